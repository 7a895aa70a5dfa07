//! prorecon library crate
//!
//! Reconciles patient-reported outcome declarations of clinical trials across
//! the trial registry, the ethics submission and the publication.

pub mod classify;
pub mod config;
pub mod ledger;
pub mod model;
pub mod oracle;
pub mod parse;
pub mod pipeline;
pub mod prompts;
pub mod recon;
pub mod registry;
pub mod report;
pub mod sheet;
pub mod store;
mod persist;
