pub mod client;
pub mod models;
pub mod router;
pub mod tasks;
pub mod tokens;

pub use client::{Backend, HttpBackend, OracleError, OracleRequest, OracleResponse};
pub use models::{Tier, Usage};
pub use router::{AskOptions, Difficulty, Router, RouterError, RoutingPolicy, TruncationMode};
pub use tasks::{OutcomeOracle, RoutedOracle};
