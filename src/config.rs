//! Configuration management for prorecon
//!
//! Settings live in `prorecon.toml` in the working directory (or a path given
//! on the command line). Every section is optional; API keys are read from the
//! environment only.

use crate::oracle::models::Tier;
use crate::oracle::router::RoutingPolicy;
use crate::prompts::EXPERT_ROLE;
use crate::sheet::SheetLayout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "prorecon.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub routing: RoutingPolicy,
    pub oracle: OracleConfig,
    pub sheet: SheetLayout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Outcome store (one record per trial)
    pub store: PathBuf,
    /// Cost ledger shared by all runs
    pub ledger: PathBuf,
    /// Raw registry payloads, one file per trial
    pub trials_dir: PathBuf,
    /// Per-trial classification dumps
    pub results_dir: PathBuf,
    /// Delimited discrepancy report
    pub report: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from("pro_results.json"),
            ledger: PathBuf::from("run_details.json"),
            trials_dir: PathBuf::from("trials"),
            results_dir: PathBuf::from("results"),
            report: PathBuf::from("pro_results.csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Per-request HTTP timeout
    pub timeout_secs: u64,
    /// Label the cost ledger books usage under
    pub project: String,
    /// Persona sent with classification and matching prompts
    pub system_role: String,
    /// Tier outcome questions start on; unset lets the router grade difficulty
    pub task_tier: Option<Tier>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            project: "default".to_string(),
            system_role: EXPERT_ROLE.to_string(),
            task_tier: Some(Tier::Strong),
        }
    }
}

impl Config {
    /// Load config from disk, or return defaults.
    ///
    /// A file that fails to parse is moved aside as `.corrupt` and defaults
    /// are used, so a bad edit never blocks a batch.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Provider credentials, taken from the environment.
#[derive(Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub gemini: Option<String>,
    pub replicate: Option<String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        Self {
            openai: env_key(&["OPENAI_API_KEY"]),
            gemini: env_key(&["GEMINI_API_KEY"]),
            replicate: env_key(&["REPLICATE_API_TOKEN", "REPLICATE_API_KEY"]),
        }
    }

    pub fn any(&self) -> bool {
        self.openai.is_some() || self.gemini.is_some() || self.replicate.is_some()
    }
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys")
            .field("openai", &self.openai.is_some())
            .field("gemini", &self.gemini.is_some())
            .field("replicate", &self.replicate.is_some())
            .finish()
    }
}

fn env_key(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
