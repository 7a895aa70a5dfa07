//! Registry retrieval: fetch a study record and keep the raw payload on disk.

use anyhow::Context;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const STUDIES_URL: &str = "https://clinicaltrials.gov/api/v2/studies";
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

fn registry_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"NCT\d{8}").ok()).as_ref()
}

/// First registry identifier in a comma-separated registration cell.
pub fn select_registry_id(registration: &str) -> Option<String> {
    let pattern = registry_id_pattern()?;
    registration
        .split(',')
        .find_map(|part| pattern.find(part.trim()))
        .map(|m| m.as_str().to_string())
}

/// Where the payload of `id` is kept under `trials_dir`.
pub fn payload_path(trials_dir: &Path, id: &str) -> PathBuf {
    trials_dir.join(format!("trial_{id}.json"))
}

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    trials_dir: PathBuf,
}

impl RegistryClient {
    pub fn new(trials_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url: STUDIES_URL.to_string(),
            trials_dir: trials_dir.into(),
        })
    }

    pub fn trials_dir(&self) -> &Path {
        &self.trials_dir
    }

    /// Payload for `id`, from disk if it was fetched before.
    ///
    /// Network and decode failures are logged and yield `None`; the trial is
    /// then skipped by the caller.
    pub async fn fetch(&self, id: &str) -> Option<Value> {
        let path = payload_path(&self.trials_dir, id);
        if let Some(cached) = read_payload(&path) {
            tracing::debug!(id, path = %path.display(), "using saved registry payload");
            return Some(cached);
        }

        let payload = match self.download(id).await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(id, error = %err, "failed to fetch registry record");
                return None;
            }
        };
        if let Err(err) = save_payload(&path, &payload) {
            tracing::warn!(id, error = %err, "failed to save registry payload");
        }
        Some(payload)
    }

    async fn download(&self, id: &str) -> anyhow::Result<Value> {
        let url = format!("{}/{}", self.base_url, id);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("registry returned {}", status);
        }
        let payload = response
            .json::<Value>()
            .await
            .context("registry response is not JSON")?;
        Ok(payload)
    }
}

/// A saved payload, or `None` when absent or unreadable.
pub fn read_payload(path: &Path) -> Option<Value> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn save_payload(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_registry_identifier() {
        assert_eq!(
            select_registry_id("ISRCTN12345678, NCT01234567,NCT07654321").as_deref(),
            Some("NCT01234567")
        );
        assert_eq!(select_registry_id(" NCT00000042 ").as_deref(), Some("NCT00000042"));
        assert_eq!(select_registry_id("EudraCT 2012-000001-01"), None);
        assert_eq!(select_registry_id("NCT123"), None);
    }

    #[test]
    fn payload_lives_under_trials_dir() {
        assert_eq!(
            payload_path(Path::new("trials"), "NCT01234567"),
            PathBuf::from("trials/trial_NCT01234567.json")
        );
    }

    #[tokio::test]
    async fn saved_payload_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = payload_path(dir.path(), "NCT01234567");
        let payload = serde_json::json!({"protocolSection": {"identificationModule": {"briefTitle": "T"}}});
        save_payload(&path, &payload).unwrap();

        let client = RegistryClient::new(dir.path()).unwrap();
        assert_eq!(client.fetch("NCT01234567").await, Some(payload));
    }

    #[test]
    fn unreadable_payload_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trial_NCT01234567.json");
        assert!(read_payload(&path).is_none());
        fs::write(&path, "{ truncated").unwrap();
        assert!(read_payload(&path).is_none());
    }
}
