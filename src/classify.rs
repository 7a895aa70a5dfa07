//! Classification pass: registry payload to one verdict per outcome.

use crate::model::{Classification, Outcome, Source};
use crate::oracle::OutcomeOracle;
use crate::store::OutcomeStore;
use anyhow::Context;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Title and outcome list read from a registry study record.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStudy {
    pub title: String,
    pub outcomes: Vec<Outcome>,
}

/// Read the title and outcomes of a study record.
///
/// Primary outcomes come first; numbering runs across both lists from 1.
pub fn registry_outcomes(payload: &Value) -> anyhow::Result<RegistryStudy> {
    let protocol = payload
        .get("protocolSection")
        .context("registry record has no protocolSection")?;
    let title = protocol
        .pointer("/identificationModule/briefTitle")
        .and_then(Value::as_str)
        .context("registry record has no briefTitle")?
        .to_string();
    let module = protocol
        .get("outcomesModule")
        .context("registry record has no outcomesModule")?;
    let primary = module
        .get("primaryOutcomes")
        .and_then(Value::as_array)
        .context("registry record has no primaryOutcomes")?;
    let secondary = module
        .get("secondaryOutcomes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut outcomes = Vec::with_capacity(primary.len() + secondary.len());
    let entries = primary
        .iter()
        .map(|entry| (entry, true))
        .chain(secondary.iter().map(|entry| (entry, false)));
    for (index, (entry, is_primary)) in entries.enumerate() {
        let number = index as u32 + 1;
        let measure = text(entry, "measure")
            .with_context(|| format!("registry outcome {number} has no measure"))?;
        let mut outcome = Outcome::new(number, measure, Source::Registry);
        outcome.description = text(entry, "description");
        outcome.time_frame = text(entry, "timeFrame");
        outcome.is_primary = is_primary;
        outcomes.push(outcome);
    }
    Ok(RegistryStudy { title, outcomes })
}

fn text(entry: &Value, key: &str) -> Option<String> {
    entry.get(key).and_then(Value::as_str).map(str::to_string)
}

/// One trial handed to the classification pass.
pub struct TrialInput<'a> {
    pub unique_id: &'a str,
    pub registry_id: &'a str,
    pub study_data_path: &'a Path,
    pub payload: &'a Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyOutcome {
    Classified { outcomes: usize, pros: usize },
    /// The store already held verdicts; the oracle was not asked.
    AlreadyClassified,
}

/// Classify every registry outcome of a trial and store the verdicts.
///
/// All outcomes are classified before anything is written, so a failure
/// part-way leaves the trial unclassified for the next run.
pub async fn classify_trial<O: OutcomeOracle>(
    oracle: &O,
    store: &OutcomeStore,
    trial: &TrialInput<'_>,
    results_dir: Option<&Path>,
) -> anyhow::Result<ClassifyOutcome> {
    if store
        .try_get(trial.unique_id)?
        .is_some_and(|record| record.outcomes_ai.is_some())
    {
        return Ok(ClassifyOutcome::AlreadyClassified);
    }

    let study = registry_outcomes(trial.payload)
        .with_context(|| format!("Unreadable registry record for {}", trial.registry_id))?;

    let mut classifications = Vec::with_capacity(study.outcomes.len());
    for outcome in study.outcomes {
        let verdict = oracle
            .classify(&study.title, &outcome)
            .await
            .with_context(|| format!("Failed to classify outcome {} of {}", outcome.number, trial.registry_id))?;
        tracing::debug!(
            id = trial.unique_id,
            number = outcome.number,
            is_pro = verdict.is_pro,
            instrument = %verdict.instrument,
            "outcome classified"
        );
        classifications.push(Classification {
            number: outcome.number,
            outcome,
            is_pro: verdict.is_pro,
            instrument: verdict.instrument,
            reason: verdict.reason,
        });
    }

    let outcomes = classifications.len();
    let pros = classifications.iter().filter(|c| c.is_pro).count();

    if let Some(dir) = results_dir {
        if let Err(err) = dump_classifications(dir, trial.registry_id, &classifications) {
            tracing::warn!(id = trial.registry_id, error = %err, "failed to write classification dump");
        }
    }

    store.upsert_classifications(trial.unique_id, &study.title, trial.study_data_path, classifications)?;
    Ok(ClassifyOutcome::Classified { outcomes, pros })
}

/// Path of the per-trial classification dump.
pub fn dump_path(results_dir: &Path, registry_id: &str) -> PathBuf {
    results_dir.join(format!("trial_{registry_id}_pros.json"))
}

fn dump_classifications(
    results_dir: &Path,
    registry_id: &str,
    classifications: &[Classification],
) -> anyhow::Result<()> {
    fs::create_dir_all(results_dir)?;
    let json = serde_json::to_string_pretty(classifications)?;
    fs::write(dump_path(results_dir, registry_id), json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::tasks::scripted::ScriptedOracle;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "protocolSection": {
                "identificationModule": {"briefTitle": "Exercise after surgery"},
                "outcomesModule": {
                    "primaryOutcomes": [
                        {"measure": "Quality of life", "description": "EORTC QLQ-C30", "timeFrame": "12 months"}
                    ],
                    "secondaryOutcomes": [
                        {"measure": "Complication rate"},
                        {"measure": "Fatigue", "timeFrame": "6 months"}
                    ]
                }
            }
        })
    }

    #[test]
    fn registry_outcomes_number_primaries_first() {
        let study = registry_outcomes(&payload()).unwrap();
        assert_eq!(study.title, "Exercise after surgery");
        let summary: Vec<(u32, &str, bool)> = study
            .outcomes
            .iter()
            .map(|o| (o.number, o.measure.as_str(), o.is_primary))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "Quality of life", true),
                (2, "Complication rate", false),
                (3, "Fatigue", false)
            ]
        );
        assert_eq!(study.outcomes[0].time_frame.as_deref(), Some("12 months"));
        assert_eq!(study.outcomes[1].description, None);
    }

    #[test]
    fn registry_record_without_primary_outcomes_is_rejected() {
        let broken = json!({"protocolSection": {"identificationModule": {"briefTitle": "T"}, "outcomesModule": {}}});
        assert!(registry_outcomes(&broken).is_err());
        assert!(registry_outcomes(&json!({})).is_err());
    }

    #[tokio::test]
    async fn classification_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("pro_results.json");
        let store = OutcomeStore::new(&store_path);
        let payload = payload();
        let trial = TrialInput {
            unique_id: "17",
            registry_id: "NCT01234567",
            study_data_path: Path::new("trials/trial_NCT01234567.json"),
            payload: &payload,
        };
        let results_dir = dir.path().join("results");

        let oracle = ScriptedOracle::default()
            .classify_as(true, "QLQ-C30")
            .classify_as(false, "")
            .classify_as(true, "FACIT-F");
        let outcome = classify_trial(&oracle, &store, &trial, Some(&results_dir)).await.unwrap();
        assert_eq!(outcome, ClassifyOutcome::Classified { outcomes: 3, pros: 2 });
        assert!(dump_path(&results_dir, "NCT01234567").exists());

        let record = store.get("17").unwrap();
        let stored = record.outcomes_ai.unwrap();
        assert_eq!(stored[2].instrument, "FACIT-F");
        assert_eq!(stored[2].outcome.measure, "Fatigue");
        let before = fs::read(&store_path).unwrap();

        let rerun = ScriptedOracle::default();
        let outcome = classify_trial(&rerun, &store, &trial, None).await.unwrap();
        assert_eq!(outcome, ClassifyOutcome::AlreadyClassified);
        assert_eq!(rerun.classify_calls.get(), 0);
        assert_eq!(fs::read(&store_path).unwrap(), before);
    }

    #[tokio::test]
    async fn locked_store_stops_before_the_oracle_is_asked() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("pro_results.json");
        let store = OutcomeStore::new(&store_path).with_lock_timeout(std::time::Duration::from_millis(100));
        let payload = payload();
        let trial = TrialInput {
            unique_id: "17",
            registry_id: "NCT01234567",
            study_data_path: Path::new("t.json"),
            payload: &payload,
        };
        let oracle = ScriptedOracle::default()
            .classify_as(true, "QLQ-C30")
            .classify_as(false, "")
            .classify_as(true, "FACIT-F");
        classify_trial(&oracle, &store, &trial, None).await.unwrap();

        // Another run holds the store lock while this one looks the trial up.
        let held = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(store_path.with_extension("lock"))
            .unwrap();
        fs2::FileExt::lock_exclusive(&held).unwrap();

        let rerun = ScriptedOracle::default();
        assert!(classify_trial(&rerun, &store, &trial, None).await.is_err());
        assert_eq!(rerun.classify_calls.get(), 0);
    }

    #[tokio::test]
    async fn failed_classification_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutcomeStore::new(dir.path().join("pro_results.json"));
        let payload = payload();
        let trial = TrialInput {
            unique_id: "17",
            registry_id: "NCT01234567",
            study_data_path: Path::new("t.json"),
            payload: &payload,
        };
        // Only one verdict scripted for three outcomes.
        let oracle = ScriptedOracle::default().classify_as(true, "QLQ-C30");
        assert!(classify_trial(&oracle, &store, &trial, None).await.is_err());
        assert!(store.get("17").is_none());
    }
}
