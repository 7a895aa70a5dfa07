//! Outcome store: the resumable per-trial ledger.
//!
//! One JSON object maps each unique trial id to its [`TrialRecord`]. Every
//! mutation reloads the whole file, applies a guarded change and writes the
//! whole file back. The guards are what make reruns idempotent: a record that
//! already has classifications or a matching block is never overwritten.

use crate::model::{Classification, MatchingResult, Outcome, Source, TrialRecord};
use crate::persist::JsonFile;
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type Records = BTreeMap<String, TrialRecord>;

pub struct OutcomeStore {
    file: JsonFile,
}

impl OutcomeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lock_timeout(self, timeout: std::time::Duration) -> Self {
        Self {
            file: self.file.with_lock_timeout(timeout),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// All records; a missing or corrupt file reads as an empty store.
    pub fn load(&self) -> Records {
        self.file.read()
    }

    pub fn get(&self, id: &str) -> Option<TrialRecord> {
        self.load().remove(id)
    }

    /// Like [`OutcomeStore::get`], but a store another run keeps locked is an
    /// error instead of an empty result. Callers that spend oracle calls on
    /// the answer use this.
    pub fn try_get(&self, id: &str) -> anyhow::Result<Option<TrialRecord>> {
        let mut records: Records = self
            .file
            .try_read()
            .with_context(|| format!("Cannot read the outcome store at {}", self.path().display()))?;
        Ok(records.remove(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.load().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.load().into_keys().collect()
    }

    /// Create the record if needed and set its classifications once.
    ///
    /// Returns `false` when the record already carried classifications.
    pub fn upsert_classifications(
        &self,
        id: &str,
        title: &str,
        study_data_path: &Path,
        classifications: Vec<Classification>,
    ) -> anyhow::Result<bool> {
        self.file.update(|records: &mut Records| {
            let record = records
                .entry(id.to_string())
                .or_insert_with(|| TrialRecord::new(title, study_data_path));
            if record.outcomes_ai.is_some() {
                return (false, false);
            }
            record.outcomes_ai = Some(classifications);
            (true, true)
        })
    }

    /// Set a counterpart outcome list, replacing any previous one.
    ///
    /// Returns `false` when no record exists for `id` yet.
    pub fn attach_counterpart_outcomes(
        &self,
        id: &str,
        source: Source,
        outcomes: Vec<Outcome>,
    ) -> anyhow::Result<bool> {
        if source == Source::Registry {
            return Err(anyhow::anyhow!(
                "registry outcomes are stored as classifications, not counterparts"
            ));
        }
        self.file.update(|records: &mut Records| {
            let Some(record) = records.get_mut(id) else {
                return (false, false);
            };
            let slot = match source {
                Source::Ethical => &mut record.outcomes_ethical,
                _ => &mut record.outcomes_publication,
            };
            if slot.as_ref() == Some(&outcomes) {
                return (true, false);
            }
            *slot = Some(outcomes);
            (true, true)
        })
    }

    /// Store a matching result unless one is already present.
    ///
    /// Returns `false` when the record is absent or already matched.
    pub fn attach_matching(&self, id: &str, result: MatchingResult) -> anyhow::Result<bool> {
        self.file.update(|records: &mut Records| {
            let Some(record) = records.get_mut(id) else {
                return (false, false);
            };
            if record.matching.is_some() {
                return (false, false);
            }
            record.matching = Some(result);
            (true, true)
        })
    }
}
