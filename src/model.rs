//! Trial records and the outcome lists that move between pipeline stages.
//!
//! The serialized layout of [`TrialRecord`] is the on-disk format of the
//! outcome store, so field names here are part of the file contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where an outcome declaration was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Registry,
    Ethical,
    Publication,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Registry => "registry",
            Source::Ethical => "ethical",
            Source::Publication => "publication",
        }
    }

    /// Human-readable document name used in report comments.
    pub fn document(&self) -> &'static str {
        match self {
            Source::Registry => "registry",
            Source::Ethical => "ethical submission",
            Source::Publication => "publication",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measured endpoint of a trial, as declared by a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// 1-based ordinal, unique within the source list.
    pub number: u32,
    #[serde(rename = "name", alias = "measure")]
    pub measure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame: Option<String>,
    #[serde(default)]
    pub instrument: String,
    #[serde(default)]
    pub is_primary: bool,
    pub source: Source,
}

impl Outcome {
    pub fn new(number: u32, measure: impl Into<String>, source: Source) -> Self {
        Self {
            number,
            measure: measure.into(),
            description: None,
            time_frame: None,
            instrument: String::new(),
            is_primary: false,
            source,
        }
    }

    pub fn with_instrument(mut self, instrument: impl Into<String>) -> Self {
        self.instrument = instrument.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

/// Oracle verdict attached to one registry outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub number: u32,
    pub outcome: Outcome,
    pub is_pro: bool,
    #[serde(default)]
    pub instrument: String,
    #[serde(default)]
    pub reason: String,
}

/// A registry classification paired with the counterpart outcome it claimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub registry: Classification,
    pub counterpart: Outcome,
    pub has_changed: bool,
}

/// Discrepancies between the registry and one counterpart source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMatching {
    pub matched: Vec<MatchedPair>,
    /// PRO outcomes in the registry with no counterpart.
    pub extra: Vec<Classification>,
    /// Counterpart outcomes that no registry outcome claimed.
    pub missing: Vec<Outcome>,
    /// Matched pairs the oracle flagged as changed.
    pub modified: Vec<MatchedPair>,
    pub match_ai: bool,
}

impl SourceMatching {
    /// Derive `modified` and `match_ai` from the raw matching sets.
    pub fn new(matched: Vec<MatchedPair>, extra: Vec<Classification>, missing: Vec<Outcome>) -> Self {
        let modified: Vec<MatchedPair> = matched.iter().filter(|m| m.has_changed).cloned().collect();
        let match_ai = extra.is_empty() && missing.is_empty() && modified.is_empty();
        Self {
            matched,
            extra,
            missing,
            modified,
            match_ai,
        }
    }
}

/// Completed reconciliation of a trial against both counterpart sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingResult {
    pub ethical: SourceMatching,
    pub publication: SourceMatching,
    pub matched_at: DateTime<Utc>,
}

impl MatchingResult {
    pub fn for_source(&self, source: Source) -> Option<&SourceMatching> {
        match source {
            Source::Ethical => Some(&self.ethical),
            Source::Publication => Some(&self.publication),
            Source::Registry => None,
        }
    }

    pub fn fully_consistent(&self) -> bool {
        self.ethical.match_ai && self.publication.match_ai
    }
}

/// Where a trial record sits in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    PendingClassification,
    PendingCounterparts,
    Ready,
    Matched,
}

impl TrialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::PendingClassification => "pending-classification",
            TrialState::PendingCounterparts => "pending-counterparts",
            TrialState::Ready => "ready",
            TrialState::Matched => "matched",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one trial, keyed in the store by its unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub title: String,
    pub study_data_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes_ai: Option<Vec<Classification>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes_ethical: Option<Vec<Outcome>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes_publication: Option<Vec<Outcome>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching: Option<MatchingResult>,
}

impl TrialRecord {
    pub fn new(title: impl Into<String>, study_data_path: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            study_data_path: study_data_path.into(),
            outcomes_ai: None,
            outcomes_ethical: None,
            outcomes_publication: None,
            matching: None,
        }
    }

    pub fn counterparts(&self, source: Source) -> Option<&[Outcome]> {
        match source {
            Source::Ethical => self.outcomes_ethical.as_deref(),
            Source::Publication => self.outcomes_publication.as_deref(),
            Source::Registry => None,
        }
    }

    pub fn state(&self) -> TrialState {
        if self.matching.is_some() {
            TrialState::Matched
        } else if self.outcomes_ai.is_none() {
            TrialState::PendingClassification
        } else if self.outcomes_ethical.is_none() || self.outcomes_publication.is_none() {
            TrialState::PendingCounterparts
        } else {
            TrialState::Ready
        }
    }
}
