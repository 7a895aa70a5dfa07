//! Batch driver: runs the pipeline stages over every trial of the sheet.
//!
//! Errors are caught per trial, logged and counted; one bad trial never
//! stops the batch.

use crate::classify::{classify_trial, ClassifyOutcome, TrialInput};
use crate::config::Config;
use crate::ledger::RunCost;
use crate::model::Source;
use crate::oracle::OutcomeOracle;
use crate::recon::{reconcile_trial, ReconcileOutcome};
use crate::registry::{payload_path, select_registry_id, RegistryClient};
use crate::report;
use crate::sheet::{counterpart_outcomes, read_rows, SheetRow};
use crate::store::OutcomeStore;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Fetch registry records and classify their outcomes.
    Classify,
    /// Copy ethical and publication outcomes from the sheet.
    Attach,
    Match,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Classify, Stage::Attach, Stage::Match, Stage::Export];

    fn needs_sheet(&self) -> bool {
        matches!(self, Stage::Classify | Stage::Attach)
    }
}

/// Counters of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub trials_processed: usize,
    pub skipped: usize,
    pub counterparts_attached: usize,
    pub matches_processed: usize,
    pub inconsistent: usize,
    pub rows_exported: usize,
    pub failures: usize,
    pub errors: Vec<String>,
    pub cost: Option<RunCost>,
}

impl RunSummary {
    fn fail(&mut self, id: &str, err: anyhow::Error) {
        tracing::error!(id, error = %format!("{err:#}"), "trial failed");
        self.failures += 1;
        self.errors.push(format!("{id}: {err:#}"));
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trials processed: {} Matches processed: {} (inconsistent: {}) Skipped: {} Failures: {}",
            self.trials_processed, self.matches_processed, self.inconsistent, self.skipped, self.failures
        )?;
        if let Some(cost) = &self.cost {
            write!(f, "\n{}", cost)?;
        }
        Ok(())
    }
}

pub struct Pipeline<'a, O> {
    config: &'a Config,
    oracle: &'a O,
    store: OutcomeStore,
}

impl<'a, O: OutcomeOracle> Pipeline<'a, O> {
    pub fn new(config: &'a Config, oracle: &'a O) -> Self {
        Self {
            config,
            oracle,
            store: OutcomeStore::new(&config.paths.store),
        }
    }

    pub fn store(&self) -> &OutcomeStore {
        &self.store
    }

    /// Run `stages` in order. Never fails; problems land in the summary.
    pub async fn run(&self, stages: &[Stage], limit: Option<usize>) -> RunSummary {
        let mut summary = RunSummary::default();

        let rows = if stages.iter().any(Stage::needs_sheet) {
            match read_rows(&self.config.sheet) {
                Ok(rows) => Some(rows),
                Err(err) => {
                    summary.fail("sheet", err);
                    None
                }
            }
        } else {
            None
        };

        for stage in stages {
            match (stage, rows.as_deref()) {
                (Stage::Classify, Some(rows)) => match RegistryClient::new(&self.config.paths.trials_dir) {
                    Ok(registry) => self.classify_rows(rows, &registry, limit, &mut summary).await,
                    Err(err) => summary.fail("registry", err),
                },
                (Stage::Attach, Some(rows)) => self.attach_rows(rows, &mut summary),
                (Stage::Classify | Stage::Attach, None) => {}
                (Stage::Match, _) => self.reconcile(&mut summary).await,
                (Stage::Export, _) => self.export(&mut summary),
            }
        }
        summary
    }

    /// Classify the registry outcomes of every sheet row not yet classified.
    ///
    /// `limit` caps the number of trials attempted in this call.
    pub async fn classify_rows(
        &self,
        rows: &[SheetRow],
        registry: &RegistryClient,
        limit: Option<usize>,
        summary: &mut RunSummary,
    ) {
        let results_dir = Some(self.config.paths.results_dir.as_path());
        let mut attempted = 0;
        for row in rows {
            if limit.is_some_and(|limit| attempted >= limit) {
                break;
            }
            let Some(unique_id) = row.unique_id() else {
                summary.skipped += 1;
                continue;
            };
            match self.store.try_get(unique_id) {
                Ok(Some(record)) if record.outcomes_ai.is_some() => continue,
                Ok(_) => {}
                Err(err) => {
                    summary.fail(unique_id, err);
                    continue;
                }
            }
            attempted += 1;

            let Some(registry_id) = row.registration().and_then(select_registry_id) else {
                tracing::warn!(id = unique_id, "no registry identifier; trial skipped");
                summary.skipped += 1;
                continue;
            };
            tracing::info!(id = unique_id, registry_id = %registry_id, "processing trial");
            let Some(payload) = registry.fetch(&registry_id).await else {
                summary.skipped += 1;
                continue;
            };

            let study_data_path = payload_path(registry.trials_dir(), &registry_id);
            let trial = TrialInput {
                unique_id,
                registry_id: &registry_id,
                study_data_path: &study_data_path,
                payload: &payload,
            };
            match classify_trial(self.oracle, &self.store, &trial, results_dir).await {
                Ok(ClassifyOutcome::Classified { outcomes, pros }) => {
                    tracing::info!(id = unique_id, outcomes, pros, "trial classified");
                    summary.trials_processed += 1;
                }
                Ok(ClassifyOutcome::AlreadyClassified) => {}
                Err(err) => summary.fail(unique_id, err),
            }
        }
    }

    /// Attach the sheet's counterpart outcomes to every stored trial.
    pub fn attach_rows(&self, rows: &[SheetRow], summary: &mut RunSummary) {
        for row in rows {
            let Some(unique_id) = row.unique_id() else {
                continue;
            };
            if !self.store.contains(unique_id) {
                continue;
            }
            let mut attached = true;
            for source in [Source::Ethical, Source::Publication] {
                let outcomes = counterpart_outcomes(&self.config.sheet, source, row);
                match self.store.attach_counterpart_outcomes(unique_id, source, outcomes) {
                    Ok(found) => attached &= found,
                    Err(err) => {
                        summary.fail(unique_id, err);
                        attached = false;
                        break;
                    }
                }
            }
            if attached {
                summary.counterparts_attached += 1;
            }
        }
    }

    /// Match every ready trial in the store.
    pub async fn reconcile(&self, summary: &mut RunSummary) {
        tracing::info!("matching results");
        for id in self.store.ids() {
            match reconcile_trial(self.oracle, &self.store, &id).await {
                Ok(ReconcileOutcome::Matched { consistent }) => {
                    summary.matches_processed += 1;
                    if !consistent {
                        summary.inconsistent += 1;
                    }
                }
                Ok(ReconcileOutcome::NotReady(state)) => {
                    tracing::debug!(id = %id, state = %state, "trial not ready for matching");
                }
                Ok(ReconcileOutcome::AlreadyMatched | ReconcileOutcome::Absent) => {}
                Err(err) => summary.fail(&id, err),
            }
        }
    }

    pub fn export(&self, summary: &mut RunSummary) {
        match report::export(&self.store, &self.config.paths.report) {
            Ok(rows) => summary.rows_exported = rows,
            Err(err) => summary.fail("report", err),
        }
    }
}
