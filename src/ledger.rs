//! Cost ledger: token usage and spend per project, carried across runs.
//!
//! Stored as one JSON object keyed by project label. `current_run_cost` is
//! bracketed by [`CostLedger::start_run`] and [`CostLedger::finish_run`];
//! the cumulative fields only ever grow.

use crate::oracle::models::{pricing_for_model, Usage};
use crate::persist::JsonFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectCost {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost: f64,
    pub current_run_cost: f64,
    /// Identifier of the run currently open for this project.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

type Projects = BTreeMap<String, ProjectCost>;

/// Spend figures reported at a run boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunCost {
    pub current_run_cost: f64,
    pub total_cost: f64,
}

impl RunCost {
    fn of(cost: &ProjectCost) -> Self {
        Self {
            current_run_cost: cost.current_run_cost,
            total_cost: cost.total_cost,
        }
    }
}

impl fmt::Display for RunCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The current run has cost ${:.2} so far while the project costs are ${:.2} in total.",
            self.current_run_cost, self.total_cost
        )
    }
}

#[derive(Debug, Clone)]
pub struct CostLedger {
    file: JsonFile,
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Open a run: zero the per-run cost, keep the cumulative totals.
    pub fn start_run(&self, project: &str) -> anyhow::Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.file.update(|projects: &mut Projects| {
            let entry = projects.entry(project.to_string()).or_default();
            entry.current_run_cost = 0.0;
            entry.run_id = Some(run_id.clone());
            ((), true)
        })?;
        tracing::info!(project, run_id = %run_id, "run started");
        Ok(run_id)
    }

    /// Add one call's usage and cost; returns the cost of the call.
    pub fn record(&self, project: &str, model_id: &str, usage: &Usage) -> anyhow::Result<f64> {
        let cost = pricing_for_model(model_id).cost(usage);
        self.file.update(|projects: &mut Projects| {
            let entry = projects.entry(project.to_string()).or_default();
            entry.total_tokens += usage.total_tokens;
            entry.prompt_tokens += usage.prompt_tokens;
            entry.completion_tokens += usage.completion_tokens;
            entry.total_cost += cost;
            entry.current_run_cost += cost;
            ((), true)
        })?;
        tracing::debug!(project, model = model_id, tokens = usage.total_tokens, cost, "usage recorded");
        Ok(cost)
    }

    /// Close a run: report both figures, then zero the per-run cost.
    pub fn finish_run(&self, project: &str) -> anyhow::Result<RunCost> {
        self.file.update(|projects: &mut Projects| {
            let entry = projects.entry(project.to_string()).or_default();
            let report = RunCost::of(entry);
            entry.current_run_cost = 0.0;
            entry.run_id = None;
            (report, true)
        })
    }

    /// Current figures without touching the file.
    pub fn report(&self, project: &str) -> RunCost {
        let projects: Projects = self.file.read();
        projects
            .get(project)
            .map(RunCost::of)
            .unwrap_or(RunCost {
                current_run_cost: 0.0,
                total_cost: 0.0,
            })
    }

    pub fn project(&self, project: &str) -> Option<ProjectCost> {
        let mut projects: Projects = self.file.read();
        projects.remove(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::models::{Tier, DEFAULT_PRICING};
    use std::fs;

    fn ledger(dir: &tempfile::TempDir) -> CostLedger {
        CostLedger::new(dir.path().join("run_details.json"))
    }

    #[test]
    fn run_boundaries_tolerate_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        let report = ledger.finish_run("default").unwrap();
        assert_eq!(report.current_run_cost, 0.0);
        assert_eq!(report.total_cost, 0.0);

        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("run_details.json"));
        ledger.start_run("default").unwrap();
        assert!(ledger.project("default").is_some());
    }

    #[test]
    fn run_cost_is_the_exact_sum_of_calls() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        ledger.start_run("p").unwrap();

        let usages = [Usage::new(1_200, 300), Usage::new(800, 40), Usage::new(15_000, 900)];
        let mut expected = 0.0;
        for usage in &usages {
            expected += ledger.record("p", Tier::Strong.id(), usage).unwrap();
        }
        let by_rate: f64 = usages.iter().map(|u| Tier::Strong.pricing().cost(u)).sum();

        let report = ledger.report("p");
        assert!((report.current_run_cost - expected).abs() < 1e-12);
        assert!((report.current_run_cost - by_rate).abs() < 1e-12);

        let project = ledger.project("p").unwrap();
        assert_eq!(project.prompt_tokens, 17_000);
        assert_eq!(project.completion_tokens, 1_240);
        assert_eq!(project.total_tokens, 18_240);
    }

    #[test]
    fn finish_run_resets_run_cost_only() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        ledger.start_run("p").unwrap();
        ledger.record("p", "gpt-4", &Usage::new(10_000, 1_000)).unwrap();

        let report = ledger.finish_run("p").unwrap();
        assert!(report.current_run_cost > 0.0);
        assert_eq!(report.current_run_cost, report.total_cost);

        let after = ledger.report("p");
        assert_eq!(after.current_run_cost, 0.0);
        assert_eq!(after.total_cost, report.total_cost);
    }

    #[test]
    fn totals_carry_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        let usage = Usage::new(1_000, 1_000);

        ledger.start_run("p").unwrap();
        ledger.record("p", "unlisted-model", &usage).unwrap();
        ledger.finish_run("p").unwrap();

        ledger.start_run("p").unwrap();
        ledger.record("p", "unlisted-model", &usage).unwrap();
        let report = ledger.report("p");

        let per_call = DEFAULT_PRICING.cost(&usage);
        assert!((report.current_run_cost - per_call).abs() < 1e-12);
        assert!((report.total_cost - 2.0 * per_call).abs() < 1e-12);
    }

    #[test]
    fn projects_are_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        ledger.record("a", "gpt-4o", &Usage::new(100, 100)).unwrap();
        assert_eq!(ledger.report("b").total_cost, 0.0);
        assert!(ledger.report("a").total_cost > 0.0);
    }

    #[test]
    fn corrupt_ledger_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_details.json");
        fs::write(&path, "not json").unwrap();
        let ledger = CostLedger::new(&path);
        assert_eq!(ledger.report("default").total_cost, 0.0);
        ledger.start_run("default").unwrap();
        assert_eq!(ledger.report("default").current_run_cost, 0.0);
    }
}
