//! Reconciliation engine: registry PRO outcomes against each counterpart source.
//!
//! Matching is greedy. Registry outcomes are visited in their original order
//! and each one may claim at most one counterpart outcome that no earlier
//! registry outcome claimed. The oracle only ever sees unclaimed candidates.

use crate::model::{Classification, MatchedPair, MatchingResult, Outcome, Source, SourceMatching, TrialState};
use crate::oracle::OutcomeOracle;
use crate::store::OutcomeStore;
use anyhow::Context;
use chrono::Utc;

/// Match the PRO classifications of a trial against one counterpart list.
pub async fn match_source<O: OutcomeOracle>(
    oracle: &O,
    title: &str,
    classifications: &[Classification],
    counterparts: &[Outcome],
) -> anyhow::Result<SourceMatching> {
    let mut claimed = vec![false; counterparts.len()];
    let mut matched = Vec::new();
    let mut extra = Vec::new();

    for registry in classifications.iter().filter(|c| c.is_pro) {
        let candidates: Vec<(usize, &Outcome)> = counterparts
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed[*i])
            .collect();
        let offered: Vec<&Outcome> = candidates.iter().map(|(_, o)| *o).collect();

        let verdict = oracle
            .pick_match(title, registry, &offered)
            .await
            .with_context(|| format!("Failed to match registry outcome {}", registry.number))?;

        let number = verdict
            .counterpart()
            .with_context(|| format!("Unusable match for registry outcome {}", registry.number))?;
        let Some(number) = number else {
            extra.push(registry.clone());
            continue;
        };
        let Some(&(index, counterpart)) = candidates.iter().find(|(_, o)| o.number == number) else {
            anyhow::bail!(
                "oracle matched registry outcome {} to {}, which was not offered",
                registry.number,
                verdict.match_number
            );
        };
        claimed[index] = true;
        matched.push(MatchedPair {
            registry: registry.clone(),
            counterpart: counterpart.clone(),
            has_changed: verdict.has_changed,
        });
    }

    let missing = counterparts
        .iter()
        .enumerate()
        .filter(|(i, _)| !claimed[*i])
        .map(|(_, o)| o.clone())
        .collect();

    Ok(SourceMatching::new(matched, extra, missing))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Matched { consistent: bool },
    /// A matching result was already stored; the oracle was not asked.
    AlreadyMatched,
    /// The trial is not ready for matching yet.
    NotReady(TrialState),
    Absent,
}

/// Compute and store the matching result of one trial.
///
/// Nothing is written unless both sources matched, so a failed trial stays
/// ready for the next run.
pub async fn reconcile_trial<O: OutcomeOracle>(
    oracle: &O,
    store: &OutcomeStore,
    id: &str,
) -> anyhow::Result<ReconcileOutcome> {
    let Some(record) = store.try_get(id)? else {
        return Ok(ReconcileOutcome::Absent);
    };
    match record.state() {
        TrialState::Ready => {}
        TrialState::Matched => return Ok(ReconcileOutcome::AlreadyMatched),
        other => return Ok(ReconcileOutcome::NotReady(other)),
    }

    let classifications = record.outcomes_ai.as_deref().unwrap_or_default();
    let mut per_source = Vec::with_capacity(2);
    for source in [Source::Ethical, Source::Publication] {
        let counterparts = record.counterparts(source).unwrap_or_default();
        let matching = match_source(oracle, &record.title, classifications, counterparts)
            .await
            .with_context(|| format!("Matching against the {} failed", source.document()))?;
        tracing::debug!(
            id,
            source = %source,
            matched = matching.matched.len(),
            extra = matching.extra.len(),
            missing = matching.missing.len(),
            modified = matching.modified.len(),
            "source matched"
        );
        per_source.push(matching);
    }
    let publication = per_source.pop().context("publication matching missing")?;
    let ethical = per_source.pop().context("ethical matching missing")?;

    let result = MatchingResult {
        ethical,
        publication,
        matched_at: Utc::now(),
    };
    let consistent = result.fully_consistent();
    if !store.attach_matching(id, result)? {
        return Ok(ReconcileOutcome::AlreadyMatched);
    }
    if !consistent {
        tracing::info!(id, title = %record.title, "registry entry does not match the trial documents");
    }
    Ok(ReconcileOutcome::Matched { consistent })
}
