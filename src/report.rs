//! Discrepancy report: one `;`-delimited row per matched trial.

use crate::model::{MatchingResult, Source};
use crate::store::{OutcomeStore, Records};
use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const HEADER: [&str; 10] = [
    "unique_id",
    "ethical_match_ai",
    "publication_match_ai",
    "extra_outcomes_in_registry_wrt_ethical",
    "missing_outcomes_in_registry_wrt_ethical",
    "modified_outcomes_in_registry_wrt_ethical",
    "extra_outcomes_in_registry_wrt_publication",
    "missing_outcomes_in_registry_wrt_publication",
    "modified_outcomes_in_registry_wrt_publication",
    "comments",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub unique_id: String,
    pub ethical_match_ai: bool,
    pub publication_match_ai: bool,
    pub extra_outcomes_in_registry_wrt_ethical: bool,
    pub missing_outcomes_in_registry_wrt_ethical: bool,
    pub modified_outcomes_in_registry_wrt_ethical: bool,
    pub extra_outcomes_in_registry_wrt_publication: bool,
    pub missing_outcomes_in_registry_wrt_publication: bool,
    pub modified_outcomes_in_registry_wrt_publication: bool,
    pub comments: String,
}

impl ReportRow {
    pub fn new(unique_id: &str, matching: &MatchingResult) -> Self {
        let mut sentences = Vec::new();
        for source in [Source::Ethical, Source::Publication] {
            let Some(m) = matching.for_source(source) else {
                continue;
            };
            let document = source.document();
            if !m.extra.is_empty() {
                sentences.push(format!(
                    "Registry has additional PRO outcomes that are not found in the {document}"
                ));
            }
            if !m.missing.is_empty() {
                sentences.push(format!(
                    "Registry is missing PRO outcomes that are present in the {document}"
                ));
            }
            if !m.modified.is_empty() {
                sentences.push(format!(
                    "Registry has outcomes matching the {document} but they might have been modified"
                ));
            }
        }
        let comments = if sentences.is_empty() {
            String::new()
        } else {
            format!("{}.", sentences.join(". "))
        };

        let ethical = &matching.ethical;
        let publication = &matching.publication;
        Self {
            unique_id: unique_id.to_string(),
            ethical_match_ai: ethical.match_ai,
            publication_match_ai: publication.match_ai,
            extra_outcomes_in_registry_wrt_ethical: !ethical.extra.is_empty(),
            missing_outcomes_in_registry_wrt_ethical: !ethical.missing.is_empty(),
            modified_outcomes_in_registry_wrt_ethical: !ethical.modified.is_empty(),
            extra_outcomes_in_registry_wrt_publication: !publication.extra.is_empty(),
            missing_outcomes_in_registry_wrt_publication: !publication.missing.is_empty(),
            modified_outcomes_in_registry_wrt_publication: !publication.modified.is_empty(),
            comments,
        }
    }
}

/// Rows for every record that has a matching result, in id order.
pub fn rows(records: &Records) -> Vec<ReportRow> {
    records
        .iter()
        .filter_map(|(id, record)| record.matching.as_ref().map(|m| ReportRow::new(id, m)))
        .collect()
}

/// Write the report; the header is written even when there are no rows.
pub fn write_report<W: Write>(rows: &[ReportRow], writer: W) -> anyhow::Result<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer);
    csv_writer.write_record(HEADER).context("CSV write error")?;
    for row in rows {
        csv_writer.serialize(row).context("CSV write error")?;
    }
    csv_writer.flush().context("CSV flush error")?;
    Ok(())
}

/// Export the store to `path`; returns the number of rows written.
pub fn export(store: &OutcomeStore, path: &Path) -> anyhow::Result<usize> {
    let rows = rows(&store.load());
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    write_report(&rows, BufWriter::new(file))?;
    tracing::info!(path = %path.display(), rows = rows.len(), "report written");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classification, MatchedPair, Outcome, SourceMatching, TrialRecord};
    use chrono::Utc;

    fn pro(number: u32) -> Classification {
        Classification {
            number,
            outcome: Outcome::new(number, "QoL", Source::Registry),
            is_pro: true,
            instrument: String::new(),
            reason: String::new(),
        }
    }

    fn consistent() -> SourceMatching {
        SourceMatching::new(vec![], vec![], vec![])
    }

    #[test]
    fn consistent_trial_has_no_comment() {
        let matching = MatchingResult {
            ethical: consistent(),
            publication: consistent(),
            matched_at: Utc::now(),
        };
        let row = ReportRow::new("1", &matching);
        assert!(row.ethical_match_ai && row.publication_match_ai);
        assert_eq!(row.comments, "");
    }

    #[test]
    fn discrepancies_become_sentences() {
        let changed = MatchedPair {
            registry: pro(2),
            counterpart: Outcome::new(1, "Quality of life", Source::Publication),
            has_changed: true,
        };
        let matching = MatchingResult {
            ethical: SourceMatching::new(vec![], vec![pro(1)], vec![]),
            publication: SourceMatching::new(vec![changed], vec![], vec![]),
            matched_at: Utc::now(),
        };
        let row = ReportRow::new("1", &matching);
        assert!(row.extra_outcomes_in_registry_wrt_ethical);
        assert!(row.modified_outcomes_in_registry_wrt_publication);
        assert!(!row.missing_outcomes_in_registry_wrt_ethical);
        assert_eq!(
            row.comments,
            "Registry has additional PRO outcomes that are not found in the ethical submission. \
Registry has outcomes matching the publication but they might have been modified."
        );
    }

    #[test]
    fn unmatched_records_are_skipped() {
        let mut records = Records::new();
        records.insert("1".to_string(), TrialRecord::new("Pending", "t.json"));
        let mut done = TrialRecord::new("Done", "u.json");
        done.matching = Some(MatchingResult {
            ethical: consistent(),
            publication: SourceMatching::new(vec![], vec![], vec![Outcome::new(3, "Pain", Source::Publication)]),
            matched_at: Utc::now(),
        });
        records.insert("2".to_string(), done);

        let rows = rows(&records);
        assert_eq!(rows.len(), 1);

        let mut out = Vec::new();
        write_report(&rows, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("unique_id;ethical_match_ai;publication_match_ai;"));
        assert_eq!(
            lines[1],
            "2;true;false;false;false;false;false;true;false;\
Registry is missing PRO outcomes that are present in the publication."
        );
    }

    #[test]
    fn empty_store_exports_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutcomeStore::new(dir.path().join("pro_results.json"));
        let path = dir.path().join("pro_results.csv");
        assert_eq!(export(&store, &path).unwrap(), 0);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
