//! Spreadsheet ingestion: trial identifiers and counterpart outcome blocks.
//!
//! One row per trial. The ethical-submission and publication outcomes sit in
//! fixed-width column blocks, with the primary outcome of each source in its
//! own column.

use crate::model::{Outcome, Source};
use anyhow::Context;
use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const REGISTRATION_COLUMN: &str = "Registrationnumber";
pub const UNIQUE_ID_COLUMN: &str = "Unique.ID";
pub const ETHICAL_PRIMARY_COLUMN: &str = "Protocol_PrimaryOutcome";
pub const PUBLICATION_PRIMARY_COLUMN: &str = "Pub_PrimaryOutcome";

/// Where the sheet is and how wide its outcome blocks are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetLayout {
    pub workbook: PathBuf,
    /// Worksheet to read; the first one when unset.
    pub worksheet: Option<String>,
    pub ethical_width: usize,
    pub publication_width: usize,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            workbook: PathBuf::from("trials.xlsx"),
            worksheet: None,
            ethical_width: 21,
            publication_width: 10,
        }
    }
}

impl SheetLayout {
    /// `(name column, instrument column)` for each slot of a source's block.
    pub fn block_columns(&self, source: Source) -> Vec<(String, String)> {
        match source {
            Source::Ethical => (1..=self.ethical_width)
                .map(|i| {
                    (
                        format!("Protocol_sec_outcome{i}"),
                        format!("Protocol_sec_instrument{i}"),
                    )
                })
                .collect(),
            Source::Publication => (b'a'..=b'z')
                .take(self.publication_width)
                .map(char::from)
                .map(|c| (format!("pub_pro_sec_{c}_name"), format!("pub_pro_sec_{c}_ins")))
                .collect(),
            Source::Registry => Vec::new(),
        }
    }

    pub fn primary_column(&self, source: Source) -> Option<&'static str> {
        match source {
            Source::Ethical => Some(ETHICAL_PRIMARY_COLUMN),
            Source::Publication => Some(PUBLICATION_PRIMARY_COLUMN),
            Source::Registry => None,
        }
    }

    fn required_columns(&self) -> Vec<String> {
        let mut columns = vec![REGISTRATION_COLUMN.to_string(), UNIQUE_ID_COLUMN.to_string()];
        for source in [Source::Ethical, Source::Publication] {
            for (name, instrument) in self.block_columns(source) {
                columns.push(name);
                columns.push(instrument);
            }
            columns.extend(self.primary_column(source).map(str::to_string));
        }
        columns
    }
}

/// Exported sheets mark empty cells with these.
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == "nan" || value == "."
}

/// One spreadsheet row, cells keyed by header.
#[derive(Debug, Clone, Default)]
pub struct SheetRow {
    cells: HashMap<String, String>,
}

impl SheetRow {
    pub fn from_cells<K: Into<String>, V: Into<String>>(cells: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            cells: cells.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Trimmed cell text, `None` for empty and placeholder cells.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !is_placeholder(v))
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.get(UNIQUE_ID_COLUMN)
    }

    pub fn registration(&self) -> Option<&str> {
        self.get(REGISTRATION_COLUMN)
    }
}

/// Counterpart outcomes of one source, numbered by block position.
///
/// The primary outcome, when present, follows the block with number
/// `width + 1`.
pub fn counterpart_outcomes(layout: &SheetLayout, source: Source, row: &SheetRow) -> Vec<Outcome> {
    let columns = layout.block_columns(source);
    let width = columns.len();
    let mut outcomes: Vec<Outcome> = columns
        .iter()
        .enumerate()
        .filter_map(|(i, (name, instrument))| {
            let measure = row.get(name)?;
            let outcome = Outcome::new(i as u32 + 1, measure, source)
                .with_instrument(row.get(instrument).unwrap_or_default());
            Some(outcome)
        })
        .collect();

    if let Some(primary) = layout.primary_column(source).and_then(|c| row.get(c)) {
        outcomes.push(Outcome::new(width as u32 + 1, primary, source).primary());
    }
    outcomes
}

/// Read every row of the configured worksheet.
pub fn read_rows(layout: &SheetLayout) -> anyhow::Result<Vec<SheetRow>> {
    read_rows_from(&layout.workbook, layout)
}

pub fn read_rows_from(path: &Path, layout: &SheetLayout) -> anyhow::Result<Vec<SheetRow>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;

    let sheet_name = match &layout.worksheet {
        Some(name) => name.clone(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Workbook {} contains no sheets", path.display()))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("Failed to read sheet '{}'", sheet_name))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_row.iter().map(cell_text).collect();

    let missing: Vec<String> = layout
        .required_columns()
        .into_iter()
        .filter(|c| !headers.contains(c))
        .collect();
    if !missing.is_empty() {
        anyhow::bail!(
            "Sheet '{}' is missing columns: {}",
            sheet_name,
            missing.join(", ")
        );
    }

    let parsed: Vec<SheetRow> = rows
        .map(|cells| {
            SheetRow::from_cells(
                headers
                    .iter()
                    .zip(cells.iter())
                    .filter(|(header, _)| !header.is_empty())
                    .map(|(header, cell)| (header.clone(), cell_text(cell))),
            )
        })
        .collect();
    tracing::debug!(sheet = %sheet_name, rows = parsed.len(), "sheet loaded");
    Ok(parsed)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        // Integral floats come from numeric id columns; print them without decimals.
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Data::Float(n) => format!("{}", n),
        Data::Int(n) => format!("{}", n),
        Data::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Data::Error(_) => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> SheetLayout {
        SheetLayout {
            ethical_width: 3,
            publication_width: 2,
            ..SheetLayout::default()
        }
    }

    #[test]
    fn placeholders_are_absent() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("nan"));
        assert!(is_placeholder(" . "));
        assert!(!is_placeholder("NaN score"));

        let row = SheetRow::from_cells([("A", "nan"), ("B", "."), ("C", " SF-36 ")]);
        assert_eq!(row.get("A"), None);
        assert_eq!(row.get("B"), None);
        assert_eq!(row.get("C"), Some("SF-36"));
        assert_eq!(row.get("D"), None);
    }

    #[test]
    fn ethical_block_keeps_slot_numbers_and_appends_primary() {
        let row = SheetRow::from_cells([
            ("Protocol_sec_outcome1", "Pain"),
            ("Protocol_sec_instrument1", "VAS"),
            ("Protocol_sec_outcome2", "nan"),
            ("Protocol_sec_instrument2", "EQ-5D"),
            ("Protocol_sec_outcome3", "Fatigue"),
            ("Protocol_sec_instrument3", "."),
            (ETHICAL_PRIMARY_COLUMN, "Overall survival"),
        ]);
        let outcomes = counterpart_outcomes(&layout(), Source::Ethical, &row);
        let numbers: Vec<u32> = outcomes.iter().map(|o| o.number).collect();
        assert_eq!(numbers, vec![1, 3, 4]);
        assert_eq!(outcomes[0].instrument, "VAS");
        assert_eq!(outcomes[1].instrument, "");
        assert!(outcomes[2].is_primary);
        assert_eq!(outcomes[2].measure, "Overall survival");
        assert!(outcomes.iter().all(|o| o.source == Source::Ethical));
    }

    #[test]
    fn publication_block_uses_letter_columns() {
        let row = SheetRow::from_cells([
            ("pub_pro_sec_a_name", "."),
            ("pub_pro_sec_b_name", "Quality of life"),
            ("pub_pro_sec_b_ins", "QLQ-C30"),
            (PUBLICATION_PRIMARY_COLUMN, "nan"),
        ]);
        let outcomes = counterpart_outcomes(&layout(), Source::Publication, &row);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].number, 2);
        assert_eq!(outcomes[0].instrument, "QLQ-C30");
        assert!(!outcomes[0].is_primary);
    }

    #[test]
    fn default_layout_matches_sheet_widths() {
        let layout = SheetLayout::default();
        let ethical = layout.block_columns(Source::Ethical);
        assert_eq!(ethical.len(), 21);
        assert_eq!(ethical[20].0, "Protocol_sec_outcome21");
        let publication = layout.block_columns(Source::Publication);
        assert_eq!(publication.len(), 10);
        assert_eq!(publication[9].1, "pub_pro_sec_j_ins");
    }

    #[test]
    fn unreadable_workbook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.xlsx");
        assert!(read_rows_from(&path, &layout()).is_err());
    }
}
