// 📥 Snapshot Loader - Raw rows from per-jurisdiction registry dumps
//
// Every dump names its columns differently ("CIN", "Company CIN",
// "corporate identification number"). The loader maps headers onto
// canonical column names and keeps provenance for each row.

use crate::entity::EntityKind;
use crate::error::SourceRef;
use crate::jurisdiction::JurisdictionRegistry;
use crate::normalizer::{RejectedRow, RejectionStage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

// ============================================================================
// CANONICAL COLUMNS
// ============================================================================

pub mod column {
    pub const CIN: &str = "cin";
    pub const COMPANY_NAME: &str = "company_name";
    pub const STATUS: &str = "status";
    pub const REGISTERED_OFFICE_ADDRESS: &str = "registered_office_address";
    pub const STATE: &str = "state";
    pub const CITY: &str = "city";
    pub const PIN: &str = "pin";
    pub const COMPANY_CATEGORY: &str = "company_category";
    pub const COMPANY_SUBCATEGORY: &str = "company_subcategory";
    pub const CLASS_OF_COMPANY: &str = "class_of_company";
    pub const AUTHORIZED_CAPITAL: &str = "authorized_capital";
    pub const PAIDUP_CAPITAL: &str = "paidup_capital";
    pub const DATE_OF_INCORPORATION: &str = "date_of_incorporation";
    pub const DATE_OF_LAST_AGM: &str = "date_of_last_agm";
    pub const DATE_OF_BALANCE_SHEET: &str = "date_of_balance_sheet";
    pub const DIN: &str = "din";
    pub const DIRECTOR_NAME: &str = "director_name";
    pub const DESIGNATION: &str = "designation";
    pub const DATE_OF_APPOINTMENT: &str = "date_of_appointment";
    pub const CHARGE_ID: &str = "charge_id";
    pub const CHARGE_HOLDER: &str = "charge_holder";
    pub const CHARGE_AMOUNT: &str = "charge_amount";
    pub const DATE_OF_CREATION: &str = "date_of_creation";
}

/// canonical column → header spellings seen in dumps (lowercase)
const COLUMN_ALIASES: &[(&str, &[&str])] = &[
    (
        column::CIN,
        &["cin", "corporate identification number", "company cin", "llpin"],
    ),
    (column::COMPANY_NAME, &["company name", "name", "company_name"]),
    (
        column::STATUS,
        &["company status", "company_status", "status", "director status", "charge status"],
    ),
    (
        column::REGISTERED_OFFICE_ADDRESS,
        &["registered office address", "address", "registered_address"],
    ),
    (column::STATE, &["state", "company state", "roc state"]),
    (column::CITY, &["city", "company city"]),
    (column::PIN, &["pin", "pincode", "pin code"]),
    (column::COMPANY_CATEGORY, &["company category", "category"]),
    (column::COMPANY_SUBCATEGORY, &["company subcategory", "subcategory"]),
    (column::CLASS_OF_COMPANY, &["class of company", "class"]),
    (
        column::AUTHORIZED_CAPITAL,
        &["authorized capital", "authorised capital", "auth_capital", "authorized capital (rs)"],
    ),
    (
        column::PAIDUP_CAPITAL,
        &[
            "paid-up capital",
            "paidup capital",
            "paidup_capital",
            "paid up capital",
            "paid-up capital (rs)",
        ],
    ),
    (
        column::DATE_OF_INCORPORATION,
        &[
            "date of incorporation",
            "incorporation_date",
            "date_of_registration",
            "date of registration",
        ],
    ),
    (column::DATE_OF_LAST_AGM, &["date of last agm", "last_agm_date"]),
    (
        column::DATE_OF_BALANCE_SHEET,
        &["date of balance sheet", "balance_sheet_date"],
    ),
    (column::DIN, &["din", "director identification number", "din/pan"]),
    (column::DIRECTOR_NAME, &["director name", "director_name", "name of director"]),
    (column::DESIGNATION, &["designation"]),
    (
        column::DATE_OF_APPOINTMENT,
        &["date of appointment", "appointment_date", "appointment date"],
    ),
    (column::CHARGE_ID, &["charge id", "charge_id", "srn"]),
    (column::CHARGE_HOLDER, &["charge holder", "charge_holder", "charge holder name"]),
    (column::CHARGE_AMOUNT, &["charge amount", "charge_amount", "amount"]),
    (
        column::DATE_OF_CREATION,
        &["date of creation", "creation_date", "charge creation date"],
    ),
];

/// Map a source header to its canonical column name
pub fn canonical_column(header: &str) -> Option<&'static str> {
    let key = header
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    COLUMN_ALIASES
        .iter()
        .find(|(canonical, aliases)| *canonical == key || aliases.contains(&key.as_str()))
        .map(|(canonical, _)| *canonical)
}

// ============================================================================
// RAW ROW
// ============================================================================

/// One row of a registry dump before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    /// canonical column → raw cell text (empty cells omitted)
    pub fields: BTreeMap<String, String>,

    /// Record kind this dump contains
    pub kind: EntityKind,

    /// Jurisdiction of the dump itself (config or file name)
    pub jurisdiction_hint: Option<String>,

    // Provenance
    pub source_file: String,
    pub line_number: usize,
}

impl RawRow {
    pub fn new(kind: EntityKind, source_file: &str, line_number: usize) -> Self {
        RawRow {
            fields: BTreeMap::new(),
            kind,
            jurisdiction_hint: None,
            source_file: source_file.to_string(),
            line_number,
        }
    }

    /// Builder: set a canonical column (empty values are skipped)
    pub fn with_field(mut self, column: &str, value: &str) -> Self {
        self.set(column, value);
        self
    }

    /// Builder: set the jurisdiction of the dump
    pub fn with_jurisdiction(mut self, jurisdiction: &str) -> Self {
        self.jurisdiction_hint = Some(jurisdiction.to_string());
        self
    }

    pub fn set(&mut self, column: &str, value: &str) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            self.fields.insert(column.to_string(), trimmed.to_string());
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(|s| s.as_str())
    }
}

// ============================================================================
// SOURCE FILES
// ============================================================================

/// One dump to ingest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: std::path::PathBuf,

    /// Explicit jurisdiction; detected from the file name when absent
    #[serde(default)]
    pub jurisdiction: Option<String>,

    #[serde(default)]
    pub kind: EntityKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSummary {
    pub rows: usize,
    pub mapped_columns: BTreeSet<String>,
    pub unmapped_columns: BTreeSet<String>,
    pub jurisdiction: Option<String>,

    /// Records that could not be read or decoded; the rest of the dump still loads
    pub unreadable: Vec<RejectedRow>,
}

/// Load one CSV dump into raw rows.
///
/// Header spellings are mapped via `canonical_column`; unmapped columns are
/// dropped and listed in the summary. A record that is not valid UTF-8 or
/// cannot be parsed lands in `LoadSummary::unreadable`.
pub fn load_csv(
    source: &SourceFile,
    registry: &JurisdictionRegistry,
) -> Result<(Vec<RawRow>, LoadSummary)> {
    let file_name = source.path.display().to_string();
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(&source.path)
        .with_context(|| format!("Failed to open CSV file {}", file_name))?;

    let headers: Vec<String> = rdr
        .byte_headers()
        .with_context(|| format!("Failed to read CSV headers from {}", file_name))?
        .iter()
        .map(|h| String::from_utf8_lossy(h).into_owned())
        .collect();

    let mut summary = LoadSummary::default();
    let mapping: Vec<Option<&'static str>> = headers
        .iter()
        .map(|h| {
            let mapped = canonical_column(h);
            match mapped {
                Some(c) => {
                    summary.mapped_columns.insert(c.to_string());
                }
                None => {
                    summary.unmapped_columns.insert(h.to_string());
                }
            }
            mapped
        })
        .collect();

    let jurisdiction = source
        .jurisdiction
        .clone()
        .or_else(|| registry.detect_from_file_name(&file_name));
    summary.jurisdiction = jurisdiction.clone();

    let mut rows = Vec::new();
    let mut record = csv::ByteRecord::new();
    loop {
        let fallback_line = rows.len() + summary.unreadable.len() + 2;
        match rdr.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) if matches!(e.kind(), csv::ErrorKind::Io(_)) => {
                return Err(e).with_context(|| format!("Failed to read {}", file_name));
            }
            Err(e) => {
                let line_number = e.position().map(|p| p.line() as usize).unwrap_or(fallback_line);
                summary.unreadable.push(unreadable_row(
                    &file_name,
                    line_number,
                    jurisdiction.clone(),
                    format!("unparseable record: {}", e),
                    BTreeMap::new(),
                ));
                continue;
            }
        }
        let line_number = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(fallback_line);

        let mut row = RawRow::new(source.kind, &file_name, line_number);
        row.jurisdiction_hint = jurisdiction.clone();
        let mut undecodable = None;
        for (idx, value) in record.iter().enumerate() {
            let Some(Some(column)) = mapping.get(idx) else {
                continue;
            };
            match std::str::from_utf8(value) {
                Ok(text) => row.set(column, text),
                Err(_) => {
                    undecodable.get_or_insert(*column);
                    row.set(column, &String::from_utf8_lossy(value));
                }
            }
        }

        match undecodable {
            None => rows.push(row),
            Some(column) => summary.unreadable.push(unreadable_row(
                &file_name,
                line_number,
                jurisdiction.clone(),
                format!("invalid UTF-8 in column `{}`", column),
                row.fields,
            )),
        }
    }

    summary.rows = rows.len();
    if !summary.unreadable.is_empty() {
        warn!(
            file = %file_name,
            unreadable = summary.unreadable.len(),
            "skipped unreadable records"
        );
    }
    if !summary.unmapped_columns.is_empty() {
        debug!(
            file = %file_name,
            unmapped = ?summary.unmapped_columns,
            "dropping unmapped columns"
        );
    }
    info!(
        file = %file_name,
        rows = summary.rows,
        jurisdiction = ?summary.jurisdiction,
        kind = source.kind.as_str(),
        "loaded dump"
    );

    Ok((rows, summary))
}

fn unreadable_row(
    file_name: &str,
    line_number: usize,
    jurisdiction: Option<String>,
    reason: String,
    raw: BTreeMap<String, String>,
) -> RejectedRow {
    RejectedRow {
        source: SourceRef {
            source_file: file_name.to_string(),
            line_number,
        },
        jurisdiction,
        stage: RejectionStage::Normalization,
        reason,
        raw,
    }
}

/// Load several dumps, preserving file order then row order.
pub fn load_sources(
    sources: &[SourceFile],
    registry: &JurisdictionRegistry,
) -> Result<(Vec<RawRow>, Vec<LoadSummary>)> {
    let mut all_rows = Vec::new();
    let mut summaries = Vec::new();
    for source in sources {
        let (rows, summary) = load_csv(source, registry)?;
        all_rows.extend(rows);
        summaries.push(summary);
    }
    Ok((all_rows, summaries))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_canonical_column_aliases() {
        assert_eq!(canonical_column("CIN"), Some(column::CIN));
        assert_eq!(
            canonical_column("Corporate Identification Number"),
            Some(column::CIN)
        );
        assert_eq!(canonical_column("Company Name"), Some(column::COMPANY_NAME));
        assert_eq!(
            canonical_column("  Paid-up   Capital "),
            Some(column::PAIDUP_CAPITAL)
        );
        assert_eq!(
            canonical_column("AUTHORISED CAPITAL"),
            Some(column::AUTHORIZED_CAPITAL)
        );
        assert_eq!(canonical_column("company_status"), Some(column::STATUS));
        assert_eq!(canonical_column("Email"), None);
    }

    #[test]
    fn test_raw_row_skips_empty_cells() {
        let row = RawRow::new(EntityKind::Company, "x.csv", 2)
            .with_field(column::CIN, "  ")
            .with_field(column::COMPANY_NAME, " Acme Ltd ");
        assert_eq!(row.get(column::CIN), None);
        assert_eq!(row.get(column::COMPANY_NAME), Some("Acme Ltd"));
    }

    #[test]
    fn test_load_csv_maps_headers_and_detects_jurisdiction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maharashtra.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "CIN,Company Name,Company Status,Email,Date of Incorporation").unwrap();
        writeln!(f, "U72900MH2000PTC124845,Acme Pvt Ltd,Active,a@b.c,15-01-2000").unwrap();
        writeln!(f, ",Beta Ltd,Active,,01-02-2001").unwrap();
        drop(f);

        let source = SourceFile {
            path: path.clone(),
            jurisdiction: None,
            kind: EntityKind::Company,
        };
        let registry = JurisdictionRegistry::new();
        let (rows, summary) = load_csv(&source, &registry).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.jurisdiction, Some("MH".to_string()));
        assert!(summary.unmapped_columns.contains("Email"));

        assert_eq!(rows[0].get(column::CIN), Some("U72900MH2000PTC124845"));
        assert_eq!(rows[0].line_number, 2);
        assert_eq!(rows[0].jurisdiction_hint, Some("MH".to_string()));
        assert_eq!(rows[1].get(column::CIN), None);
        assert_eq!(rows[1].line_number, 3);
        assert!(rows[0].fields.get("Email").is_none());
    }

    #[test]
    fn test_explicit_jurisdiction_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maharashtra.csv");
        std::fs::write(&path, "CIN,Company Name\nX,Y\n").unwrap();

        let source = SourceFile {
            path,
            jurisdiction: Some("GJ".to_string()),
            kind: EntityKind::Company,
        };
        let (rows, _) = load_csv(&source, &JurisdictionRegistry::new()).unwrap();
        assert_eq!(rows[0].jurisdiction_hint, Some("GJ".to_string()));
    }

    #[test]
    fn test_invalid_utf8_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maharashtra.csv");
        let mut bytes = b"CIN,Company Name\n".to_vec();
        bytes.extend_from_slice(b"U72900MH2000PTC124845,Acme Ltd\n");
        bytes.extend_from_slice(b"U72900MH2000PTC124846,Caf\xe9 Ltd\n");
        bytes.extend_from_slice(b"U72900MH2000PTC124847,Beta Ltd\n");
        std::fs::write(&path, bytes).unwrap();

        let source = SourceFile {
            path,
            jurisdiction: None,
            kind: EntityKind::Company,
        };
        let (rows, summary) = load_csv(&source, &JurisdictionRegistry::new()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].line_number, 4);
        assert_eq!(summary.unreadable.len(), 1);
        let bad = &summary.unreadable[0];
        assert_eq!(bad.source.line_number, 3);
        assert_eq!(bad.stage, RejectionStage::Normalization);
        assert_eq!(bad.jurisdiction.as_deref(), Some("MH"));
        assert!(bad.reason.contains("company_name"));
        assert_eq!(bad.raw.get(column::CIN).map(String::as_str), Some("U72900MH2000PTC124846"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let source = SourceFile {
            path: "/nonexistent/none.csv".into(),
            jurisdiction: None,
            kind: EntityKind::Company,
        };
        assert!(load_csv(&source, &JurisdictionRegistry::new()).is_err());
    }
}
