// 🧹 Record Normalizer - Raw rows → CanonicalEntity
//
// Pure function of the input row. Loosely typed cells become closed enums,
// calendar dates and fixed-precision money here, so nothing downstream ever
// sees upstream schema drift.

use crate::engine::CancellationToken;
use crate::entity::{attr, AttributeValue, CanonicalEntity, EntityKind, EntityStatus};
use crate::error::{SourceRef, ValidationError};
use crate::jurisdiction::JurisdictionRegistry;
use crate::loader::{column, RawRow};
use chrono::NaiveDate;
use rayon::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

/// Accepted date layouts, tried in order
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%d-%b-%Y", "%d %b %Y",
];

/// Fractional digits kept for money
const MONEY_SCALE: u32 = 2;

// ============================================================================
// REJECTED ROWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStage {
    Normalization,
    Identity,
}

impl RejectionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionStage::Normalization => "normalization",
            RejectionStage::Identity => "identity",
        }
    }
}

/// One entry of the per-run rejected-rows log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub source: SourceRef,
    pub jurisdiction: Option<String>,
    pub stage: RejectionStage,
    pub reason: String,
    pub raw: BTreeMap<String, String>,
}

impl RejectedRow {
    pub fn from_raw(row: &RawRow, stage: RejectionStage, reason: String) -> Self {
        RejectedRow {
            source: SourceRef {
                source_file: row.source_file.clone(),
                line_number: row.line_number,
            },
            jurisdiction: row.jurisdiction_hint.clone(),
            stage,
            reason,
            raw: row.fields.clone(),
        }
    }

    pub fn from_entity(entity: &CanonicalEntity, stage: RejectionStage, reason: String) -> Self {
        RejectedRow {
            source: entity.source.clone(),
            jurisdiction: Some(entity.jurisdiction.clone()),
            stage,
            reason,
            raw: entity.to_raw_row().fields,
        }
    }
}

// ============================================================================
// NORMALIZED BATCH
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// In source row order
    pub entities: Vec<CanonicalEntity>,
    pub rejected: Vec<RejectedRow>,
    /// Stopped early on a cancellation request
    pub cancelled: bool,
}

// ============================================================================
// IDENTIFIER FORMATS
// ============================================================================

/// 21-char CIN: L/U, 5-digit industry, 2-letter state, 4-digit year,
/// 3-letter ownership, 6-digit serial.
///
/// Example: U72900MH2000PTC124845
pub fn is_valid_cin(value: &str) -> bool {
    let b = value.as_bytes();
    if b.len() != 21 {
        return false;
    }
    let digits = |r: std::ops::Range<usize>| b[r].iter().all(|c| c.is_ascii_digit());
    let letters = |r: std::ops::Range<usize>| b[r].iter().all(|c| c.is_ascii_uppercase());

    (b[0] == b'L' || b[0] == b'U')
        && digits(1..6)
        && letters(6..8)
        && digits(8..12)
        && letters(12..15)
        && digits(15..21)
}

/// LLP identification number, e.g. AAB-1234
pub fn is_valid_llpin(value: &str) -> bool {
    let b = value.as_bytes();
    b.len() == 8
        && b[..3].iter().all(|c| c.is_ascii_uppercase())
        && b[3] == b'-'
        && b[4..].iter().all(|c| c.is_ascii_digit())
}

pub const DIRECTOR_PREFIX: &str = "DIN-";
pub const CHARGE_PREFIX: &str = "CHG-";

fn is_digits(raw: &str, max_len: usize) -> bool {
    !raw.is_empty() && raw.len() <= max_len && raw.bytes().all(|c| c.is_ascii_digit())
}

/// Authoritative key for a raw identifier, None when absent or malformed
pub fn authoritative_id(kind: EntityKind, raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    match kind {
        EntityKind::Company => {
            let upper = raw.to_uppercase();
            (is_valid_cin(&upper) || is_valid_llpin(&upper)).then_some(upper)
        }
        EntityKind::Director => {
            let valid = is_digits(raw, 8);
            valid.then(|| format!("{}{:0>8}", DIRECTOR_PREFIX, raw))
        }
        EntityKind::Charge => {
            let valid = is_digits(raw, 12);
            valid.then(|| {
                let trimmed = raw.trim_start_matches('0');
                format!("{}{}", CHARGE_PREFIX, if trimmed.is_empty() { "0" } else { trimmed })
            })
        }
    }
}

/// Raw identifier column for each kind
fn identifier_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Company => column::CIN,
        EntityKind::Director => column::DIN,
        EntityKind::Charge => column::CHARGE_ID,
    }
}

// ============================================================================
// FIELD COERCION
// ============================================================================

/// Trim and collapse internal whitespace. Case is preserved.
pub fn clean_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ValidationError> {
    let value = value.trim();
    // Spreadsheet exports often carry a midnight time component
    let date_part = value.split(['T', ' ']).next().unwrap_or(value);

    for candidate in [value, date_part] {
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
                return Ok(date);
            }
        }
    }

    Err(ValidationError::MalformedDate {
        field: field.to_string(),
        value: value.to_string(),
    })
}

pub fn parse_money(field: &str, value: &str) -> Result<Decimal, ValidationError> {
    let malformed = || ValidationError::MalformedAmount {
        field: field.to_string(),
        value: value.to_string(),
    };

    let mut cleaned = value.trim().replace('₹', "");
    for prefix in ["INR", "Rs.", "Rs", "rs.", "rs"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.to_string();
            break;
        }
    }
    let cleaned: String = cleaned
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Err(malformed());
    }

    let amount = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|_| malformed())?;

    let mut amount =
        amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    amount.rescale(MONEY_SCALE);
    Ok(amount)
}

fn parse_references(value: &str) -> Vec<String> {
    let mut refs: Vec<String> = value
        .split([';', ',', '|'])
        .map(|r| r.trim().to_uppercase())
        .filter(|r| !r.is_empty())
        .collect();
    refs.sort();
    refs.dedup();
    refs
}

// ============================================================================
// NORMALIZER
// ============================================================================

pub struct Normalizer {
    registry: JurisdictionRegistry,
}

impl Normalizer {
    pub fn new(registry: JurisdictionRegistry) -> Self {
        Normalizer { registry }
    }

    pub fn registry(&self) -> &JurisdictionRegistry {
        &self.registry
    }

    /// Normalize one raw row.
    ///
    /// A missing or malformed identifier is NOT an error here: the entity
    /// comes back without `entity_id` and the identity resolver decides.
    pub fn normalize(&self, row: &RawRow) -> Result<CanonicalEntity, ValidationError> {
        let jurisdiction = self.resolve_jurisdiction(row)?;
        let status = row
            .get(column::STATUS)
            .map(EntityStatus::from_raw)
            .unwrap_or(EntityStatus::Unknown);

        let mut attributes = BTreeMap::new();
        match row.kind {
            EntityKind::Company => self.company_attributes(row, &mut attributes)?,
            EntityKind::Director => self.director_attributes(row, &mut attributes)?,
            EntityKind::Charge => self.charge_attributes(row, &mut attributes)?,
        }

        let source = SourceRef {
            source_file: row.source_file.clone(),
            line_number: row.line_number,
        };
        let mut entity = CanonicalEntity::new(row.kind, jurisdiction, status, attributes, source);

        let raw_id = row.get(identifier_column(row.kind));
        match authoritative_id(row.kind, raw_id) {
            Some(id) => entity.entity_id = id,
            None => debug!(
                source_file = %row.source_file,
                line = row.line_number,
                raw_id = ?raw_id,
                "identifier missing or malformed, deferring to composite key"
            ),
        }

        Ok(entity)
    }

    /// Normalize a batch in parallel on the current rayon pool.
    ///
    /// Output keeps source row order. Malformed rows are collected, never fatal.
    pub fn normalize_batch(&self, rows: &[RawRow], cancel: &CancellationToken) -> NormalizedBatch {
        let results: Vec<Option<Result<CanonicalEntity, ValidationError>>> = rows
            .par_iter()
            .map(|row| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.normalize(row))
            })
            .collect();

        let mut batch = NormalizedBatch::default();
        for (row, result) in rows.iter().zip(results) {
            match result {
                Some(Ok(entity)) => batch.entities.push(entity),
                Some(Err(err)) => {
                    debug!(
                        source_file = %row.source_file,
                        line = row.line_number,
                        reason = %err,
                        "row rejected"
                    );
                    batch.rejected.push(RejectedRow::from_raw(
                        row,
                        RejectionStage::Normalization,
                        err.to_string(),
                    ));
                }
                None => batch.cancelled = true,
            }
        }
        batch
    }

    fn resolve_jurisdiction(&self, row: &RawRow) -> Result<String, ValidationError> {
        let value = row
            .jurisdiction_hint
            .as_deref()
            .or_else(|| row.get(column::STATE))
            .ok_or_else(|| ValidationError::missing(column::STATE))?;

        self.registry
            .normalize(value)
            .ok_or_else(|| ValidationError::UnknownJurisdiction {
                value: value.to_string(),
            })
    }

    fn company_attributes(
        &self,
        row: &RawRow,
        attributes: &mut BTreeMap<String, AttributeValue>,
    ) -> Result<(), ValidationError> {
        let name = row
            .get(column::COMPANY_NAME)
            .ok_or_else(|| ValidationError::missing(column::COMPANY_NAME))?;
        attributes.insert(attr::NAME.to_string(), AttributeValue::Text(clean_text(name)));

        for (col, name) in [
            (column::REGISTERED_OFFICE_ADDRESS, attr::REGISTERED_ADDRESS),
            (column::CITY, attr::CITY),
            (column::PIN, attr::PIN),
            (column::COMPANY_CATEGORY, attr::CATEGORY),
            (column::COMPANY_SUBCATEGORY, attr::SUBCATEGORY),
            (column::CLASS_OF_COMPANY, attr::CLASS),
        ] {
            insert_text(row, col, name, attributes);
        }

        insert_money(row, column::AUTHORIZED_CAPITAL, attr::AUTHORIZED_CAPITAL, attributes)?;
        insert_money(row, column::PAIDUP_CAPITAL, attr::PAIDUP_CAPITAL, attributes)?;

        insert_date(row, column::DATE_OF_INCORPORATION, attr::INCORPORATION_DATE, attributes)?;
        insert_date(row, column::DATE_OF_LAST_AGM, attr::LAST_AGM_DATE, attributes)?;
        insert_date(row, column::DATE_OF_BALANCE_SHEET, attr::BALANCE_SHEET_DATE, attributes)?;
        Ok(())
    }

    fn director_attributes(
        &self,
        row: &RawRow,
        attributes: &mut BTreeMap<String, AttributeValue>,
    ) -> Result<(), ValidationError> {
        let name = row
            .get(column::DIRECTOR_NAME)
            .or_else(|| row.get(column::COMPANY_NAME))
            .ok_or_else(|| ValidationError::missing(column::DIRECTOR_NAME))?;
        attributes.insert(attr::NAME.to_string(), AttributeValue::Text(clean_text(name)));

        insert_text(row, column::DESIGNATION, attr::DESIGNATION, attributes);
        insert_date(row, column::DATE_OF_APPOINTMENT, attr::APPOINTMENT_DATE, attributes)?;
        insert_references(row, attributes);
        Ok(())
    }

    fn charge_attributes(
        &self,
        row: &RawRow,
        attributes: &mut BTreeMap<String, AttributeValue>,
    ) -> Result<(), ValidationError> {
        let holder = row
            .get(column::CHARGE_HOLDER)
            .ok_or_else(|| ValidationError::missing(column::CHARGE_HOLDER))?;
        attributes.insert(
            attr::CHARGE_HOLDER.to_string(),
            AttributeValue::Text(clean_text(holder)),
        );

        insert_money(row, column::CHARGE_AMOUNT, attr::CHARGE_AMOUNT, attributes)?;
        insert_date(row, column::DATE_OF_CREATION, attr::CREATION_DATE, attributes)?;
        insert_references(row, attributes);
        Ok(())
    }
}

fn insert_text(
    row: &RawRow,
    col: &str,
    name: &str,
    attributes: &mut BTreeMap<String, AttributeValue>,
) {
    if let Some(value) = row.get(col) {
        attributes.insert(name.to_string(), AttributeValue::Text(clean_text(value)));
    }
}

fn insert_money(
    row: &RawRow,
    col: &str,
    name: &str,
    attributes: &mut BTreeMap<String, AttributeValue>,
) -> Result<(), ValidationError> {
    if let Some(value) = row.get(col) {
        attributes.insert(name.to_string(), AttributeValue::Money(parse_money(col, value)?));
    }
    Ok(())
}

fn insert_date(
    row: &RawRow,
    col: &str,
    name: &str,
    attributes: &mut BTreeMap<String, AttributeValue>,
) -> Result<(), ValidationError> {
    if let Some(value) = row.get(col) {
        attributes.insert(name.to_string(), AttributeValue::Date(parse_date(col, value)?));
    }
    Ok(())
}

fn insert_references(row: &RawRow, attributes: &mut BTreeMap<String, AttributeValue>) {
    if let Some(value) = row.get(column::CIN) {
        let refs = parse_references(value);
        if !refs.is_empty() {
            attributes.insert(attr::COMPANY_IDS.to_string(), AttributeValue::References(refs));
        }
    }
}

// ============================================================================
// CANONICAL → RAW (re-serialization)
// ============================================================================

impl CanonicalEntity {
    /// Re-serialize into a raw row the normalizer accepts.
    ///
    /// Derived attributes added by enrichment have no source column and are
    /// not emitted.
    pub fn to_raw_row(&self) -> RawRow {
        let mut row = RawRow::new(self.kind, &self.source.source_file, self.source.line_number)
            .with_jurisdiction(&self.jurisdiction)
            .with_field(column::STATUS, self.status.as_str());

        let raw_id = match self.kind {
            EntityKind::Company => Some(self.entity_id.as_str()),
            EntityKind::Director => self.entity_id.strip_prefix(DIRECTOR_PREFIX),
            EntityKind::Charge => self.entity_id.strip_prefix(CHARGE_PREFIX),
        };
        if let Some(raw_id) = raw_id {
            if !self.identity_uncertain {
                row.set(identifier_column(self.kind), raw_id);
            }
        }

        let columns: &[(&str, &str)] = match self.kind {
            EntityKind::Company => &[
                (attr::NAME, column::COMPANY_NAME),
                (attr::REGISTERED_ADDRESS, column::REGISTERED_OFFICE_ADDRESS),
                (attr::CITY, column::CITY),
                (attr::PIN, column::PIN),
                (attr::CATEGORY, column::COMPANY_CATEGORY),
                (attr::SUBCATEGORY, column::COMPANY_SUBCATEGORY),
                (attr::CLASS, column::CLASS_OF_COMPANY),
                (attr::AUTHORIZED_CAPITAL, column::AUTHORIZED_CAPITAL),
                (attr::PAIDUP_CAPITAL, column::PAIDUP_CAPITAL),
                (attr::INCORPORATION_DATE, column::DATE_OF_INCORPORATION),
                (attr::LAST_AGM_DATE, column::DATE_OF_LAST_AGM),
                (attr::BALANCE_SHEET_DATE, column::DATE_OF_BALANCE_SHEET),
            ],
            EntityKind::Director => &[
                (attr::NAME, column::DIRECTOR_NAME),
                (attr::DESIGNATION, column::DESIGNATION),
                (attr::APPOINTMENT_DATE, column::DATE_OF_APPOINTMENT),
                (attr::COMPANY_IDS, column::CIN),
            ],
            EntityKind::Charge => &[
                (attr::CHARGE_HOLDER, column::CHARGE_HOLDER),
                (attr::CHARGE_AMOUNT, column::CHARGE_AMOUNT),
                (attr::CREATION_DATE, column::DATE_OF_CREATION),
                (attr::COMPANY_IDS, column::CIN),
            ],
        };

        for (name, col) in columns {
            if let Some(value) = self.attributes.get(*name) {
                row.set(col, &value.to_raw_string());
            }
        }
        row
    }
}

// ============================================================================
// TESTS
// ============================================================================
