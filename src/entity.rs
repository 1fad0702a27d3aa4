// 🏢 Canonical Entity - One registry record in normalized form
//
// Identity: entity_id (CIN / DIN / charge id, immutable once assigned)
// Values: status + attributes (change between generations, never in place)

use crate::error::SourceRef;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ============================================================================
// ENTITY KIND
// ============================================================================

/// Companies, directors and charges share the same consolidation machinery.
/// Directors and charges point at companies through `company_ids`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Director,
    Charge,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Director => "director",
            EntityKind::Charge => "charge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "company" | "companies" => Some(EntityKind::Company),
            "director" | "directors" => Some(EntityKind::Director),
            "charge" | "charges" => Some(EntityKind::Charge),
            _ => None,
        }
    }

    /// Attribute holding the display name used for composite keys
    pub fn name_attribute(&self) -> &'static str {
        match self {
            EntityKind::Company | EntityKind::Director => attr::NAME,
            EntityKind::Charge => attr::CHARGE_HOLDER,
        }
    }

    /// Attribute holding the "birth" date used for composite keys
    pub fn date_attribute(&self) -> &'static str {
        match self {
            EntityKind::Company => attr::INCORPORATION_DATE,
            EntityKind::Director => attr::APPOINTMENT_DATE,
            EntityKind::Charge => attr::CREATION_DATE,
        }
    }
}

impl Default for EntityKind {
    fn default() -> Self {
        EntityKind::Company
    }
}

/// Canonical attribute names
pub mod attr {
    pub const NAME: &str = "name";
    pub const INCORPORATION_DATE: &str = "incorporation_date";
    pub const REGISTERED_ADDRESS: &str = "registered_address";
    pub const CITY: &str = "city";
    pub const PIN: &str = "pin";
    pub const CATEGORY: &str = "category";
    pub const SUBCATEGORY: &str = "subcategory";
    pub const CLASS: &str = "class";
    pub const AUTHORIZED_CAPITAL: &str = "authorized_capital";
    pub const PAIDUP_CAPITAL: &str = "paidup_capital";
    pub const LAST_AGM_DATE: &str = "last_agm_date";
    pub const BALANCE_SHEET_DATE: &str = "balance_sheet_date";
    pub const DESIGNATION: &str = "designation";
    pub const APPOINTMENT_DATE: &str = "appointment_date";
    pub const CHARGE_HOLDER: &str = "charge_holder";
    pub const CHARGE_AMOUNT: &str = "charge_amount";
    pub const CREATION_DATE: &str = "creation_date";
    pub const COMPANY_IDS: &str = "company_ids";
}

// ============================================================================
// STATUS
// ============================================================================

/// Closed status enumeration. Anything upstream invents maps to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    StruckOff,
    Dissolved,
    UnderLiquidation,
    Amalgamated,
    Unknown,
}

impl EntityStatus {
    pub const ALL: [EntityStatus; 6] = [
        EntityStatus::Active,
        EntityStatus::StruckOff,
        EntityStatus::Dissolved,
        EntityStatus::UnderLiquidation,
        EntityStatus::Amalgamated,
        EntityStatus::Unknown,
    ];

    /// Map a raw status code. Never fails.
    ///
    /// Example: "Strike Off" → StruckOff, "ACTIVE" → Active, "Dormant" → Unknown
    pub fn from_raw(value: &str) -> Self {
        let key: String = value
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        match key.as_str() {
            "active" => EntityStatus::Active,
            "struck off" | "strike off" | "struckoff" | "strikeoff" => EntityStatus::StruckOff,
            "dissolved" => EntityStatus::Dissolved,
            "under liquidation" | "liquidation" | "in liquidation" => {
                EntityStatus::UnderLiquidation
            }
            "amalgamated" => EntityStatus::Amalgamated,
            _ => EntityStatus::Unknown,
        }
    }

    /// Strict parse of a status name as printed by `as_str` (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::StruckOff => "struck_off",
            EntityStatus::Dissolved => "dissolved",
            EntityStatus::UnderLiquidation => "under_liquidation",
            EntityStatus::Amalgamated => "amalgamated",
            EntityStatus::Unknown => "unknown",
        }
    }
}

// ============================================================================
// ATTRIBUTE VALUE
// ============================================================================

/// Normalized attribute value. Money is fixed-precision, dates are calendar
/// dates, references are entity ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Date(NaiveDate),
    Money(Decimal),
    Integer(i64),
    References(Vec<String>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            AttributeValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_money(&self) -> Option<Decimal> {
        match self {
            AttributeValue::Money(m) => Some(*m),
            _ => None,
        }
    }

    pub fn as_references(&self) -> Option<&[String]> {
        match self {
            AttributeValue::References(r) => Some(r),
            _ => None,
        }
    }

    /// Flat string form, re-parseable by the normalizer
    pub fn to_raw_string(&self) -> String {
        match self {
            AttributeValue::Text(s) => s.clone(),
            AttributeValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            AttributeValue::Money(m) => m.to_string(),
            AttributeValue::Integer(i) => i.to_string(),
            AttributeValue::References(refs) => refs.join(";"),
        }
    }
}

// ============================================================================
// CANONICAL ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    /// Stable key. Empty until the identity resolver assigns one.
    #[serde(default)]
    pub entity_id: String,

    pub kind: EntityKind,

    /// Two-letter jurisdiction code
    pub jurisdiction: String,

    // ========================================================================
    // VALUES
    // ========================================================================
    pub status: EntityStatus,

    pub attributes: BTreeMap<String, AttributeValue>,

    /// sha256 over `attributes` (sorted keys)
    pub checksum: String,

    // ========================================================================
    // PROVENANCE
    // ========================================================================
    /// Ingestion run (generation number) that last touched this record
    #[serde(default)]
    pub source_generation: u64,

    /// Identifier was missing or malformed; resolved through the composite key
    #[serde(default)]
    pub identity_uncertain: bool,

    pub source: SourceRef,
}

impl CanonicalEntity {
    pub fn new(
        kind: EntityKind,
        jurisdiction: String,
        status: EntityStatus,
        attributes: BTreeMap<String, AttributeValue>,
        source: SourceRef,
    ) -> Self {
        let checksum = compute_checksum(&attributes);
        CanonicalEntity {
            entity_id: String::new(),
            kind,
            jurisdiction,
            status,
            attributes,
            checksum,
            source_generation: 0,
            identity_uncertain: false,
            source,
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = entity_id.into();
        self
    }

    pub fn has_identity(&self) -> bool {
        !self.entity_id.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Display name (company/director name, charge holder)
    pub fn name(&self) -> Option<&str> {
        self.attribute(self.kind.name_attribute())
            .and_then(|v| v.as_text())
    }

    /// Recompute the checksum after attributes changed
    pub fn refresh_checksum(&mut self) {
        self.checksum = compute_checksum(&self.attributes);
    }

    /// Deterministic fallback key: jurisdiction + normalized name + birth date.
    ///
    /// None when either part is missing.
    pub fn composite_key(&self) -> Option<String> {
        let name = self.name()?;
        let date = self
            .attribute(self.kind.date_attribute())
            .and_then(|v| v.as_date())?;
        let name_key = name_key(name);
        if name_key.is_empty() {
            return None;
        }
        Some(format!(
            "{}|{}|{}|{}",
            self.kind.as_str(),
            self.jurisdiction,
            name_key,
            date.format("%Y-%m-%d")
        ))
    }
}

/// Content hash over normalized attributes.
///
/// BTreeMap iteration is key-ordered, so source column order never
/// changes the hash.
pub fn compute_checksum(attributes: &BTreeMap<String, AttributeValue>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in attributes {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value_tag(value).as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.to_raw_string().as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}

fn value_tag(value: &AttributeValue) -> &'static str {
    match value {
        AttributeValue::Text(_) => "text",
        AttributeValue::Date(_) => "date",
        AttributeValue::Money(_) => "money",
        AttributeValue::Integer(_) => "integer",
        AttributeValue::References(_) => "references",
    }
}

/// Uppercase alphanumerics with legal-form spellings unified.
///
/// Example: "Acme Private Limited" and "ACME PVT. LTD." → "ACMEPVTLTD"
pub fn name_key(name: &str) -> String {
    let words: Vec<String> = name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_uppercase())
        .collect();

    let mut out = String::new();
    for word in words {
        let unified = match word.as_str() {
            "PRIVATE" | "PVT" => "PVT",
            "LIMITED" | "LTD" => "LTD",
            "COMPANY" | "CO" => "CO",
            other => other,
        };
        out.push_str(unified);
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================
