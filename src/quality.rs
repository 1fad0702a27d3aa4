// ✅ Data Quality - Per-generation completeness and sanity checks
//
// Computed from one immutable generation, so it can run at any time after
// promotion without touching the store.

use crate::entity::{attr, CanonicalEntity, EntityKind, EntityStatus};
use crate::store::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Records lost or unusable
    Warning,  // Questionable or incomplete data
    Info,     // Valid but worth a look
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub field: String,
    pub issue: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCompleteness {
    pub present: usize,
    pub missing: usize,
    pub completeness_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub generation: u64,
    pub generated_at: DateTime<Utc>,
    pub total_records: usize,

    /// Keyed "<kind>.<attribute>"
    pub completeness: BTreeMap<String, FieldCompleteness>,
    pub overall_completeness_pct: f64,

    pub negative_authorized_capital: usize,
    pub identity_uncertain: usize,
    pub unknown_status: usize,
    pub rejected_rows: usize,

    pub by_jurisdiction: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,

    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn summary(&self) -> String {
        format!(
            "Generation {}: {} records, completeness {:.2}%, issues: {} ({} critical)",
            self.generation,
            self.total_records,
            self.overall_completeness_pct,
            self.issues.len(),
            self.issues
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count()
        )
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

pub struct QualityAnalyzer {
    /// Field completeness below this raises a warning
    completeness_threshold_pct: f64,

    /// Rejected share of input rows above this is critical
    rejection_threshold_pct: f64,
}

impl QualityAnalyzer {
    pub fn new() -> Self {
        QualityAnalyzer {
            completeness_threshold_pct: 90.0,
            rejection_threshold_pct: 5.0,
        }
    }

    fn key_attributes(kind: EntityKind) -> &'static [&'static str] {
        match kind {
            EntityKind::Company => &[
                attr::NAME,
                attr::INCORPORATION_DATE,
                attr::REGISTERED_ADDRESS,
                attr::CATEGORY,
                attr::CLASS,
                attr::AUTHORIZED_CAPITAL,
                attr::PAIDUP_CAPITAL,
            ],
            EntityKind::Director => &[
                attr::NAME,
                attr::DESIGNATION,
                attr::APPOINTMENT_DATE,
                attr::COMPANY_IDS,
            ],
            EntityKind::Charge => &[
                attr::CHARGE_HOLDER,
                attr::CHARGE_AMOUNT,
                attr::CREATION_DATE,
                attr::COMPANY_IDS,
            ],
        }
    }

    pub fn analyze(&self, snapshot: &Snapshot) -> QualityReport {
        let total = snapshot.len();
        let mut completeness: BTreeMap<String, FieldCompleteness> = BTreeMap::new();
        let mut present_cells = 0usize;
        let mut expected_cells = 0usize;

        for (kind, count) in snapshot.count_by_kind() {
            for field in Self::key_attributes(kind) {
                let present = snapshot
                    .entities()
                    .filter(|e| e.kind == kind && e.attribute(field).is_some())
                    .count();
                present_cells += present;
                expected_cells += count;
                completeness.insert(
                    format!("{}.{}", kind.as_str(), field),
                    FieldCompleteness {
                        present,
                        missing: count - present,
                        completeness_pct: percentage(present, count),
                    },
                );
            }
        }

        let negative_authorized_capital = snapshot
            .entities()
            .filter(|e| has_negative_capital(e))
            .count();
        let identity_uncertain = snapshot.entities().filter(|e| e.identity_uncertain).count();
        let unknown_status = snapshot
            .count_by_status()
            .get(&EntityStatus::Unknown)
            .copied()
            .unwrap_or(0);
        let rejected_rows = snapshot.rejected().len();

        let mut report = QualityReport {
            generation: snapshot.generation(),
            generated_at: Utc::now(),
            total_records: total,
            completeness,
            overall_completeness_pct: if expected_cells == 0 {
                100.0
            } else {
                percentage(present_cells, expected_cells)
            },
            negative_authorized_capital,
            identity_uncertain,
            unknown_status,
            rejected_rows,
            by_jurisdiction: snapshot.count_by_jurisdiction(),
            by_status: snapshot
                .count_by_status()
                .into_iter()
                .map(|(s, n)| (s.as_str().to_string(), n))
                .collect(),
            by_kind: snapshot
                .count_by_kind()
                .into_iter()
                .map(|(k, n)| (k.as_str().to_string(), n))
                .collect(),
            issues: Vec::new(),
        };
        report.issues = self.issues(&report);
        report
    }

    fn issues(&self, report: &QualityReport) -> Vec<QualityIssue> {
        let mut issues = Vec::new();

        let input_rows = report.total_records + report.rejected_rows;
        if report.rejected_rows > 0 {
            let share = percentage(report.rejected_rows, input_rows);
            issues.push(QualityIssue {
                severity: if share > self.rejection_threshold_pct {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                field: "rows".to_string(),
                issue: format!("{} rows rejected ({:.2}% of input)", report.rejected_rows, share),
                recommendation: "Review the rejected-rows log for this run".to_string(),
            });
        }

        for (field, stats) in &report.completeness {
            if stats.completeness_pct < self.completeness_threshold_pct {
                issues.push(QualityIssue {
                    severity: Severity::Warning,
                    field: field.clone(),
                    issue: format!(
                        "{:.2}% complete ({} missing)",
                        stats.completeness_pct, stats.missing
                    ),
                    recommendation: "Check the source column mapping for this field".to_string(),
                });
            }
        }

        if report.negative_authorized_capital > 0 {
            issues.push(QualityIssue {
                severity: Severity::Warning,
                field: attr::AUTHORIZED_CAPITAL.to_string(),
                issue: format!(
                    "{} records with negative authorized capital",
                    report.negative_authorized_capital
                ),
                recommendation: "Verify the amounts against the registry filing".to_string(),
            });
        }

        if report.identity_uncertain > 0 {
            issues.push(QualityIssue {
                severity: Severity::Warning,
                field: "entity_id".to_string(),
                issue: format!(
                    "{} records resolved through the composite key",
                    report.identity_uncertain
                ),
                recommendation: "Review identity_uncertain records".to_string(),
            });
        }

        if report.unknown_status > 0 {
            issues.push(QualityIssue {
                severity: Severity::Info,
                field: "status".to_string(),
                issue: format!("{} records with an unrecognized status", report.unknown_status),
                recommendation: "Extend the status mapping if upstream added a code".to_string(),
            });
        }

        issues.sort_by_key(|i| i.severity);
        issues
    }
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn has_negative_capital(entity: &CanonicalEntity) -> bool {
    entity
        .attribute(attr::AUTHORIZED_CAPITAL)
        .and_then(|v| v.as_money())
        .is_some_and(|m| m.is_sign_negative() && !m.is_zero())
}

/// Percentage rounded to 2 decimals
fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 10_000.0).round() / 100.0
}

// ============================================================================
// TESTS
// ============================================================================
