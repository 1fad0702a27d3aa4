// ✨ Enrichment Pipeline - Derived and cross-referenced attributes
//
// Each step declares the attributes it produces. A failing step never fails
// the record: the record continues with what it had before that step.
// Steps may never touch entity_id, jurisdiction, kind or status.

use crate::engine::CancellationToken;
use crate::entity::{attr, AttributeValue, CanonicalEntity, EntityKind};
use crate::error::EnrichmentError;
use crate::normalizer::is_valid_cin;
use chrono::Datelike;
use rayon::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// ============================================================================
// STEP CAPABILITY
// ============================================================================

/// One enrichment step.
///
/// Steps are applied per record, in the pipeline's declared order.
pub trait EnrichmentStep: Send + Sync {
    fn name(&self) -> &str;

    /// Attribute names this step may add, change or remove
    fn produces(&self) -> &[&'static str];

    fn apply(&self, entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError>;

    /// External steps may block (network, remote registry) and run under a timeout
    fn is_external(&self) -> bool {
        false
    }

    /// Records this step has nothing to do for are passed through untouched
    fn applies_to(&self, _entity: &CanonicalEntity) -> bool {
        true
    }
}

/// Existence check used by cross-reference steps
pub trait ReferenceLookup: Send + Sync {
    fn exists(&self, entity_id: &str) -> bool;
}

impl ReferenceLookup for HashSet<String> {
    fn exists(&self, entity_id: &str) -> bool {
        self.contains(entity_id)
    }
}

// ============================================================================
// BUILT-IN STEPS
// ============================================================================

pub const STEP_CIN_DECODER: &str = "cin_decoder";
pub const STEP_INCORPORATION_YEAR: &str = "incorporation_year";
pub const STEP_CAPITAL_BAND: &str = "capital_band";
pub const STEP_PAIDUP_RATIO: &str = "paidup_ratio";
pub const STEP_REFERENCE_CHECK: &str = "reference_check";

/// Built-in steps in their default declared order
pub const BUILTIN_STEPS: &[&str] = &[
    STEP_CIN_DECODER,
    STEP_INCORPORATION_YEAR,
    STEP_CAPITAL_BAND,
    STEP_PAIDUP_RATIO,
    STEP_REFERENCE_CHECK,
];

/// Decodes the segments embedded in a CIN
pub struct CinDecoder;

impl CinDecoder {
    fn ownership_class(code: &str) -> &'static str {
        match code {
            "PTC" => "private",
            "PLC" => "public",
            "OPC" => "one_person",
            "GOI" | "SGC" | "GAP" | "GAT" => "government",
            "NPL" => "not_for_profit",
            "FTC" => "foreign_subsidiary",
            "ULL" | "ULT" => "unlimited",
            _ => "other",
        }
    }
}

impl EnrichmentStep for CinDecoder {
    fn name(&self) -> &str {
        STEP_CIN_DECODER
    }

    fn produces(&self) -> &[&'static str] {
        &["listing_status", "industry_code", "registration_state", "ownership_class"]
    }

    fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
        if entity.kind != EntityKind::Company || !is_valid_cin(&entity.entity_id) {
            return Ok(entity);
        }
        let cin = entity.entity_id.clone();
        let listing = if cin.starts_with('L') { "listed" } else { "unlisted" };

        let text = |s: &str| AttributeValue::Text(s.to_string());
        entity.attributes.insert("listing_status".to_string(), text(listing));
        entity.attributes.insert("industry_code".to_string(), text(&cin[1..6]));
        entity.attributes.insert("registration_state".to_string(), text(&cin[6..8]));
        entity.attributes.insert(
            "ownership_class".to_string(),
            text(Self::ownership_class(&cin[12..15])),
        );
        Ok(entity)
    }
}

pub struct IncorporationYear;

impl EnrichmentStep for IncorporationYear {
    fn name(&self) -> &str {
        STEP_INCORPORATION_YEAR
    }

    fn produces(&self) -> &[&'static str] {
        &["incorporation_year"]
    }

    fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
        if let Some(date) = entity
            .attribute(attr::INCORPORATION_DATE)
            .and_then(|v| v.as_date())
        {
            entity.attributes.insert(
                "incorporation_year".to_string(),
                AttributeValue::Integer(i64::from(date.year())),
            );
        }
        Ok(entity)
    }
}

/// Size band from authorized capital
///
/// < 1 lakh small, < 10 lakh medium, < 1 crore large, else very_large
pub struct CapitalBand;

impl CapitalBand {
    pub fn band(capital: Decimal) -> &'static str {
        if capital < Decimal::from(100_000) {
            "small"
        } else if capital < Decimal::from(1_000_000) {
            "medium"
        } else if capital < Decimal::from(10_000_000) {
            "large"
        } else {
            "very_large"
        }
    }
}

impl EnrichmentStep for CapitalBand {
    fn name(&self) -> &str {
        STEP_CAPITAL_BAND
    }

    fn produces(&self) -> &[&'static str] {
        &["capital_band"]
    }

    fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
        let Some(capital) = entity
            .attribute(attr::AUTHORIZED_CAPITAL)
            .and_then(|v| v.as_money())
        else {
            return Ok(entity);
        };
        if capital < Decimal::ZERO {
            return Err(EnrichmentError::failed(
                STEP_CAPITAL_BAND,
                format!("negative authorized capital {}", capital),
            ));
        }
        entity.attributes.insert(
            "capital_band".to_string(),
            AttributeValue::Text(Self::band(capital).to_string()),
        );
        Ok(entity)
    }
}

/// paid-up / authorized, 4 fractional digits
pub struct PaidUpRatio;

impl EnrichmentStep for PaidUpRatio {
    fn name(&self) -> &str {
        STEP_PAIDUP_RATIO
    }

    fn produces(&self) -> &[&'static str] {
        &["paidup_ratio"]
    }

    fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
        let authorized = entity.attribute(attr::AUTHORIZED_CAPITAL).and_then(|v| v.as_money());
        let paid = entity.attribute(attr::PAIDUP_CAPITAL).and_then(|v| v.as_money());
        let (Some(authorized), Some(paid)) = (authorized, paid) else {
            return Ok(entity);
        };
        if authorized.is_zero() {
            return Err(EnrichmentError::failed(STEP_PAIDUP_RATIO, "authorized capital is zero"));
        }

        let Some(ratio) = paid.checked_div(authorized) else {
            return Err(EnrichmentError::failed(STEP_PAIDUP_RATIO, "ratio overflow"));
        };
        let mut ratio = ratio.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero);
        ratio.rescale(4);
        entity
            .attributes
            .insert("paidup_ratio".to_string(), AttributeValue::Money(ratio));
        Ok(entity)
    }
}

/// Checks that director/charge `company_ids` point at known companies.
///
/// Declared external: production lookups go to a remote registry.
pub struct ReferenceCheck {
    lookup: Arc<dyn ReferenceLookup>,
}

impl ReferenceCheck {
    pub fn new(lookup: Arc<dyn ReferenceLookup>) -> Self {
        ReferenceCheck { lookup }
    }
}

impl EnrichmentStep for ReferenceCheck {
    fn name(&self) -> &str {
        STEP_REFERENCE_CHECK
    }

    fn produces(&self) -> &[&'static str] {
        &["unresolved_references"]
    }

    fn is_external(&self) -> bool {
        true
    }

    fn applies_to(&self, entity: &CanonicalEntity) -> bool {
        entity.attribute(attr::COMPANY_IDS).is_some()
    }

    fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
        let Some(refs) = entity.attribute(attr::COMPANY_IDS).and_then(|v| v.as_references()) else {
            return Ok(entity);
        };
        let unresolved: Vec<String> = refs
            .iter()
            .filter(|id| !self.lookup.exists(id))
            .cloned()
            .collect();

        if unresolved.is_empty() {
            entity.attributes.remove("unresolved_references");
        } else {
            entity.attributes.insert(
                "unresolved_references".to_string(),
                AttributeValue::References(unresolved),
            );
        }
        Ok(entity)
    }
}

/// Build a built-in step by name
pub fn builtin_step(
    name: &str,
    lookup: &Arc<dyn ReferenceLookup>,
) -> Option<Arc<dyn EnrichmentStep>> {
    let step: Arc<dyn EnrichmentStep> = match name {
        STEP_CIN_DECODER => Arc::new(CinDecoder),
        STEP_INCORPORATION_YEAR => Arc::new(IncorporationYear),
        STEP_CAPITAL_BAND => Arc::new(CapitalBand),
        STEP_PAIDUP_RATIO => Arc::new(PaidUpRatio),
        STEP_REFERENCE_CHECK => Arc::new(ReferenceCheck::new(Arc::clone(lookup))),
        _ => return None,
    };
    Some(step)
}

// ============================================================================
// PIPELINE
// ============================================================================

/// A failure recorded against one entity for observability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentFailure {
    pub entity_id: String,
    pub error: EnrichmentError,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichedBatch {
    pub entities: Vec<CanonicalEntity>,
    pub failures: Vec<EnrichmentFailure>,
    pub cancelled: bool,
}

/// Concurrent external calls per pipeline
pub const DEFAULT_EXTERNAL_WORKERS: usize = 8;

pub struct EnrichmentPipeline {
    steps: Vec<Arc<dyn EnrichmentStep>>,
    external_timeout: Duration,

    /// Runs external steps; a timed-out call keeps its worker until it returns
    external_pool: Option<Arc<rayon::ThreadPool>>,
}

impl EnrichmentPipeline {
    pub fn new(external_timeout: Duration) -> Self {
        EnrichmentPipeline {
            steps: Vec::new(),
            external_timeout,
            external_pool: external_pool(DEFAULT_EXTERNAL_WORKERS),
        }
    }

    /// Builder: cap concurrent external calls at `workers`
    pub fn with_external_workers(mut self, workers: usize) -> Self {
        self.external_pool = external_pool(workers.max(1));
        self
    }

    /// Pipeline of built-in steps, in the order given. Unknown names are skipped.
    pub fn from_names(
        names: &[String],
        external_timeout: Duration,
        lookup: Arc<dyn ReferenceLookup>,
    ) -> Self {
        let mut pipeline = EnrichmentPipeline::new(external_timeout);
        for name in names {
            match builtin_step(name, &lookup) {
                Some(step) => pipeline.steps.push(step),
                None => warn!(step = %name, "unknown enrichment step, skipping"),
            }
        }
        pipeline
    }

    /// Builder: append a step (declared order = insertion order)
    pub fn with_step(mut self, step: Arc<dyn EnrichmentStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Apply every step to one entity, then refresh its checksum.
    pub fn enrich(&self, entity: CanonicalEntity) -> (CanonicalEntity, Vec<EnrichmentFailure>) {
        let mut current = entity;
        let mut failures = Vec::new();

        for step in &self.steps {
            if !step.applies_to(&current) {
                continue;
            }
            let result = if step.is_external() {
                self.run_external(step, &current)
            } else {
                step.apply(current.clone())
            };

            let checked = result.and_then(|next| check_contract(step.as_ref(), &current, next));
            match checked {
                Ok(next) => current = next,
                Err(error) => {
                    warn!(
                        entity_id = %current.entity_id,
                        step = step.name(),
                        error = %error,
                        "enrichment step skipped"
                    );
                    failures.push(EnrichmentFailure {
                        entity_id: current.entity_id.clone(),
                        error,
                    });
                }
            }
        }

        current.refresh_checksum();
        (current, failures)
    }

    /// Enrich a batch in parallel on the current rayon pool. Order is preserved.
    pub fn enrich_batch(
        &self,
        entities: Vec<CanonicalEntity>,
        cancel: &CancellationToken,
    ) -> EnrichedBatch {
        let results: Vec<Option<(CanonicalEntity, Vec<EnrichmentFailure>)>> = entities
            .into_par_iter()
            .map(|entity| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.enrich(entity))
            })
            .collect();

        let mut batch = EnrichedBatch::default();
        for result in results {
            match result {
                Some((entity, failures)) => {
                    batch.entities.push(entity);
                    batch.failures.extend(failures);
                }
                None => batch.cancelled = true,
            }
        }
        batch
    }

    fn run_external(
        &self,
        step: &Arc<dyn EnrichmentStep>,
        entity: &CanonicalEntity,
    ) -> Result<CanonicalEntity, EnrichmentError> {
        let Some(pool) = &self.external_pool else {
            return Err(EnrichmentError::failed(step.name(), "no external worker pool"));
        };
        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(step);
        let input = entity.clone();

        pool.spawn(move || {
            // Receiver may be gone after a timeout
            let _ = tx.send(worker.apply(input));
        });

        match rx.recv_timeout(self.external_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EnrichmentError::Timeout {
                step: step.name().to_string(),
                timeout_ms: self.external_timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EnrichmentError::failed(step.name(), "worker terminated without a result"))
            }
        }
    }
}

fn external_pool(workers: usize) -> Option<Arc<rayon::ThreadPool>> {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("enrich-external-{}", i))
        .build()
    {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
            warn!(error = %e, "external enrichment pool unavailable, external steps will fail");
            None
        }
    }
}

/// Reject outputs that touch protected fields or undeclared attributes
fn check_contract(
    step: &dyn EnrichmentStep,
    before: &CanonicalEntity,
    after: CanonicalEntity,
) -> Result<CanonicalEntity, EnrichmentError> {
    let violation = |reason: String| EnrichmentError::ContractViolation {
        step: step.name().to_string(),
        reason,
    };

    if after.entity_id != before.entity_id {
        return Err(violation("changed entity_id".to_string()));
    }
    if after.jurisdiction != before.jurisdiction {
        return Err(violation("changed jurisdiction".to_string()));
    }
    if after.status != before.status {
        return Err(violation("changed status".to_string()));
    }
    if after.kind != before.kind {
        return Err(violation("changed kind".to_string()));
    }

    let declared: BTreeSet<&str> = step.produces().iter().copied().collect();
    let keys: BTreeSet<&String> = before.attributes.keys().chain(after.attributes.keys()).collect();
    for key in keys {
        let changed = before.attributes.get(key) != after.attributes.get(key);
        if changed && !declared.contains(key.as_str()) {
            return Err(violation(format!("wrote undeclared attribute `{}`", key)));
        }
    }

    Ok(after)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityStatus;
    use crate::error::SourceRef;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn company(cin: &str, authorized: &str, paid: &str) -> CanonicalEntity {
        let mut attributes = BTreeMap::new();
        attributes.insert(attr::NAME.to_string(), AttributeValue::Text("Acme".to_string()));
        attributes.insert(
            attr::INCORPORATION_DATE.to_string(),
            AttributeValue::Date(NaiveDate::from_ymd_opt(2000, 1, 15).unwrap()),
        );
        attributes.insert(
            attr::AUTHORIZED_CAPITAL.to_string(),
            AttributeValue::Money(Decimal::from_str(authorized).unwrap()),
        );
        attributes.insert(
            attr::PAIDUP_CAPITAL.to_string(),
            AttributeValue::Money(Decimal::from_str(paid).unwrap()),
        );
        CanonicalEntity::new(
            EntityKind::Company,
            "MH".to_string(),
            EntityStatus::Active,
            attributes,
            SourceRef {
                source_file: "mh.csv".to_string(),
                line_number: 2,
            },
        )
        .with_entity_id(cin)
    }

    fn empty_lookup() -> Arc<dyn ReferenceLookup> {
        Arc::new(HashSet::<String>::new())
    }

    fn all_builtins(lookup: Arc<dyn ReferenceLookup>) -> EnrichmentPipeline {
        let names: Vec<String> = BUILTIN_STEPS.iter().map(|s| s.to_string()).collect();
        EnrichmentPipeline::from_names(&names, Duration::from_millis(500), lookup)
    }

    struct FailingStep;
    impl EnrichmentStep for FailingStep {
        fn name(&self) -> &str {
            "failing"
        }
        fn produces(&self) -> &[&'static str] {
            &["never"]
        }
        fn apply(&self, _entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
            Err(EnrichmentError::failed("failing", "upstream unavailable"))
        }
    }

    struct StatusRewriter;
    impl EnrichmentStep for StatusRewriter {
        fn name(&self) -> &str {
            "status_rewriter"
        }
        fn produces(&self) -> &[&'static str] {
            &[]
        }
        fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
            entity.status = EntityStatus::Dissolved;
            Ok(entity)
        }
    }

    struct UndeclaredWriter;
    impl EnrichmentStep for UndeclaredWriter {
        fn name(&self) -> &str {
            "undeclared"
        }
        fn produces(&self) -> &[&'static str] {
            &["declared"]
        }
        fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
            entity
                .attributes
                .insert(attr::NAME.to_string(), AttributeValue::Text("Hijacked".to_string()));
            Ok(entity)
        }
    }

    struct SlowExternal;
    impl EnrichmentStep for SlowExternal {
        fn name(&self) -> &str {
            "slow_external"
        }
        fn produces(&self) -> &[&'static str] {
            &["remote_flag"]
        }
        fn is_external(&self) -> bool {
            true
        }
        fn apply(&self, mut entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
            std::thread::sleep(Duration::from_millis(300));
            entity
                .attributes
                .insert("remote_flag".to_string(), AttributeValue::Text("y".to_string()));
            Ok(entity)
        }
    }

    #[test]
    fn test_builtin_steps_derive_attributes() {
        let input = company("U72900MH2000PTC124845", "500000.00", "125000.00");
        let (entity, failures) = all_builtins(empty_lookup()).enrich(input);

        assert!(failures.is_empty());
        assert_eq!(
            entity.attribute("listing_status"),
            Some(&AttributeValue::Text("unlisted".to_string()))
        );
        assert_eq!(
            entity.attribute("industry_code"),
            Some(&AttributeValue::Text("72900".to_string()))
        );
        assert_eq!(
            entity.attribute("ownership_class"),
            Some(&AttributeValue::Text("private".to_string()))
        );
        assert_eq!(entity.attribute("incorporation_year"), Some(&AttributeValue::Integer(2000)));
        assert_eq!(
            entity.attribute("capital_band"),
            Some(&AttributeValue::Text("medium".to_string()))
        );
        assert_eq!(
            entity.attribute("paidup_ratio"),
            Some(&AttributeValue::Money(Decimal::from_str("0.2500").unwrap()))
        );
    }

    #[test]
    fn test_checksum_refreshed_after_enrichment() {
        let input = company("U72900MH2000PTC124845", "500000.00", "125000.00");
        let before = input.checksum.clone();
        let (entity, _) = all_builtins(empty_lookup()).enrich(input);
        assert_ne!(before, entity.checksum);
        assert_eq!(entity.checksum, crate::entity::compute_checksum(&entity.attributes));
    }

    #[test]
    fn test_capital_bands() {
        assert_eq!(CapitalBand::band(Decimal::from(99_999)), "small");
        assert_eq!(CapitalBand::band(Decimal::from(100_000)), "medium");
        assert_eq!(CapitalBand::band(Decimal::from(5_000_000)), "large");
        assert_eq!(CapitalBand::band(Decimal::from(10_000_000)), "very_large");
    }

    #[test]
    fn test_failed_step_keeps_previous_attributes() {
        let pipeline = EnrichmentPipeline::new(Duration::from_millis(100))
            .with_step(Arc::new(IncorporationYear))
            .with_step(Arc::new(FailingStep))
            .with_step(Arc::new(CapitalBand));

        let (entity, failures) =
            pipeline.enrich(company("U72900MH2000PTC124845", "500000.00", "1.00"));

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.step(), "failing");
        assert_eq!(failures[0].entity_id, "U72900MH2000PTC124845");
        // Steps before and after the failure still applied
        assert!(entity.attribute("incorporation_year").is_some());
        assert!(entity.attribute("capital_band").is_some());
        assert!(entity.attribute("never").is_none());
    }

    #[test]
    fn test_ratio_overflow_fails_ratio_only() {
        let (entity, failures) = all_builtins(empty_lookup())
            .enrich(company("U72900MH2000PTC124845", "0.01", "1000000000000000000000000000"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.step(), STEP_PAIDUP_RATIO);
        assert!(entity.attribute("paidup_ratio").is_none());
        assert!(entity.attribute("incorporation_year").is_some());
    }

    #[test]
    fn test_negative_zero_capital_is_banded() {
        let (entity, failures) =
            all_builtins(empty_lookup()).enrich(company("U72900MH2000PTC124845", "-0.00", "1.00"));
        assert!(failures.iter().all(|f| f.error.step() != STEP_CAPITAL_BAND));
        assert_eq!(
            entity.attribute("capital_band"),
            Some(&AttributeValue::Text("small".to_string()))
        );
    }

    #[test]
    fn test_zero_authorized_capital_fails_ratio_only() {
        let (entity, failures) =
            all_builtins(empty_lookup()).enrich(company("U72900MH2000PTC124845", "0.00", "0.00"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.step(), STEP_PAIDUP_RATIO);
        assert!(entity.attribute("paidup_ratio").is_none());
        assert!(entity.attribute("capital_band").is_some());
    }

    #[test]
    fn test_protected_fields_cannot_change() {
        let pipeline =
            EnrichmentPipeline::new(Duration::from_millis(100)).with_step(Arc::new(StatusRewriter));
        let (entity, failures) = pipeline.enrich(company("U72900MH2000PTC124845", "1.00", "1.00"));

        assert_eq!(entity.status, EntityStatus::Active);
        assert!(matches!(
            failures[0].error,
            EnrichmentError::ContractViolation { .. }
        ));
    }

    #[test]
    fn test_undeclared_attribute_write_is_discarded() {
        let pipeline = EnrichmentPipeline::new(Duration::from_millis(100))
            .with_step(Arc::new(UndeclaredWriter));
        let (entity, failures) = pipeline.enrich(company("U72900MH2000PTC124845", "1.00", "1.00"));

        assert_eq!(entity.name(), Some("Acme"));
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_external_step_timeout_skips_step() {
        let pipeline = EnrichmentPipeline::new(Duration::from_millis(20))
            .with_step(Arc::new(SlowExternal))
            .with_step(Arc::new(IncorporationYear));
        let (entity, failures) = pipeline.enrich(company("U72900MH2000PTC124845", "1.00", "1.00"));

        assert!(matches!(failures[0].error, EnrichmentError::Timeout { timeout_ms: 20, .. }));
        assert!(entity.attribute("remote_flag").is_none());
        assert!(entity.attribute("incorporation_year").is_some());
    }

    #[test]
    fn test_reference_check() {
        let mut director = company("DIN-00012345", "1.00", "1.00");
        director.kind = EntityKind::Director;
        director.attributes.insert(
            attr::COMPANY_IDS.to_string(),
            AttributeValue::References(vec![
                "L17110MH1973PLC019786".to_string(),
                "U72900MH2000PTC124845".to_string(),
            ]),
        );

        let known: HashSet<String> = HashSet::from(["U72900MH2000PTC124845".to_string()]);
        let pipeline = EnrichmentPipeline::new(Duration::from_millis(500))
            .with_step(Arc::new(ReferenceCheck::new(Arc::new(known))));
        let (entity, failures) = pipeline.enrich(director);

        assert!(failures.is_empty());
        assert_eq!(
            entity.attribute("unresolved_references"),
            Some(&AttributeValue::References(vec!["L17110MH1973PLC019786".to_string()]))
        );
    }

    #[test]
    fn test_reference_check_skips_records_without_references() {
        // A zero timeout fails every external call that actually runs
        let pipeline = EnrichmentPipeline::new(Duration::ZERO)
            .with_step(Arc::new(ReferenceCheck::new(empty_lookup())));
        let (entity, failures) = pipeline.enrich(company("U72900MH2000PTC124845", "1.00", "1.00"));
        assert!(failures.is_empty());
        assert!(entity.attribute("unresolved_references").is_none());
    }

    struct CountingExternal {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }
    impl EnrichmentStep for CountingExternal {
        fn name(&self) -> &str {
            "counting_external"
        }
        fn produces(&self) -> &[&'static str] {
            &[]
        }
        fn is_external(&self) -> bool {
            true
        }
        fn apply(&self, entity: CanonicalEntity) -> Result<CanonicalEntity, EnrichmentError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(entity)
        }
    }

    #[test]
    fn test_external_calls_are_bounded() {
        let step = Arc::new(CountingExternal {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pipeline = EnrichmentPipeline::new(Duration::from_secs(5))
            .with_external_workers(2)
            .with_step(step.clone());
        let entities: Vec<CanonicalEntity> = (0..16)
            .map(|_| company("U72900MH2000PTC124845", "1.00", "1.00"))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(8).build().unwrap();
        let batch = pool.install(|| pipeline.enrich_batch(entities, &CancellationToken::new()));

        assert!(batch.failures.is_empty());
        assert_eq!(batch.entities.len(), 16);
        assert!(step.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_unknown_step_names_are_skipped() {
        let names = vec!["capital_band".to_string(), "astrology".to_string()];
        let pipeline =
            EnrichmentPipeline::from_names(&names, Duration::from_millis(10), empty_lookup());
        assert_eq!(pipeline.step_names(), vec!["capital_band"]);
    }

    #[test]
    fn test_enrich_batch_preserves_order() {
        let pipeline = all_builtins(empty_lookup());
        let entities = vec![
            company("U72900MH2000PTC124845", "1.00", "1.00"),
            company("L17110MH1973PLC019786", "1.00", "1.00"),
        ];
        let batch = pipeline.enrich_batch(entities, &CancellationToken::new());
        assert!(!batch.cancelled);
        assert_eq!(batch.entities[0].entity_id, "U72900MH2000PTC124845");
        assert_eq!(batch.entities[1].entity_id, "L17110MH1973PLC019786");
        assert_eq!(
            batch.entities[1].attribute("listing_status"),
            Some(&AttributeValue::Text("listed".to_string()))
        );
    }
}
