// 🔄 Consolidation Engine - One ingestion run, end to end
//
//   raw rows → normalize (parallel) → resolve (single pass)
//            → enrich (parallel) → promote → diff → BatchSummary
//
// Cancellation is cooperative and checked between rows. Once promotion
// starts the run is committed.

use crate::archive::Archive;
use crate::config::EngineConfig;
use crate::diff::{diff, ChangeCounts, ChangeSet};
use crate::enrichment::{EnrichmentFailure, EnrichmentPipeline};
use crate::entity::EntityKind;
use crate::error::{EngineError, IdentityConflict};
use crate::identity::IdentityResolver;
use crate::jurisdiction::JurisdictionRegistry;
use crate::loader::{load_sources, RawRow, SourceFile};
use crate::normalizer::{Normalizer, RejectedRow};
use crate::quality::{QualityAnalyzer, QualityReport};
use crate::store::SnapshotStore;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// Ask the run to stop after the rows currently in flight
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// BATCH SUMMARY
// ============================================================================

/// What one run did. Never a silent partial success: every row is either in
/// the new generation or in `rejected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub generation: u64,
    pub previous_generation: u64,
    pub input_rows: usize,
    pub entity_count: usize,

    pub counts: ChangeCounts,
    pub rejected_count: usize,

    pub rejected: Vec<RejectedRow>,
    pub conflicts: Vec<IdentityConflict>,
    pub enrichment_failures: Vec<EnrichmentFailure>,
    pub uncertain: Vec<String>,

    pub changes: ChangeSet,
}

impl BatchSummary {
    pub fn summary(&self) -> String {
        format!(
            "generation {} ({} entities): +{} added, {} status changed, \
             {} attribute changed, -{} removed, {} unchanged, {} rejected",
            self.generation,
            self.entity_count,
            self.counts.added,
            self.counts.status_changed,
            self.counts.attribute_changed,
            self.counts.removed,
            self.counts.unchanged,
            self.rejected_count,
        )
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ConsolidationEngine {
    config: EngineConfig,
    normalizer: Normalizer,
    resolver: IdentityResolver,
    store: Arc<SnapshotStore>,
    pool: rayon::ThreadPool,
}

impl ConsolidationEngine {
    pub fn new(config: EngineConfig, store: Arc<SnapshotStore>) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("consolidate-{}", i))
            .build()
            .map_err(|e| EngineError::WorkerPool(e.to_string()))?;

        Ok(ConsolidationEngine {
            config,
            normalizer: Normalizer::new(JurisdictionRegistry::new()),
            resolver: IdentityResolver::new(),
            store,
            pool,
        })
    }

    /// Engine with the store described by `config.database_path`
    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let store = match &config.database_path {
            Some(path) => SnapshotStore::open(Archive::open(path)?)?,
            None => SnapshotStore::in_memory(),
        };
        Ok(ConsolidationEngine::new(config, Arc::new(store))?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn registry(&self) -> &JurisdictionRegistry {
        self.normalizer.registry()
    }

    /// Load the given dumps and run them as one batch
    pub fn run_sources(
        &self,
        sources: &[SourceFile],
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, EngineError> {
        let (rows, summaries) =
            load_sources(sources, self.registry()).context("Failed to load sources")?;
        let mut unreadable = Vec::new();
        for summary in summaries {
            if summary.jurisdiction.is_none() {
                warn!(
                    rows = summary.rows,
                    "no jurisdiction for dump, rows rely on the state column"
                );
            }
            unreadable.extend(summary.unreadable);
        }
        self.run_with_rejected(&rows, unreadable, cancel)
    }

    /// One ingestion run over rows in source order.
    ///
    /// The batch is the complete new dataset: entities missing from it
    /// surface as `removed`.
    pub fn run(
        &self,
        rows: &[RawRow],
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, EngineError> {
        self.run_with_rejected(rows, Vec::new(), cancel)
    }

    /// `run` with rows already rejected while loading; they join the run's log
    fn run_with_rejected(
        &self,
        rows: &[RawRow],
        unreadable: Vec<RejectedRow>,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, EngineError> {
        info!(rows = rows.len(), stage = "normalize", "ingestion started");
        let normalized = self.pool.install(|| self.normalizer.normalize_batch(rows, cancel));
        if normalized.cancelled || cancel.is_cancelled() {
            return Err(cancelled("normalize"));
        }

        let base = self.store.current();
        let resolution = self.resolver.resolve(normalized.entities, base.as_ref());
        info!(
            stage = "resolve",
            entities = resolution.entities.len(),
            conflicts = resolution.conflicts.len(),
            uncertain = resolution.uncertain.len(),
            "identities resolved"
        );
        if cancel.is_cancelled() {
            return Err(cancelled("resolve"));
        }

        let companies: HashSet<String> = resolution
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Company)
            .map(|e| e.entity_id.clone())
            .collect();
        let pipeline = EnrichmentPipeline::from_names(
            &self.config.enrichment.enabled_steps,
            self.config.external_step_timeout(),
            Arc::new(companies),
        );
        let enriched = self
            .pool
            .install(|| pipeline.enrich_batch(resolution.entities, cancel));
        info!(
            stage = "enrich",
            failures = enriched.failures.len(),
            "enrichment finished"
        );
        if enriched.cancelled || cancel.is_cancelled() {
            return Err(cancelled("enrich"));
        }

        let input_rows = rows.len() + unreadable.len();
        let mut rejected = unreadable;
        rejected.extend(normalized.rejected);
        rejected.extend(resolution.rejected);

        let report = self.store.promote(enriched.entities, rejected.clone())?;
        let changes = diff(&report.current, &report.previous, self.config.include_unchanged);

        let summary = BatchSummary {
            generation: report.generation,
            previous_generation: report.previous.generation(),
            input_rows,
            entity_count: report.entity_count,
            counts: changes.counts,
            rejected_count: rejected.len(),
            rejected,
            conflicts: resolution.conflicts,
            enrichment_failures: enriched.failures,
            uncertain: resolution.uncertain,
            changes,
        };
        info!(generation = summary.generation, "{}", summary.summary());
        Ok(summary)
    }

    /// Change set between the two retained generations
    pub fn diff_retained(&self) -> ChangeSet {
        diff(&self.store.current(), &self.store.previous(), self.config.include_unchanged)
    }

    pub fn quality_report(&self) -> QualityReport {
        QualityAnalyzer::new().analyze(&self.store.current())
    }
}

fn cancelled(stage: &str) -> EngineError {
    warn!(stage, "ingestion cancelled, store left on the prior generation");
    EngineError::Cancelled
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeKind;
    use crate::entity::{attr, AttributeValue, EntityStatus};
    use crate::loader::column;
    use crate::logging::{self, Profile};
    use crate::normalizer::RejectionStage;
    use std::io::Write;

    fn engine() -> ConsolidationEngine {
        logging::init(Profile::Test);
        let config = EngineConfig {
            worker_threads: 2,
            ..EngineConfig::default()
        };
        ConsolidationEngine::new(config, Arc::new(SnapshotStore::in_memory())).unwrap()
    }

    fn company_row(line: usize, cin: &str, name: &str, status: &str) -> RawRow {
        RawRow::new(EntityKind::Company, "maharashtra.csv", line)
            .with_jurisdiction("MH")
            .with_field(column::CIN, cin)
            .with_field(column::COMPANY_NAME, name)
            .with_field(column::STATUS, status)
            .with_field(column::DATE_OF_INCORPORATION, "15-01-2000")
            .with_field(column::AUTHORIZED_CAPITAL, "5,00,000")
            .with_field(column::PAIDUP_CAPITAL, "1,00,000")
    }

    fn valid_rows(count: usize) -> Vec<RawRow> {
        (0..count)
            .map(|i| {
                company_row(
                    i + 2,
                    &format!("U72900MH2000PTC{:06}", i),
                    &format!("Company {} Private Limited", i),
                    "Active",
                )
            })
            .collect()
    }

    #[test]
    fn test_thousand_valid_three_malformed() {
        let engine = engine();
        engine.run(&valid_rows(10), &CancellationToken::new()).unwrap();
        let prior = engine.store().current();

        let mut rows = valid_rows(1000);
        rows.push(
            company_row(2000, "U72900MH2000PTC999991", "Bad Date Ltd", "Active")
                .with_field(column::DATE_OF_INCORPORATION, "31/13/2000"),
        );
        rows.push(
            company_row(2001, "U72900MH2000PTC999992", "Bad Money Ltd", "Active")
                .with_field(column::AUTHORIZED_CAPITAL, "twelve lakh"),
        );
        let mut no_state = RawRow::new(EntityKind::Company, "unknown.csv", 2002)
            .with_field(column::CIN, "U72900MH2000PTC999993")
            .with_field(column::COMPANY_NAME, "Nowhere Ltd");
        no_state.jurisdiction_hint = None;
        rows.push(no_state);

        let summary = engine.run(&rows, &CancellationToken::new()).unwrap();

        assert_eq!(summary.entity_count, 1000);
        assert_eq!(engine.store().current().len(), 1000);
        assert_eq!(summary.rejected_count, 3);
        assert_eq!(summary.rejected.len(), 3);
        assert!(summary.rejected.iter().all(|r| !r.reason.is_empty()));
        assert!(summary
            .rejected
            .iter()
            .all(|r| r.stage == RejectionStage::Normalization));

        // Prior generation untouched
        assert_eq!(prior.generation(), 1);
        assert_eq!(prior.len(), 10);
        assert_eq!(engine.store().previous().generation(), 1);
        assert_eq!(summary.counts.added, 990);
        assert_eq!(summary.counts.unchanged, 10);
    }

    #[test]
    fn test_status_change_yields_one_record() {
        let engine = engine();
        let id = "U72900MH2000PTC124845";
        engine
            .run(&[company_row(2, id, "Acme Private Limited", "Active")], &CancellationToken::new())
            .unwrap();
        let summary = engine
            .run(
                &[company_row(2, id, "Acme Private Limited", "Struck Off")],
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(summary.changes.records.len(), 1);
        let record = &summary.changes.records[0];
        assert_eq!(record.entity_id, id);
        assert_eq!(record.change_kind, ChangeKind::StatusChanged);
        assert_eq!(record.before.as_ref().unwrap().status, EntityStatus::Active);
        assert_eq!(record.after.as_ref().unwrap().status, EntityStatus::StruckOff);
    }

    #[test]
    fn test_missing_id_resolves_to_existing_entity() {
        let engine = engine();
        let id = "U72900MH2000PTC124845";
        engine
            .run(&[company_row(2, id, "Acme Private Limited", "Active")], &CancellationToken::new())
            .unwrap();

        let mut without_cin = company_row(2, "", "ACME PVT. LTD.", "Active");
        without_cin.fields.remove(column::CIN);
        let summary = engine.run(&[without_cin], &CancellationToken::new()).unwrap();

        assert_eq!(summary.uncertain, vec![id.to_string()]);
        let entity = engine.store().lookup(id).unwrap();
        assert!(entity.identity_uncertain);
        assert_eq!(summary.counts.removed, 0);
        assert_eq!(summary.counts.added, 0);
    }

    #[test]
    fn test_diff_rerun_is_byte_identical() {
        let engine = engine();
        engine.run(&valid_rows(50), &CancellationToken::new()).unwrap();
        let mut next = valid_rows(40);
        next[3] = company_row(5, "U72900MH2000PTC000003", "Company 3 Private Limited", "Dissolved");
        engine.run(&next, &CancellationToken::new()).unwrap();

        let first = engine.diff_retained();
        let second = engine.diff_retained();
        assert_eq!(first.to_canonical_json().unwrap(), second.to_canonical_json().unwrap());
        assert_eq!(first.counts.removed, 10);
        assert_eq!(first.counts.status_changed, 1);
    }

    #[test]
    fn test_unchanged_entities_classified_unchanged() {
        let engine = engine();
        engine.run(&valid_rows(5), &CancellationToken::new()).unwrap();
        let summary = engine.run(&valid_rows(5), &CancellationToken::new()).unwrap();
        assert_eq!(summary.counts.unchanged, 5);
        assert_eq!(summary.counts.total_changes(), 0);
        assert!(summary.changes.records.is_empty());
    }

    #[test]
    fn test_cancelled_run_leaves_store_untouched() {
        let engine = engine();
        engine.run(&valid_rows(5), &CancellationToken::new()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.run(&valid_rows(20), &cancel).unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(engine.store().current().generation(), 1);
        assert_eq!(engine.store().current().len(), 5);
    }

    #[test]
    fn test_enrichment_applied_and_failures_reported() {
        let engine = engine();
        let rows = vec![
            company_row(2, "U72900MH2000PTC000001", "Zero Capital Ltd", "Active")
                .with_field(column::AUTHORIZED_CAPITAL, "0"),
            company_row(3, "U72900MH2000PTC000002", "Normal Ltd", "Active"),
        ];
        let summary = engine.run(&rows, &CancellationToken::new()).unwrap();

        assert_eq!(summary.enrichment_failures.len(), 1);
        assert_eq!(summary.enrichment_failures[0].entity_id, "U72900MH2000PTC000001");
        let normal = engine.store().lookup("U72900MH2000PTC000002").unwrap();
        assert_eq!(
            normal.attribute("capital_band"),
            Some(&AttributeValue::Text("medium".to_string()))
        );
        assert_eq!(normal.attribute("incorporation_year"), Some(&AttributeValue::Integer(2000)));
    }

    #[test]
    fn test_director_references_checked_against_batch() {
        let engine = engine();
        let rows = vec![
            company_row(2, "U72900MH2000PTC000001", "Acme Ltd", "Active"),
            RawRow::new(EntityKind::Director, "directors.csv", 2)
                .with_jurisdiction("MH")
                .with_field(column::DIN, "1234567")
                .with_field(column::DIRECTOR_NAME, "Asha Rao")
                .with_field(column::DATE_OF_APPOINTMENT, "01-04-2010")
                .with_field(column::CIN, "U72900MH2000PTC000001;U72900MH2000PTC999999"),
        ];
        engine.run(&rows, &CancellationToken::new()).unwrap();

        let director = engine.store().lookup("DIN-01234567").unwrap();
        assert_eq!(
            director.attribute("unresolved_references"),
            Some(&AttributeValue::References(vec!["U72900MH2000PTC999999".to_string()]))
        );
        assert!(director.attribute(attr::COMPANY_IDS).is_some());
    }

    #[test]
    fn test_run_sources_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gujarat.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "CIN,Company Name,Company Status,Date of Incorporation,Authorized Capital"
        )
        .unwrap();
        writeln!(
            file,
            "U01100GJ1995PTC024356,Shree Agro Private Limited,Active,12/06/1995,\"25,00,000\""
        )
        .unwrap();
        writeln!(file, "U01100GJ1995PTC024357,,Active,12/06/1995,100").unwrap();
        drop(file);

        let engine = engine();
        let summary = engine
            .run_sources(
                &[SourceFile {
                    path,
                    jurisdiction: None,
                    kind: EntityKind::Company,
                }],
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(summary.entity_count, 1);
        assert_eq!(summary.rejected_count, 1);
        let entity = engine.store().lookup("U01100GJ1995PTC024356").unwrap();
        assert_eq!(entity.jurisdiction, "GJ");
    }

    #[test]
    fn test_run_sources_keeps_going_past_undecodable_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maharashtra.csv");
        let mut bytes = b"CIN,Company Name,Company Status,Date of Incorporation\n".to_vec();
        bytes.extend_from_slice(b"U72900MH2000PTC000001,Alpha Ltd,Active,15-01-2000\n");
        bytes.extend_from_slice(b"U72900MH2000PTC000002,Caf\xe9 Ltd,Active,15-01-2000\n");
        bytes.extend_from_slice(b"U72900MH2000PTC000003,Gamma Ltd,Active,15-01-2000\n");
        std::fs::write(&path, bytes).unwrap();

        let engine = engine();
        let summary = engine
            .run_sources(
                &[SourceFile {
                    path,
                    jurisdiction: None,
                    kind: EntityKind::Company,
                }],
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(summary.input_rows, 3);
        assert_eq!(summary.entity_count, 2);
        assert_eq!(summary.rejected_count, 1);
        assert_eq!(summary.rejected[0].source.line_number, 3);
        assert_eq!(summary.rejected[0].stage, RejectionStage::Normalization);
        assert!(engine.store().lookup("U72900MH2000PTC000003").is_some());
        assert_eq!(engine.store().current().rejected().len(), 1);
    }

    #[test]
    fn test_ratio_overflow_does_not_abort_run() {
        let engine = engine();
        let rows = vec![
            company_row(2, "U72900MH2000PTC000001", "Tiny Ltd", "Active")
                .with_field(column::AUTHORIZED_CAPITAL, "0.01")
                .with_field(column::PAIDUP_CAPITAL, "1000000000000000000000000000"),
            company_row(3, "U72900MH2000PTC000002", "Plain Ltd", "Active"),
        ];

        let summary = engine.run(&rows, &CancellationToken::new()).unwrap();

        assert_eq!(summary.entity_count, 2);
        assert_eq!(summary.enrichment_failures.len(), 1);
        assert_eq!(summary.enrichment_failures[0].entity_id, "U72900MH2000PTC000001");
        let tiny = engine.store().lookup("U72900MH2000PTC000001").unwrap();
        assert!(tiny.attribute("paidup_ratio").is_none());
        assert!(tiny.attribute("incorporation_year").is_some());
    }

    #[test]
    fn test_jurisdiction_move_is_reported() {
        let engine = engine();
        let id = "U72900MH2000PTC124845";
        engine
            .run(&[company_row(2, id, "Acme Private Limited", "Active")], &CancellationToken::new())
            .unwrap();
        let moved = company_row(2, id, "Acme Private Limited", "Active").with_jurisdiction("GJ");
        let summary = engine.run(&[moved], &CancellationToken::new()).unwrap();

        assert_eq!(summary.counts.attribute_changed, 1);
        assert_eq!(summary.counts.unchanged, 0);
        let record = &summary.changes.records[0];
        assert_eq!(record.change_kind, ChangeKind::AttributeChanged);
        assert!(record.changed_fields.contains(&"jurisdiction".to_string()));
        assert_eq!(record.jurisdiction, "GJ");
    }

    #[test]
    fn test_quality_report_for_current_generation() {
        let engine = engine();
        engine.run(&valid_rows(3), &CancellationToken::new()).unwrap();
        let report = engine.quality_report();
        assert_eq!(report.generation, 1);
        assert_eq!(report.total_records, 3);
        assert_eq!(report.by_jurisdiction["MH"], 3);
    }
}
