// Registry Consolidation - Core Library
// Merges per-jurisdiction registry dumps into versioned generations and
// reports what changed between them.

pub mod error;
pub mod config;
pub mod logging;
pub mod jurisdiction;
pub mod entity;
pub mod loader;
pub mod normalizer;  // Record Normalizer
pub mod identity;    // Identity Resolver
pub mod enrichment;  // Enrichment Pipeline
pub mod store;       // Snapshot Store
pub mod archive;     // SQLite persistence for the store
pub mod diff;        // Diff Engine
pub mod quality;
pub mod engine;

// Re-export commonly used types
pub use error::{
    EngineError, EnrichmentError, IdentityConflict, PromotionError, SourceRef, ValidationError,
};
pub use config::{EngineConfig, EnrichmentConfig};
pub use jurisdiction::{Jurisdiction, JurisdictionKind, JurisdictionRegistry};
pub use entity::{AttributeValue, CanonicalEntity, EntityKind, EntityStatus};
pub use loader::{load_csv, load_sources, LoadSummary, RawRow, SourceFile};
pub use normalizer::{NormalizedBatch, Normalizer, RejectedRow, RejectionStage};
pub use identity::{IdentityIndex, IdentityResolver, Resolution};
pub use enrichment::{
    EnrichedBatch, EnrichmentFailure, EnrichmentPipeline, EnrichmentStep, ReferenceLookup,
};
pub use store::{EntityFilter, EntityQuery, PromotionReport, Snapshot, SnapshotStore, Tombstone};
pub use archive::{Archive, Event, GenerationInfo};
pub use diff::{diff, ChangeCounts, ChangeKind, ChangeRecord, ChangeSet, EntityState};
pub use quality::{QualityAnalyzer, QualityIssue, QualityReport, Severity};
pub use engine::{BatchSummary, CancellationToken, ConsolidationEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
