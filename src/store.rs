// 🗄️ Snapshot Store - Two immutable generations (current + previous)
//
// A generation is built completely (entities + indices + tombstones) before
// it becomes visible. Promotion swaps Arc pointers under a short write lock;
// readers holding an Arc keep a consistent view for as long as they need it.

use crate::archive::Archive;
use crate::entity::{CanonicalEntity, EntityKind, EntityStatus};
use crate::error::{PromotionError, SourceRef};
use crate::identity::IdentityIndex;
use crate::normalizer::RejectedRow;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use tracing::{debug, info};

// ============================================================================
// TOMBSTONE
// ============================================================================

/// An entity that left the active set. Never physically deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub entity_id: String,
    /// Generation in which the entity disappeared
    pub removed_in: u64,
    /// State in the last generation that contained it
    pub last_seen: CanonicalEntity,
}

// ============================================================================
// SNAPSHOT (one generation)
// ============================================================================

#[derive(Debug, Clone)]
pub struct Snapshot {
    generation: u64,
    created_at: DateTime<Utc>,
    entities: BTreeMap<String, CanonicalEntity>,

    // Secondary indices, built before the snapshot is shared
    by_jurisdiction: HashMap<String, BTreeSet<String>>,
    by_status: HashMap<EntityStatus, BTreeSet<String>>,
    by_kind: HashMap<EntityKind, BTreeSet<String>>,
    by_composite: HashMap<String, String>,

    tombstones: BTreeMap<String, Tombstone>,

    /// Rejected-rows log of the run that produced this generation
    rejected: Vec<RejectedRow>,
}

impl Snapshot {
    /// Generation 0: nothing ingested yet
    pub fn empty() -> Self {
        Snapshot::from_parts(0, Utc::now(), Vec::new(), Vec::new(), Vec::new())
    }

    /// Build the generation that follows `previous`.
    ///
    /// Stamps `source_generation`, carries tombstones forward and records
    /// entities that disappeared since `previous`.
    pub fn build(
        generation: u64,
        created_at: DateTime<Utc>,
        entities: Vec<CanonicalEntity>,
        rejected: Vec<RejectedRow>,
        previous: &Snapshot,
    ) -> Result<Snapshot, PromotionError> {
        let mut by_id: BTreeMap<String, CanonicalEntity> = BTreeMap::new();
        for mut entity in entities {
            if !entity.has_identity() {
                return Err(PromotionError::UnassignedIdentity {
                    source_ref: entity.source.clone(),
                });
            }
            if by_id.contains_key(&entity.entity_id) {
                return Err(PromotionError::DuplicateEntityId(entity.entity_id));
            }
            entity.source_generation = generation;
            by_id.insert(entity.entity_id.clone(), entity);
        }

        let mut tombstones: Vec<Tombstone> = previous
            .tombstones
            .values()
            .filter(|t| !by_id.contains_key(&t.entity_id))
            .cloned()
            .collect();
        tombstones.extend(
            previous
                .entities
                .values()
                .filter(|e| !by_id.contains_key(&e.entity_id))
                .map(|e| Tombstone {
                    entity_id: e.entity_id.clone(),
                    removed_in: generation,
                    last_seen: e.clone(),
                }),
        );

        Ok(Snapshot::from_parts(
            generation,
            created_at,
            by_id.into_values().collect(),
            tombstones,
            rejected,
        ))
    }

    /// Assemble a generation from stored parts (no validation, no stamping).
    pub fn from_parts(
        generation: u64,
        created_at: DateTime<Utc>,
        entities: Vec<CanonicalEntity>,
        tombstones: Vec<Tombstone>,
        rejected: Vec<RejectedRow>,
    ) -> Snapshot {
        let mut snapshot = Snapshot {
            generation,
            created_at,
            entities: BTreeMap::new(),
            by_jurisdiction: HashMap::new(),
            by_status: HashMap::new(),
            by_kind: HashMap::new(),
            by_composite: HashMap::new(),
            tombstones: tombstones
                .into_iter()
                .map(|t| (t.entity_id.clone(), t))
                .collect(),
            rejected,
        };

        for entity in entities {
            let id = entity.entity_id.clone();
            snapshot
                .by_jurisdiction
                .entry(entity.jurisdiction.clone())
                .or_default()
                .insert(id.clone());
            snapshot.by_status.entry(entity.status).or_default().insert(id.clone());
            snapshot.by_kind.entry(entity.kind).or_default().insert(id.clone());
            if let Some(key) = entity.composite_key() {
                snapshot.by_composite.insert(key, id.clone());
            }
            snapshot.entities.insert(id, entity);
        }
        snapshot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn lookup(&self, entity_id: &str) -> Option<&CanonicalEntity> {
        self.entities.get(entity_id)
    }

    pub fn tombstone(&self, entity_id: &str) -> Option<&Tombstone> {
        self.tombstones.get(entity_id)
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.values()
    }

    pub fn rejected(&self) -> &[RejectedRow] {
        &self.rejected
    }

    /// All entities, ascending entity_id
    pub fn entities(&self) -> impl Iterator<Item = &CanonicalEntity> {
        self.entities.values()
    }

    pub(crate) fn entity_map(&self) -> &BTreeMap<String, CanonicalEntity> {
        &self.entities
    }

    pub fn count_by_jurisdiction(&self) -> BTreeMap<String, usize> {
        self.by_jurisdiction
            .iter()
            .map(|(k, ids)| (k.clone(), ids.len()))
            .collect()
    }

    pub fn count_by_status(&self) -> BTreeMap<EntityStatus, usize> {
        self.by_status.iter().map(|(k, ids)| (*k, ids.len())).collect()
    }

    pub fn count_by_kind(&self) -> BTreeMap<EntityKind, usize> {
        self.by_kind.iter().map(|(k, ids)| (*k, ids.len())).collect()
    }

    /// Lazy, restartable query. See [`EntityQuery`].
    pub fn query(&self, filter: EntityFilter) -> EntityQuery<'_> {
        EntityQuery {
            snapshot: self,
            filter,
        }
    }
}

impl IdentityIndex for Snapshot {
    fn find_by_composite(&self, composite_key: &str) -> Option<&str> {
        self.by_composite.get(composite_key).map(|s| s.as_str())
    }
}

// ============================================================================
// QUERY
// ============================================================================

/// Filter over one generation. Empty filter = everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub kind: Option<EntityKind>,
    pub jurisdiction: Option<String>,
    pub status: Option<EntityStatus>,
    /// Case-insensitive prefix of the display name
    pub name_prefix: Option<String>,
    /// Pagination cursor: only entity_ids strictly greater than this
    pub after: Option<String>,
    pub limit: Option<usize>,
}

impl EntityFilter {
    pub fn new() -> Self {
        EntityFilter::default()
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_jurisdiction(mut self, jurisdiction: &str) -> Self {
        self.jurisdiction = Some(jurisdiction.to_string());
        self
    }

    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = Some(prefix.to_string());
        self
    }

    pub fn after(mut self, entity_id: &str) -> Self {
        self.after = Some(entity_id.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entity: &CanonicalEntity) -> bool {
        if self.kind.is_some_and(|k| k != entity.kind) {
            return false;
        }
        if self.status.is_some_and(|s| s != entity.status) {
            return false;
        }
        if let Some(j) = &self.jurisdiction {
            if *j != entity.jurisdiction {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            let prefix = prefix.to_lowercase();
            match entity.name() {
                Some(name) if name.to_lowercase().starts_with(&prefix) => {}
                _ => return false,
            }
        }
        true
    }
}

/// A query bound to one generation.
///
/// Nothing is evaluated until iterated. Every call to `iter()` starts over,
/// yielding matches in ascending entity_id order.
pub struct EntityQuery<'a> {
    snapshot: &'a Snapshot,
    filter: EntityFilter,
}

impl<'a> EntityQuery<'a> {
    pub fn filter(&self) -> &EntityFilter {
        &self.filter
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &'a CanonicalEntity> + '_> {
        let snapshot = self.snapshot;
        let filter = &self.filter;
        let lower = match &filter.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };
        let range = (lower, Bound::<String>::Unbounded);

        // Drive iteration from the narrowest available index
        let indexed: Option<&'a BTreeSet<String>> = [
            filter
                .jurisdiction
                .as_ref()
                .map(|j| snapshot.by_jurisdiction.get(j)),
            filter.status.map(|s| snapshot.by_status.get(&s)),
            filter.kind.map(|k| snapshot.by_kind.get(&k)),
        ]
        .into_iter()
        .flatten()
        .map(|set| set.unwrap_or(&EMPTY_IDS))
        .min_by_key(|set| set.len());

        let candidates: Box<dyn Iterator<Item = &'a CanonicalEntity> + '_> = match indexed {
            Some(ids) => Box::new(ids.range(range).filter_map(move |id| snapshot.entities.get(id))),
            None => Box::new(snapshot.entities.range(range).map(|(_, e)| e)),
        };

        let matching = candidates.filter(move |e| filter.matches(e));
        match filter.limit {
            Some(limit) => Box::new(matching.take(limit)),
            None => Box::new(matching),
        }
    }

    /// Materialize one page
    pub fn collect_page(&self) -> Vec<CanonicalEntity> {
        self.iter().cloned().collect()
    }
}

static EMPTY_IDS: BTreeSet<String> = BTreeSet::new();

// ============================================================================
// STORE
// ============================================================================

struct Generations {
    current: Arc<Snapshot>,
    previous: Arc<Snapshot>,
}

/// Result of a successful promotion
#[derive(Debug, Clone)]
pub struct PromotionReport {
    pub generation: u64,
    pub entity_count: usize,
    pub tombstone_count: usize,
    pub rejected_count: usize,
    /// Source rows that did not make it into the generation
    pub rejected_sources: Vec<SourceRef>,
    pub current: Arc<Snapshot>,
    pub previous: Arc<Snapshot>,
}

pub struct SnapshotStore {
    state: RwLock<Generations>,
    /// Held for the whole promotion; a second promoter gets `Busy`
    promotion: Mutex<()>,
    archive: Option<Mutex<Archive>>,
}

impl SnapshotStore {
    /// Store with no persistence
    pub fn in_memory() -> Self {
        let empty = Arc::new(Snapshot::empty());
        SnapshotStore {
            state: RwLock::new(Generations {
                current: Arc::clone(&empty),
                previous: empty,
            }),
            promotion: Mutex::new(()),
            archive: None,
        }
    }

    /// Store backed by a SQLite archive; restores current/previous from it.
    pub fn open(archive: Archive) -> Result<Self> {
        let (current, previous) = archive.load_retained()?;
        let current = current.unwrap_or_else(Snapshot::empty);
        let previous = previous.unwrap_or_else(Snapshot::empty);
        info!(
            current = current.generation(),
            previous = previous.generation(),
            entities = current.len(),
            "snapshot store restored"
        );

        Ok(SnapshotStore {
            state: RwLock::new(Generations {
                current: Arc::new(current),
                previous: Arc::new(previous),
            }),
            promotion: Mutex::new(()),
            archive: Some(Mutex::new(archive)),
        })
    }

    pub fn current(&self) -> Arc<Snapshot> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&state.current)
    }

    pub fn previous(&self) -> Arc<Snapshot> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&state.previous)
    }

    /// Look up in the current generation
    pub fn lookup(&self, entity_id: &str) -> Option<CanonicalEntity> {
        self.current().lookup(entity_id).cloned()
    }

    /// Archive handle, when persistence is attached
    pub fn archive(&self) -> Option<MutexGuard<'_, Archive>> {
        self.archive
            .as_ref()
            .map(|a| a.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Build a new generation from `entities` and make it current.
    ///
    /// All-or-nothing: on error the store still serves the prior generation.
    pub fn promote(
        &self,
        entities: Vec<CanonicalEntity>,
        rejected: Vec<RejectedRow>,
    ) -> Result<PromotionReport, PromotionError> {
        let _guard = match self.promotion.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(PromotionError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let base = self.current();
        let generation = base.generation() + 1;
        let rejected_sources: Vec<SourceRef> = rejected.iter().map(|r| r.source.clone()).collect();

        // Off-lock: readers keep using `base` meanwhile
        let snapshot = Snapshot::build(generation, Utc::now(), entities, rejected, &base)?;
        debug!(generation, entities = snapshot.len(), "generation built");

        if let Some(archive) = &self.archive {
            let mut archive = archive.lock().map_err(|_| PromotionError::LockPoisoned)?;
            archive
                .save_generation(&snapshot)
                .map_err(|e| PromotionError::Persistence {
                    generation,
                    reason: format!("{:#}", e),
                })?;
        }

        // Archive already holds this generation; serve it even if poisoned
        let current = Arc::new(snapshot);
        {
            let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.previous = Arc::clone(&state.current);
            state.current = Arc::clone(&current);
        }

        info!(
            generation,
            entities = current.len(),
            tombstones = current.tombstones.len(),
            rejected = rejected_sources.len(),
            "generation promoted"
        );

        Ok(PromotionReport {
            generation,
            entity_count: current.len(),
            tombstone_count: current.tombstones.len(),
            rejected_count: rejected_sources.len(),
            rejected_sources,
            current,
            previous: base,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
