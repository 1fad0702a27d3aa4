// 🔀 Diff Engine - Classified change set between two generations
//
// Sorted merge-join of two BTreeMaps keyed by entity_id. Pure: the same two
// generations always produce the same bytes.

use crate::entity::{AttributeValue, CanonicalEntity, EntityKind, EntityStatus};
use crate::store::Snapshot;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// CHANGE RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    StatusChanged,
    AttributeChanged,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::StatusChanged => "status_changed",
            ChangeKind::AttributeChanged => "attribute_changed",
            ChangeKind::Unchanged => "unchanged",
        }
    }
}

/// Value side of an entity at one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub jurisdiction: String,
    pub status: EntityStatus,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub checksum: String,
}

impl From<&CanonicalEntity> for EntityState {
    fn from(entity: &CanonicalEntity) -> Self {
        EntityState {
            jurisdiction: entity.jurisdiction.clone(),
            status: entity.status,
            attributes: entity.attributes.clone(),
            checksum: entity.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity_id: String,
    pub kind: EntityKind,
    pub jurisdiction: String,
    pub change_kind: ChangeKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<EntityState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<EntityState>,

    /// "status" and/or attribute names whose value differs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,

    pub generation_from: u64,
    pub generation_to: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub removed: usize,
    pub status_changed: usize,
    pub attribute_changed: usize,
    pub unchanged: usize,
}

impl ChangeCounts {
    fn record(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Added => self.added += 1,
            ChangeKind::Removed => self.removed += 1,
            ChangeKind::StatusChanged => self.status_changed += 1,
            ChangeKind::AttributeChanged => self.attribute_changed += 1,
            ChangeKind::Unchanged => self.unchanged += 1,
        }
    }

    /// Everything except unchanged
    pub fn total_changes(&self) -> usize {
        self.added + self.removed + self.status_changed + self.attribute_changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub generation_from: u64,
    pub generation_to: u64,
    pub counts: ChangeCounts,
    /// Ascending entity_id
    pub records: Vec<ChangeRecord>,
}

impl ChangeSet {
    /// Stable JSON encoding (struct field order + BTreeMap key order)
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// sha256 of the canonical JSON; equal digests mean byte-identical change sets
    pub fn digest(&self) -> serde_json::Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_json()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter().filter(move |r| r.change_kind == kind)
    }
}

// ============================================================================
// DIFF
// ============================================================================

/// Compare `current` against `previous`.
///
/// `unchanged` entities are always counted; they are materialized only
/// when `include_unchanged` is set.
pub fn diff(current: &Snapshot, previous: &Snapshot, include_unchanged: bool) -> ChangeSet {
    let from = previous.generation();
    let to = current.generation();
    let mut counts = ChangeCounts::default();
    let mut records = Vec::new();

    let mut cur = current.entity_map().values().peekable();
    let mut prev = previous.entity_map().values().peekable();

    loop {
        let order = match (cur.peek(), prev.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(c), Some(p)) => c.entity_id.cmp(&p.entity_id),
        };

        let pair = match order {
            Ordering::Less => cur.next().map(Pair::Added),
            Ordering::Greater => prev.next().map(Pair::Removed),
            Ordering::Equal => cur.next().zip(prev.next()).map(|(a, b)| Pair::Both(b, a)),
        };
        let Some(pair) = pair else { break };

        let record = classify(pair, from, to);
        counts.record(record.change_kind);
        if record.change_kind != ChangeKind::Unchanged || include_unchanged {
            records.push(record);
        }
    }

    ChangeSet {
        generation_from: from,
        generation_to: to,
        counts,
        records,
    }
}

/// One step of the merge-join
#[derive(Clone, Copy)]
enum Pair<'a> {
    Added(&'a CanonicalEntity),
    Removed(&'a CanonicalEntity),
    /// (before, after)
    Both(&'a CanonicalEntity, &'a CanonicalEntity),
}

fn classify(pair: Pair<'_>, from: u64, to: u64) -> ChangeRecord {
    // Id and kind are fixed; jurisdiction comes from the newer side
    let identity = match pair {
        Pair::Added(e) | Pair::Removed(e) | Pair::Both(_, e) => e,
    };

    let (before, after, change_kind, changed_fields) = match pair {
        Pair::Added(a) => (None, Some(a), ChangeKind::Added, Vec::new()),
        Pair::Removed(b) => (Some(b), None, ChangeKind::Removed, Vec::new()),
        Pair::Both(b, a) => {
            let mut fields = changed_attributes(b, a);
            let moved = a.jurisdiction != b.jurisdiction;
            if moved {
                fields.insert(0, "jurisdiction".to_string());
            }
            if a.status != b.status {
                fields.insert(0, "status".to_string());
                (Some(b), Some(a), ChangeKind::StatusChanged, fields)
            } else if moved || a.checksum != b.checksum {
                (Some(b), Some(a), ChangeKind::AttributeChanged, fields)
            } else {
                (Some(b), Some(a), ChangeKind::Unchanged, Vec::new())
            }
        }
    };

    let materialize = change_kind != ChangeKind::Unchanged;
    ChangeRecord {
        entity_id: identity.entity_id.clone(),
        kind: identity.kind,
        jurisdiction: identity.jurisdiction.clone(),
        change_kind,
        before: before.filter(|_| materialize).map(EntityState::from),
        after: after.filter(|_| materialize).map(EntityState::from),
        changed_fields,
        generation_from: from,
        generation_to: to,
    }
}

fn changed_attributes(before: &CanonicalEntity, after: &CanonicalEntity) -> Vec<String> {
    let keys: BTreeSet<&String> = before.attributes.keys().chain(after.attributes.keys()).collect();
    keys.into_iter()
        .filter(|k| before.attributes.get(*k) != after.attributes.get(*k))
        .cloned()
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
