// 🔑 Identity Resolver - Stable entity_id for every normalized record
//
// Two tiers:
//   1. Authoritative registration identifier (CIN / DIN / charge id)
//   2. Deterministic composite key (kind + jurisdiction + name + date),
//      flagged `identity_uncertain` for review
//
// Runs as ONE sequential pass after parallel normalization, so the
// in-progress key map has a single writer.

use crate::entity::CanonicalEntity;
use crate::error::{IdentityConflict, ValidationError};
use crate::normalizer::{RejectedRow, RejectionStage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

pub const PROVISIONAL_PREFIX: &str = "PROV-";

// ============================================================================
// EXISTING INDEX
// ============================================================================

/// Read view over already-assigned identities (normally the current generation)
pub trait IdentityIndex {
    /// entity_id previously assigned to this composite key
    fn find_by_composite(&self, composite_key: &str) -> Option<&str>;
}

/// No prior generation (first run)
pub struct EmptyIndex;

impl IdentityIndex for EmptyIndex {
    fn find_by_composite(&self, _composite_key: &str) -> Option<&str> {
        None
    }
}

/// Deterministic id for an uncertain record with no existing match
pub fn provisional_id(composite_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(composite_key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{}", PROVISIONAL_PREFIX, &digest[..20].to_uppercase())
}

// ============================================================================
// RESOLUTION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resolution {
    /// One entity per entity_id, in order of first appearance
    pub entities: Vec<CanonicalEntity>,

    /// Intra-batch collisions (last write won)
    pub conflicts: Vec<IdentityConflict>,

    /// entity_ids resolved through the composite key
    pub uncertain: Vec<String>,

    /// No usable identifier and no composite key
    pub rejected: Vec<RejectedRow>,
}

// ============================================================================
// RESOLVER
// ============================================================================

#[derive(Debug, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        IdentityResolver
    }

    /// Assign or confirm entity_id for every entity of the batch.
    ///
    /// `entities` must be in source row order: collisions are resolved by
    /// last-write-wins in that order.
    pub fn resolve(
        &self,
        entities: Vec<CanonicalEntity>,
        existing: &dyn IdentityIndex,
    ) -> Resolution {
        let mut resolution = Resolution::default();

        // Composite keys of rows that DO carry an authoritative id, so an
        // id-less row for the same entity in the same batch finds it.
        let batch_composites: HashMap<String, String> = entities
            .iter()
            .filter(|e| e.has_identity())
            .filter_map(|e| e.composite_key().map(|k| (k, e.entity_id.clone())))
            .collect();

        let mut slots: Vec<CanonicalEntity> = Vec::with_capacity(entities.len());
        let mut position: HashMap<String, usize> = HashMap::new();

        for mut entity in entities {
            if !entity.has_identity() {
                let Some(composite) = entity.composite_key() else {
                    let err = ValidationError::NoIdentity {
                        reason: format!(
                            "no {} or {} to build a composite key",
                            entity.kind.name_attribute(),
                            entity.kind.date_attribute()
                        ),
                    };
                    debug!(
                        source = %entity.source,
                        reason = %err,
                        "row rejected at identity stage"
                    );
                    resolution.rejected.push(RejectedRow::from_entity(
                        &entity,
                        RejectionStage::Identity,
                        err.to_string(),
                    ));
                    continue;
                };

                let entity_id = existing
                    .find_by_composite(&composite)
                    .map(str::to_string)
                    .or_else(|| batch_composites.get(&composite).cloned())
                    .unwrap_or_else(|| provisional_id(&composite));

                debug!(
                    source = %entity.source,
                    composite = %composite,
                    entity_id = %entity_id,
                    "resolved through composite key"
                );
                entity.entity_id = entity_id;
                entity.identity_uncertain = true;
            }

            match position.get(&entity.entity_id) {
                Some(&idx) => {
                    let conflict = IdentityConflict {
                        entity_id: entity.entity_id.clone(),
                        kept: entity.source.clone(),
                        discarded: slots[idx].source.clone(),
                    };
                    warn!(
                        entity_id = %conflict.entity_id,
                        kept = %conflict.kept,
                        discarded = %conflict.discarded,
                        "identity conflict, last write wins"
                    );
                    resolution.conflicts.push(conflict);
                    slots[idx] = entity;
                }
                None => {
                    position.insert(entity.entity_id.clone(), slots.len());
                    slots.push(entity);
                }
            }
        }

        resolution.uncertain = slots
            .iter()
            .filter(|e| e.identity_uncertain)
            .map(|e| e.entity_id.clone())
            .collect();
        resolution.entities = slots;
        resolution
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{attr, AttributeValue, EntityKind, EntityStatus};
    use crate::error::SourceRef;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    struct MapIndex(HashMap<String, String>);

    impl IdentityIndex for MapIndex {
        fn find_by_composite(&self, composite_key: &str) -> Option<&str> {
            self.0.get(composite_key).map(|s| s.as_str())
        }
    }

    fn entity(id: &str, name: &str, line: usize) -> CanonicalEntity {
        let mut attributes = BTreeMap::new();
        attributes.insert(attr::NAME.to_string(), AttributeValue::Text(name.to_string()));
        attributes.insert(
            attr::INCORPORATION_DATE.to_string(),
            AttributeValue::Date(NaiveDate::from_ymd_opt(2000, 1, 15).unwrap()),
        );
        CanonicalEntity::new(
            EntityKind::Company,
            "MH".to_string(),
            EntityStatus::Active,
            attributes,
            SourceRef {
                source_file: "mh.csv".to_string(),
                line_number: line,
            },
        )
        .with_entity_id(id)
    }

    #[test]
    fn test_authoritative_ids_pass_through() {
        let resolution = IdentityResolver::new().resolve(
            vec![entity("U72900MH2000PTC124845", "Acme", 2)],
            &EmptyIndex,
        );
        assert_eq!(resolution.entities.len(), 1);
        assert_eq!(resolution.entities[0].entity_id, "U72900MH2000PTC124845");
        assert!(!resolution.entities[0].identity_uncertain);
        assert!(resolution.uncertain.is_empty());
    }

    #[test]
    fn test_missing_id_matches_existing_composite() {
        let e = entity("", "Acme Private Limited", 2);
        let composite = e.composite_key().unwrap();
        let index = MapIndex(HashMap::from([(
            composite,
            "U72900MH2000PTC124845".to_string(),
        )]));

        let resolution = IdentityResolver::new().resolve(vec![e], &index);

        assert_eq!(resolution.entities[0].entity_id, "U72900MH2000PTC124845");
        assert!(resolution.entities[0].identity_uncertain);
        assert_eq!(resolution.uncertain, vec!["U72900MH2000PTC124845".to_string()]);
    }

    #[test]
    fn test_missing_id_without_match_gets_provisional_id() {
        let resolution = IdentityResolver::new().resolve(vec![entity("", "Acme", 2)], &EmptyIndex);
        let id = &resolution.entities[0].entity_id;
        assert!(id.starts_with(PROVISIONAL_PREFIX));
        assert!(resolution.entities[0].identity_uncertain);

        // Deterministic across runs
        let again = IdentityResolver::new().resolve(vec![entity("", "ACME", 7)], &EmptyIndex);
        assert_eq!(&again.entities[0].entity_id, id);
    }

    #[test]
    fn test_missing_id_matches_authoritative_row_in_same_batch() {
        let resolution = IdentityResolver::new().resolve(
            vec![
                entity("U72900MH2000PTC124845", "Acme Pvt Ltd", 2),
                entity("", "ACME PRIVATE LIMITED", 3),
            ],
            &EmptyIndex,
        );
        // Same key → collision, last write wins
        assert_eq!(resolution.entities.len(), 1);
        assert_eq!(resolution.entities[0].source.line_number, 3);
        assert_eq!(resolution.conflicts.len(), 1);
    }

    #[test]
    fn test_collision_last_write_wins() {
        let resolution = IdentityResolver::new().resolve(
            vec![
                entity("U72900MH2000PTC124845", "Acme Old", 2),
                entity("L17110MH1973PLC019786", "Other", 3),
                entity("U72900MH2000PTC124845", "Acme New", 4),
            ],
            &EmptyIndex,
        );

        assert_eq!(resolution.entities.len(), 2);
        assert_eq!(resolution.entities[0].name(), Some("Acme New"));
        assert_eq!(resolution.conflicts.len(), 1);

        let conflict = &resolution.conflicts[0];
        assert_eq!(conflict.entity_id, "U72900MH2000PTC124845");
        assert_eq!(conflict.kept.line_number, 4);
        assert_eq!(conflict.discarded.line_number, 2);
    }

    #[test]
    fn test_no_id_and_no_composite_is_rejected() {
        let mut e = entity("", "Acme", 2);
        e.attributes.remove(attr::INCORPORATION_DATE);

        let resolution = IdentityResolver::new().resolve(vec![e], &EmptyIndex);
        assert!(resolution.entities.is_empty());
        assert_eq!(resolution.rejected.len(), 1);
        assert_eq!(resolution.rejected[0].stage, RejectionStage::Identity);
    }
}
