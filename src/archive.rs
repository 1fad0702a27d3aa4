// 💾 Archive - SQLite persistence for the snapshot store
//
// Layout:
//   generations          one row per promoted generation, slot = current/previous/NULL
//   generation_entities  entity rows for the two retained generations only
//   tombstones           every removal ever seen (never pruned)
//   rejected_rows        per-run rejected-rows log (never pruned)
//   events               audit trail
//
// A generation is written in ONE transaction: either the new current is on
// disk with its entities, tombstones and rejected rows, or nothing changed.

use crate::entity::CanonicalEntity;
use crate::normalizer::{RejectedRow, RejectionStage};
use crate::store::{Snapshot, Tombstone};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

const SLOT_CURRENT: &str = "current";
const SLOT_PREVIOUS: &str = "previous";

// ============================================================================
// EVENTS (audit trail)
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Summary row of the generations table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub entity_count: usize,
    pub rejected_count: usize,
    pub slot: Option<String>,
}

// ============================================================================
// ARCHIVE
// ============================================================================

pub struct Archive {
    conn: Connection,
}

impl Archive {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open archive {}", path.display()))?;
        setup_database(&conn)?;
        Ok(Archive { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory archive")?;
        setup_database(&conn)?;
        Ok(Archive { conn })
    }

    /// Persist `snapshot` as the new current generation.
    ///
    /// Demotes the old current to previous and prunes entity rows of
    /// anything older. Tombstones and rejected rows are kept forever.
    pub fn save_generation(&mut self, snapshot: &Snapshot) -> Result<()> {
        let generation = snapshot.generation() as i64;
        let tx = self.conn.transaction().context("Failed to begin transaction")?;

        tx.execute(
            "UPDATE generations SET slot = NULL WHERE slot = ?1",
            params![SLOT_PREVIOUS],
        )?;
        tx.execute(
            "UPDATE generations SET slot = ?1 WHERE slot = ?2",
            params![SLOT_PREVIOUS, SLOT_CURRENT],
        )?;
        tx.execute(
            "INSERT INTO generations (generation, created_at, entity_count, rejected_count, slot)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                generation,
                snapshot.created_at().to_rfc3339(),
                snapshot.len() as i64,
                snapshot.rejected().len() as i64,
                SLOT_CURRENT,
            ],
        )
        .with_context(|| format!("Failed to record generation {}", generation))?;

        {
            let mut insert_entity = tx.prepare(
                "INSERT INTO generation_entities (generation, entity_id, data) VALUES (?1, ?2, ?3)",
            )?;
            for entity in snapshot.entities() {
                let data = serde_json::to_string(entity)?;
                insert_entity.execute(params![generation, entity.entity_id, data])?;
            }

            let mut insert_tombstone = tx.prepare(
                "INSERT OR IGNORE INTO tombstones (entity_id, removed_in, last_seen)
                 VALUES (?1, ?2, ?3)",
            )?;
            let removed_now = snapshot
                .tombstones()
                .filter(|t| t.removed_in == snapshot.generation());
            for tombstone in removed_now {
                let data = serde_json::to_string(&tombstone.last_seen)?;
                insert_tombstone.execute(params![tombstone.entity_id, generation, data])?;
            }

            let mut insert_rejected = tx.prepare(
                "INSERT INTO rejected_rows
                 (generation, source_file, line_number, jurisdiction, stage, reason, raw)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in snapshot.rejected() {
                insert_rejected.execute(params![
                    generation,
                    row.source.source_file,
                    row.source.line_number as i64,
                    row.jurisdiction,
                    row.stage.as_str(),
                    row.reason,
                    serde_json::to_string(&row.raw)?,
                ])?;
            }
        }

        tx.execute(
            "DELETE FROM generation_entities
             WHERE generation NOT IN (SELECT generation FROM generations WHERE slot IS NOT NULL)",
            [],
        )?;

        let event = Event::new(
            "generation_promoted",
            "generation",
            &generation.to_string(),
            serde_json::json!({
                "entities": snapshot.len(),
                "tombstones": snapshot.tombstones().count(),
                "rejected": snapshot.rejected().len(),
            }),
            "snapshot_store",
        );
        insert_event(&tx, &event)?;

        tx.commit()
            .with_context(|| format!("Failed to commit generation {}", generation))?;
        debug!(generation, "generation archived");
        Ok(())
    }

    /// (current, previous) as recorded by the last successful save
    pub fn load_retained(&self) -> Result<(Option<Snapshot>, Option<Snapshot>)> {
        let current = self.generation_in_slot(SLOT_CURRENT)?;
        let previous = self.generation_in_slot(SLOT_PREVIOUS)?;

        let current = match current {
            Some(g) => Some(self.load_generation(g)?),
            None => None,
        };
        let previous = match previous {
            Some(g) => Some(self.load_generation(g)?),
            None => None,
        };
        Ok((current, previous))
    }

    fn generation_in_slot(&self, slot: &str) -> Result<Option<u64>> {
        let generation: Option<i64> = self
            .conn
            .query_row(
                "SELECT generation FROM generations WHERE slot = ?1",
                params![slot],
                |row| row.get(0),
            )
            .optional()?;
        Ok(generation.map(|g| g as u64))
    }

    /// Rebuild one retained generation with its indices
    pub fn load_generation(&self, generation: u64) -> Result<Snapshot> {
        let created_at: String = self
            .conn
            .query_row(
                "SELECT created_at FROM generations WHERE generation = ?1",
                params![generation as i64],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("generation {} is not in the archive", generation))?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .with_context(|| format!("Bad timestamp on generation {}", generation))?
            .with_timezone(&Utc);

        let mut stmt = self.conn.prepare(
            "SELECT data FROM generation_entities WHERE generation = ?1 ORDER BY entity_id",
        )?;
        let entities = stmt
            .query_map(params![generation as i64], |row| row.get::<_, String>(0))?
            .map(|data| -> Result<CanonicalEntity> {
                Ok(serde_json::from_str(&data?).context("Corrupt entity row")?)
            })
            .collect::<Result<Vec<_>>>()?;

        let present: std::collections::HashSet<&str> =
            entities.iter().map(|e| e.entity_id.as_str()).collect();
        let tombstones: Vec<Tombstone> = self
            .tombstones_as_of(generation)?
            .into_iter()
            .filter(|t| !present.contains(t.entity_id.as_str()))
            .collect();

        let rejected = self.rejected_rows(generation)?;
        Ok(Snapshot::from_parts(generation, created_at, entities, tombstones, rejected))
    }

    /// Latest removal per entity at or before `generation`
    fn tombstones_as_of(&self, generation: u64) -> Result<Vec<Tombstone>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, removed_in, last_seen FROM tombstones
             WHERE removed_in <= ?1 ORDER BY entity_id, removed_in",
        )?;
        let mut latest: BTreeMap<String, Tombstone> = BTreeMap::new();
        let rows = stmt.query_map(params![generation as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (entity_id, removed_in, last_seen) = row?;
            let last_seen: CanonicalEntity =
                serde_json::from_str(&last_seen).context("Corrupt tombstone row")?;
            latest.insert(
                entity_id.clone(),
                Tombstone {
                    entity_id,
                    removed_in: removed_in as u64,
                    last_seen,
                },
            );
        }
        Ok(latest.into_values().collect())
    }

    /// Every recorded removal of one entity, oldest first
    pub fn tombstone_history(&self, entity_id: &str) -> Result<Vec<Tombstone>> {
        let mut stmt = self.conn.prepare(
            "SELECT removed_in, last_seen FROM tombstones WHERE entity_id = ?1 ORDER BY removed_in",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (removed_in, last_seen) = row?;
            history.push(Tombstone {
                entity_id: entity_id.to_string(),
                removed_in: removed_in as u64,
                last_seen: serde_json::from_str(&last_seen).context("Corrupt tombstone row")?,
            });
        }
        Ok(history)
    }

    /// Rejected-rows log of one ingestion run, in source order
    pub fn rejected_rows(&self, generation: u64) -> Result<Vec<RejectedRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_file, line_number, jurisdiction, stage, reason, raw
             FROM rejected_rows WHERE generation = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![generation as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut rejected = Vec::new();
        for row in rows {
            let (source_file, line_number, jurisdiction, stage, reason, raw) = row?;
            let stage = match stage.as_str() {
                "identity" => RejectionStage::Identity,
                _ => RejectionStage::Normalization,
            };
            rejected.push(RejectedRow {
                source: crate::error::SourceRef {
                    source_file,
                    line_number: line_number as usize,
                },
                jurisdiction,
                stage,
                reason,
                raw: serde_json::from_str(&raw).context("Corrupt rejected row")?,
            });
        }
        Ok(rejected)
    }

    /// All generations ever promoted, newest first
    pub fn generations(&self) -> Result<Vec<GenerationInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT generation, created_at, entity_count, rejected_count, slot
             FROM generations ORDER BY generation DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut infos = Vec::new();
        for row in rows {
            let (generation, created_at, entity_count, rejected_count, slot) = row?;
            infos.push(GenerationInfo {
                generation: generation as u64,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                entity_count: entity_count as usize,
                rejected_count: rejected_count as usize,
                slot,
            });
        }
        Ok(infos)
    }

    pub fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        get_events_for_entity(&self.conn, entity_type, entity_id)
    }

    /// Rows per table, for diagnostics
    pub fn table_counts(&self) -> Result<HashMap<String, i64>> {
        let mut counts = HashMap::new();
        let tables = [
            "generations",
            "generation_entities",
            "tombstones",
            "rejected_rows",
            "events",
        ];
        for table in tables {
            let count: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            counts.insert(table.to_string(), count);
        }
        Ok(counts)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery (in-memory databases report "memory")
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS generations (
            generation INTEGER PRIMARY KEY,
            created_at TEXT NOT NULL,
            entity_count INTEGER NOT NULL,
            rejected_count INTEGER NOT NULL,
            slot TEXT UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS generation_entities (
            generation INTEGER NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (generation, entity_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tombstones (
            entity_id TEXT NOT NULL,
            removed_in INTEGER NOT NULL,
            last_seen TEXT NOT NULL,
            PRIMARY KEY (entity_id, removed_in)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rejected_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            generation INTEGER NOT NULL,
            source_file TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            jurisdiction TEXT,
            stage TEXT NOT NULL,
            reason TEXT NOT NULL,
            raw TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rejected_generation ON rejected_rows(generation)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let rows = stmt.query_map(params![entity_type, entity_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (event_id, timestamp, event_type, entity_type, entity_id, data, actor) = row?;
        events.push(Event {
            event_id,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
            event_type,
            entity_type,
            entity_id,
            data: serde_json::from_str(&data)?,
            actor,
        });
    }
    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================
