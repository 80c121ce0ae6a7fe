//! Durable damage record storage.
//!
//! One logical record per track id, keyed writes only. The upsert is a
//! single SQLite statement (`INSERT ... ON CONFLICT DO UPDATE`) so
//! concurrent writers for the same key serialize inside the engine and
//! neither write is lost. Reads return the whole row or nothing; a row is
//! never composed from two different writes.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{BoundingBox, DamageClass, DamageRecord, Verdict};

pub trait DamageRecordStore {
    /// Insert or overwrite the record for `rec.track_id`. Never produces a
    /// second row for a track id already on record.
    fn upsert(&mut self, rec: &DamageRecord) -> Result<()>;

    /// Full current record for a track id, or `None` if never seen.
    fn get_by_track_id(&self, track_id: i64) -> Result<Option<DamageRecord>>;

    /// Most recently written records, newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<DamageRecord>>;
}

pub struct SqliteDamageStore {
    conn: Connection,
}

impl SqliteDamageStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open damage db at {}", db_path))?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS damage_records (
              track_id INTEGER PRIMARY KEY,
              damage_type TEXT NOT NULL,
              confidence REAL NOT NULL,
              location TEXT NOT NULL,
              observed_at INTEGER NOT NULL,
              verdict TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_damage_observed ON damage_records(observed_at);
            "#,
        )?;
        Ok(())
    }
}

impl DamageRecordStore for SqliteDamageStore {
    fn upsert(&mut self, rec: &DamageRecord) -> Result<()> {
        let location = serde_json::to_string(&rec.location)?;
        let verdict = rec
            .verdict
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            r#"
            INSERT INTO damage_records(track_id, damage_type, confidence, location, observed_at, verdict)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(track_id) DO UPDATE SET
              damage_type = excluded.damage_type,
              confidence = excluded.confidence,
              location = excluded.location,
              observed_at = excluded.observed_at,
              verdict = excluded.verdict
            "#,
            params![
                rec.track_id,
                rec.damage_type.as_str(),
                f64::from(rec.confidence),
                location,
                rec.observed_at,
                verdict
            ],
        )?;
        Ok(())
    }

    fn get_by_track_id(&self, track_id: i64) -> Result<Option<DamageRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT track_id, damage_type, confidence, location, observed_at, verdict
                FROM damage_records WHERE track_id = ?1
                "#,
                params![track_id],
                row_to_raw,
            )
            .optional()?;
        row.map(raw_to_record).transpose()
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<DamageRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT track_id, damage_type, confidence, location, observed_at, verdict
            FROM damage_records
            ORDER BY observed_at DESC, track_id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_raw)?;

        let mut out = Vec::new();
        for raw in rows {
            out.push(raw_to_record(raw?)?);
        }
        Ok(out)
    }
}

type RawRow = (i64, String, f64, String, i64, Option<String>);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn raw_to_record(raw: RawRow) -> Result<DamageRecord> {
    let (track_id, damage_type, confidence, location, observed_at, verdict) = raw;
    let damage_type = DamageClass::parse(&damage_type)
        .ok_or_else(|| anyhow!("corrupt damage record: unknown class '{}'", damage_type))?;
    let location: BoundingBox =
        serde_json::from_str(&location).context("corrupt damage record: location json")?;
    let verdict: Option<Verdict> = verdict
        .map(|v| serde_json::from_str(&v))
        .transpose()
        .context("corrupt damage record: verdict json")?;
    Ok(DamageRecord {
        track_id,
        damage_type,
        confidence: confidence as f32,
        location,
        observed_at,
        verdict,
    })
}

/// HashMap-backed store with the same keyed-upsert semantics, for tests and
/// offline runs.
#[derive(Debug, Default)]
pub struct InMemoryDamageStore {
    records: std::collections::HashMap<i64, DamageRecord>,
}

impl InMemoryDamageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl DamageRecordStore for InMemoryDamageStore {
    fn upsert(&mut self, rec: &DamageRecord) -> Result<()> {
        self.records.insert(rec.track_id, rec.clone());
        Ok(())
    }

    fn get_by_track_id(&self, track_id: i64) -> Result<Option<DamageRecord>> {
        Ok(self.records.get(&track_id).cloned())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<DamageRecord>> {
        let mut records: Vec<DamageRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.observed_at
                .cmp(&a.observed_at)
                .then(b.track_id.cmp(&a.track_id))
        });
        records.truncate(limit);
        Ok(records)
    }
}
