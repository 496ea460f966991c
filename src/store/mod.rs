//! Durable detection storage.
//!
//! The local store is the system of record: every accepted detection is
//! written here synchronously before anything else happens. Remote sync
//! (`sync`) and transient-image cleanup (`cleanup`) operate on top of it,
//! and `coordinator` sequences the whole persistence protocol.

mod cleanup;
mod coordinator;
mod sync;

pub use cleanup::ImageCleanup;
pub use coordinator::{DetectionNotifier, LogNotifier, PersistenceCoordinator};
pub use sync::RemoteSync;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};

use crate::plate::VehicleType;

/// A persisted plate detection.
#[derive(Clone, Debug)]
pub struct DetectionRecord {
    /// Row id once stored.
    pub id: Option<i64>,
    pub plate: String,
    pub vehicle_type: VehicleType,
    pub confidence: f32,
    pub camera_id: String,
    pub direction: Option<String>,
    /// Epoch seconds.
    pub created_at: u64,
    pub full_image_path: Option<String>,
    /// Transient crop image; cleared by cleanup once synced or expired.
    pub roi_image_path: Option<String>,
    pub engine: String,
    pub processing_ms: u64,
    pub synced: bool,
}

/// Append-only detection store, queryable by recency and plate text.
///
/// Appends must be at-least-once safe: the coordinator retries on
/// failure, and a duplicate row is preferable to a lost detection.
pub trait DetectionStore: Send {
    fn append(&mut self, record: &DetectionRecord) -> Result<i64>;

    fn recent(&mut self, limit: usize) -> Result<Vec<DetectionRecord>>;

    fn by_plate(&mut self, plate: &str, limit: usize) -> Result<Vec<DetectionRecord>>;

    /// Rows not yet replicated to the remote store, oldest first.
    fn unsynced(&mut self, limit: usize) -> Result<Vec<DetectionRecord>>;

    fn mark_synced(&mut self, id: i64) -> Result<()>;

    /// Rows whose ROI image may be deleted: synced, or older than the
    /// grace cutoff.
    fn cleanup_candidates(&mut self, cutoff: u64) -> Result<Vec<DetectionRecord>>;

    /// Forget a deleted ROI image path.
    fn clear_roi_path(&mut self, id: i64) -> Result<()>;
}

// ----------------------------------------------------------------------------
// SQLite store
// ----------------------------------------------------------------------------

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              plate TEXT NOT NULL,
              vehicle_type TEXT NOT NULL,
              confidence REAL NOT NULL,
              camera_id TEXT NOT NULL,
              direction TEXT,
              created_at INTEGER NOT NULL,
              full_image_path TEXT,
              roi_image_path TEXT,
              engine TEXT NOT NULL,
              processing_ms INTEGER NOT NULL,
              synced INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_detections_created ON detections(created_at);
            CREATE INDEX IF NOT EXISTS idx_detections_plate ON detections(plate);
            "#,
        )?;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<DetectionRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let vehicle_type: String = row.get(2)?;
            let created_at: i64 = row.get(6)?;
            let synced: i64 = row.get(11)?;
            out.push(DetectionRecord {
                id: Some(row.get(0)?),
                plate: row.get(1)?,
                vehicle_type: VehicleType::parse(&vehicle_type)
                    .ok_or_else(|| anyhow!("corrupt row: unknown vehicle type {}", vehicle_type))?,
                confidence: row.get(3)?,
                camera_id: row.get(4)?,
                direction: row.get(5)?,
                created_at: u64::try_from(created_at)
                    .map_err(|_| anyhow!("corrupt row: negative created_at"))?,
                full_image_path: row.get(7)?,
                roi_image_path: row.get(8)?,
                engine: row.get(9)?,
                processing_ms: u64::try_from(row.get::<_, i64>(10)?).unwrap_or(0),
                synced: synced != 0,
            });
        }
        Ok(out)
    }
}

const SELECT_COLUMNS: &str = "SELECT id, plate, vehicle_type, confidence, camera_id, direction, \
     created_at, full_image_path, roi_image_path, engine, processing_ms, synced FROM detections";

impl DetectionStore for SqliteDetectionStore {
    fn append(&mut self, record: &DetectionRecord) -> Result<i64> {
        let created_at = i64::try_from(record.created_at)
            .map_err(|_| anyhow!("created_at exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO detections(plate, vehicle_type, confidence, camera_id, direction,
                                   created_at, full_image_path, roi_image_path, engine,
                                   processing_ms, synced)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.plate,
                record.vehicle_type.as_str(),
                record.confidence,
                record.camera_id,
                record.direction,
                created_at,
                record.full_image_path,
                record.roi_image_path,
                record.engine,
                record.processing_ms as i64,
                record.synced as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let sql = format!("{} ORDER BY created_at DESC, id DESC LIMIT ?1", SELECT_COLUMNS);
        self.query(&sql, &[&(limit as i64)])
    }

    fn by_plate(&mut self, plate: &str, limit: usize) -> Result<Vec<DetectionRecord>> {
        let sql = format!(
            "{} WHERE plate = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            SELECT_COLUMNS
        );
        self.query(&sql, &[&plate, &(limit as i64)])
    }

    fn unsynced(&mut self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let sql = format!(
            "{} WHERE synced = 0 ORDER BY created_at ASC, id ASC LIMIT ?1",
            SELECT_COLUMNS
        );
        self.query(&sql, &[&(limit as i64)])
    }

    fn mark_synced(&mut self, id: i64) -> Result<()> {
        self.conn
            .execute("UPDATE detections SET synced = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn cleanup_candidates(&mut self, cutoff: u64) -> Result<Vec<DetectionRecord>> {
        let cutoff = i64::try_from(cutoff).map_err(|_| anyhow!("cutoff exceeds i64 range"))?;
        let sql = format!(
            "{} WHERE roi_image_path IS NOT NULL AND (synced = 1 OR created_at <= ?1)",
            SELECT_COLUMNS
        );
        self.query(&sql, &[&cutoff])
    }

    fn clear_roi_path(&mut self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE detections SET roi_image_path = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory store (tests)
// ----------------------------------------------------------------------------

pub struct MemoryDetectionStore {
    rows: Vec<DetectionRecord>,
    next_id: i64,
}

impl Default for MemoryDetectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDetectionStore {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl DetectionStore for MemoryDetectionStore {
    fn append(&mut self, record: &DetectionRecord) -> Result<i64> {
        let id = self.next_id;
        self.next_id += 1;
        let mut row = record.clone();
        row.id = Some(id);
        self.rows.push(row);
        Ok(id)
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn by_plate(&mut self, plate: &str, limit: usize) -> Result<Vec<DetectionRecord>> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .filter(|r| r.plate == plate)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn unsynced(&mut self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let mut rows: Vec<_> = self.rows.iter().filter(|r| !r.synced).cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn mark_synced(&mut self, id: i64) -> Result<()> {
        for row in &mut self.rows {
            if row.id == Some(id) {
                row.synced = true;
            }
        }
        Ok(())
    }

    fn cleanup_candidates(&mut self, cutoff: u64) -> Result<Vec<DetectionRecord>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.roi_image_path.is_some() && (r.synced || r.created_at <= cutoff))
            .cloned()
            .collect())
    }

    fn clear_roi_path(&mut self, id: i64) -> Result<()> {
        for row in &mut self.rows {
            if row.id == Some(id) {
                row.roi_image_path = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_record(plate: &str, camera_id: &str, created_at: u64) -> DetectionRecord {
    DetectionRecord {
        id: None,
        plate: plate.to_string(),
        vehicle_type: VehicleType::Passenger,
        confidence: 0.9,
        camera_id: camera_id.to_string(),
        direction: Some("IN".to_string()),
        created_at,
        full_image_path: None,
        roi_image_path: None,
        engine: "ollama".to_string(),
        processing_ms: 1200,
        synced: false,
    }
}
