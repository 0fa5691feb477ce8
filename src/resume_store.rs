/// Resume Store
///
/// Durable record of in-flight downloads and their chunk state, backed by a
/// local SQLite database. Every mutation is a single transaction, so a
/// crash at any point leaves a consistent picture: on restart the engine
/// lists pending downloads and re-fetches whatever is not marked completed.
///
/// Only `update_chunk(.., Completed)` ever advances a download's
/// `completed_size`; it is recomputed from the chunk table inside the same
/// transaction that flips the chunk.
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::InProgress => "in_progress",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DownloadStatus::Pending),
            "in_progress" => Some(DownloadStatus::InProgress),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "in_progress" => Some(ChunkStatus::InProgress),
            "completed" => Some(ChunkStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub hash: String,
    pub url: String,
    pub expected_size: u64,
    pub completed_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub status: DownloadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub download_hash: String,
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub status: ChunkStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct ResumeStore {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamp so stored values order lexicographically.
fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

impl ResumeStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create resume store directory: {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open resume store: {:?}", path))?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and ephemeral nodes.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = ResumeStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                expected_size INTEGER NOT NULL,
                completed_size INTEGER NOT NULL DEFAULT 0,
                chunk_size INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                error TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS download_chunks (
                download_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                status TEXT NOT NULL,
                completed_at TEXT,
                PRIMARY KEY (download_id, chunk_index),
                FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status)",
            [],
        )?;
        Ok(())
    }

    /// Insert a download plus its chunk partition. Idempotent: an existing
    /// record for the same hash is left untouched.
    pub fn create(&self, hash: &str, url: &str, expected_size: u64, chunk_size: u64) -> Result<()> {
        if chunk_size == 0 {
            bail!("chunk_size must be positive");
        }
        let total_chunks = expected_size.div_ceil(chunk_size) as u32;
        let now = now_ts();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO downloads
             (id, url, expected_size, completed_size, chunk_size, total_chunks, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?7)",
            params![
                hash,
                url,
                expected_size,
                chunk_size,
                total_chunks,
                DownloadStatus::Pending.as_str(),
                now
            ],
        )?;
        if inserted > 0 {
            let mut stmt = tx.prepare(
                "INSERT INTO download_chunks (download_id, chunk_index, start_offset, end_offset, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut index: u32 = 0;
            let mut start: u64 = 0;
            while start < expected_size {
                let end = (start + chunk_size).min(expected_size);
                stmt.execute(params![
                    hash,
                    index,
                    start,
                    end,
                    ChunkStatus::Pending.as_str()
                ])?;
                index += 1;
                start = end;
            }
            drop(stmt);
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch a download and its chunks, ordered by index.
    pub fn get(&self, hash: &str) -> Result<Option<(DownloadRecord, Vec<ChunkRecord>)>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, url, expected_size, completed_size, chunk_size, total_chunks,
                        status, created_at, updated_at, error
                 FROM downloads WHERE id = ?1",
                params![hash],
                row_to_download,
            )
            .optional()?;

        let Some(record) = record else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, start_offset, end_offset, status, completed_at
             FROM download_chunks WHERE download_id = ?1 ORDER BY chunk_index",
        )?;
        let chunks = stmt
            .query_map(params![hash], row_to_chunk)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some((record, chunks)))
    }

    /// Downloads that still need work: pending or in progress.
    pub fn pending_downloads(&self) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, url, expected_size, completed_size, chunk_size, total_chunks,
                    status, created_at, updated_at, error
             FROM downloads WHERE status IN ('pending', 'in_progress')
             ORDER BY created_at",
        )?;
        let records = stmt
            .query_map([], row_to_download)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Chunks of one download not yet completed, ordered by index.
    pub fn pending_chunks(&self, hash: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, start_offset, end_offset, status, completed_at
             FROM download_chunks
             WHERE download_id = ?1 AND status != 'completed'
             ORDER BY chunk_index",
        )?;
        let chunks = stmt
            .query_map(params![hash], row_to_chunk)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    pub fn update_status(&self, hash: &str, status: DownloadStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE downloads SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_ts(), hash],
        )?;
        Ok(())
    }

    pub fn complete(&self, hash: &str) -> Result<()> {
        self.update_status(hash, DownloadStatus::Completed)
    }

    pub fn fail(&self, hash: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE downloads SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, now_ts(), hash],
        )?;
        Ok(())
    }

    /// Flip one chunk's status. Completing a chunk stamps `completed_at`
    /// and recomputes the parent's `completed_size` in the same
    /// transaction.
    pub fn update_chunk(&self, hash: &str, index: u32, status: ChunkStatus) -> Result<()> {
        let now = now_ts();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        match status {
            ChunkStatus::Completed => {
                tx.execute(
                    "UPDATE download_chunks SET status = ?1, completed_at = ?2
                     WHERE download_id = ?3 AND chunk_index = ?4",
                    params![status.as_str(), now, hash, index],
                )?;
                tx.execute(
                    "UPDATE downloads SET completed_size = (
                         SELECT COALESCE(SUM(end_offset - start_offset), 0)
                         FROM download_chunks
                         WHERE download_id = ?1 AND status = 'completed'
                     ), updated_at = ?2
                     WHERE id = ?1",
                    params![hash, now],
                )?;
            }
            _ => {
                tx.execute(
                    "UPDATE download_chunks SET status = ?1, completed_at = NULL
                     WHERE download_id = ?2 AND chunk_index = ?3",
                    params![status.as_str(), hash, index],
                )?;
                tx.execute(
                    "UPDATE downloads SET updated_at = ?2 WHERE id = ?1",
                    params![hash, now],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Put any in-progress chunks of a download back to pending; called on
    /// the failure and cancellation paths so no chunk is left mid-flight.
    pub fn reset_in_progress(&self, hash: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE download_chunks SET status = 'pending', completed_at = NULL
             WHERE download_id = ?1 AND status = 'in_progress'",
            params![hash],
        )?;
        Ok(changed)
    }

    /// Delete a download; chunk rows go with it via the cascade.
    pub fn delete(&self, hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![hash])?;
        Ok(())
    }

    /// Janitor sweep: drop unfinished records that have not been touched
    /// within `max_age`. Returns how many were removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).context("max_age out of range")?;
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM downloads
             WHERE status IN ('pending', 'in_progress', 'failed') AND updated_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }
}

fn parse_timestamp(column: usize, value: String) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                column,
                "timestamp".to_string(),
                rusqlite::types::Type::Text,
            )
        })
}

fn row_to_download(row: &Row) -> std::result::Result<DownloadRecord, rusqlite::Error> {
    let status_str: String = row.get(6)?;
    let status = DownloadStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(6, "status".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(DownloadRecord {
        hash: row.get(0)?,
        url: row.get(1)?,
        expected_size: row.get::<_, i64>(2)? as u64,
        completed_size: row.get::<_, i64>(3)? as u64,
        chunk_size: row.get::<_, i64>(4)? as u64,
        total_chunks: row.get::<_, i64>(5)? as u32,
        status,
        created_at: parse_timestamp(7, row.get(7)?)?,
        updated_at: parse_timestamp(8, row.get(8)?)?,
        error: row.get(9)?,
    })
}

fn row_to_chunk(row: &Row) -> std::result::Result<ChunkRecord, rusqlite::Error> {
    let status_str: String = row.get(4)?;
    let status = ChunkStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, "status".to_string(), rusqlite::types::Type::Text)
    })?;
    let completed_at: Option<String> = row.get(5)?;
    Ok(ChunkRecord {
        download_hash: row.get(0)?,
        index: row.get::<_, i64>(1)? as u32,
        start: row.get::<_, i64>(2)? as u64,
        end: row.get::<_, i64>(3)? as u64,
        status,
        completed_at: match completed_at {
            Some(ts) => Some(parse_timestamp(5, ts)?),
            None => None,
        },
    })
}
