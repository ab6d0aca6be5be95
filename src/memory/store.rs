//! SQLite memory store
//!
//! Single database file holding memory entries and turns, accessed through a
//! deadpool-sqlite connection pool. Entries are append-only: supersession
//! writes a pointer on the old row, never deletes it. Per-partition async
//! mutexes serialize writers within a partition while letting writes to
//! different partitions proceed in parallel; reads go straight to the pool.
//!
//! Bounded growth: each category has a capacity. On overflow the store evicts
//! superseded rows in least-recently-retrieved order first, then live rows by
//! oldest recency.

use crate::error::{NimbusError, Result};
use crate::memory::{MemoryStore, PendingTurn};
use crate::types::{
    MemoryCategory, MemoryEntry, MemoryId, Route, ToolCall, Turn, TurnRef, TurnStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Identifies a write-serialization partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Conversation,
    Preference,
    ResourceState,
    Turns,
}

impl Partition {
    fn for_category(category: MemoryCategory) -> Self {
        match category {
            MemoryCategory::Conversation => Partition::Conversation,
            MemoryCategory::Preference => Partition::Preference,
            MemoryCategory::ResourceState => Partition::ResourceState,
        }
    }

    fn index(self) -> usize {
        match self {
            Partition::Conversation => 0,
            Partition::Preference => 1,
            Partition::ResourceState => 2,
            Partition::Turns => 3,
        }
    }
}

/// SQLite-backed memory store with per-partition write serialization
pub struct SqliteMemoryStore {
    pool: Pool,
    /// One write lock per partition, indexed by `Partition::index`
    partition_locks: [Mutex<()>; 4],
    capacity_per_category: usize,
}

impl SqliteMemoryStore {
    /// Open (or create) the store at the given path and run migrations
    pub async fn open<P: AsRef<Path>>(db_path: P, capacity_per_category: usize) -> Result<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening memory store at: {}", path_str);

        let config = Config::new(path_str);
        let pool = config
            .create_pool(Runtime::Tokio1)
            .map_err(|e| NimbusError::Database(format!("Failed to create connection pool: {}", e)))?;

        let store = Self {
            pool,
            partition_locks: [Mutex::new(()), Mutex::new(()), Mutex::new(()), Mutex::new(())],
            capacity_per_category,
        };

        store.migrate().await?;
        Ok(store)
    }

    /// Create tables if missing; safe to call on every open
    async fn migrate(&self) -> Result<()> {
        self.interact(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS memory_entries (
                    id TEXT PRIMARY KEY,
                    category TEXT NOT NULL,
                    content TEXT NOT NULL,
                    source_session TEXT,
                    source_sequence INTEGER,
                    recency TEXT NOT NULL,
                    last_retrieved_at TEXT,
                    superseded_by TEXT,
                    embedding TEXT NOT NULL,
                    embedding_model TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_entries_category
                    ON memory_entries(category);
                CREATE INDEX IF NOT EXISTS idx_entries_live
                    ON memory_entries(category, superseded_by);

                CREATE TABLE IF NOT EXISTS turns (
                    session_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    input TEXT NOT NULL,
                    route TEXT NOT NULL,
                    intent TEXT,
                    status TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    PRIMARY KEY (session_id, sequence)
                );

                CREATE TABLE IF NOT EXISTS store_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    /// Run a closure against a pooled connection
    async fn interact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| NimbusError::MemoryStoreUnavailable(format!("pool: {}", e)))?;

        conn.interact(f)
            .await
            .map_err(|e| NimbusError::Database(format!("Pool interaction failed: {}", e)))?
    }

    /// Enforce the fixed embedding dimensionality invariant.
    /// The first write pins the dimension; later writes must match it.
    fn check_dimensions(conn: &Connection, produced: usize) -> Result<()> {
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'embedding_dimensions'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)?;

        match stored {
            Some(s) => {
                let stored: usize = s.parse().unwrap_or(0);
                if stored != produced {
                    return Err(NimbusError::EmbeddingDimensionMismatch { stored, produced });
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO store_meta (key, value) VALUES ('embedding_dimensions', ?1)",
                    params![produced.to_string()],
                )
                .map_err(db_err)?;
            }
        }
        Ok(())
    }

    fn insert_entry(conn: &Connection, entry: &MemoryEntry) -> Result<()> {
        let embedding = entry.embedding.as_ref().ok_or_else(|| {
            NimbusError::Other("memory entry written without an embedding".to_string())
        })?;
        Self::check_dimensions(conn, embedding.len())?;

        let embedding_json = serde_json::to_string(embedding)?;
        let (source_session, source_sequence) = match &entry.source_turn {
            Some(turn) => (Some(turn.session_id.clone()), Some(turn.sequence as i64)),
            None => (None, None),
        };

        conn.execute(
            "INSERT INTO memory_entries
                (id, category, content, source_session, source_sequence,
                 recency, last_retrieved_at, superseded_by, embedding, embedding_model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id.to_string(),
                entry.category.as_str(),
                entry.content,
                source_session,
                source_sequence,
                entry.recency.to_rfc3339(),
                entry.last_retrieved_at.map(|t| t.to_rfc3339()),
                entry.superseded_by.map(|id| id.to_string()),
                embedding_json,
                entry.embedding_model,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Evict beyond-capacity rows for a category. Caller holds the partition
    /// lock. Superseded rows go first (least recently retrieved, then oldest);
    /// live rows only if the category is still over capacity.
    fn evict_overflow(conn: &Connection, category: MemoryCategory, capacity: usize) -> Result<()> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_entries WHERE category = ?1",
                params![category.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let mut excess = (count as usize).saturating_sub(capacity);
        if excess == 0 {
            return Ok(());
        }

        debug!("Evicting {} overflow entries from {}", excess, category);

        let removed = conn
            .execute(
                "DELETE FROM memory_entries WHERE id IN (
                    SELECT id FROM memory_entries
                    WHERE category = ?1 AND superseded_by IS NOT NULL
                    ORDER BY COALESCE(last_retrieved_at, ''), recency
                    LIMIT ?2
                )",
                params![category.as_str(), excess as i64],
            )
            .map_err(db_err)?;

        excess -= removed;
        if excess > 0 {
            conn.execute(
                "DELETE FROM memory_entries WHERE id IN (
                    SELECT id FROM memory_entries
                    WHERE category = ?1
                    ORDER BY COALESCE(last_retrieved_at, ''), recency
                    LIMIT ?2
                )",
                params![category.as_str(), excess as i64],
            )
            .map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn put(&self, entry: MemoryEntry) -> Result<MemoryId> {
        let partition = Partition::for_category(entry.category);
        let _guard = self.partition_locks[partition.index()].lock().await;

        let id = entry.id;
        let category = entry.category;
        let capacity = self.capacity_per_category;
        self.interact(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            Self::insert_entry(&tx, &entry)?;
            Self::evict_overflow(&tx, category, capacity)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await?;

        debug!("Stored memory entry {} ({})", id, category);
        Ok(id)
    }

    async fn get(&self, id: MemoryId) -> Result<MemoryEntry> {
        let id_str = id.to_string();
        self.interact(move |conn| {
            conn.query_row(
                "SELECT id, category, content, source_session, source_sequence,
                        recency, last_retrieved_at, superseded_by, embedding, embedding_model
                 FROM memory_entries WHERE id = ?1",
                params![id_str],
                row_to_entry,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => NimbusError::MemoryNotFound(id_str.clone()),
                other => db_err(other),
            })
        })
        .await
    }

    async fn supersede(&self, old: MemoryId, replacement: MemoryEntry) -> Result<MemoryId> {
        // The old entry's category is unknown until read, so hold all three
        // entry partitions for the supersession write. Canonical order keeps
        // concurrent supersessions deadlock-free.
        let mut _guards = Vec::new();
        for lock in &self.partition_locks[..3] {
            _guards.push(lock.lock().await);
        }

        let new_id = replacement.id;
        let old_str = old.to_string();
        let capacity = self.capacity_per_category;
        self.interact(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;

            let found: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM memory_entries WHERE id = ?1",
                    params![old_str],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if found == 0 {
                return Err(NimbusError::MemoryNotFound(old_str.clone()));
            }

            let category = replacement.category;
            Self::insert_entry(&tx, &replacement)?;
            tx.execute(
                "UPDATE memory_entries SET superseded_by = ?1 WHERE id = ?2",
                params![new_id.to_string(), old_str],
            )
            .map_err(db_err)?;
            Self::evict_overflow(&tx, category, capacity)?;

            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await?;

        debug!("Superseded {} with {}", old, new_id);
        Ok(new_id)
    }

    async fn record_turn(&self, turn: PendingTurn) -> Result<Turn> {
        let _guard = self.partition_locks[Partition::Turns.index()].lock().await;

        self.interact(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;

            // Sequence assignment happens inside the turns partition lock,
            // which makes numbers strictly increasing and gap-free even with
            // concurrent callers.
            let last: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) FROM turns WHERE session_id = ?1",
                    params![turn.session_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            let sequence = (last as u64) + 1;

            let intent_json = match &turn.intent {
                Some(call) => Some(serde_json::to_string(call)?),
                None => None,
            };

            tx.execute(
                "INSERT INTO turns
                    (session_id, sequence, timestamp, input, route, intent, status, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    turn.session_id,
                    sequence as i64,
                    turn.timestamp.to_rfc3339(),
                    turn.input,
                    route_str(turn.route),
                    intent_json,
                    status_str(turn.status),
                    turn.summary,
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            Ok(Turn {
                sequence,
                session_id: turn.session_id,
                timestamp: turn.timestamp,
                input: turn.input,
                route: turn.route,
                intent: turn.intent,
                status: turn.status,
                summary: turn.summary,
            })
        })
        .await
    }

    async fn turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        let session = session_id.to_string();
        self.interact(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, sequence, timestamp, input, route, intent, status, summary
                     FROM turns WHERE session_id = ?1 ORDER BY sequence",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![session], row_to_turn)
                .map_err(db_err)?;
            let mut turns = Vec::new();
            for row in rows {
                turns.push(row.map_err(db_err)?);
            }
            Ok(turns)
        })
        .await
    }

    async fn live_entries(&self) -> Result<Vec<MemoryEntry>> {
        self.interact(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, category, content, source_session, source_sequence,
                            recency, last_retrieved_at, superseded_by, embedding, embedding_model
                     FROM memory_entries WHERE superseded_by IS NULL",
                )
                .map_err(db_err)?;
            let rows = stmt.query_map([], row_to_entry).map_err(db_err)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(db_err)?);
            }
            Ok(entries)
        })
        .await
    }

    async fn recent(&self, category: MemoryCategory, n: usize) -> Result<Vec<MemoryEntry>> {
        self.interact(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, category, content, source_session, source_sequence,
                            recency, last_retrieved_at, superseded_by, embedding, embedding_model
                     FROM memory_entries
                     WHERE category = ?1 AND superseded_by IS NULL
                     ORDER BY recency DESC LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![category.as_str(), n as i64], row_to_entry)
                .map_err(db_err)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(db_err)?);
            }
            Ok(entries)
        })
        .await
    }

    async fn clear(&self, category: MemoryCategory) -> Result<usize> {
        let partition = Partition::for_category(category);
        let _guard = self.partition_locks[partition.index()].lock().await;

        self.interact(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM memory_entries WHERE category = ?1",
                    params![category.as_str()],
                )
                .map_err(db_err)?;
            Ok(removed)
        })
        .await
    }

    async fn touch_retrieved(&self, ids: &[MemoryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.interact(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for id in &id_strings {
                tx.execute(
                    "UPDATE memory_entries SET last_retrieved_at = ?1 WHERE id = ?2",
                    params![now, id],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

fn db_err(e: rusqlite::Error) -> NimbusError {
    NimbusError::Database(e.to_string())
}

fn ignore_no_rows<T>(e: rusqlite::Error) -> std::result::Result<Option<T>, rusqlite::Error> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn route_str(route: Route) -> &'static str {
    match route {
        Route::Shell => "shell",
        Route::Control => "control",
        Route::Agent => "agent",
    }
}

fn route_from_str(s: &str) -> Route {
    match s {
        "shell" => Route::Shell,
        "control" => Route::Control,
        _ => Route::Agent,
    }
}

fn status_str(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::Succeeded => "succeeded",
        TurnStatus::Failed => "failed",
        TurnStatus::Cancelled => "cancelled",
        TurnStatus::Degraded => "degraded",
    }
}

fn status_from_str(s: &str) -> TurnStatus {
    match s {
        "succeeded" => TurnStatus::Succeeded,
        "cancelled" => TurnStatus::Cancelled,
        "degraded" => TurnStatus::Degraded,
        _ => TurnStatus::Failed,
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let id_str: String = row.get(0)?;
    let category_str: String = row.get(1)?;
    let source_session: Option<String> = row.get(3)?;
    let source_sequence: Option<i64> = row.get(4)?;
    let recency_str: String = row.get(5)?;
    let last_retrieved: Option<String> = row.get(6)?;
    let superseded_by: Option<String> = row.get(7)?;
    let embedding_json: String = row.get(8)?;

    let source_turn = match (source_session, source_sequence) {
        (Some(session_id), Some(sequence)) => Some(TurnRef {
            session_id,
            sequence: sequence as u64,
        }),
        _ => None,
    };

    Ok(MemoryEntry {
        id: MemoryId::from_string(&id_str).unwrap_or_default(),
        source_turn,
        content: row.get(2)?,
        category: MemoryCategory::from_str(&category_str)
            .unwrap_or(MemoryCategory::Conversation),
        recency: parse_timestamp(&recency_str),
        last_retrieved_at: last_retrieved.as_deref().map(parse_timestamp),
        superseded_by: superseded_by
            .as_deref()
            .and_then(|s| MemoryId::from_string(s).ok()),
        embedding: serde_json::from_str(&embedding_json).ok(),
        embedding_model: row.get(9)?,
    })
}

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<Turn> {
    let timestamp_str: String = row.get(2)?;
    let route_string: String = row.get(4)?;
    let intent_json: Option<String> = row.get(5)?;
    let status_string: String = row.get(6)?;
    let sequence: i64 = row.get(1)?;

    let intent: Option<ToolCall> = intent_json.as_deref().and_then(|j| serde_json::from_str(j).ok());

    Ok(Turn {
        session_id: row.get(0)?,
        sequence: sequence as u64,
        timestamp: parse_timestamp(&timestamp_str),
        input: row.get(3)?,
        route: route_from_str(&route_string),
        intent,
        status: status_from_str(&status_string),
        summary: row.get(7)?,
    })
}
