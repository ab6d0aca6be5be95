//! Memory layer: durable store and semantic retrieval
//!
//! Provides the append-only persistence of turns and memory entries, and the
//! retrieval layer that ranks entries against a query (semantic with lexical
//! fallback).

pub mod retriever;
pub mod store;

pub use retriever::ContextRetriever;
pub use store::SqliteMemoryStore;

use crate::error::Result;
use crate::types::{MemoryCategory, MemoryEntry, MemoryId, Route, ToolCall, Turn, TurnStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A turn ready to persist; the store assigns the sequence number
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub input: String,
    pub route: Route,
    pub intent: Option<ToolCall>,
    pub status: TurnStatus,
    pub summary: String,
}

impl PendingTurn {
    pub fn new(session_id: &str, input: &str, route: Route) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            input: input.to_string(),
            route,
            intent: None,
            status: TurnStatus::Succeeded,
            summary: String::new(),
        }
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_intent(mut self, intent: ToolCall) -> Self {
        self.intent = Some(intent);
        self
    }
}

/// Storage backend trait defining all required memory operations
///
/// Writes are append-only at the storage layer: supersession is a logical
/// flag, not physical deletion, so the audit trail stays intact. Writers are
/// serialized per logical partition (one per category, plus turns); writes to
/// different partitions may proceed in parallel.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store a new entry; computes nothing, persists what it is given
    async fn put(&self, entry: MemoryEntry) -> Result<MemoryId>;

    /// Retrieve an entry by id, superseded or not (audit trail)
    async fn get(&self, id: MemoryId) -> Result<MemoryEntry>;

    /// Persist `replacement` and mark `old` superseded by it
    async fn supersede(&self, old: MemoryId, replacement: MemoryEntry) -> Result<MemoryId>;

    /// Persist a completed turn, assigning the next gap-free sequence number
    async fn record_turn(&self, turn: PendingTurn) -> Result<Turn>;

    /// All turns for a session in sequence order
    async fn turns(&self, session_id: &str) -> Result<Vec<Turn>>;

    /// All non-superseded entries with their embeddings (retrieval input)
    async fn live_entries(&self) -> Result<Vec<MemoryEntry>>;

    /// Most recent non-superseded entries in a category, newest first
    async fn recent(&self, category: MemoryCategory, n: usize) -> Result<Vec<MemoryEntry>>;

    /// Remove every entry in a category; returns the number removed.
    /// The one operation that physically deletes (explicit user intent).
    async fn clear(&self, category: MemoryCategory) -> Result<usize>;

    /// Stamp entries as retrieved now (feeds least-recently-retrieved eviction)
    async fn touch_retrieved(&self, ids: &[MemoryId]) -> Result<()>;
}
