//! Core data types for the nimbus assistant
//!
//! This module defines the fundamental data structures used throughout nimbus:
//! turns, memory entries, tool calls, and the routing/outcome enums that tie
//! the classifier, dispatcher, and memory store together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for memory entries
///
/// Wraps a UUID to provide type safety and prevent mixing memory ids
/// with other UUID-based identifiers in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a memory id from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution route chosen for one input line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Recognized shell invocation, executed at the shell boundary
    Shell,

    /// Member of the closed control-command set (exit, clear, reset)
    Control,

    /// Everything else: interpreted by the language-model backend
    Agent,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Shell => write!(f, "shell"),
            Route::Control => write!(f, "control"),
            Route::Agent => write!(f, "agent"),
        }
    }
}

/// Terminal status of a completed turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The route executed and produced its normal result
    Succeeded,

    /// The route executed but the operation failed; details in the summary
    Failed,

    /// A user interrupt aborted the turn at a suspension point
    Cancelled,

    /// The turn completed but with a fallback in effect
    /// (lexical-only retrieval, stateless agent path, missing final summary)
    Degraded,
}

impl TurnStatus {
    /// Succeeded, unless a fallback was in effect during the turn
    pub fn ok_or_degraded(degraded: bool) -> Self {
        if degraded {
            TurnStatus::Degraded
        } else {
            TurnStatus::Succeeded
        }
    }
}

/// One full request/response cycle
///
/// Turns are immutable once written and owned exclusively by the memory
/// store. Sequence numbers are strictly increasing and gap-free within a
/// session; the store assigns them at persist time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Monotonic per-session sequence number (assigned by the store)
    pub sequence: u64,

    /// Session this turn belongs to
    pub session_id: String,

    /// When the turn completed
    pub timestamp: DateTime<Utc>,

    /// Raw input line as typed
    pub input: String,

    /// Route the classifier resolved
    pub route: Route,

    /// Structured intent the agent path resolved, if any
    pub intent: Option<ToolCall>,

    /// Terminal outcome
    pub status: TurnStatus,

    /// Human-readable account of what happened
    pub summary: String,
}

/// Weak reference from a memory entry back to its source turn
///
/// Id plus lookup key, never ownership: the referenced turn may be pruned
/// while the derived entry persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRef {
    pub session_id: String,
    pub sequence: u64,
}

/// Logical partition a memory entry belongs to
///
/// Writers are serialized per partition; writes to different partitions may
/// proceed in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Summaries of past conversation turns
    Conversation,

    /// Durable user preferences ("remember: ...", confirmed defaults)
    Preference,

    /// Observed cloud configuration state (active projects, regions, ...)
    ResourceState,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 3] = [
        MemoryCategory::Conversation,
        MemoryCategory::Preference,
        MemoryCategory::ResourceState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Conversation => "conversation",
            MemoryCategory::Preference => "preference",
            MemoryCategory::ResourceState => "resource_state",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "conversation" => Some(MemoryCategory::Conversation),
            "preference" => Some(MemoryCategory::Preference),
            "resource_state" => Some(MemoryCategory::ResourceState),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted fact or turn summary eligible for retrieval
///
/// Every entry carries exactly one embedding vector computed at write time.
/// Vectors are never mutated in place: an update creates a new entry and
/// marks the old one superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    // === Identity ===
    /// Unique identifier
    pub id: MemoryId,

    /// Weak reference to the turn this entry was derived from
    pub source_turn: Option<TurnRef>,

    // === Content ===
    /// Text content used for both semantic and lexical retrieval
    pub content: String,

    /// Logical partition
    pub category: MemoryCategory,

    // === Lifecycle ===
    /// Recency timestamp (write time; newer wins similarity ties)
    pub recency: DateTime<Utc>,

    /// Last time retrieval returned this entry (feeds eviction)
    pub last_retrieved_at: Option<DateTime<Utc>>,

    /// If superseded, the id of the superseding entry
    pub superseded_by: Option<MemoryId>,

    // === Computational ===
    /// Embedding vector, computed once at write time
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,

    /// Model that produced the embedding
    pub embedding_model: String,
}

impl MemoryEntry {
    /// Build a fresh entry with write-time recency and no supersession
    pub fn new(content: impl Into<String>, category: MemoryCategory) -> Self {
        Self {
            id: MemoryId::new(),
            source_turn: None,
            content: content.into(),
            category,
            recency: Utc::now(),
            last_retrieved_at: None,
            superseded_by: None,
            embedding: None,
            embedding_model: String::new(),
        }
    }

    pub fn with_source_turn(mut self, turn: TurnRef) -> Self {
        self.source_turn = Some(turn);
        self
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }
}

/// Cloud provider a tool call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Aws,
    Gcp,
    Azure,
    Docker,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Azure => "azure",
            ProviderKind::Docker => "docker",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "aws" => Some(ProviderKind::Aws),
            "gcp" => Some(ProviderKind::Gcp),
            "azure" => Some(ProviderKind::Azure),
            "docker" => Some(ProviderKind::Docker),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured request to an external cloud-provider handler
///
/// Ephemeral: produced by the agent path per turn and validated at the
/// dispatcher boundary; only its outcome is folded into a Turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Target provider
    pub provider: ProviderKind,

    /// Operation name within the provider's closed operation table
    pub operation: String,

    /// Parameter mapping; BTreeMap keeps keys unique and ordered
    pub params: BTreeMap<String, serde_json::Value>,

    /// Whether the operation is safely repeatable
    pub idempotent: bool,
}

/// Machine-readable failure category for tool dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    /// Connectivity failure; transient
    Network,

    /// Provider-side throttling; transient
    RateLimited,

    /// The call exceeded its per-call timeout
    Timeout,

    /// Credentials missing or insufficient; permanent
    Authorization,

    /// The call itself was malformed for the target operation; permanent
    Validation,

    /// Provider-side internal failure; permanent
    Internal,
}

impl DispatchErrorKind {
    /// Transient kinds are eligible for retry (idempotent calls only)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchErrorKind::Network | DispatchErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatchErrorKind::Network => "network",
            DispatchErrorKind::RateLimited => "rate_limited",
            DispatchErrorKind::Timeout => "timeout",
            DispatchErrorKind::Authorization => "authorization",
            DispatchErrorKind::Validation => "validation",
            DispatchErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one dispatched tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ToolOutcome {
    /// The provider handler completed the operation
    Success { payload: serde_json::Value },

    /// The provider handler reported a categorized failure
    Failure {
        kind: DispatchErrorKind,
        message: String,
    },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }
}

/// A retrieved memory entry with its relevance score
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    /// The entry that matched
    pub entry: MemoryEntry,

    /// Relevance score; comparable only within one retrieval call
    pub score: f32,

    /// Whether the score came from the semantic or the lexical ranker
    pub semantic: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_id_creation() {
        let id1 = MemoryId::new();
        let id2 = MemoryId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_category_round_trip() {
        for cat in MemoryCategory::ALL {
            assert_eq!(MemoryCategory::from_str(cat.as_str()), Some(cat));
        }
        assert_eq!(MemoryCategory::from_str("unknown"), None);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(DispatchErrorKind::Network.is_transient());
        assert!(DispatchErrorKind::RateLimited.is_transient());
        assert!(!DispatchErrorKind::Authorization.is_transient());
        assert!(!DispatchErrorKind::Validation.is_transient());
        assert!(!DispatchErrorKind::Timeout.is_transient());
    }

    #[test]
    fn test_tool_call_serialization() {
        let mut params = BTreeMap::new();
        params.insert("project".to_string(), serde_json::json!("acme-prod"));
        let call = ToolCall {
            provider: ProviderKind::Gcp,
            operation: "list_projects".to_string(),
            params,
            idempotent: true,
        };

        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"provider\":\"gcp\""));

        let back: ToolCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back.operation, "list_projects");
        assert!(back.idempotent);
    }

    #[test]
    fn test_fresh_entry_is_live() {
        let entry = MemoryEntry::new("prefers us-east-1", MemoryCategory::Preference);
        assert!(!entry.is_superseded());
        assert!(entry.embedding.is_none());
        assert!(entry.source_turn.is_none());
    }
}
