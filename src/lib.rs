//! Nimbus - Terminal Cloud Assistant with Persistent Semantic Memory
//!
//! Nimbus accepts free-form natural-language or raw shell input, decides how
//! to execute it (local shell, cloud-provider tool call, or AI-interpreted
//! operation), and augments every decision with a persistent,
//! semantically-searchable memory of prior interactions, cloud configuration
//! state, and user preferences.
//!
//! # Architecture
//!
//! The core is organized into layers, leaves first:
//! - **Types**: the data model (Turn, MemoryEntry, ToolCall, routes)
//! - **Memory**: durable SQLite store plus semantic/lexical retrieval
//! - **Embeddings**: remote HTTP embedder and an offline hashed embedder
//! - **Classifier**: shell / control / agent routing heuristics
//! - **Dispatch**: validated tool calls against provider handlers with an
//!   injected retry policy
//! - **History**: persisted raw-input index with fuzzy reverse search
//! - **Orchestrator**: the per-turn request/response cycle
//!
//! # Example
//!
//! ```ignore
//! use nimbus_core::{Orchestrator, SessionState};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut orchestrator = build_orchestrator().await?;
//!     let cancel = CancellationToken::new();
//!
//!     let report = orchestrator.run_turn("List all my GCP projects", &cancel).await;
//!     println!("{}", report.display);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod embeddings;
pub mod error;
pub mod history;
pub mod memory;
pub mod orchestrator;
pub mod providers;
pub mod session;
pub mod shell;
pub mod types;

// Re-export commonly used types
pub use backend::{AgentBackend, BackendRequest, BackendResponse, HttpBackend};
pub use classifier::{Classification, ControlCommand, InputClassifier};
pub use config::{load_config, NimbusConfig};
pub use dispatch::{CallState, DispatchReport, RetryPolicy, ToolDispatcher};
pub use embeddings::{Embedder, HashedEmbedder, RemoteEmbedder};
pub use error::{BackendError, NimbusError, Result};
pub use history::{HistoryIndex, HistorySearch, SearchDirection, SearchOutcome};
pub use memory::{ContextRetriever, MemoryStore, PendingTurn, SqliteMemoryStore};
pub use orchestrator::{ControlAction, Orchestrator, TurnReport};
pub use providers::{CliProviderHandler, ProviderHandler};
pub use session::SessionState;
pub use shell::{ShellExecutor, ShellOutput};
pub use types::{
    DispatchErrorKind, MemoryCategory, MemoryEntry, MemoryId, ProviderKind, Route, ScoredEntry,
    ToolCall, ToolOutcome, Turn, TurnRef, TurnStatus,
};
