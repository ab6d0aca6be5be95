//! Common test utilities and helpers

use async_trait::async_trait;
use nimbus_core::backend::{BackendRequest, BackendResponse, ToolUseRequest};
use nimbus_core::providers::{OperationSpec, ProviderHandler};
use nimbus_core::{
    AgentBackend, BackendError, ContextRetriever, Embedder, HashedEmbedder, InputClassifier,
    MemoryCategory, MemoryEntry, MemoryStore, Orchestrator, ProviderKind, RetryPolicy,
    SessionState, ShellExecutor, SqliteMemoryStore, ToolCall, ToolDispatcher, ToolOutcome,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const DIMS: usize = 64;

/// Backend double: pops scripted responses and records every request
pub struct ScriptedBackend {
    responses: Mutex<Vec<Result<BackendResponse, BackendError>>>,
    pub requests: Mutex<Vec<BackendRequest>>,
    pub calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<Result<BackendResponse, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn text(reply: &str) -> Arc<Self> {
        Self::new(vec![Ok(BackendResponse::Text(reply.to_string()))])
    }

    pub fn tool_then_text(tool: &str, input: serde_json::Value, reply: &str) -> Arc<Self> {
        Self::new(vec![
            Ok(BackendResponse::ToolUse(ToolUseRequest {
                name: tool.to_string(),
                input,
            })),
            Ok(BackendResponse::Text(reply.to_string())),
        ])
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn complete(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Err(BackendError::Malformed("script exhausted".to_string()))
        } else {
            responses.remove(0)
        }
    }
}

pub const TEST_OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        name: "list_projects",
        description: "read-only project listing",
        idempotent: true,
        required_params: &[],
    },
    OperationSpec {
        name: "delete_instance",
        description: "destructive instance deletion",
        idempotent: false,
        required_params: &["name"],
    },
];

/// Provider handler double with a fixed outcome and call counter
pub struct StubHandler {
    pub outcome: ToolOutcome,
    pub calls: AtomicU32,
}

impl StubHandler {
    pub fn succeeding(payload: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            outcome: ToolOutcome::Success { payload },
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing(kind: nimbus_core::DispatchErrorKind, message: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: ToolOutcome::Failure {
                kind,
                message: message.to_string(),
            },
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ProviderHandler for StubHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn operations(&self) -> &'static [OperationSpec] {
        TEST_OPERATIONS
    }

    async fn execute(&self, _call: &ToolCall) -> ToolOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Embedder double that sleeps past any reasonable timeout
pub struct SlowEmbedder;

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, _text: &str) -> nimbus_core::Result<Vec<f32>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(vec![0.0; DIMS])
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "slow"
    }
}

/// Everything a turn-cycle test needs, wired together
pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub store: Arc<SqliteMemoryStore>,
    pub backend: Arc<ScriptedBackend>,
    pub handler: Arc<StubHandler>,
    pub dir: TempDir,
}

pub async fn fixture_with(
    backend: Arc<ScriptedBackend>,
    handler: Arc<StubHandler>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
) -> Fixture {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(
        SqliteMemoryStore::open(dir.path().join("nimbus.db"), 128)
            .await
            .expect("open store"),
    );

    let retriever =
        ContextRetriever::new(store.clone(), embedder.clone(), Duration::from_millis(200));

    let mut dispatcher = ToolDispatcher::new(retry, Duration::from_secs(2));
    dispatcher.register(handler.clone());

    let orchestrator = Orchestrator::new(
        SessionState::with_cwd(dir.path().to_path_buf()),
        InputClassifier::with_commands(["ls", "echo", "cat", "grep", "false"]),
        store.clone(),
        retriever,
        dispatcher,
        backend.clone(),
        embedder,
        ShellExecutor::new(Duration::from_secs(5)),
        10,
        Duration::from_secs(2),
        Duration::from_millis(200),
    );

    Fixture {
        orchestrator,
        store,
        backend,
        handler,
        dir,
    }
}

pub async fn fixture(backend: Arc<ScriptedBackend>, handler: Arc<StubHandler>) -> Fixture {
    fixture_with(
        backend,
        handler,
        Arc::new(HashedEmbedder::new(DIMS)),
        RetryPolicy::no_retry(),
    )
    .await
}

/// Seed the store with pre-embedded conversation entries
pub async fn seed_memories(store: &SqliteMemoryStore, contents: &[&str]) {
    let embedder = HashedEmbedder::new(DIMS);
    for content in contents {
        let mut entry = MemoryEntry::new(*content, MemoryCategory::Conversation);
        entry.embedding = Some(embedder.embed(content).await.unwrap());
        entry.embedding_model = embedder.model_name().to_string();
        store.put(entry).await.unwrap();
    }
}
