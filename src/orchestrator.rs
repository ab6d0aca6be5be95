//! Per-turn orchestration
//!
//! Drives one full request/response cycle: classify, execute the route,
//! persist the turn. The orchestrator takes `&mut self` per turn, so there is
//! never more than one in-flight turn per session and memory writes stay
//! causally ordered. The three suspension points (embedding, backend, tool
//! dispatch) are bounded by timeouts and watch the cancellation token: an
//! interrupt resolves the turn as `Cancelled` without touching session state
//! or undoing already-dispatched external calls.

use crate::backend::{AgentBackend, BackendRequest, BackendResponse, ToolResultContext};
use crate::classifier::{Classification, ControlCommand, InputClassifier};
use crate::dispatch::ToolDispatcher;
use crate::embeddings::Embedder;
use crate::error::{BackendError, NimbusError, Result};
use crate::memory::{ContextRetriever, MemoryStore, PendingTurn};
use crate::session::SessionState;
use crate::shell::ShellExecutor;
use crate::types::{MemoryCategory, MemoryEntry, Route, ToolOutcome, Turn, TurnRef, TurnStatus};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Characters of output folded into a turn summary
const SUMMARY_BUDGET: usize = 400;

/// Recent exchanges kept for prompt context; cleared by `reset`
const TRANSCRIPT_WINDOW: usize = 4;

/// Side effect the CLI surface must apply after a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Exit,
    ClearScreen,
}

/// What one completed turn produced
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn: Turn,
    /// Text the surface shows the user
    pub display: String,
    pub control: Option<ControlAction>,
}

struct Exchange {
    input: String,
    reply: String,
}

/// Composes classifier, memory, backend, dispatcher, and shell into the
/// request/response cycle
pub struct Orchestrator {
    session: SessionState,
    classifier: InputClassifier,
    store: Arc<dyn MemoryStore>,
    retriever: ContextRetriever,
    dispatcher: ToolDispatcher,
    backend: Arc<dyn AgentBackend>,
    embedder: Arc<dyn Embedder>,
    shell: ShellExecutor,
    top_k: usize,
    backend_timeout: Duration,
    embed_timeout: Duration,
    transcript: Vec<Exchange>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionState,
        classifier: InputClassifier,
        store: Arc<dyn MemoryStore>,
        retriever: ContextRetriever,
        dispatcher: ToolDispatcher,
        backend: Arc<dyn AgentBackend>,
        embedder: Arc<dyn Embedder>,
        shell: ShellExecutor,
        top_k: usize,
        backend_timeout: Duration,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            session,
            classifier,
            store,
            retriever,
            dispatcher,
            backend,
            embedder,
            shell,
            top_k,
            backend_timeout,
            embed_timeout,
            transcript: Vec::new(),
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Explicit provider/project selection from the surface
    pub fn select_context(&mut self, provider: crate::types::ProviderKind, project: Option<String>) {
        self.session.set_active_context(provider, project);
    }

    /// Run one turn to completion. Never panics across this boundary; every
    /// outcome, including cancellation and backend failure, yields a report
    /// and a best-effort persisted turn.
    pub async fn run_turn(&mut self, input: &str, cancel: &CancellationToken) -> TurnReport {
        let classification = self.classifier.classify(input, &self.session);

        let report = match classification {
            Classification::Control(cmd) => self.run_control(input, cmd).await,
            Classification::Shell { command } => self.run_shell(input, &command, cancel).await,
            Classification::Agent { prompt } => self.run_agent(input, &prompt, cancel).await,
        };

        self.session.record_completed_turn();
        report
    }

    async fn run_control(&mut self, input: &str, cmd: ControlCommand) -> TurnReport {
        let (summary, display, action) = match cmd {
            ControlCommand::Exit => ("control: exit", "goodbye".to_string(), Some(ControlAction::Exit)),
            ControlCommand::Clear => ("control: clear", String::new(), Some(ControlAction::ClearScreen)),
            ControlCommand::Reset => {
                self.transcript.clear();
                ("control: reset", "conversation context cleared".to_string(), None)
            }
        };

        let turn = self
            .persist_turn(
                PendingTurn::new(self.session.session_id(), input, Route::Control)
                    .with_summary(summary),
            )
            .await;

        TurnReport {
            turn,
            display,
            control: action,
        }
    }

    async fn run_shell(
        &mut self,
        input: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> TurnReport {
        let result = cancellable(cancel, self.shell.execute(command, self.session.cwd())).await;

        let (status, summary, display) = match result {
            Ok(Ok(output)) => {
                if let Some(new_cwd) = &output.new_cwd {
                    self.session.set_cwd(new_cwd.clone());
                }
                let display = if output.success() {
                    output.stdout.clone()
                } else if output.stderr.is_empty() {
                    format!("exit code {}", output.exit_code)
                } else {
                    output.stderr.clone()
                };
                let summary = if output.success() && output.stdout.trim().is_empty() {
                    format!("executed: {}", command)
                } else {
                    truncate(&display, SUMMARY_BUDGET)
                };
                let status = if output.success() {
                    TurnStatus::Succeeded
                } else {
                    TurnStatus::Failed
                };
                (status, summary, display)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                (TurnStatus::Failed, message.clone(), message)
            }
            Err(_) => cancelled_outcome(),
        };

        let turn = self
            .persist_turn(
                PendingTurn::new(self.session.session_id(), input, Route::Shell)
                    .with_status(status)
                    .with_summary(summary),
            )
            .await;

        TurnReport {
            turn,
            display,
            control: None,
        }
    }

    async fn run_agent(
        &mut self,
        input: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> TurnReport {
        let mut degraded = false;

        // Suspension point 1: context retrieval (embedding inside). Store
        // trouble means stateless operation, not a blocked user.
        let context = match cancellable(cancel, self.retriever.retrieve(prompt, self.top_k)).await
        {
            Ok(Ok(scored)) => scored
                .into_iter()
                .map(|s| s.entry.content)
                .collect::<Vec<_>>(),
            Ok(Err(e)) => {
                warn!("Proceeding without retrieved context: {}", e);
                degraded = true;
                Vec::new()
            }
            Err(_) => {
                return self.finish_cancelled(input).await;
            }
        };

        let mut request = BackendRequest {
            system: self.system_prompt(),
            input: self.prompt_with_transcript(prompt),
            context,
            tools: self.dispatcher.tool_schemas(),
            tool_result: None,
        };

        // Suspension point 2: the backend, called exactly once per turn
        // unless it requests a tool call.
        let response = match self.call_backend(&request, cancel).await {
            Ok(response) => response,
            Err(NimbusError::Cancelled) => return self.finish_cancelled(input).await,
            Err(e) => return self.finish_failed(input, e).await,
        };

        match response {
            BackendResponse::Text(text) => {
                self.finish_agent_turn(input, prompt, None, TurnStatus::ok_or_degraded(degraded), text)
                    .await
            }
            BackendResponse::ToolUse(tool_request) => {
                let call = match self.dispatcher.resolve(&tool_request) {
                    Ok(call) => call,
                    Err(e) => {
                        // Unrecognized tool or bad parameters: surfaced as a
                        // failed turn, never a crash.
                        return self.finish_failed(input, e).await;
                    }
                };

                info!(
                    "Dispatching {} {} (idempotent: {})",
                    call.provider, call.operation, call.idempotent
                );

                // Suspension point 3: the provider handler.
                let report = match cancellable(cancel, self.dispatcher.dispatch(&call)).await {
                    Ok(report) => report,
                    Err(_) => return self.finish_cancelled(input).await,
                };

                let tool_failed = !report.outcome.is_success();
                let outcome_text = describe_outcome(&report.outcome);

                // Hand the outcome back for one final natural-language
                // summary; a failure here degrades, it does not lose the
                // tool result.
                request.tool_result = Some(ToolResultContext {
                    call: call.clone(),
                    request: tool_request,
                    outcome: report.outcome,
                });

                let (status, display) = match self.call_backend(&request, cancel).await {
                    Ok(BackendResponse::Text(text)) => {
                        let status = if tool_failed {
                            TurnStatus::Failed
                        } else {
                            TurnStatus::ok_or_degraded(degraded)
                        };
                        (status, text)
                    }
                    Err(NimbusError::Cancelled) => {
                        return self.finish_cancelled(input).await;
                    }
                    Ok(BackendResponse::ToolUse(_)) | Err(_) => {
                        let status = if tool_failed {
                            TurnStatus::Failed
                        } else {
                            TurnStatus::Degraded
                        };
                        (status, outcome_text)
                    }
                };

                self.finish_agent_turn(input, prompt, Some(call), status, display)
                    .await
            }
        }
    }

    async fn call_backend(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse> {
        let bounded = tokio::time::timeout(self.backend_timeout, self.backend.complete(request));
        match cancellable(cancel, bounded).await {
            Ok(Ok(result)) => result.map_err(NimbusError::Backend),
            Ok(Err(_)) => Err(NimbusError::Backend(BackendError::Timeout(
                self.backend_timeout.as_millis() as u64,
            ))),
            Err(_) => Err(NimbusError::Cancelled),
        }
    }

    async fn finish_agent_turn(
        &mut self,
        input: &str,
        prompt: &str,
        intent: Option<crate::types::ToolCall>,
        status: TurnStatus,
        display: String,
    ) -> TurnReport {
        // Successful cloud operations become resource-state memory so later
        // turns can recall what was touched where.
        let resource_note = match (&intent, status) {
            (Some(call), TurnStatus::Succeeded) => Some(format!(
                "{} {} succeeded ({})",
                call.provider,
                call.operation,
                self.session.describe()
            )),
            _ => None,
        };

        let mut pending = PendingTurn::new(self.session.session_id(), input, Route::Agent)
            .with_status(status)
            .with_summary(truncate(&display, SUMMARY_BUDGET));
        if let Some(call) = intent {
            pending = pending.with_intent(call);
        }
        let turn = self.persist_turn(pending).await;

        self.remember_exchange(prompt, &display, &turn).await;
        if let Some(note) = resource_note {
            self.remember_fact(note, MemoryCategory::ResourceState, &turn)
                .await;
        }

        self.transcript.push(Exchange {
            input: prompt.to_string(),
            reply: truncate(&display, SUMMARY_BUDGET),
        });
        if self.transcript.len() > TRANSCRIPT_WINDOW {
            self.transcript.remove(0);
        }

        TurnReport {
            turn,
            display,
            control: None,
        }
    }

    async fn finish_failed(&mut self, input: &str, error: NimbusError) -> TurnReport {
        let message = error.to_string();
        let pending = PendingTurn::new(self.session.session_id(), input, Route::Agent)
            .with_status(TurnStatus::Failed)
            .with_summary(truncate(&message, SUMMARY_BUDGET));
        let turn = self.persist_turn(pending).await;

        TurnReport {
            turn,
            display: message,
            control: None,
        }
    }

    async fn finish_cancelled(&mut self, input: &str) -> TurnReport {
        let (_, summary, display) = cancelled_outcome();
        let turn = self
            .persist_turn(
                PendingTurn::new(self.session.session_id(), input, Route::Agent)
                    .with_status(TurnStatus::Cancelled)
                    .with_summary(summary),
            )
            .await;
        TurnReport {
            turn,
            display,
            control: None,
        }
    }

    /// Persist the turn; on a down store, degrade to an unpersisted record
    /// rather than dropping the turn silently.
    async fn persist_turn(&self, pending: PendingTurn) -> Turn {
        match self.store.record_turn(pending.clone()).await {
            Ok(turn) => turn,
            Err(e) => {
                warn!("Turn not persisted (store unavailable): {}", e);
                Turn {
                    sequence: self.session.turn_counter() + 1,
                    session_id: pending.session_id,
                    timestamp: pending.timestamp,
                    input: pending.input,
                    route: pending.route,
                    intent: pending.intent,
                    status: pending.status,
                    summary: pending.summary,
                }
            }
        }
    }

    /// Fold the exchange into durable memory. Explicit "remember:" requests
    /// become preferences; everything else is a conversation summary.
    async fn remember_exchange(&self, prompt: &str, reply: &str, turn: &Turn) {
        let (category, content) = match preference_payload(prompt) {
            Some(fact) => (MemoryCategory::Preference, fact.to_string()),
            None => (
                MemoryCategory::Conversation,
                format!("{} -> {}", prompt, truncate(reply, 200)),
            ),
        };
        self.remember_fact(content, category, turn).await;
    }

    async fn remember_fact(&self, content: String, category: MemoryCategory, turn: &Turn) {
        let bounded = tokio::time::timeout(self.embed_timeout, self.embedder.embed(&content));
        let embedding = match bounded.await.unwrap_or_else(|_| {
            Err(NimbusError::EmbeddingUnavailable(format!(
                "write-time embedding exceeded {}ms",
                self.embed_timeout.as_millis()
            )))
        }) {
            Ok(vector) => vector,
            Err(e) => {
                // The invariant is one embedding per entry at write time, so
                // a failed embedding skips the write instead of storing a
                // vectorless entry.
                warn!("Memory entry not stored (embedding failed): {}", e);
                return;
            }
        };

        let mut entry = MemoryEntry::new(content, category).with_source_turn(TurnRef {
            session_id: turn.session_id.clone(),
            sequence: turn.sequence,
        });
        entry.embedding = Some(embedding);
        entry.embedding_model = self.embedder.model_name().to_string();

        if let Err(e) = self.store.put(entry).await {
            warn!("Memory entry not stored: {}", e);
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are nimbus, a terminal assistant for cloud operations across \
             GCP, AWS, Azure, and Docker. Session context: {}. Use the \
             available tools for cloud operations; prefer read-only listings \
             unless the user clearly asks for a change. Answer concisely.",
            self.session.describe()
        )
    }

    fn prompt_with_transcript(&self, prompt: &str) -> String {
        if self.transcript.is_empty() {
            return prompt.to_string();
        }
        let mut text = String::from("Earlier in this session:\n");
        for exchange in &self.transcript {
            text.push_str(&format!("> {}\n{}\n", exchange.input, exchange.reply));
        }
        text.push('\n');
        text.push_str(prompt);
        text
    }
}

/// Race a future against the cancellation token. Biased toward the token so
/// an already-fired interrupt wins even over an immediately-ready future.
async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> std::result::Result<T, ()>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(()),
        value = fut => Ok(value),
    }
}

fn cancelled_outcome() -> (TurnStatus, String, String) {
    (
        TurnStatus::Cancelled,
        "interrupted by user".to_string(),
        "interrupted".to_string(),
    )
}

fn describe_outcome(outcome: &ToolOutcome) -> String {
    match outcome {
        ToolOutcome::Success { payload } => {
            format!("tool call succeeded: {}", truncate(&payload.to_string(), SUMMARY_BUDGET))
        }
        ToolOutcome::Failure { kind, message } => {
            format!("tool call failed ({}): {}", kind, message)
        }
    }
}

fn truncate(s: &str, budget: usize) -> String {
    if s.chars().count() <= budget {
        s.to_string()
    } else {
        let cut: String = s.chars().take(budget).collect();
        format!("{}…", cut)
    }
}

/// Extract the fact from an explicit "remember: ..." request
fn preference_payload(prompt: &str) -> Option<&str> {
    let lower = prompt.to_lowercase();
    for prefix in ["remember:", "remember that ", "remember "] {
        if lower.starts_with(prefix) {
            let fact = prompt[prefix.len()..].trim();
            if !fact.is_empty() {
                return Some(fact);
            }
        }
    }
    None
}
