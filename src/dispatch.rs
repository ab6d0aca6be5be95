//! Tool dispatcher
//!
//! Translates an agent-resolved tool-use request into a call against a
//! registered provider handler. Validation happens before anything external
//! runs: unknown tool names are a typed error in the same class as a
//! classification ambiguity, never a crash. Each call walks an explicit
//! state machine `Pending -> Executing -> {Succeeded, Failed, TimedOut}`.
//! Retry behavior is a policy object injected at construction so tests can
//! substitute a zero-backoff policy: idempotent calls retry on transient
//! failure kinds only, non-idempotent calls dispatch at most once.

use crate::backend::{ToolSchema, ToolUseRequest};
use crate::error::{NimbusError, Result};
use crate::providers::ProviderHandler;
use crate::types::{DispatchErrorKind, ProviderKind, ToolCall, ToolOutcome};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for transient tool-call failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// No retries, no waiting; for tests and non-interactive callers
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Retries without backoff delay; keeps retry-count tests fast
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether this failure on this call earns another attempt
    pub fn should_retry(&self, call: &ToolCall, kind: DispatchErrorKind, attempt: u32) -> bool {
        call.idempotent && kind.is_transient() && attempt < self.max_attempts
    }

    /// Exponential backoff delay before the given attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Per-call state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
}

/// Terminal report of one dispatched call
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcome: ToolOutcome,
    pub terminal_state: CallState,
    /// Attempts actually made (1 unless transient retries fired)
    pub attempts: u32,
}

/// Dispatcher over the registered provider handlers
pub struct ToolDispatcher {
    handlers: HashMap<ProviderKind, Arc<dyn ProviderHandler>>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            policy,
            call_timeout,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ProviderHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Tool schemas advertised to the backend, one per operation,
    /// named `<provider>_<operation>`
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = Vec::new();
        for handler in self.handlers.values() {
            for op in handler.operations() {
                let properties: serde_json::Map<String, Value> = op
                    .required_params
                    .iter()
                    .map(|p| (p.to_string(), serde_json::json!({ "type": "string" })))
                    .collect();
                schemas.push(ToolSchema {
                    name: format!("{}_{}", handler.kind(), op.name),
                    description: op.description.to_string(),
                    input_schema: serde_json::json!({
                        "type": "object",
                        "properties": properties,
                        "required": op.required_params,
                    }),
                });
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Validate a backend tool-use request into a typed call.
    ///
    /// Resolves the provider and operation against the registered tables and
    /// stamps the table's idempotency flag. Anything unrecognized or missing
    /// a required parameter is rejected here, before any external call.
    pub fn resolve(&self, request: &ToolUseRequest) -> Result<ToolCall> {
        let (provider_str, operation) = request
            .name
            .split_once('_')
            .ok_or_else(|| NimbusError::UnknownTool(request.name.clone()))?;

        let provider = ProviderKind::from_str(provider_str)
            .ok_or_else(|| NimbusError::UnknownTool(request.name.clone()))?;

        let handler = self
            .handlers
            .get(&provider)
            .ok_or_else(|| NimbusError::UnknownTool(request.name.clone()))?;

        let spec = handler
            .operations()
            .iter()
            .find(|op| op.name == operation)
            .ok_or_else(|| NimbusError::UnknownTool(request.name.clone()))?;

        let params: BTreeMap<String, Value> = match &request.input {
            Value::Object(map) => map.clone().into_iter().collect(),
            Value::Null => BTreeMap::new(),
            _ => {
                return Err(NimbusError::Dispatch {
                    kind: DispatchErrorKind::Validation,
                    message: "tool input must be an object".to_string(),
                })
            }
        };

        for required in spec.required_params {
            if !params.contains_key(*required) {
                return Err(NimbusError::Dispatch {
                    kind: DispatchErrorKind::Validation,
                    message: format!("missing required parameter '{}'", required),
                });
            }
        }

        Ok(ToolCall {
            provider,
            operation: operation.to_string(),
            params,
            idempotent: spec.idempotent,
        })
    }

    /// Execute a validated call to its terminal state
    pub async fn dispatch(&self, call: &ToolCall) -> DispatchReport {
        let Some(handler) = self.handlers.get(&call.provider) else {
            return DispatchReport {
                outcome: ToolOutcome::Failure {
                    kind: DispatchErrorKind::Validation,
                    message: format!("no handler registered for {}", call.provider),
                },
                terminal_state: CallState::Failed,
                attempts: 0,
            };
        };

        let mut state = CallState::Pending;
        debug!(
            "Tool call {} {} state {:?}",
            call.provider, call.operation, state
        );
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let delay = self.policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }

            state = CallState::Executing;
            debug!(
                "Dispatching {} {} (attempt {}, state {:?})",
                call.provider, call.operation, attempt, state
            );

            let result = tokio::time::timeout(self.call_timeout, handler.execute(call)).await;

            match result {
                Ok(ToolOutcome::Success { payload }) => {
                    return DispatchReport {
                        outcome: ToolOutcome::Success { payload },
                        terminal_state: CallState::Succeeded,
                        attempts: attempt,
                    };
                }
                Ok(ToolOutcome::Failure { kind, message }) => {
                    if self.policy.should_retry(call, kind, attempt) {
                        warn!(
                            "Transient {} failure on {} {} (attempt {}), retrying: {}",
                            kind, call.provider, call.operation, attempt, message
                        );
                        continue;
                    }
                    return DispatchReport {
                        outcome: ToolOutcome::Failure { kind, message },
                        terminal_state: CallState::Failed,
                        attempts: attempt,
                    };
                }
                Err(_) => {
                    // Timeouts are terminal: the external call may still be
                    // in flight, so even an idempotent retry is not free.
                    return DispatchReport {
                        outcome: ToolOutcome::Failure {
                            kind: DispatchErrorKind::Timeout,
                            message: format!(
                                "call exceeded {}ms",
                                self.call_timeout.as_millis()
                            ),
                        },
                        terminal_state: CallState::TimedOut,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::OperationSpec;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Handler double with a scripted outcome per call and an attempt counter
    struct ScriptedHandler {
        kind: ProviderKind,
        calls: AtomicU32,
        outcome: Box<dyn Fn(u32) -> ToolOutcome + Send + Sync>,
    }

    const TEST_OPERATIONS: &[OperationSpec] = &[
        OperationSpec {
            name: "list_projects",
            description: "read-only listing",
            idempotent: true,
            required_params: &[],
        },
        OperationSpec {
            name: "delete_instance",
            description: "destructive",
            idempotent: false,
            required_params: &["name"],
        },
    ];

    #[async_trait]
    impl ProviderHandler for ScriptedHandler {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn operations(&self) -> &'static [OperationSpec] {
            TEST_OPERATIONS
        }

        async fn execute(&self, _call: &ToolCall) -> ToolOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.outcome)(n)
        }
    }

    fn scripted<F>(outcome: F) -> Arc<ScriptedHandler>
    where
        F: Fn(u32) -> ToolOutcome + Send + Sync + 'static,
    {
        Arc::new(ScriptedHandler {
            kind: ProviderKind::Gcp,
            calls: AtomicU32::new(0),
            outcome: Box::new(outcome),
        })
    }

    fn dispatcher_with(handler: Arc<ScriptedHandler>, policy: RetryPolicy) -> ToolDispatcher {
        let mut dispatcher = ToolDispatcher::new(policy, Duration::from_secs(1));
        dispatcher.register(handler);
        dispatcher
    }

    fn idempotent_call() -> ToolCall {
        ToolCall {
            provider: ProviderKind::Gcp,
            operation: "list_projects".to_string(),
            params: BTreeMap::new(),
            idempotent: true,
        }
    }

    fn destructive_call() -> ToolCall {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), serde_json::json!("vm-1"));
        ToolCall {
            provider: ProviderKind::Gcp,
            operation: "delete_instance".to_string(),
            params,
            idempotent: false,
        }
    }

    fn transient_failure() -> ToolOutcome {
        ToolOutcome::Failure {
            kind: DispatchErrorKind::Network,
            message: "connection reset".to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let handler = scripted(|_| ToolOutcome::Success {
            payload: serde_json::json!(["alpha"]),
        });
        let dispatcher = dispatcher_with(handler.clone(), RetryPolicy::no_retry());

        let report = dispatcher.dispatch(&idempotent_call()).await;
        assert_eq!(report.terminal_state, CallState::Succeeded);
        assert_eq!(report.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_transient_failure_retries_to_success() {
        let handler = scripted(|n| {
            if n < 3 {
                transient_failure()
            } else {
                ToolOutcome::Success {
                    payload: serde_json::json!([]),
                }
            }
        });
        let dispatcher = dispatcher_with(handler.clone(), RetryPolicy::immediate(3));

        let report = dispatcher.dispatch(&idempotent_call()).await;
        assert_eq!(report.terminal_state, CallState::Succeeded);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_stop_at_policy_bound() {
        let handler = scripted(|_| transient_failure());
        let dispatcher = dispatcher_with(handler.clone(), RetryPolicy::immediate(3));

        let report = dispatcher.dispatch(&idempotent_call()).await;
        assert_eq!(report.terminal_state, CallState::Failed);
        assert_eq!(report.attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_idempotent_never_retried() {
        let handler = scripted(|_| transient_failure());
        let dispatcher = dispatcher_with(handler.clone(), RetryPolicy::immediate(5));

        let report = dispatcher.dispatch(&destructive_call()).await;
        assert_eq!(report.terminal_state, CallState::Failed);
        assert_eq!(report.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_never_retried() {
        let handler = scripted(|_| ToolOutcome::Failure {
            kind: DispatchErrorKind::Authorization,
            message: "permission denied".to_string(),
        });
        let dispatcher = dispatcher_with(handler.clone(), RetryPolicy::immediate(5));

        let report = dispatcher.dispatch(&idempotent_call()).await;
        assert_eq!(report.terminal_state, CallState::Failed);
        assert_eq!(report.attempts, 1);
        match report.outcome {
            ToolOutcome::Failure { kind, message } => {
                assert_eq!(kind, DispatchErrorKind::Authorization);
                assert_eq!(message, "permission denied");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        struct SlowHandler;

        #[async_trait]
        impl ProviderHandler for SlowHandler {
            fn kind(&self) -> ProviderKind {
                ProviderKind::Gcp
            }
            fn operations(&self) -> &'static [OperationSpec] {
                TEST_OPERATIONS
            }
            async fn execute(&self, _call: &ToolCall) -> ToolOutcome {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ToolOutcome::Success {
                    payload: serde_json::Value::Null,
                }
            }
        }

        let mut dispatcher =
            ToolDispatcher::new(RetryPolicy::immediate(5), Duration::from_millis(50));
        dispatcher.register(Arc::new(SlowHandler));

        let report = dispatcher.dispatch(&idempotent_call()).await;
        assert_eq!(report.terminal_state, CallState::TimedOut);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_resolve_validates_and_stamps_idempotency() {
        let dispatcher = dispatcher_with(
            scripted(|_| ToolOutcome::Success {
                payload: serde_json::Value::Null,
            }),
            RetryPolicy::no_retry(),
        );

        let call = dispatcher
            .resolve(&ToolUseRequest {
                name: "gcp_list_projects".to_string(),
                input: serde_json::json!({}),
            })
            .unwrap();
        assert!(call.idempotent);
        assert_eq!(call.operation, "list_projects");

        let call = dispatcher
            .resolve(&ToolUseRequest {
                name: "gcp_delete_instance".to_string(),
                input: serde_json::json!({"name": "vm-1"}),
            })
            .unwrap();
        assert!(!call.idempotent);
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_tools() {
        let dispatcher = dispatcher_with(
            scripted(|_| ToolOutcome::Success {
                payload: serde_json::Value::Null,
            }),
            RetryPolicy::no_retry(),
        );

        for name in ["bogus", "gcp_format_disk", "azure_list_groups"] {
            let err = dispatcher
                .resolve(&ToolUseRequest {
                    name: name.to_string(),
                    input: serde_json::json!({}),
                })
                .unwrap_err();
            assert!(
                matches!(err, NimbusError::UnknownTool(_)),
                "expected unknown tool for {}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_rejects_missing_required_param() {
        let dispatcher = dispatcher_with(
            scripted(|_| ToolOutcome::Success {
                payload: serde_json::Value::Null,
            }),
            RetryPolicy::no_retry(),
        );

        let err = dispatcher
            .resolve(&ToolUseRequest {
                name: "gcp_delete_instance".to_string(),
                input: serde_json::json!({}),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            NimbusError::Dispatch {
                kind: DispatchErrorKind::Validation,
                ..
            }
        ));
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(300),
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(300));
    }
}
