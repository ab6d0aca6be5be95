//! Cloud-provider tool handlers
//!
//! Handlers are external collaborators behind one trait: they report success
//! or a machine-readable failure kind, never an opaque panic. The concrete
//! handlers here delegate to each provider's own CLI (`gcloud`, `aws`, `az`,
//! `docker`), which also keeps credential acquisition with the provider's
//! existing login flow. Each handler declares a closed operation table; the
//! dispatcher validates calls against it before anything runs.

use crate::types::{DispatchErrorKind, ProviderKind, ToolCall, ToolOutcome};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// One operation in a provider's closed table
#[derive(Debug, Clone, Copy)]
pub struct OperationSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Safely repeatable; gates dispatcher retries
    pub idempotent: bool,
    /// Parameters that must be present in the call
    pub required_params: &'static [&'static str],
}

/// Cloud-provider handler boundary
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// The closed set of operations this handler accepts
    fn operations(&self) -> &'static [OperationSpec];

    /// Execute a validated call. Infallible signature: failures are data.
    async fn execute(&self, call: &ToolCall) -> ToolOutcome;
}

const GCP_OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        name: "list_projects",
        description: "List GCP projects visible to the active account",
        idempotent: true,
        required_params: &[],
    },
    OperationSpec {
        name: "list_instances",
        description: "List Compute Engine instances in a project",
        idempotent: true,
        required_params: &["project"],
    },
    OperationSpec {
        name: "delete_instance",
        description: "Delete a Compute Engine instance",
        idempotent: false,
        required_params: &["project", "zone", "name"],
    },
];

const AWS_OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        name: "list_buckets",
        description: "List S3 buckets in the active account",
        idempotent: true,
        required_params: &[],
    },
    OperationSpec {
        name: "list_instances",
        description: "List EC2 instances in the active region",
        idempotent: true,
        required_params: &[],
    },
    OperationSpec {
        name: "delete_bucket",
        description: "Delete an S3 bucket",
        idempotent: false,
        required_params: &["name"],
    },
];

const AZURE_OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        name: "list_groups",
        description: "List resource groups in the active subscription",
        idempotent: true,
        required_params: &[],
    },
    OperationSpec {
        name: "list_vms",
        description: "List virtual machines in a resource group",
        idempotent: true,
        required_params: &["group"],
    },
    OperationSpec {
        name: "delete_group",
        description: "Delete a resource group and everything in it",
        idempotent: false,
        required_params: &["group"],
    },
];

const DOCKER_OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        name: "list_containers",
        description: "List containers, including stopped ones",
        idempotent: true,
        required_params: &[],
    },
    OperationSpec {
        name: "list_images",
        description: "List local images",
        idempotent: true,
        required_params: &[],
    },
    OperationSpec {
        name: "remove_container",
        description: "Remove a container by name or id",
        idempotent: false,
        required_params: &["name"],
    },
];

/// Handler that shells out to a provider CLI
pub struct CliProviderHandler {
    kind: ProviderKind,
    binary: String,
}

impl CliProviderHandler {
    pub fn new(kind: ProviderKind) -> Self {
        let binary = match kind {
            ProviderKind::Gcp => "gcloud",
            ProviderKind::Aws => "aws",
            ProviderKind::Azure => "az",
            ProviderKind::Docker => "docker",
        };
        Self {
            kind,
            binary: binary.to_string(),
        }
    }

    /// Override the binary (tests point this at a stub script)
    pub fn with_binary(kind: ProviderKind, binary: impl Into<String>) -> Self {
        Self {
            kind,
            binary: binary.into(),
        }
    }

    fn build_args(&self, call: &ToolCall) -> Option<Vec<String>> {
        let p = |key: &str| {
            call.params
                .get(key)
                .and_then(Value::as_str)
                .map(String::from)
        };

        let args: Vec<String> = match (self.kind, call.operation.as_str()) {
            (ProviderKind::Gcp, "list_projects") => {
                vec!["projects".into(), "list".into(), "--format=json".into()]
            }
            (ProviderKind::Gcp, "list_instances") => vec![
                "compute".into(),
                "instances".into(),
                "list".into(),
                format!("--project={}", p("project")?),
                "--format=json".into(),
            ],
            (ProviderKind::Gcp, "delete_instance") => vec![
                "compute".into(),
                "instances".into(),
                "delete".into(),
                p("name")?,
                format!("--project={}", p("project")?),
                format!("--zone={}", p("zone")?),
                "--quiet".into(),
            ],
            (ProviderKind::Aws, "list_buckets") => vec![
                "s3api".into(),
                "list-buckets".into(),
                "--output".into(),
                "json".into(),
            ],
            (ProviderKind::Aws, "list_instances") => vec![
                "ec2".into(),
                "describe-instances".into(),
                "--output".into(),
                "json".into(),
            ],
            (ProviderKind::Aws, "delete_bucket") => vec![
                "s3api".into(),
                "delete-bucket".into(),
                "--bucket".into(),
                p("name")?,
            ],
            (ProviderKind::Azure, "list_groups") => {
                vec!["group".into(), "list".into(), "--output".into(), "json".into()]
            }
            (ProviderKind::Azure, "list_vms") => vec![
                "vm".into(),
                "list".into(),
                "--resource-group".into(),
                p("group")?,
                "--output".into(),
                "json".into(),
            ],
            (ProviderKind::Azure, "delete_group") => vec![
                "group".into(),
                "delete".into(),
                "--name".into(),
                p("group")?,
                "--yes".into(),
            ],
            (ProviderKind::Docker, "list_containers") => vec![
                "ps".into(),
                "-a".into(),
                "--format".into(),
                "{{json .}}".into(),
            ],
            (ProviderKind::Docker, "list_images") => vec![
                "images".into(),
                "--format".into(),
                "{{json .}}".into(),
            ],
            (ProviderKind::Docker, "remove_container") => {
                vec!["rm".into(), p("name")?]
            }
            _ => return None,
        };
        Some(args)
    }
}

#[async_trait]
impl ProviderHandler for CliProviderHandler {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn operations(&self) -> &'static [OperationSpec] {
        match self.kind {
            ProviderKind::Gcp => GCP_OPERATIONS,
            ProviderKind::Aws => AWS_OPERATIONS,
            ProviderKind::Azure => AZURE_OPERATIONS,
            ProviderKind::Docker => DOCKER_OPERATIONS,
        }
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let Some(args) = self.build_args(call) else {
            return ToolOutcome::Failure {
                kind: DispatchErrorKind::Validation,
                message: format!(
                    "{} has no operation '{}' or a required parameter is missing",
                    self.kind, call.operation
                ),
            };
        };

        debug!("Running {} {}", self.binary, args.join(" "));

        let result = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutcome::Failure {
                    kind: DispatchErrorKind::Validation,
                    message: format!("{} CLI not installed", self.binary),
                };
            }
            Err(e) => {
                return ToolOutcome::Failure {
                    kind: DispatchErrorKind::Internal,
                    message: e.to_string(),
                };
            }
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let payload = serde_json::from_str(&stdout)
                .unwrap_or_else(|_| Value::String(stdout.trim().to_string()));
            ToolOutcome::Success { payload }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            ToolOutcome::Failure {
                kind: classify_cli_failure(&stderr),
                message: stderr.trim().to_string(),
            }
        }
    }
}

/// Map provider CLI stderr to a machine-readable failure kind
fn classify_cli_failure(stderr: &str) -> DispatchErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("permission")
        || lower.contains("denied")
        || lower.contains("unauthorized")
        || lower.contains("unauthenticated")
        || lower.contains("forbidden")
        || lower.contains("credential")
    {
        DispatchErrorKind::Authorization
    } else if lower.contains("rate limit") || lower.contains("quota") || lower.contains("429") {
        DispatchErrorKind::RateLimited
    } else if lower.contains("could not resolve")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("unreachable")
    {
        DispatchErrorKind::Network
    } else if lower.contains("invalid") || lower.contains("usage:") || lower.contains("unknown flag")
    {
        DispatchErrorKind::Validation
    } else {
        DispatchErrorKind::Internal
    }
}

/// Default handler set, one per supported provider
pub fn default_handlers() -> Vec<std::sync::Arc<dyn ProviderHandler>> {
    vec![
        std::sync::Arc::new(CliProviderHandler::new(ProviderKind::Gcp)),
        std::sync::Arc::new(CliProviderHandler::new(ProviderKind::Aws)),
        std::sync::Arc::new(CliProviderHandler::new(ProviderKind::Azure)),
        std::sync::Arc::new(CliProviderHandler::new(ProviderKind::Docker)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(
        provider: ProviderKind,
        operation: &str,
        params: &[(&str, &str)],
        idempotent: bool,
    ) -> ToolCall {
        ToolCall {
            provider,
            operation: operation.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect(),
            idempotent,
        }
    }

    #[test]
    fn test_operation_tables_mark_destructive_ops_non_idempotent() {
        for handler in [
            CliProviderHandler::new(ProviderKind::Gcp),
            CliProviderHandler::new(ProviderKind::Aws),
            CliProviderHandler::new(ProviderKind::Azure),
            CliProviderHandler::new(ProviderKind::Docker),
        ] {
            for op in handler.operations() {
                let destructive = op.name.starts_with("delete") || op.name.starts_with("remove");
                assert_eq!(
                    op.idempotent, !destructive,
                    "{} {} idempotency is wrong",
                    handler.kind(),
                    op.name
                );
            }
        }
    }

    #[test]
    fn test_build_args_substitutes_params() {
        let handler = CliProviderHandler::new(ProviderKind::Gcp);
        let args = handler
            .build_args(&call(
                ProviderKind::Gcp,
                "list_instances",
                &[("project", "acme-prod")],
                true,
            ))
            .unwrap();
        assert!(args.contains(&"--project=acme-prod".to_string()));
    }

    #[test]
    fn test_build_args_missing_param_is_none() {
        let handler = CliProviderHandler::new(ProviderKind::Gcp);
        assert!(handler
            .build_args(&call(ProviderKind::Gcp, "list_instances", &[], true))
            .is_none());
    }

    #[test]
    fn test_build_args_unknown_operation_is_none() {
        let handler = CliProviderHandler::new(ProviderKind::Docker);
        assert!(handler
            .build_args(&call(ProviderKind::Docker, "format_disk", &[], false))
            .is_none());
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            classify_cli_failure("ERROR: Permission denied on project"),
            DispatchErrorKind::Authorization
        );
        assert_eq!(
            classify_cli_failure("Quota exceeded for requests"),
            DispatchErrorKind::RateLimited
        );
        assert_eq!(
            classify_cli_failure("could not resolve host oauth2.googleapis.com"),
            DispatchErrorKind::Network
        );
        assert_eq!(
            classify_cli_failure("Invalid value for --zone"),
            DispatchErrorKind::Validation
        );
        assert_eq!(
            classify_cli_failure("backend exploded"),
            DispatchErrorKind::Internal
        );
    }

    #[tokio::test]
    async fn test_execute_reports_missing_binary_as_validation() {
        let handler =
            CliProviderHandler::with_binary(ProviderKind::Gcp, "nonexistent-binary-xyz");
        let outcome = handler
            .execute(&call(ProviderKind::Gcp, "list_projects", &[], true))
            .await;
        match outcome {
            ToolOutcome::Failure { kind, message } => {
                assert_eq!(kind, DispatchErrorKind::Validation);
                assert!(message.contains("not installed"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
