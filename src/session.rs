//! Per-process session state
//!
//! An explicitly owned context object handed to the orchestrator each turn,
//! rather than ambient global state, so concurrent-session tests need no
//! shared fixtures. Only the orchestrator's thread of control mutates it.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::types::ProviderKind;

/// Mutable context for one interactive session
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Stable identifier used in turn references
    session_id: String,

    /// Working directory; mutated only by a successful `cd`
    cwd: PathBuf,

    /// Active cloud provider, set by explicit user selection or an
    /// agent-confirmed context switch
    active_provider: Option<ProviderKind>,

    /// Active project/account identifier within the provider
    active_project: Option<String>,

    /// Completed turns this session; incremented once per persisted turn
    turn_counter: u64,

    started_at: DateTime<Utc>,
}

impl SessionState {
    /// Create a session rooted at the process working directory
    pub fn new() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self::with_cwd(cwd)
    }

    /// Create a session rooted at an explicit directory (tests, subshells)
    pub fn with_cwd(cwd: PathBuf) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            cwd,
            active_provider: None,
            active_project: None,
            turn_counter: 0,
            started_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Apply a directory change; called by the orchestrator after the shell
    /// boundary reports a successful `cd`
    pub fn set_cwd(&mut self, dir: PathBuf) {
        self.cwd = dir;
    }

    pub fn active_provider(&self) -> Option<ProviderKind> {
        self.active_provider
    }

    pub fn active_project(&self) -> Option<&str> {
        self.active_project.as_deref()
    }

    /// Record an explicit provider/project selection
    pub fn set_active_context(&mut self, provider: ProviderKind, project: Option<String>) {
        self.active_provider = Some(provider);
        self.active_project = project;
    }

    pub fn turn_counter(&self) -> u64 {
        self.turn_counter
    }

    /// Bump the counter after a turn has been persisted
    pub fn record_completed_turn(&mut self) {
        self.turn_counter += 1;
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// One-line context string injected into agent prompts
    pub fn describe(&self) -> String {
        let provider = self
            .active_provider
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string());
        let project = self.active_project.as_deref().unwrap_or("none");
        format!(
            "cwd={} provider={} project={}",
            self.cwd.display(),
            provider,
            project
        )
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
