//! Nimbus - Terminal Cloud Assistant
//!
//! This is the main entry point: a thin CLI surface over the core. The
//! default command is the interactive loop; `remember`, `recall`, `forget`,
//! `history`, and `complete` expose the memory and history layers directly.

use clap::{Parser, Subcommand};
use nimbus_core::{
    backend::OfflineBackend,
    config::NimbusConfig,
    error::Result,
    AgentBackend, ContextRetriever, Embedder, HashedEmbedder, HistoryIndex, HistorySearch,
    HttpBackend, InputClassifier, MemoryCategory, MemoryEntry, MemoryStore, Orchestrator,
    RemoteEmbedder, RetryPolicy, SearchOutcome, SessionState, ShellExecutor, SqliteMemoryStore,
    ToolDispatcher,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nimbus", version, about = "Terminal cloud assistant with persistent memory")]
struct Cli {
    /// Path to nimbus.toml (defaults to ./nimbus.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(long, global = true, env = "NIMBUS_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Store a fact in preference memory
    Remember {
        /// The fact to store
        text: Vec<String>,
    },
    /// Search memory semantically
    Recall {
        /// Query text
        query: Vec<String>,

        /// Maximum results
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete every entry in a memory category
    Forget {
        /// conversation | preference | resource_state
        #[arg(long, default_value = "conversation")]
        category: String,
    },
    /// Show or search raw input history
    History {
        /// Optional fuzzy pattern; reverse-walks matches newest first
        pattern: Vec<String>,
    },
    /// Suggest completions for a partial input
    Complete {
        /// Partial command or input prefix
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nimbus=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = nimbus_core::load_config(cli.config.as_deref())?;
    if let Some(db_path) = cli.db_path {
        config.storage.db_path = Some(db_path);
    }

    match cli.command {
        None => interactive(config).await?,
        Some(Command::Remember { text }) => remember(config, &text.join(" ")).await?,
        Some(Command::Recall { query, limit }) => recall(config, &query.join(" "), limit).await?,
        Some(Command::Forget { category }) => forget(config, &category).await?,
        Some(Command::History { pattern }) => history(config, &pattern.join(" "))?,
        Some(Command::Complete { prefix }) => complete(config, &prefix)?,
    }

    Ok(())
}

/// Open the store and pick the configured embedder
async fn open_memory(
    config: &NimbusConfig,
) -> Result<(Arc<SqliteMemoryStore>, Arc<dyn Embedder>)> {
    let store = Arc::new(
        SqliteMemoryStore::open(
            config.storage.resolved_db_path(),
            config.storage.capacity_per_category,
        )
        .await?,
    );

    let embedder: Arc<dyn Embedder> = if config.embedding.provider == "remote" {
        match RemoteEmbedder::from_config(&config.embedding) {
            Ok(remote) => Arc::new(remote),
            Err(e) => {
                warn!("Remote embedder unavailable, using offline embedder: {}", e);
                Arc::new(HashedEmbedder::new(config.embedding.dimensions))
            }
        }
    } else {
        Arc::new(HashedEmbedder::new(config.embedding.dimensions))
    };

    Ok((store, embedder))
}

fn build_retriever(
    config: &NimbusConfig,
    store: Arc<SqliteMemoryStore>,
    embedder: Arc<dyn Embedder>,
) -> ContextRetriever {
    ContextRetriever::new(
        store,
        embedder,
        Duration::from_millis(config.embedding.timeout_ms),
    )
}

/// The interactive request/response loop
async fn interactive(config: NimbusConfig) -> Result<()> {
    let (store, embedder) = open_memory(&config).await?;
    let retriever = build_retriever(&config, store.clone(), embedder.clone());

    let mut dispatcher = ToolDispatcher::new(
        RetryPolicy::new(
            config.dispatch.max_attempts,
            Duration::from_millis(config.dispatch.base_delay_ms),
            Duration::from_millis(config.dispatch.max_delay_ms),
        ),
        Duration::from_millis(config.dispatch.timeout_ms),
    );
    for handler in nimbus_core::providers::default_handlers() {
        dispatcher.register(handler);
    }

    let backend: Arc<dyn AgentBackend> = match HttpBackend::from_config(&config.backend) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            warn!("Agent route disabled: {}", e);
            Arc::new(OfflineBackend)
        }
    };

    let mut orchestrator = Orchestrator::new(
        SessionState::new(),
        InputClassifier::new(),
        store.clone(),
        retriever,
        dispatcher,
        backend,
        embedder,
        ShellExecutor::new(Duration::from_secs(config.shell.timeout_secs)),
        config.retrieval.top_k,
        Duration::from_millis(config.backend.timeout_ms),
        Duration::from_millis(config.embedding.timeout_ms),
    );

    let history_path = config.history.resolved_file(&config.storage);
    let mut history = HistoryIndex::load(&history_path, config.history.max_entries)?;

    println!("nimbus {} (type 'exit' to quit)", env!("CARGO_PKG_VERSION"));

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("|>| {} ", orchestrator.session().cwd().display());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break; // EOF
        };
        if line.trim().is_empty() {
            continue;
        }

        history.append(&line)?;

        let cancel = CancellationToken::new();
        let turn = orchestrator.run_turn(&line, &cancel);
        tokio::pin!(turn);

        let report = loop {
            tokio::select! {
                report = &mut turn => break report,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                }
            }
        };

        if !report.display.is_empty() {
            println!("{}", report.display);
        }

        match report.control {
            Some(nimbus_core::ControlAction::Exit) => break,
            Some(nimbus_core::ControlAction::ClearScreen) => {
                print!("\x1b[2J\x1b[H");
                std::io::stdout().flush()?;
            }
            None => {}
        }
    }

    Ok(())
}

async fn remember(config: NimbusConfig, text: &str) -> Result<()> {
    if text.is_empty() {
        println!("nothing to remember");
        return Ok(());
    }

    let (store, embedder) = open_memory(&config).await?;

    let mut entry = MemoryEntry::new(text, MemoryCategory::Preference);
    entry.embedding = Some(embedder.embed(text).await?);
    entry.embedding_model = embedder.model_name().to_string();

    let id = store.put(entry).await?;
    println!("stored {}", id);
    Ok(())
}

async fn recall(config: NimbusConfig, query: &str, limit: usize) -> Result<()> {
    let (store, embedder) = open_memory(&config).await?;
    let retriever = build_retriever(&config, store, embedder);

    let results = retriever.retrieve(query, limit).await?;
    if results.is_empty() {
        println!("no matching memories");
        return Ok(());
    }

    for result in results {
        println!(
            "[{:.3}] ({}) {}",
            result.score, result.entry.category, result.entry.content
        );
    }
    Ok(())
}

async fn forget(config: NimbusConfig, category: &str) -> Result<()> {
    let Some(category) = MemoryCategory::from_str(category) else {
        println!("unknown category; expected conversation, preference, or resource_state");
        return Ok(());
    };

    let (store, _) = open_memory(&config).await?;
    let removed = store.clear(category).await?;
    println!("removed {} entries from {}", removed, category);
    Ok(())
}

fn history(config: NimbusConfig, pattern: &str) -> Result<()> {
    let history_path = config.history.resolved_file(&config.storage);
    let index = HistoryIndex::load(&history_path, config.history.max_entries)?;

    if pattern.is_empty() {
        for entry in index.entries().iter().rev().take(20) {
            println!("{}", entry);
        }
        return Ok(());
    }

    let mut search = HistorySearch::new();
    search.set_pattern(pattern);
    loop {
        match search.step(&index) {
            SearchOutcome::Match { index: i, entry } => println!("{:>5}  {}", i, entry),
            SearchOutcome::NoMatch => break,
        }
    }
    Ok(())
}

/// Prefix suggestions over history entries and known commands
fn complete(config: NimbusConfig, prefix: &str) -> Result<()> {
    let history_path = config.history.resolved_file(&config.storage);
    let index = HistoryIndex::load(&history_path, config.history.max_entries)?;

    for suggestion in index.complete(prefix) {
        println!("{}", suggestion);
    }
    for command in InputClassifier::new().command_suggestions(prefix) {
        println!("{}", command);
    }
    Ok(())
}
