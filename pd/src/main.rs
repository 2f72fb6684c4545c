//! promptd - persistent prompt queue and multi-agent scheduler
//!
//! CLI entry point for submitting prompts and running the scheduler.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use promptd::agent::create_agent;
use promptd::cli::{Cli, Command, OutputFormat, generate_after_help, get_log_path};
use promptd::config::Config;
use promptd::domain::{Collaboration, CoordinationMode, EntryDraft, EntryState, PromptEntry, RoutingStrategy, now_ms};
use promptd::events::{EventBus, create_event_bus, spawn_event_logger};
use promptd::pool::AgentPool;
use promptd::router::Router;
use promptd::scheduler::Scheduler;
use promptd::state::StateManager;

fn parse_level(level: &str) -> tracing::Level {
    match level.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        _ => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", level);
            tracing::Level::INFO
        }
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = cli_log_level
        .or(config_log_level)
        .map(parse_level)
        .unwrap_or(tracing::Level::INFO);

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Build command with dynamic after_help that shows agent tool checks
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    if let Err(e) = setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }
    config.validate().context("Invalid configuration")?;

    let store_path = cli.store.clone().unwrap_or_else(|| config.storage.path.clone());
    info!(store = %store_path.display(), "promptd starting");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Submit {
            content,
            priority,
            working_dir,
            context_files,
            max_retries,
            capability,
            strategy,
            tokens,
            group,
            agents,
            group_size,
        } => {
            let content = if content == "-" { read_stdin()? } else { content };
            let mut draft = EntryDraft::new(content).with_context_files(context_files);
            draft.priority = priority;
            draft.working_directory = working_dir;
            draft.max_retries = max_retries;
            draft.estimated_tokens = tokens;
            draft.required_capability = capability;
            draft.strategy = strategy;
            draft.collaboration = collaboration(group, agents, group_size);
            cmd_submit(&config, &store_path, draft).await
        }
        Command::List { state, format } => cmd_list(&config, &store_path, state, format).await,
        Command::Show { id, format } => cmd_show(&config, &store_path, &id, format).await,
        Command::Cancel { id } => cmd_cancel(&config, &store_path, &id).await,
        Command::Stats { format } => cmd_stats(&config, &store_path, format).await,
        Command::Agents { check } => cmd_agents(&config, check).await,
        Command::Run => cmd_run(&config, &store_path).await,
    }
}

fn read_stdin() -> Result<String> {
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .context("Failed to read prompt from stdin")?;
    Ok(content)
}

fn collaboration(group: Option<CoordinationMode>, agents: Vec<String>, group_size: usize) -> Option<Collaboration> {
    match (group, agents.is_empty()) {
        (None, true) => None,
        (mode, false) => Some(Collaboration::with_agents(mode.unwrap_or_default(), agents)),
        (Some(mode), true) => Some(Collaboration::with_size(mode, group_size)),
    }
}

/// Entry Store handle plus the event logger that mirrors it to disk
struct Session {
    state: StateManager,
    event_bus: Arc<EventBus>,
    logger: JoinHandle<()>,
}

impl Session {
    fn open(config: &Config, store_path: &Path) -> Result<Self> {
        debug!(store = %store_path.display(), "Session::open: called");
        let event_bus = create_event_bus();
        let logger = spawn_event_logger(&event_bus, store_path.join("events.jsonl"));
        let state = StateManager::spawn(store_path, config.queue.defaults(), event_bus.clone())
            .context(format!("Failed to open store at {}", store_path.display()))?;
        Ok(Self {
            state,
            event_bus,
            logger,
        })
    }

    /// Stop the store and let the logger drain the remaining events
    async fn close(self) {
        let Self {
            state,
            event_bus,
            logger,
        } = self;
        if let Err(e) = state.shutdown().await {
            warn!(error = %e, "Session::close: store shutdown failed");
        }
        drop(state);
        drop(event_bus);
        if tokio::time::timeout(Duration::from_secs(2), logger).await.is_err() {
            warn!("Session::close: event logger did not finish in time");
        }
    }
}

fn colored_state(state: EntryState) -> colored::ColoredString {
    let label = state.to_string();
    match state {
        EntryState::Queued => label.cyan(),
        EntryState::Executing => label.blue().bold(),
        EntryState::RateLimited => label.yellow(),
        EntryState::Completed => label.green(),
        EntryState::Failed => label.red(),
        EntryState::Cancelled => label.dimmed(),
    }
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// Queue a prompt
async fn cmd_submit(config: &Config, store_path: &Path, draft: EntryDraft) -> Result<()> {
    debug!(priority = ?draft.priority, "cmd_submit: called");
    let session = Session::open(config, store_path)?;
    let result = session.state.submit(draft).await;
    session.close().await;

    let id = result.context("Submit rejected")?;
    println!("{} {}", "Queued".green(), id);
    Ok(())
}

/// List entries in submission order
async fn cmd_list(config: &Config, store_path: &Path, state: Option<EntryState>, format: OutputFormat) -> Result<()> {
    debug!(?state, %format, "cmd_list: called");
    let session = Session::open(config, store_path)?;
    let result = session.state.list(state).await;
    session.close().await;
    let entries = result.context("Failed to list entries")?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!(
            "No entries found{}",
            state.map(|s| format!(" in state '{}'", s)).unwrap_or_default()
        );
        return Ok(());
    }

    println!("{:<40} {:<14} {:>5} {:>7}  {}", "ID", "STATE", "PRI", "RETRIES", "UPDATED");
    println!("{}", "-".repeat(90));
    for entry in entries {
        println!(
            "{:<40} {:<14} {:>5} {:>7}  {}",
            truncate(&entry.id, 40),
            colored_state(entry.state),
            entry.priority,
            format!("{}/{}", entry.retry_count, entry.max_retries),
            format_time(entry.updated_at)
        );
    }
    Ok(())
}

fn print_entry(entry: &PromptEntry) {
    println!("{}  {}", entry.id.bold(), colored_state(entry.state));
    println!("  priority:      {}", entry.priority);
    println!("  retries:       {}/{}", entry.retry_count, entry.max_retries);
    println!("  working dir:   {}", entry.working_directory);
    if !entry.context_files.is_empty() {
        println!("  context files: {}", entry.context_files.join(", "));
    }
    if let Some(capability) = &entry.required_capability {
        println!("  capability:    {}", capability);
    }
    if let Some(strategy) = entry.strategy {
        println!("  strategy:      {}", strategy);
    }
    if let Some(collaboration) = &entry.collaboration {
        println!(
            "  group:         {} [{}]",
            collaboration.mode,
            if collaboration.agents.is_empty() {
                format!("{} router-selected", collaboration.size)
            } else {
                collaboration.agents.join(", ")
            }
        );
    }
    println!("  created:       {}", format_time(entry.created_at));
    println!("  updated:       {}", format_time(entry.updated_at));
    if entry.state == EntryState::Queued && entry.eligible_at > now_ms() {
        println!("  eligible at:   {}", format_time(entry.eligible_at));
    }
    if let Some(resume_at) = entry.resume_at {
        println!("  resume at:     {}", format_time(resume_at));
    }
    if entry.rate_limit_cycles > 0 {
        println!("  rate limited:  {} times", entry.rate_limit_cycles);
    }
    if let Some(agent) = &entry.assigned_agent_id {
        println!("  agent:         {}", agent);
    }
    if let Some(error) = &entry.last_error {
        println!("  last error:    {} ({})", error.message.red(), error.kind);
    }
    println!();
    println!("{}", entry.content);
    if let Some(result) = &entry.result {
        println!();
        println!("{}", "Result:".bold());
        println!("{}", result);
    }
}

/// Show one entry
async fn cmd_show(config: &Config, store_path: &Path, reference: &str, format: OutputFormat) -> Result<()> {
    debug!(%reference, %format, "cmd_show: called");
    let session = Session::open(config, store_path)?;
    let result = match session.state.resolve_id(reference).await {
        Ok(id) => session.state.get_required(&id).await,
        Err(e) => Err(e),
    };
    session.close().await;
    let entry = result.context(format!("Failed to show '{}'", reference))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
        OutputFormat::Text => print_entry(&entry),
    }
    Ok(())
}

/// Cancel a queued or rate-limited entry
async fn cmd_cancel(config: &Config, store_path: &Path, reference: &str) -> Result<()> {
    debug!(%reference, "cmd_cancel: called");
    let session = Session::open(config, store_path)?;
    let result = match session.state.resolve_id(reference).await {
        Ok(id) => session.state.cancel(&id).await,
        Err(e) => Err(e),
    };
    session.close().await;

    let entry = result.context(format!("Cannot cancel '{}'", reference))?;
    println!("{} {}", "Cancelled".yellow(), entry.id);
    Ok(())
}

/// Show per-state counts and throttled backends
async fn cmd_stats(config: &Config, store_path: &Path, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_stats: called");
    let session = Session::open(config, store_path)?;
    let stats = session.state.stats().await;
    let windows = session.state.list_rate_limits().await;
    session.close().await;
    let stats = stats.context("Failed to read queue stats")?;
    let now = now_ms();
    let throttled: Vec<_> = windows
        .context("Failed to read rate-limit windows")?
        .into_iter()
        .filter(|w| !w.is_open(now))
        .collect();

    if format == OutputFormat::Json {
        let value = serde_json::json!({ "queue": stats, "throttled": throttled });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for state in EntryState::ALL {
        println!("{:<14} {}", colored_state(state), stats.get(state));
    }
    println!("{:<14} {}", "total", stats.total);
    println!("{:<14} {}", "processed", stats.total_processed);
    if !throttled.is_empty() {
        println!();
        println!("{}", "Throttled backends:".yellow());
        for window in throttled {
            println!("  {:<20} until {}", window.backend_id, format_time(window.resume_at));
        }
    }
    Ok(())
}

/// List configured agents
async fn cmd_agents(config: &Config, check: bool) -> Result<()> {
    debug!(check, "cmd_agents: called");
    if config.agents.is_empty() {
        println!("No agents configured. Add an `agents:` list to promptd.yml.");
        return Ok(());
    }

    println!("{:<20} {:<14} {:<12} {:>4} {:>8}  {}", "ID", "KIND", "BACKEND", "MAX", "COST", "CAPABILITIES");
    println!("{}", "-".repeat(90));
    for agent_config in &config.agents {
        let status = match create_agent(agent_config, config.router.default_rate_limit()) {
            Ok(agent) if check => {
                if agent.health_check().await {
                    "reachable".green()
                } else {
                    "unreachable".red()
                }
            }
            Ok(_) => "".normal(),
            Err(e) => format!("invalid: {}", e).as_str().red(),
        };
        println!(
            "{:<20} {:<14} {:<12} {:>4} {:>8.4}  {} {}",
            agent_config.id,
            agent_config.kind.to_string(),
            agent_config.backend_id(),
            agent_config.max_concurrency,
            agent_config.cost_per_call,
            agent_config.capabilities.join(","),
            status
        );
    }
    Ok(())
}

/// Run the scheduler in the foreground until Ctrl-C
async fn cmd_run(config: &Config, store_path: &Path) -> Result<()> {
    debug!(store = %store_path.display(), "cmd_run: called");
    let session = Session::open(config, store_path)?;

    let pool = Arc::new(AgentPool::new(config.pool.unreachable_after).with_event_bus(session.event_bus.clone()));
    for agent_config in &config.agents {
        match create_agent(agent_config, config.router.default_rate_limit()) {
            Ok(agent) => {
                info!(id = %agent_config.id, kind = %agent_config.kind, "Registered agent");
                pool.register_agent(agent);
            }
            Err(e) => {
                warn!(id = %agent_config.id, error = %e, "Skipping agent");
                eprintln!("{} agent '{}': {}", "Skipping".yellow(), agent_config.id, e);
            }
        }
    }
    if pool.is_empty() {
        println!("{}", "No agents registered; entries will stay queued.".yellow());
    }

    let strategy: RoutingStrategy = config.router.strategy;
    let router = Router::new(pool.clone(), strategy);
    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        session.state.clone(),
        router,
        config.backoff.policy(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));
    println!(
        "promptd scheduler running with {} agent(s) on {}. Press Ctrl-C to stop.",
        pool.len(),
        store_path.display()
    );

    let joined = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            println!("Shutting down, waiting for in-flight prompts...");
            let _ = shutdown_tx.send(true);
            (&mut handle).await
        }
        joined = &mut handle => joined,
    };

    let stats = scheduler.stats().await;
    drop(scheduler);
    drop(pool);
    session.close().await;

    joined.context("Scheduler task panicked")??;
    println!("{} {}", "Stopped.".green(), stats);
    Ok(())
}
