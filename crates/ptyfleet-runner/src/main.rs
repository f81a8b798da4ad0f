//! ptyfleet
//!
//! Fans a list of instruction files out to parallel agent workers, each in
//! its own pseudo-terminal, and monitors their status channels until every
//! worker reports completion or the operator aborts.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use tracing::{error, info, warn};

use ptyfleet_core::config::load_config;
use ptyfleet_core::tracing_init::{default_filter, init_tracing};
use ptyfleet_core::{Config, WorkspaceLayout};
use ptyfleet_runner::{
    ConsoleRenderer, Dispatcher, LaunchSettings, Launcher, Monitor, MonitorExit, PtyBackend,
    Terminator, WorkerRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "ptyfleet")]
#[command(version, about = "Run agent workers in parallel pseudo-terminals")]
struct Args {
    /// Instruction files, one worker per file
    instructions: Vec<PathBuf>,

    /// Working directory for workers, logs/ and comm/ (defaults to the current directory)
    #[arg(long, env = "PTYFLEET_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Milliseconds between successive worker launches
    #[arg(long)]
    stagger_ms: Option<u64>,

    /// Milliseconds between monitor ticks
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Agent program launched for every worker
    #[arg(long)]
    agent_bin: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PTYFLEET_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ms) = self.stagger_ms {
            config.runner.stagger_delay_ms = ms;
        }
        if let Some(ms) = self.interval_ms {
            config.runner.monitor_interval_ms = ms;
        }
        if let Some(bin) = &self.agent_bin {
            config.agent.program.clone_from(bin);
        }
        if let Some(level) = &self.log_level {
            config.runner.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.instructions.is_empty() {
        let err = Args::command().error(
            clap::error::ErrorKind::MissingRequiredArgument,
            "at least one instruction file is required\n\n\
             Usage: ptyfleet <worker1_instructions.md> [worker2_instructions.md] ...",
        );
        let _ = err.print();
        return ExitCode::FAILURE;
    }

    let (work_dir, config) = match prepare(&args) {
        Ok(prepared) => prepared,
        Err(e) => {
            // Config did not load, so fall back to the CLI or default level.
            let level = args.log_level.as_deref().unwrap_or("info");
            init_tracing(&default_filter(level), args.log_json);
            error!(error = %e, "ptyfleet failed to start");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&default_filter(&config.runner.log_level), args.log_json);

    match run(args, work_dir, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "ptyfleet failed");
            ExitCode::FAILURE
        }
    }
}

/// Resolve the working directory and load the layered configuration.
///
/// The working directory is made absolute because workers run inside it
/// and are handed paths that must not depend on the orchestrator's cwd.
fn prepare(args: &Args) -> anyhow::Result<(PathBuf, Config)> {
    let work_dir = match &args.work_dir {
        Some(dir) => std::path::absolute(dir)?,
        None => std::env::current_dir()?,
    };
    let mut config = load_config(Some(&work_dir))?;
    args.apply_overrides(&mut config);
    Ok((work_dir, config))
}

/// SIGINT and SIGTERM listeners, registered as soon as they are created.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next shutdown signal and return its name.
    async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run(args: Args, work_dir: PathBuf, config: Config) -> anyhow::Result<ExitCode> {
    // Installed before any worker exists so a signal can never bypass the
    // terminator.
    let mut signals = ShutdownSignals::install()?;

    let layout = WorkspaceLayout::new(&work_dir);
    layout.ensure_dirs()?;

    let max_workers = args.instructions.len();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        work_dir = %work_dir.display(),
        instructions = ?args.instructions,
        agent = %config.agent.program,
        "Starting parallel agent execution"
    );

    let registry = WorkerRegistry::new();
    let terminator = Terminator::new(registry.clone());
    let (dispatch, dispatcher) = Dispatcher::new(layout.clone(), registry.clone());
    let dispatcher_handle = tokio::spawn(dispatcher.run());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let launcher = Launcher::new(
        layout.clone(),
        LaunchSettings::from_config(&config, max_workers),
        Arc::new(PtyBackend::new()),
        registry.clone(),
        dispatch,
    )
    .with_shutdown(shutdown_rx.clone());
    let grace = Duration::from_secs(config.runner.shutdown_grace_secs);

    // The launch runs to its own end; a signal only stops further launches.
    let (launched, signalled) = {
        let launch = launcher.start_all_workers(&args.instructions);
        tokio::pin!(launch);
        let mut signalled = false;
        loop {
            tokio::select! {
                result = &mut launch => break (result, signalled),
                signal = signals.recv(), if !signalled => {
                    info!(signal, "Received shutdown signal during launch");
                    signalled = true;
                    let _ = shutdown_tx.send(true);
                }
            }
        }
    };
    drop(launcher);

    let report = match launched {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Failed to launch workers");
            terminator.terminate().await;
            drain_dispatcher(dispatcher_handle, grace).await;
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(
        launched = report.launched.len(),
        skipped = report.skipped.len(),
        interrupted = report.interrupted,
        "All launches issued"
    );
    if signalled || report.interrupted {
        return Ok(shut_down(&terminator, dispatcher_handle, grace).await);
    }

    let monitor = Monitor::new(
        registry.clone(),
        layout,
        max_workers,
        Duration::from_millis(config.runner.monitor_interval_ms),
        terminator.clone(),
        ConsoleRenderer::stdout(),
    );
    let mut monitor_handle = tokio::spawn(monitor.run(shutdown_rx));

    // Notify systemd that monitoring is live (no-op outside systemd).
    #[cfg(unix)]
    {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            warn!(error = %e, "Failed to notify systemd");
        }
    }

    tokio::select! {
        exit = &mut monitor_handle => {
            match exit {
                Ok(MonitorExit::AllCompleted { completion, .. }) => {
                    info!(completed = completion.completed, "All workers completed");
                }
                Ok(MonitorExit::Shutdown) => {}
                Err(e) => error!(error = %e, "Monitor task failed"),
            }
        }
        signal = signals.recv() => {
            info!(signal, "Received shutdown signal");
            let _ = shutdown_tx.send(true);
            if let Err(e) = monitor_handle.await {
                warn!(error = %e, "Monitor task failed during shutdown");
            }
        }
    }

    // Already a no-op when the monitor terminated everything itself.
    Ok(shut_down(&terminator, dispatcher_handle, grace).await)
}

async fn shut_down(
    terminator: &Terminator,
    dispatcher: tokio::task::JoinHandle<()>,
    grace: Duration,
) -> ExitCode {
    terminator.terminate().await;
    drain_dispatcher(dispatcher, grace).await;
    info!("ptyfleet stopped");
    ExitCode::SUCCESS
}

/// Give pending exit reactions a chance to clean up pid records.
async fn drain_dispatcher(handle: tokio::task::JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Event dispatcher failed"),
        Err(_) => warn!(
            grace_secs = grace.as_secs(),
            "Timed out waiting for workers to exit"
        ),
    }
}
