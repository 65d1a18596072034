use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info, warn};
use tokio::net::TcpListener;

mod api;
mod config;
mod container;
mod environments;
mod executor;
mod session;
mod store;
mod tasks;

use crate::api::AppState;
use crate::config::Settings;
use crate::container::{ContainerRuntime, ContainerRuntimeApi};
use crate::environments::EnvironmentRegistry;
use crate::executor::{ExecutorConfig, SandboxExecutor};
use crate::session::SessionService;
use crate::store::{RedisStore, SessionStore};
use crate::tasks::{TaskRuntime, TaskWorker};

/// How often the reaper reconciles sessions and sweeps orphan containers.
const REAP_INTERVAL: Duration = Duration::from_secs(300);

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let settings = Settings::load().context("loading configuration")?;

    match cli.command {
        Command::Serve(cmd) => run_serve(settings, cmd),
        Command::Environments => handle_environments(&settings),
        Command::Config {
            command: ConfigCommand::Show,
        } => handle_config_show(&settings),
    }
}

#[tokio::main]
async fn run_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    handle_serve(settings, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Code Executor - sandboxed code execution service.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// List the configured execution environments
    Environments,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the bind host
    #[arg(long)]
    host: Option<String>,
    /// Override the bind port
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective settings
    Show,
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    if common.quiet {
        log::set_max_level(LevelFilter::Off);
        return;
    }

    let level = effective_log_level(common);
    let level_name = match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "code_executor={level_name},tower_http={level_name}"
        ))
    });

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug {
        LevelFilter::Debug
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn load_registry(settings: &Settings) -> Result<Arc<EnvironmentRegistry>> {
    let path = settings.environments_file_path().context(
        "environments catalog not found; set ENVIRONMENTS_FILE or place \
         config/environments.yaml next to the binary",
    )?;
    let registry = EnvironmentRegistry::load(&path)
        .with_context(|| format!("loading environment catalog from {}", path.display()))?;
    Ok(Arc::new(registry))
}

async fn handle_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    info!("Starting code executor server...");

    let registry = load_registry(&settings)?;
    let enabled = registry.list();
    info!("Available environments: {}", enabled.join(", "));
    if enabled.is_empty() {
        warn!("No enabled environments in the catalog; all submissions will be rejected");
    }

    let store: Arc<dyn SessionStore> = Arc::new(
        RedisStore::connect(
            &settings.redis_url(),
            Duration::from_secs(settings.session_ttl),
        )
        .await
        .with_context(|| format!("connecting to state store at {}", settings.redis_url()))?,
    );
    info!("Connected to state store at {}", settings.redis_url());

    let runtime: Arc<dyn ContainerRuntimeApi> = match settings.container_runtime {
        Some(ref binary) => Arc::new(ContainerRuntime::with_binary(binary.as_str())),
        None => Arc::new(ContainerRuntime::new()),
    };

    let defaults = registry.defaults().clone();
    let executor = Arc::new(SandboxExecutor::new(
        runtime,
        registry.clone(),
        ExecutorConfig {
            image_prefix: settings.image_prefix.clone(),
            workspace_dir: defaults.workspace_dir,
            executor_user: defaults.executor_user,
            memory_limit: settings.container_memory_limit.clone(),
            cpu_limit: settings.container_cpu_limit,
            pids_limit: settings.container_pids_limit,
            execution_timeout: settings.execution_timeout,
            network_disabled: settings.network_disabled,
            read_only: settings.read_only,
            no_new_privileges: settings.no_new_privileges,
            tmpfs_size: settings.tmpfs_size.clone(),
        },
    ));

    let worker = TaskWorker::new(store.clone(), executor);
    let task_runtime = TaskRuntime::start(
        worker,
        settings.worker_concurrency,
        settings.task_soft_limit(),
        settings.task_hard_limit(),
    );
    // First tick fires immediately, cleaning up orphans from prior runs
    let _reaper = task_runtime.spawn_reaper(REAP_INTERVAL);

    let service = SessionService::new(
        store,
        registry,
        task_runtime,
        settings.execution_timeout(),
    );

    let app = api::create_router(AppState::new(service));

    let host = cmd.host.unwrap_or_else(|| settings.api_host.clone());
    let port = cmd.port.unwrap_or(settings.api_port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid bind address")?;

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

fn handle_environments(settings: &Settings) -> Result<()> {
    let registry = load_registry(settings)?;

    for name in registry.list() {
        if let Some(env) = registry.get(&name) {
            println!(
                "{:<12} {:<8} {}",
                env.name, env.file_extension, env.description
            );
        }
    }
    Ok(())
}

fn handle_config_show(settings: &Settings) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(settings).context("serializing settings to JSON")?;
    println!("{rendered}");
    Ok(())
}
