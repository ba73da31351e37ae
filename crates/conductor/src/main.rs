use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File};
use log::{debug, info};
use tokio::net::TcpListener;

use conductor::bootstrap::App;
use conductor::config::CoordinatorConfig;
use conductor::db::Database;

/// Config problem (bad flags, unreadable file, inconsistent settings).
const EX_CONFIG: i32 = 64;
/// Store problem (cannot open or migrate the database).
const EX_STORE: i32 = 70;

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let code = match cli.command {
        Command::Serve(cmd) => serve_main(&cli.common, cmd),
        Command::Config => print_config(&cli.common),
    };

    if code != 0 {
        std::process::exit(code);
    }
}

#[tokio::main]
async fn serve_main(common: &CommonOpts, cmd: ServeCommand) -> i32 {
    let config = match load_config(common, &cmd) {
        Ok(config) => config,
        Err(err) => {
            let _ = writeln!(io::stderr(), "configuration error: {err:#}");
            return EX_CONFIG;
        }
    };

    let db = match Database::new(&config.store_path()).await {
        Ok(db) => db,
        Err(err) => {
            let _ = writeln!(io::stderr(), "store error: {err:#}");
            return EX_STORE;
        }
    };

    match serve(db, config).await {
        Ok(()) => 0,
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            1
        }
    }
}

async fn serve(db: Database, config: CoordinatorConfig) -> Result<()> {
    let listen = config.listen;
    let mut app = App::build(&db, config).await?;
    let router = app.router();
    let _background = app.spawn_background_tasks();

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!("Conductor listening on {}", listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

fn print_config(common: &CommonOpts) -> i32 {
    let config = match load_config(common, &ServeCommand::default()) {
        Ok(config) => config,
        Err(err) => {
            let _ = writeln!(io::stderr(), "configuration error: {err:#}");
            return EX_CONFIG;
        }
    };

    match toml::to_string_pretty(&config) {
        Ok(rendered) => {
            print!("{}", rendered);
            0
        }
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err}");
            1
        }
    }
}

/// Layer configuration: defaults < file < CONDUCTOR_* env < CLI flags.
fn load_config(common: &CommonOpts, cmd: &ServeCommand) -> Result<CoordinatorConfig> {
    let mut builder = Config::builder().add_source(
        Config::try_from(&CoordinatorConfig::default()).context("encoding default config")?,
    );

    if let Some(path) = &common.config {
        builder = builder.add_source(File::from(path.clone()));
    }
    builder = builder.add_source(Environment::with_prefix("CONDUCTOR"));

    let mut config: CoordinatorConfig = builder
        .build()
        .context("building configuration")?
        .try_deserialize()
        .context("parsing configuration")?;

    if let Some(data_dir) = &cmd.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(listen) = cmd.listen {
        config.listen = listen;
    }
    if cmd.auth_enabled {
        config.auth_enabled = true;
    }
    if let Some(url) = &cmd.auth_verifier_url {
        config.auth_verifier_url = Some(url.clone());
    }
    if let Some(seconds) = cmd.heartbeat_stale_seconds {
        config.heartbeat_stale_seconds = seconds;
    }
    if let Some(seconds) = cmd.heartbeat_remove_seconds {
        config.heartbeat_remove_seconds = seconds;
    }
    if let Some(seconds) = cmd.dispatch_timeout_seconds {
        config.dispatch_timeout_seconds = seconds;
    }

    if config.heartbeat_remove_seconds <= config.heartbeat_stale_seconds {
        anyhow::bail!(
            "heartbeat-remove-seconds ({}) must exceed heartbeat-stale-seconds ({})",
            config.heartbeat_remove_seconds,
            config.heartbeat_stale_seconds
        );
    }
    if config.auth_enabled && config.auth_verifier_url.is_none() {
        anyhow::bail!("--auth-enabled requires an auth verifier URL");
    }

    debug!("resolved configuration: {:?}", config);
    Ok(config)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Conductor - agent orchestration coordinator.",
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
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
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
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the coordinator server.
    Serve(ServeCommand),
    /// Print the resolved configuration and exit.
    Config,
}

#[derive(Debug, Clone, Default, Args)]
struct ServeCommand {
    /// Directory for the store file and config tree
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// HTTP listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,
    /// Require bearer tokens on every request
    #[arg(long)]
    auth_enabled: bool,
    /// External verifier URL for bearer tokens
    #[arg(long, value_name = "URL")]
    auth_verifier_url: Option<String>,
    /// Seconds without a heartbeat before a runner is marked stale
    #[arg(long, value_name = "SECONDS")]
    heartbeat_stale_seconds: Option<u64>,
    /// Seconds without a heartbeat before a runner is removed
    #[arg(long, value_name = "SECONDS")]
    heartbeat_remove_seconds: Option<u64>,
    /// Seconds a pending run may wait for an eligible runner
    #[arg(long, value_name = "SECONDS")]
    dispatch_timeout_seconds: Option<u64>,
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::EnvFilter;

    let level = if common.quiet {
        "error"
    } else if common.trace {
        "trace"
    } else if common.debug || common.verbose >= 2 {
        "debug"
    } else if common.verbose == 1 {
        "info"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("conductor={level},tower_http=warn")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
