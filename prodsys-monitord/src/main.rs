//! prodsys-monitord — the monitoring daemon for prodsys grid requests.
//!
//! Periodically submits newly approved requests to the grid, polls the
//! backend for sub-job statuses, drives reschedules, and keeps the service
//! heartbeat records fresh for dashboards.

use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, builder::styling};
use dotenvy::dotenv;
use log::info;

use prodsys::config::ProdsysConfig;
use prodsys::grid::create_grid_interface;
use prodsys::store::Store;
use prodsys::template::ScriptTemplate;

mod daemon;
mod logging;

use daemon::MonitoringDaemon;

const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::Green.on_default().bold())
    .usage(styling::AnsiColor::Green.on_default().bold())
    .literal(styling::AnsiColor::Cyan.on_default().bold())
    .placeholder(styling::AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "prodsys-monitord")]
#[command(about = "Monitoring daemon for prodsys grid requests", long_about = None)]
#[command(styles = STYLES)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Path to the SQLite database file. If not specified, uses the config
    /// file or the DATABASE_URL environment variable
    #[arg(short, long)]
    database: Option<String>,

    /// Minutes between monitoring cycles
    #[arg(short, long, env = "PRODSYS_INTERVAL_MINS")]
    interval_mins: Option<f64>,

    /// Base URL of the grid gateway
    #[arg(long, env = "PRODSYS_GRID_URL")]
    grid_url: Option<String>,

    /// Directory for log files (enables file logging with daily rotation)
    #[arg(long, env = "PRODSYS_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Use JSON format for log files (useful for log aggregation systems)
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Run as daemon (Unix/Linux only)
    #[arg(long, default_value_t = false)]
    daemon: bool,

    /// PID file location (Unix only, used when running as daemon)
    #[arg(long, default_value = "/var/run/prodsys-monitord.pid")]
    pid_file: PathBuf,
}

/// Daemonize the process (Unix only)
#[cfg(unix)]
fn daemonize_process(pid_file: &std::path::Path) -> Result<()> {
    use daemonize::Daemonize;

    let daemonize = Daemonize::new()
        .pid_file(pid_file)
        .working_directory(env::current_dir()?)
        .umask(0o027);

    daemonize
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to daemonize: {}", e))?;

    Ok(())
}

#[cfg(not(unix))]
fn daemonize_process(_pid_file: &std::path::Path) -> Result<()> {
    anyhow::bail!("Daemon mode is only supported on Unix/Linux systems");
}

fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();

    // Load configuration from files and merge with CLI arguments.
    // CLI arguments take precedence over file config.
    let mut config = match ProdsysConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading configuration: {}", err);
            std::process::exit(1);
        }
    };
    if args.log_level != "info" {
        config.monitoring.log_level = args.log_level.clone();
    }
    if let Some(database) = args.database {
        config.monitoring.database = Some(database);
    }
    if let Some(interval_mins) = args.interval_mins {
        config.monitoring.interval_mins = interval_mins;
    }
    if let Some(grid_url) = args.grid_url {
        config.grid.url = grid_url;
    }
    if args.log_dir.is_some() {
        config.monitoring.logging.log_dir = args.log_dir.clone();
    }
    if args.json_logs {
        config.monitoring.logging.json_logs = true;
    }

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    // Handle daemonization BEFORE initializing logging; daemonization forks
    // the process.
    if args.daemon {
        daemonize_process(&args.pid_file)?;
    }

    logging::init_logging(
        config.monitoring.logging.log_dir.as_deref(),
        &config.monitoring.log_level,
        config.monitoring.logging.json_logs,
    )?;

    // Use database path from config/CLI if provided, otherwise fall back to
    // the DATABASE_URL environment variable.
    let database_url = match &config.monitoring.database {
        Some(path) => format!("sqlite:{}", path),
        None => env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set or --database must be provided"),
    };

    // Reconciliation is serial by design — one request at a time — so a
    // single-threaded runtime is all the loop needs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        info!(
            "Starting prodsys-monitord version={}",
            env!("CARGO_PKG_VERSION")
        );

        let store = Store::connect(&database_url).await?;
        info!("Connected to database: {}", database_url);
        info!("Database configured with WAL journal mode and foreign key constraints");

        let grid = create_grid_interface(&config.grid)?;
        info!("Grid gateway: {}", config.grid.url);

        let template = ScriptTemplate::new(&config.parametricjobs);
        let daemon = MonitoringDaemon::new(
            store,
            grid,
            template,
            config.monitoring.clone(),
            config.parametricjobs.reschedules,
        );
        daemon.run().await
    })
}
