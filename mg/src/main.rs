//! Morgana - event monitor for multi-agent task runs
//!
//! CLI entry point for the monitor daemon and its viewers.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use morgana::cli::{Cli, Command};
use morgana::config::Config;
use morgana::consumer::EventConsumer;
use morgana::events::{EventBus, EventFileWriter};
use morgana::ipc::{MonitorReceiver, MonitorServer};
use morgana::render;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("morgana")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("morgana.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Cancel `ctx` on Ctrl-C
fn cancel_on_ctrl_c(ctx: &CancellationToken) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cancel_on_ctrl_c: failed to listen for Ctrl-C");
            return;
        }
        info!("Ctrl-C received, shutting down");
        ctx.cancel();
    });
}

fn print_events(bus: &EventBus) {
    bus.subscribe_all(|event| println!("{}", render::line(event)));
}

async fn close_bus(bus: &EventBus) {
    if let Err(e) = bus.close().await {
        warn!(error = %e, "close_bus: bus already closed");
    }
}

async fn cmd_monitor(config: &Config, socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(|| config.monitor.socket_path());
    debug!(?socket_path, "cmd_monitor: called");

    let bus = Arc::new(EventBus::new(config.bus.clone()));
    print_events(&bus);

    let server = MonitorServer::new(&socket_path, bus.clone(), config.monitor.history_capacity);
    let ctx = CancellationToken::new();
    cancel_on_ctrl_c(&ctx);

    println!("Monitoring on {}", socket_path.display());
    let result = server.run(ctx).await;
    close_bus(&bus).await;
    result
}

async fn cmd_watch(config: &Config, socket: Option<PathBuf>, record: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(|| config.monitor.socket_path());
    debug!(?socket_path, ?record, "cmd_watch: called");

    let bus = Arc::new(EventBus::new(config.bus.clone()));
    print_events(&bus);
    if let Some(path) = record {
        let writer = Arc::new(EventFileWriter::open(&path)?);
        writer.attach(&bus);
        println!("Recording to {}", path.display());
    }

    let receiver = MonitorReceiver::connect(&socket_path, bus.clone())
        .await
        .context(format!("Is `mg monitor` running on {}?", socket_path.display()))?;

    let ctx = CancellationToken::new();
    cancel_on_ctrl_c(&ctx);
    tokio::select! {
        _ = ctx.cancelled() => receiver.disconnect().await,
        _ = receiver.closed() => println!("Monitor closed the connection"),
    }

    info!(received = receiver.received_count(), "cmd_watch: done");
    close_bus(&bus).await;
    Ok(())
}

async fn cmd_tail(config: &Config, file: Option<PathBuf>) -> Result<()> {
    let mut consumer_config = config.consumer.clone();
    if let Some(file) = file {
        consumer_config.event_file = file;
    }
    debug!(event_file = ?consumer_config.event_file, "cmd_tail: called");

    let bus = Arc::new(EventBus::new(config.bus.clone()));
    print_events(&bus);

    let consumer = EventConsumer::new(consumer_config, bus.clone());
    let ctx = CancellationToken::new();
    cancel_on_ctrl_c(&ctx);

    consumer.start(&ctx)?;
    println!("Tailing {}", consumer.event_file().display());
    ctx.cancelled().await;
    consumer.stop().await;

    let stats = consumer.stats();
    info!(?stats, "cmd_tail: done");
    close_bus(&bus).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log level from config file first, before the full load
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Monitor { socket } => cmd_monitor(&config, socket).await,
        Command::Watch { socket, record } => cmd_watch(&config, socket, record).await,
        Command::Tail { file } => cmd_tail(&config, file).await,
    }
}
