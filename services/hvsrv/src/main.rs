//! High-voltage test-system service (`hvsrv`)
//!
//! `run` keeps the recorder, CSV export, retention and meter readers alive
//! and, when configured, drives the HAPS06 poller and a stabilization
//! session. The other subcommands are one-shot maintenance tools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use common::logging::{self, LogConfig};
use errors::{VoltageError, VoltageErrorTrait, VoltageResult};
use hvsrv::config::{HvsrvConfig, DEFAULT_CONFIG_PATH, ENV_PREFIX};
use hvsrv::meter::MeterFeed;
use hvsrv::modbus::Haps06Driver;
use hvsrv::poller::VoltagePoller;
use hvsrv::port::serial::{SerialOpener, SerialSettings};
use hvsrv::port::PortTarget;
use hvsrv::recorder::csv_export::CsvExportHandle;
use hvsrv::recorder::AcquisitionRecorder;
use hvsrv::retention::{self, RetentionManager};
use hvsrv::session;
use hvsrv::stabilization::StabilizationController;

/// High-voltage test-system service
#[derive(Parser)]
#[command(name = "hvsrv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service until Ctrl+C / SIGTERM (default)
    Run,

    /// Print database statistics as JSON
    DbStats,

    /// Run one retention pass and print the report
    Cleanup,

    /// Connect to a HAPS06 and print its slave address
    Probe {
        /// Serial port, defaults to serial.port from the config
        #[arg(short, long)]
        port: Option<String>,

        /// Line speed, defaults to serial.baud from the config
        #[arg(short, long)]
        baud: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> VoltageResult<()> {
    let cli = Cli::parse();

    let config: HvsrvConfig = common::config_loader::load_config(Some(&cli.config), ENV_PREFIX)?;
    init_logging(&config)?;
    config.validate()?;

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::DbStats => db_stats(&config).await,
        Commands::Cleanup => cleanup(&config).await,
        Commands::Probe { port, baud } => probe(&config, port, baud).await,
    };
    if let Err(e) = &result {
        report_failure(e);
    }
    result
}

fn report_failure(e: &VoltageError) {
    let code = e.error_code();
    let category = e.category();
    let level = e.log_level();
    if level == Level::ERROR {
        error!(code, ?category, "{}", e);
    } else if level == Level::INFO {
        info!(code, ?category, "{}", e);
    } else {
        warn!(code, ?category, retryable = e.is_retryable(), "{}", e);
    }
}

fn init_logging(config: &HvsrvConfig) -> VoltageResult<()> {
    let level = config
        .logging
        .level
        .parse::<tracing::Level>()
        .map_err(|e| VoltageError::Configuration(format!("logging.level: {e}")))?;
    let log_config = LogConfig {
        service_name: "hvsrv".to_string(),
        log_dir: logging::resolve_log_dir(config.logging.dir.as_deref()),
        level,
        enable_json: config.logging.json,
        ..LogConfig::default()
    };
    logging::init_with_config(log_config)
        .map_err(|e| VoltageError::StartupFailed(format!("Failed to initialize logging: {e}")))?;
    logging::enable_sighup_log_reopen();
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> VoltageResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| VoltageError::Serialization(e.to_string()))?;
    println!("{text}");
    Ok(())
}

async fn db_stats(config: &HvsrvConfig) -> VoltageResult<()> {
    let stats = retention::db_stats(&config.recorder.path).await?;
    print_json(&stats)
}

async fn cleanup(config: &HvsrvConfig) -> VoltageResult<()> {
    // A separate process cannot see another process's recording flag
    let manager = RetentionManager::new(
        config.recorder.path.clone(),
        config.retention.to_policy(),
        Default::default(),
    );
    let report = manager.cleanup().await?;
    print_json(&report)
}

async fn probe(config: &HvsrvConfig, port: Option<String>, baud: Option<u32>) -> VoltageResult<()> {
    let target = PortTarget::new(
        port.unwrap_or_else(|| config.serial.port.clone()),
        baud.unwrap_or(config.serial.baud),
    );
    let driver = Haps06Driver::new(SerialOpener::new(config.serial.settings()), config.driver.to_settings());
    let addr = driver.connect(target.clone()).await?;
    driver.disconnect().await;

    print_json(&serde_json::json!({
        "port": target.port,
        "baud": target.baud,
        "slave_addr": addr,
    }))
}

async fn run(config: HvsrvConfig) -> VoltageResult<()> {
    info!("hvsrv starting");

    // Recording pipeline
    let recorder = Arc::new(AcquisitionRecorder::open(config.recorder.to_settings()).await?);
    let csv = config
        .csv
        .path
        .clone()
        .map(|base| Arc::new(CsvExportHandle::spawn(config.csv.to_settings(base))));

    // Retention
    let cancel = CancellationToken::new();
    let retention_task = if config.retention.interval_secs > 0 {
        let manager = Arc::new(RetentionManager::new(
            config.recorder.path.clone(),
            config.retention.to_policy(),
            recorder.activity(),
        ));
        Some(manager.spawn_periodic(Duration::from_secs(config.retention.interval_secs), cancel.clone()))
    } else {
        None
    };

    // Meters, 8N1 at each meter's own speed
    let meters = MeterFeed::new();
    let readers = session::spawn_meter_readers(
        Arc::new(SerialOpener::new(SerialSettings::default())),
        &config.meters,
        &meters,
    );

    // Source, poller and stabilization session
    let mut driver = None;
    let mut poller = None;
    let mut controller = None;
    let mut tasks = Vec::new();
    if config.serial.connect_on_start {
        let d = Arc::new(Haps06Driver::new(
            SerialOpener::new(config.serial.settings()),
            config.driver.to_settings(),
        ));
        match d.connect(config.serial.target()).await {
            Ok(addr) => {
                info!("HAPS06 connected at address {}", addr);
                let p = VoltagePoller::spawn(d.clone(), Duration::from_millis(config.poller.interval_ms));
                let params = serde_json::to_value(&config.stabilization)
                    .map_err(|e| VoltageError::Serialization(e.to_string()))?;
                recorder.start_run(&params).await?;
                tasks.push(session::spawn_forwarder(
                    p.subscribe(),
                    meters.clone(),
                    config.stabilization.meter_max_age(),
                    recorder.clone(),
                    csv.clone(),
                    cancel.clone(),
                ));
                poller = Some(p);

                if config.session.stabilize_on_start {
                    let c = StabilizationController::new(
                        d.clone(),
                        meters.clone(),
                        config.stabilization.clone(),
                    );
                    tasks.push(session::spawn_session_log(
                        c.subscribe(),
                        recorder.clone(),
                        csv.clone(),
                    ));
                    match c.start().await {
                        Ok(()) => controller = Some(c),
                        Err(e) => error!("Stabilization did not start: {}", e),
                    }
                }
                driver = Some(d);
            },
            Err(e) => error!("HAPS06 connect failed, continuing without source: {}", e),
        }
    }

    info!("hvsrv running");
    common::shutdown::shutdown_on_signal(cancel.clone()).await;

    // Reverse order; the session zeroes the output before the driver goes.
    // Dropping the controller closes its event channel and ends the log task.
    if let Some(c) = controller {
        c.stop().await;
    }
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
    if let Some(p) = poller {
        p.stop().await;
    }
    if let Some(d) = driver {
        d.disconnect().await;
    }
    for reader in readers {
        reader.stop().await;
    }
    if let Some(task) = retention_task {
        if tokio::time::timeout(Duration::from_secs(30), task).await.is_err() {
            warn!("Retention task did not stop in time");
        }
    }
    if let Some(csv) = csv {
        if let Err(e) = csv.stop().await {
            error!("CSV export stop failed: {}", e);
        }
    }
    recorder.stop().await?;

    info!("hvsrv stopped");
    Ok(())
}
