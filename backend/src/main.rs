// 纯 Rust 轮询后端 (可独立运行)
// Entry point: scheduled polling jobs, plus a one-shot probe for commissioning

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use poller_backend::config::{AppConfig, OutputConfig};
use poller_backend::devices::DeviceReader;
use poller_backend::drivers::{CsvSink, FieldConnection, MemorySink, ModbusClient, ModbusTcpConnector, RowSink};
use poller_backend::guard::TickGuard;
use poller_backend::orchestrator::ReadingOrchestrator;
use poller_backend::poll_core::PollController;
use poller_backend::trigger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Field-bus poller for generator power, voltage and tank levels
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured job on its schedule until interrupted
    Run {
        /// Path to the JSON configuration file
        #[clap(long, default_value = "poller.json")]
        config: PathBuf,

        /// Keep rows in memory instead of writing them out
        #[clap(long)]
        dry_run: bool,
    },
    /// Read holding registers from one device once and print them
    Probe {
        #[clap(long)]
        host: String,

        #[clap(long, default_value = "502")]
        port: u16,

        #[clap(long, default_value = "1")]
        unit: u8,

        /// Zero-based register address; repeat for several
        #[clap(long = "address", required = true)]
        addresses: Vec<u16>,

        /// Registers to read at each address
        #[clap(long, default_value = "1")]
        count: u16,

        #[clap(long, default_value = "5000")]
        connect_timeout_ms: u64,

        #[clap(long, default_value = "3000")]
        read_timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    match Cli::parse().command {
        Command::Run { config, dry_run } => run(config, dry_run).await,
        Command::Probe {
            host,
            port,
            unit,
            addresses,
            count,
            connect_timeout_ms,
            read_timeout_ms,
        } => {
            probe(
                &host,
                port,
                unit,
                &addresses,
                count,
                Duration::from_millis(connect_timeout_ms),
                Duration::from_millis(read_timeout_ms),
            )
            .await
        }
    }
}

async fn run(config_path: PathBuf, dry_run: bool) -> Result<()> {
    let config = AppConfig::from_file(&config_path)?;
    let offset = config.utc_offset()?;
    let plans = config.plans()?;
    if plans.is_empty() {
        bail!("No jobs configured in {}", config_path.display());
    }

    let sink: Arc<dyn RowSink> = match (&config.output, dry_run) {
        (_, true) | (OutputConfig::Memory, _) => {
            warn!("Dry run: rows are kept in memory only");
            Arc::new(MemorySink::new())
        }
        (OutputConfig::Csv { dir }, false) => {
            info!("Writing rows to {}", dir.display());
            Arc::new(CsvSink::new(dir.clone(), offset))
        }
    };
    let reader = DeviceReader::new(Arc::new(ModbusTcpConnector));

    let mut handles = Vec::with_capacity(plans.len());
    for plan in plans {
        info!(
            "Scheduling job '{}' -> {} every {:?} ({} registers)",
            plan.job.name,
            plan.job.table,
            plan.schedule.period(),
            plan.job.specs.len()
        );
        let orchestrator = ReadingOrchestrator::new(reader.clone(), plan.schedule.period())
            .with_overrun_ratio(plan.overrun_ratio);
        let controller = PollController::new(plan.job, orchestrator, TickGuard::new(), sink.clone());
        handles.push(tokio::spawn(trigger::run(
            controller,
            plan.schedule,
            plan.run_immediately,
        )));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn probe(
    host: &str,
    port: u16,
    unit: u8,
    addresses: &[u16],
    count: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<()> {
    info!("Connecting to {}:{} (unit {})", host, port, unit);
    let mut client = match timeout(connect_timeout, ModbusClient::connect(host, port, unit)).await {
        Ok(Ok(client)) => client,
        Ok(Err(e)) => bail!("Cannot connect to {}:{}: {}", host, port, e),
        Err(_) => bail!("Connecting to {}:{} timed out after {:?}", host, port, connect_timeout),
    };

    for &address in addresses {
        match timeout(read_timeout, client.read_holding_registers(address, count)).await {
            Ok(Ok(words)) => println!("{}: {:?}", address, words),
            Ok(Err(e)) => error!("Read at {} failed: {}", address, e),
            Err(_) => error!("Read at {} timed out after {:?}", address, read_timeout),
        }
    }

    if let Err(e) = client.close().await {
        warn!("Closing connection to {} failed: {}", client.peer(), e);
    } else {
        info!("Connection closed");
    }
    Ok(())
}
