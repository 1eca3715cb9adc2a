use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use blockmind_kernel::{AgentCoreBuilder, CoreConfig};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "blockmindd")]
#[command(about = "Replay raw game events through the blockmind core")]
struct Cli {
    /// TOML config file. Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON-lines file of raw events, `-` for stdin.
    #[arg(long, default_value = "-")]
    events: String,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    log_json: bool,
    /// Override the configured tick interval.
    #[arg(long)]
    tick_ms: Option<u64>,
    /// Pause between replayed events.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<CoreConfig> {
    let mut config = match &cli.config {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let mut config = CoreConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(tick_ms) = cli.tick_ms {
        config.tick_interval_ms = tick_ms;
    }
    Ok(config)
}

async fn open_events(source: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if source == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("opening event file {source}"))?;
    Ok(Box::new(BufReader::new(file)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let config = load_config(&cli)?;
    let core = AgentCoreBuilder::from_config(config)
        .build()
        .context("building agent core")?;
    info!(mode = %core.current_mode().name, "core ready");

    let mut changes = core.subscribe_changes();
    let change_task = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(record) => info!(
                    from = %record.from,
                    to = %record.to,
                    reason = %record.reason,
                    triggered_by = %record.triggered_by,
                    interrupt = record.interrupt_raised,
                    "mode changed"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "mode change log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let ticker = core.spawn_ticker();

    let mut lines = open_events(&cli.events).await?.lines();
    let (mut ingested, mut skipped, mut line_no) = (0u64, 0u64, 0u64);
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(raw) => {
                let report = core.ingest(&raw).await;
                ingested += 1;
                if !report.is_clean() {
                    warn!(
                        line = line_no,
                        tag = %report.tag,
                        failed = report.listeners_failed,
                        "listeners failed"
                    );
                }
            }
            Err(error) => {
                warn!(line = line_no, %error, "skipping invalid JSON line");
                skipped += 1;
            }
        }
        if cli.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(cli.delay_ms)).await;
        }
    }

    core.tick().await;
    tokio::task::yield_now().await;
    ticker.abort();
    change_task.abort();

    info!(
        ingested,
        skipped,
        mode = %core.current_mode().name,
        "replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&core.diagnostics())?);
    Ok(())
}
