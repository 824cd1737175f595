//! Chart Service - candlestick aggregation from a JSON-lines tick feed
//!
//! Reads ticks (`{"symbol","timestamp_msec","price","volume"}` per line)
//! from a file or stdin, aggregates them, and streams the finalized bars
//! of the requested symbols to stdout as JSON lines.

use anyhow::{Context, Result};
use chart_service::wire::{BarMessage, parse_tick_line};
use chart_service::{
    ChartConfig, ChartError, ChartService, ShutdownMode, StoreBackend, SubscriberSession, Tick,
    Timeframe,
};
use clap::Parser;
use services_common::init_tracing;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "chart-service";

/// Candlestick aggregation and streaming service
#[derive(Parser)]
#[clap(name = "chart-service")]
#[clap(about = "Aggregate trade ticks into OHLC bars and stream them")]
struct Cli {
    /// TOML configuration file; CHART__* environment variables override it
    #[clap(long)]
    config: Option<PathBuf>,

    /// Tick source: a JSON-lines file, or `-` for stdin
    #[clap(long, default_value = "-")]
    ticks: String,

    /// Symbols to stream, comma separated
    #[clap(long, value_delimiter = ',', required = true)]
    symbols: Vec<String>,

    /// Timeframe to stream (1m, 5m, 15m, 30m, 1h, 4h, 1d)
    #[clap(long, default_value = "1m", value_parser = parse_timeframe)]
    timeframe: Timeframe,

    /// Persist bars to a journal in this directory instead of memory
    #[clap(long)]
    journal_dir: Option<PathBuf>,

    /// Print Prometheus metrics to stderr on exit
    #[clap(long)]
    metrics: bool,
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, String> {
    raw.parse().map_err(|e: ChartError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(SERVICE_NAME)?;

    let mut config = ChartConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = cli.journal_dir {
        config.persistence.backend = StoreBackend::Journal;
        config.persistence.journal_dir = Some(dir);
    }
    if !config.engine.timeframes.contains(&cli.timeframe) {
        config.engine.timeframes.push(cli.timeframe);
    }

    let service = ChartService::start(config)
        .await
        .context("starting chart service")?;
    let session = service
        .subscribe(&cli.symbols, cli.timeframe)
        .context("subscribing")?;
    let writer = tokio::spawn(write_bars(session));

    let ticks = tick_stream(&cli.ticks)
        .await
        .with_context(|| format!("opening tick source {}", cli.ticks))?;
    let router = service.tick_router();

    let mode = tokio::select! {
        result = router.run(ticks) => {
            let summary = result.context("ingesting ticks")?;
            info!(ticks = summary.ticks, rejected = summary.rejected, "Tick source exhausted");
            ShutdownMode::FlushOpen
        }
        () = shutdown_signal() => ShutdownMode::Discard,
    };

    let summary = service.shutdown(mode).await.context("shutting down")?;
    let written = writer.await.context("bar writer task")??;
    info!(
        written,
        published = summary.pipeline.published,
        duplicates = summary.pipeline.duplicates,
        failed = summary.pipeline.failed,
        "Chart service shutdown complete"
    );

    if cli.metrics {
        eprint!("{}", service.metrics_text()?);
    }
    Ok(())
}

/// Parsed ticks from a JSON-lines source; malformed lines are logged and skipped
async fn tick_stream(source: &str) -> Result<impl Stream<Item = Tick>> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = if source == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(tokio::fs::File::open(source).await?)
    };

    let lines = LinesStream::new(BufReader::new(reader).lines());
    Ok(lines.filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => match parse_tick_line(&line) {
            Ok(tick) => Some(tick),
            Err(e) => {
                warn!(error = %e, "Skipping tick line");
                None
            }
        },
        Err(e) => {
            error!(error = %e, "Failed to read tick source");
            None
        }
    }))
}

/// Write every streamed bar to stdout; returns the number written
async fn write_bars(session: SubscriberSession) -> Result<u64> {
    let mut stdout = tokio::io::stdout();
    let mut written = 0;
    loop {
        match session.recv().await {
            Ok(item) => {
                let mut line = serde_json::to_string(&BarMessage::from(&item))?;
                line.push('\n');
                stdout.write_all(line.as_bytes()).await?;
                written += 1;
            }
            Err(end) => {
                if let Some(err @ ChartError::SubscriberOverrun { .. }) = end.into_error() {
                    warn!(error = %err, "Output could not keep up, stream closed");
                }
                break;
            }
        }
    }
    stdout.flush().await?;
    Ok(written)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
