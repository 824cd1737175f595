//! Print the bars stored in a chart journal as JSON lines

use anyhow::{Context, Result};
use chart_service::Timeframe;
use chart_service::storage::journal::read_journal;
use chart_service::wire::BarMessage;
use clap::Parser;
use services_common::Symbol;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Chart journal inspector
#[derive(Parser)]
#[clap(name = "journal_dump")]
#[clap(about = "Dump bars from a chart journal directory")]
struct Cli {
    /// Journal directory
    dir: PathBuf,

    /// Only bars for this symbol
    #[clap(long)]
    symbol: Option<String>,

    /// Only bars for this timeframe
    #[clap(long, value_parser = parse_timeframe)]
    timeframe: Option<Timeframe>,
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, String> {
    raw.parse().map_err(|e: chart_service::ChartError| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let symbol = cli
        .symbol
        .as_deref()
        .map(Symbol::new)
        .transpose()
        .context("invalid --symbol")?;

    let mut bars = read_journal(&cli.dir)
        .with_context(|| format!("reading journal {}", cli.dir.display()))?;
    bars.sort_by(|a, b| a.key.cmp(&b.key));

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut count = 0_usize;
    for bar in bars
        .iter()
        .filter(|bar| symbol.as_ref().is_none_or(|s| &bar.key.symbol == s))
        .filter(|bar| cli.timeframe.is_none_or(|tf| bar.key.timeframe == tf))
    {
        serde_json::to_writer(&mut out, &BarMessage::from(bar))?;
        out.write_all(b"\n")?;
        count += 1;
    }
    out.flush()?;
    eprintln!("{count} bars");
    Ok(())
}
