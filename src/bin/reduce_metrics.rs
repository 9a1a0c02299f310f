use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use ctc_sdkd::{logging_outputs_can_be_summed, reduce_metrics, LoggingRecord};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reduce-metrics")]
#[command(about = "Sum per-step criterion logging records and report corpus-level metrics")]
struct Args {
    /// JSON-lines files with one logging record per line, one file per worker shard.
    #[arg(required = true)]
    shards: Vec<PathBuf>,
    /// Write the reduced metrics here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        tracing::error!(%err, "reduce-metrics failed");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = Args::parse();

    let mut shard_totals = Vec::with_capacity(args.shards.len());
    for path in &args.shards {
        let records = read_records(path)?;
        tracing::info!(shard = %path.display(), records = records.len(), "shard loaded");
        if logging_outputs_can_be_summed() {
            shard_totals.push(records.iter().sum::<LoggingRecord>());
        } else {
            shard_totals.extend(records);
        }
    }

    let reduced = reduce_metrics(&shard_totals);
    let json = if args.pretty {
        serde_json::to_string_pretty(&reduced)
    } else {
        serde_json::to_string(&reduced)
    }
    .map_err(|e| format!("serialize metrics: {e}"))?;

    match args.out {
        Some(out) => fs::write(&out, format!("{json}\n"))
            .map_err(|e| format!("write {}: {e}", out.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<LoggingRecord>, String> {
    let data = fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<LoggingRecord>(line)
                .map_err(|e| format!("{}:{}: {e}", path.display(), i + 1))
        })
        .collect()
}
