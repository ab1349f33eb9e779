//! ccbackfill - Backfill Prometheus with historical Claude Code usage

mod cli;

use anyhow::{bail, Context, Result};
use ccbackfill_core::{
    Backfill, BackfillConfig, BackfillOptions, PrometheusStore, RunPhase, SnapshotFormat,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ccbackfill",
    version,
    about = "Backfill Prometheus with historical Claude Code usage metrics",
    long_about = "Reads Claude Code JSONL session logs, derives the cumulative counters the\n\
                  live telemetry exporter would have produced, and bulk-loads them into a\n\
                  Prometheus TSDB.\n\
                  \n\
                  Examples:\n\
                    ccbackfill --dry-run                          # Print snapshot to stdout\n\
                    ccbackfill --dry-run -o usage.prom            # Write snapshot only\n\
                    ccbackfill --tsdb-dir /var/lib/prometheus     # Load into the TSDB\n\
                    ccbackfill --source ~/.claude/projects \\\n\
                               --source /mnt/backup/.claude/projects \\\n\
                               --before 2025-06-01 --tsdb-dir ./data\n\
                  \n\
                  Environment Variables:\n\
                    CCBACKFILL_CONFIG                # Config file path\n\
                    CCBACKFILL_TSDB_DIR              # Prometheus data directory\n\
                    CCBACKFILL_PROMETHEUS_URL        # Reload endpoint base URL\n\
                    RUST_LOG                         # Log filter (overrides --verbose)"
)]
struct Cli {
    /// JSONL source directory, repeatable (default: ~/.claude/projects)
    #[arg(long = "source", short = 's', value_name = "DIR")]
    sources: Vec<PathBuf>,

    /// Snapshot file path (dry run default: stdout)
    #[arg(long, short = 'o', env = "CCBACKFILL_OUTPUT")]
    output: Option<PathBuf>,

    /// Write the snapshot without touching the store
    #[arg(long)]
    dry_run: bool,

    /// Snapshot flavour: prometheus or openmetrics
    #[arg(long, env = "CCBACKFILL_FORMAT")]
    format: Option<SnapshotFormat>,

    /// Only include events strictly before this date (YYYY-MM-DD, UTC)
    #[arg(long, value_parser = cli::parse_before)]
    before: Option<DateTime<Utc>>,

    /// Prometheus data directory to create blocks in
    #[arg(long, env = "CCBACKFILL_TSDB_DIR")]
    tsdb_dir: Option<PathBuf>,

    /// Prometheus base URL for the post-load reload
    #[arg(long, env = "CCBACKFILL_PROMETHEUS_URL")]
    prometheus_url: Option<String>,

    /// Reload request timeout in seconds
    #[arg(long, env = "CCBACKFILL_RELOAD_TIMEOUT")]
    reload_timeout: Option<u64>,

    /// Config file (default: <config dir>/ccbackfill/config.toml)
    #[arg(long, env = "CCBACKFILL_CONFIG")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable ANSI colors in the summary
    #[arg(long, env = "CCBACKFILL_NO_COLOR")]
    no_color: bool,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "ccbackfill=info,ccbackfill_core=info",
        1 => "ccbackfill=debug,ccbackfill_core=debug",
        _ => "ccbackfill=trace,ccbackfill_core=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolved run settings: flags over config file over defaults
#[derive(Debug)]
struct Plan {
    options: BackfillOptions,
    tsdb_dir: Option<PathBuf>,
}

fn plan(cli: &Cli, config: &BackfillConfig) -> Result<Plan> {
    let sources = if !cli.sources.is_empty() {
        cli.sources.clone()
    } else if !config.sources.is_empty() {
        config.sources.clone()
    } else {
        vec![BackfillConfig::default_source().context("Could not determine home directory")?]
    };
    let output = cli.output.clone().or_else(|| config.output.clone());
    let tsdb_dir = cli.tsdb_dir.clone().or_else(|| config.store.tsdb_dir.clone());

    let mut options = if cli.dry_run {
        let options = BackfillOptions::dry_run(sources);
        match output {
            Some(output) => options.with_output(output),
            None => options,
        }
    } else {
        if tsdb_dir.is_none() {
            bail!("--tsdb-dir (or [store].tsdb_dir) is required unless --dry-run is given");
        }
        let format = cli
            .format
            .or(config.format)
            .unwrap_or(SnapshotFormat::OpenMetrics);
        let output = output.unwrap_or_else(|| default_snapshot_name(format));
        BackfillOptions::commit(sources, output)
    };

    if let Some(format) = cli.format.or(config.format) {
        options = options.with_format(format);
    }
    if !cli.dry_run && options.format != SnapshotFormat::OpenMetrics {
        tracing::warn!(
            format = %options.format,
            "promtool bulk-load expects OpenMetrics input"
        );
    }

    Ok(Plan {
        options: options.with_before(cli.before),
        tsdb_dir,
    })
}

fn default_snapshot_name(format: SnapshotFormat) -> PathBuf {
    match format {
        SnapshotFormat::OpenMetrics => PathBuf::from("ccbackfill-snapshot.om"),
        SnapshotFormat::Prometheus => PathBuf::from("ccbackfill-snapshot.prom"),
    }
}

/// Cancels `cancel` on the first interrupt; returns true once a second one arrives
///
/// Returns false if the signal listener fails, leaving the run to finish.
async fn watch_interrupts<F, Fut>(mut next: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = next().await {
        tracing::warn!(error = %e, "Could not listen for Ctrl-C");
        return false;
    }
    tracing::warn!("Interrupted, stopping after the current file (Ctrl-C again to quit)");
    cancel.cancel();

    next().await.is_ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "Parsed CLI arguments");

    let config = BackfillConfig::discover(cli.config.as_deref())?;
    let pricing = config.pricing_table()?;
    let Plan { options, tsdb_dir } = plan(&cli, &config)?;
    let print_snapshot = options.output.is_none();

    let mut store_config = config.store_config(tsdb_dir.unwrap_or_default());
    if let Some(url) = &cli.prometheus_url {
        store_config = store_config.with_url(url.clone());
    }
    if let Some(secs) = cli.reload_timeout {
        store_config = store_config.with_reload_timeout(Duration::from_secs(secs));
    }
    let store = PrometheusStore::new(store_config).context("Failed to build Prometheus client")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, on_signal).await {
            tracing::error!("Interrupted twice, exiting without a snapshot");
            std::process::exit(130);
        }
    });

    let mut backfill = Backfill::new(options, pricing).with_cancellation(cancel);
    let outcome = backfill.run(&store).await?;

    if print_snapshot && outcome.phase == RunPhase::DryRunComplete {
        print!("{}", outcome.snapshot.content);
    }
    eprintln!("{}", cli::format_summary(&outcome, cli.no_color));

    Ok(())
}
