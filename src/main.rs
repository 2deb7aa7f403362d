use std::sync::Arc;
use std::time::Duration;

use bleed_scan_rs::heartbleed::HeartbleedProbe;
use bleed_scan_rs::scanner::{ScanConfig, ScanError, ScanReport, Scanner};

use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Give up on a result that has not shown up for this long while targets are in flight.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for one complete probe, kept below the idle timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(4);
/// Connect and per-read/write timeout inside a probe.
const IO_TIMEOUT: Duration = Duration::from_millis(1500);

/// bleed-scan-rs: reads `mode,host-or-cidr,port` lines on stdin and writes one CSV verdict
/// per host to stdout.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "bleed-scan-rs",
    version,
    about = "Mass Heartbleed scanner: mode,host-or-cidr,port lines in, CSV verdicts out.",
    long_about = None
)]
struct Cli {
    /// Log diagnostics (skipped lines, dispatched targets) to stderr.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Number of concurrent probe workers.
    #[arg(short, long, default_value_t = 512, value_parser = clap::value_parser!(u32).range(1..))]
    workers: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = ScanConfig {
        workers: cli.workers as usize,
        idle_timeout: IDLE_TIMEOUT,
        probe_timeout: Some(PROBE_TIMEOUT),
        ..ScanConfig::default()
    };
    info!(
        workers = config.workers,
        queue = config.queue_capacity(),
        "starting scan"
    );

    let probe = Arc::new(HeartbleedProbe::new(IO_TIMEOUT));
    let scanner = Scanner::new(probe, config);
    let stdin = BufReader::new(tokio::io::stdin());

    // Exit directly: tokio's blocking stdin reader may still be parked on a read.
    match finish(scanner.run(stdin, std::io::stdout()).await)? {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}

/// Exit status for a finished scan: 0 on completion, 1 when the watchdog gave up.
/// Any other failure is returned to `main` as an error.
fn finish<W>(outcome: Result<ScanReport<W>, ScanError>) -> Result<i32> {
    match outcome {
        Ok(report) => {
            info!(
                dispatched = report.dispatched,
                results = report.summary.total(),
                "done"
            );
            Ok(0)
        }
        Err(e @ ScanError::Stalled { .. }) => {
            error!("{e}");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}
