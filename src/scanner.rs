use crate::classify::to_result;
use crate::probe::{Probe, ProbeError};
use crate::targets::parse_bytes;
use crate::types::{ScanResult, ScanSummary, Target};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tracing::{debug, info, warn};

/// Tuning knobs for a scan run.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Number of concurrent probe workers.
    pub workers: usize,
    /// Queue slots per worker, for both the target and the result queue.
    pub queue_factor: usize,
    /// How long the collector may go without a result while work is outstanding.
    pub idle_timeout: Duration,
    /// Deadline for a single probe call. `None` lets probes run to their own timeouts.
    pub probe_timeout: Option<Duration>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 512,
            queue_factor: 4,
            idle_timeout: Duration::from_secs(5),
            probe_timeout: Some(Duration::from_secs(4)),
        }
    }
}

impl ScanConfig {
    pub fn queue_capacity(&self) -> usize {
        self.workers.max(1).saturating_mul(self.queue_factor.max(1))
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("timed out: no result for {idle:?} with {outstanding} target(s) outstanding")]
    Stalled { idle: Duration, outstanding: usize },
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] csv::Error),
    #[error("scan task failed: {0}")]
    Join(#[from] JoinError),
    #[error("scan pipeline shut down before all targets were handled")]
    Shutdown,
}

/// Counts targets that were dispatched but have not produced a result yet.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatched target.
    pub fn add(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a produced result.
    pub fn done(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "done() without matching add()");
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Resolves once every dispatched target has produced its result.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a done() between the load and the await is not lost.
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// What a finished run hands back.
#[derive(Debug)]
pub struct ScanReport<W> {
    pub dispatched: u64,
    pub summary: ScanSummary,
    pub output: W,
}

/// Producer/worker/collector pipeline around a [`Probe`].
///
/// - Lines are read from the input, expanded into targets and pushed into a bounded queue.
/// - `workers` tasks pull targets, probe and classify them, and push results into a second
///   bounded queue.
/// - A single collector writes each result as a CSV record and flushes it straight away.
///
/// Results come out in completion order. The collector fails the run with
/// [`ScanError::Stalled`] when nothing arrives for `idle_timeout` while targets are still
/// outstanding.
pub struct Scanner {
    probe: Arc<dyn Probe>,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(probe: Arc<dyn Probe>, config: ScanConfig) -> Self {
        Self { probe, config }
    }

    pub async fn run<R, W>(&self, input: R, output: W) -> Result<ScanReport<W>, ScanError>
    where
        R: AsyncBufRead + Unpin,
        W: io::Write + Send + 'static,
    {
        let capacity = self.config.queue_capacity();
        let (target_tx, target_rx) = mpsc::channel::<Target>(capacity);
        let (result_tx, result_rx) = mpsc::channel::<ScanResult>(capacity);
        let queue = Arc::new(Mutex::new(target_rx));
        let tracker = Arc::new(CompletionTracker::new());

        let worker_count = self.config.workers.max(1);
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            workers.spawn(worker(
                id,
                queue.clone(),
                result_tx.clone(),
                self.probe.clone(),
                tracker.clone(),
                self.config.probe_timeout,
            ));
        }
        drop(result_tx);
        debug!(workers = worker_count, capacity, "started scan pipeline");

        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(output);
        let mut collector = tokio::spawn(collect(
            result_rx,
            writer,
            tracker.clone(),
            self.config.idle_timeout,
        ));

        let dispatched = tokio::select! {
            joined = &mut collector => {
                workers.abort_all();
                return Err(match joined? {
                    Err(e) => e,
                    Ok(_) => ScanError::Shutdown,
                });
            }
            res = dispatch(input, target_tx, &tracker) => res,
        };
        let dispatched = match dispatched {
            Ok(n) => n,
            Err(e) => {
                workers.abort_all();
                collector.abort();
                return Err(e);
            }
        };

        while let Some(joined) = workers.join_next().await {
            joined?;
        }
        let (summary, output) = collector.await??;
        info!(
            dispatched,
            vulnerable = summary.vulnerable,
            not_vulnerable = summary.not_vulnerable,
            unknown = summary.unknown,
            errors = summary.errors,
            "scan complete"
        );
        Ok(ScanReport {
            dispatched,
            summary,
            output,
        })
    }
}

/// Feed targets from `input` into the queue, then wait for all of them to finish before
/// closing the queue.
async fn dispatch<R>(
    mut input: R,
    queue: mpsc::Sender<Target>,
    tracker: &CompletionTracker,
) -> Result<u64, ScanError>
where
    R: AsyncBufRead + Unpin,
{
    let mut dispatched = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        let targets = match parse_bytes(line) {
            Ok(targets) => targets,
            Err(e) => {
                info!("skipping {:?}: {e}", String::from_utf8_lossy(line));
                continue;
            }
        };
        for target in targets {
            info!("scanning {} {} {}", target.mode, target.host, target.port);
            tracker.add();
            if queue.send(target).await.is_err() {
                tracker.done();
                return Err(ScanError::Shutdown);
            }
            dispatched += 1;
        }
    }

    debug!(dispatched, "input exhausted, waiting for outstanding targets");
    tracker.wait_idle().await;
    drop(queue);
    Ok(dispatched)
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Target>>>,
    results: mpsc::Sender<ScanResult>,
    probe: Arc<dyn Probe>,
    tracker: Arc<CompletionTracker>,
    deadline: Option<Duration>,
) {
    loop {
        // The guard is dropped at the end of this statement, before probing.
        let next = queue.lock().await.recv().await;
        let Some(target) = next else {
            break;
        };

        let outcome = match deadline {
            Some(limit) => time::timeout(limit, probe.probe(&target))
                .await
                .unwrap_or(Err(ProbeError::Timeout)),
            None => probe.probe(&target).await,
        };
        debug!(worker = id, target = %target.address(), ?outcome, "probe finished");

        let sent = results.send(to_result(target, &outcome)).await;
        tracker.done();
        if sent.is_err() {
            warn!(worker = id, "result queue closed, stopping worker");
            break;
        }
    }
}

async fn collect<W: io::Write>(
    mut results: mpsc::Receiver<ScanResult>,
    mut out: csv::Writer<W>,
    tracker: Arc<CompletionTracker>,
    idle_timeout: Duration,
) -> Result<(ScanSummary, W), ScanError> {
    let mut summary = ScanSummary::default();
    loop {
        match time::timeout(idle_timeout, results.recv()).await {
            Ok(Some(result)) => {
                out.serialize(&result)?;
                out.flush().map_err(csv::Error::from)?;
                summary.record(result.classification);
            }
            Ok(None) => break,
            Err(_) => {
                let outstanding = tracker.outstanding();
                if outstanding > 0 {
                    return Err(ScanError::Stalled {
                        idle: idle_timeout,
                        outstanding,
                    });
                }
                debug!("collector idle with no outstanding targets");
            }
        }
    }

    out.flush().map_err(csv::Error::from)?;
    let output = out
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok((summary, output))
}
