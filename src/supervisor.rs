//! Process-level orchestration: privilege check, worker fleet, kernel rules, shutdown.
//!
//! The signal-handling shape (`Arc<AtomicBool>` flipped by `ctrlc::set_handler`) is taken
//! directly from `retina-core::runtime::online::OnlineRuntime::new`. Where `retina-core`
//! polls DPDK RX cores, this supervisor polls `JoinHandle::is_finished()` on worker
//! threads — see DESIGN.md for why workers are OS threads rather than forked processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::IpsConfig;
use crate::matcher::Matcher;
use crate::queue::{self, NfqueueSource};
use crate::stats::SharedStats;
use crate::worker::{PacketWorker, WorkerConfig};

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_CHECK_TICK: Duration = Duration::from_millis(200);
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(5);
const WORKER_JOIN_POLL: Duration = Duration::from_millis(100);

/// Verifies the process can bind raw packet queues. Fatal (control-plane error) if not.
pub fn check_privileges() -> anyhow::Result<()> {
    anyhow::ensure!(
        nix::unistd::Uid::effective().is_root(),
        "warden must run as root to bind an NFQUEUE"
    );
    Ok(())
}

fn worker_config(cfg: &IpsConfig) -> WorkerConfig {
    WorkerConfig {
        max_buffer_size: cfg.max_buffer_size,
        max_scan_window: cfg.max_scan_window,
        flow_timeout_secs: cfg.flow_timeout_secs,
        log_flush_interval_secs: cfg.log_flush_interval_secs,
        icmp_size_check: cfg.icmp_size_check,
    }
}

fn build_matcher(cfg: &IpsConfig) -> anyhow::Result<crate::matcher::CompiledMatcher> {
    let mut matcher = Matcher::new();
    matcher.add_rules(&cfg.rules)?;
    Ok(matcher.build()?)
}

/// Brings up the worker fleet and stats endpoint, blocks until shutdown, tears down.
pub fn run(cfg: IpsConfig, alert_dir: impl Into<std::path::PathBuf> + Clone) -> anyhow::Result<()> {
    check_privileges()?;

    // Built once purely to validate the rule set before committing to starting workers;
    // each worker recompiles its own below so no compiled state crosses thread boundaries.
    build_matcher(&cfg)?;
    log::info!("validated {} rule(s)", cfg.rules.len());

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })?;

    let shared_stats = Arc::new(SharedStats::new(cfg.queues));
    let (endpoint_shutdown_tx, endpoint_shutdown_rx) = watch::channel(false);

    let endpoint_stats = Arc::clone(&shared_stats);
    let endpoint_addr = format!("{}:{}", cfg.http_metrics.host, cfg.http_metrics.port).parse()?;
    let endpoint_thread = std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("stats endpoint: failed to start tokio runtime: {e}");
                return;
            }
        };
        if let Err(e) = runtime.block_on(crate::stats_endpoint::run(endpoint_addr, endpoint_stats, endpoint_shutdown_rx)) {
            log::error!("stats endpoint exited with error: {e}");
        }
    });

    let num_cores = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);

    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(cfg.queues as usize);
    for queue_id in 0..cfg.queues {
        queue::install_queue_rules(queue_id as u16)?;
        log::info!("installed kernel redirection for queue {queue_id}");

        let matcher = build_matcher(&cfg)?;
        let worker_cfg = worker_config(&cfg);
        let shared_stats = Arc::clone(&shared_stats);
        let shutdown = Arc::clone(&shutdown);
        let alert_dir = alert_dir.clone().into();

        handles.push(std::thread::spawn(move || {
            let mut source = match NfqueueSource::bind(queue_id as u16) {
                Ok(source) => source,
                Err(e) => {
                    log::error!("queue {queue_id}: failed to bind nfqueue: {e}");
                    return;
                }
            };
            let mut worker = PacketWorker::new(queue_id, matcher, worker_cfg, alert_dir, shared_stats);
            worker.run(&mut source, &shutdown, num_cores);
        }));
    }

    let mut last_poll = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(SHUTDOWN_CHECK_TICK);
        if last_poll.elapsed() >= LIVENESS_POLL_INTERVAL {
            for (queue_id, handle) in handles.iter().enumerate() {
                if handle.is_finished() {
                    log::warn!("queue {queue_id}: worker thread died");
                }
            }
            last_poll = Instant::now();
        }
    }

    log::info!("shutdown signal received, tearing down");
    let _ = endpoint_shutdown_tx.send(true);

    for queue_id in 0..cfg.queues {
        queue::uninstall_queue_rules(queue_id as u16);
    }

    for (queue_id, handle) in handles.into_iter().enumerate() {
        join_with_grace(queue_id as u32, handle);
    }

    if endpoint_thread.join().is_err() {
        log::warn!("stats endpoint thread panicked");
    }

    Ok(())
}

/// Polls `handle.is_finished()` for up to [`WORKER_JOIN_GRACE`] before giving up. Safe
/// Rust has no thread-kill primitive, so a still-running worker past the grace period is
/// logged, not forcibly terminated; the process exit that follows reclaims it anyway.
fn join_with_grace(queue_id: u32, handle: JoinHandle<()>) {
    let deadline = Instant::now() + WORKER_JOIN_GRACE;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(WORKER_JOIN_POLL);
    }
    if !handle.is_finished() {
        log::warn!("queue {queue_id}: worker did not exit within {WORKER_JOIN_GRACE:?}, abandoning join");
        return;
    }
    if handle.join().is_err() {
        log::warn!("queue {queue_id}: worker thread panicked");
    }
}
