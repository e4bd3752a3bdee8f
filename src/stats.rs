//! Worker counters and the shared, single-writer-per-slot snapshot table.
//!
//! `retina-core::stats` keeps one `Family<CoreId, Counter>` per metric and serves them
//! through a Prometheus registry (see `core/src/stats/prometheus.rs`). Warden exposes a
//! plain JSON endpoint instead, so each worker keeps plain `u64` counters locally and
//! publishes a point-in-time [`WorkerStatsSnapshot`] into a shared table the stats endpoint
//! reads. The table is a `Vec<Mutex<Option<..>>>` indexed by queue id: the mutex exists
//! only to satisfy Rust's aliasing rules, since each worker is the sole writer of its slot.

use std::sync::Mutex;

use serde::Serialize;

/// Running counters owned by a single [`crate::worker::PacketWorker`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub packets_processed: u64,
    pub matches_found: u64,
    pub packets_dropped: u64,
    pub packets_accepted: u64,
    pub active_flows: usize,
    pub total_buffer_size: usize,
    pub pending_alerts: usize,
}

impl WorkerStats {
    pub fn record_match(&mut self, dropped: bool) {
        self.matches_found += 1;
        if dropped {
            self.packets_dropped += 1;
        } else {
            self.packets_accepted += 1;
        }
    }

    pub fn record_passthrough(&mut self) {
        self.packets_accepted += 1;
    }

    pub fn snapshot(&self, queue_id: u32) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            queue_id,
            packets_processed: self.packets_processed,
            matches_found: self.matches_found,
            packets_dropped: self.packets_dropped,
            packets_accepted: self.packets_accepted,
            active_flows: self.active_flows,
            total_buffer_size: self.total_buffer_size,
            pending_alerts: self.pending_alerts,
        }
    }
}

/// A point-in-time copy of one worker's counters, serializable for the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerStatsSnapshot {
    pub queue_id: u32,
    pub packets_processed: u64,
    pub matches_found: u64,
    pub packets_dropped: u64,
    pub packets_accepted: u64,
    pub active_flows: usize,
    pub total_buffer_size: usize,
    pub pending_alerts: usize,
}

/// Shared table of the most recent snapshot from each worker, indexed by queue id.
///
/// Each worker only ever writes its own slot (`publish`), so contention is never expected;
/// the mutex is load-bearing only for the borrow checker, not for coordination.
pub struct SharedStats {
    slots: Vec<Mutex<Option<WorkerStatsSnapshot>>>,
}

impl SharedStats {
    pub fn new(queues: u32) -> Self {
        let mut slots = Vec::with_capacity(queues as usize);
        slots.resize_with(queues as usize, || Mutex::new(None));
        SharedStats { slots }
    }

    /// Overwrites the snapshot for `snapshot.queue_id`. Logs and drops the update rather
    /// than panicking if the queue id is out of range or the lock is poisoned.
    pub fn publish(&self, snapshot: WorkerStatsSnapshot) {
        let idx = snapshot.queue_id as usize;
        let Some(slot) = self.slots.get(idx) else {
            log::warn!("stats publish for out-of-range queue id {idx}");
            return;
        };
        match slot.lock() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(_) => log::warn!("stats slot {idx} lock poisoned, dropping update"),
        }
    }

    /// Returns every populated worker snapshot, in queue-id order.
    pub fn snapshots(&self) -> Vec<WorkerStatsSnapshot> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().ok().and_then(|guard| *guard))
            .collect()
    }

    pub fn get(&self, queue_id: u32) -> Option<WorkerStatsSnapshot> {
        self.slots
            .get(queue_id as usize)
            .and_then(|slot| slot.lock().ok().and_then(|guard| *guard))
    }

    /// Sums every worker's counters into a single totals snapshot (`queue_id` is unused,
    /// set to `u32::MAX` as a sentinel).
    pub fn totals(&self) -> WorkerStatsSnapshot {
        self.snapshots().into_iter().fold(
            WorkerStatsSnapshot {
                queue_id: u32::MAX,
                packets_processed: 0,
                matches_found: 0,
                packets_dropped: 0,
                packets_accepted: 0,
                active_flows: 0,
                total_buffer_size: 0,
                pending_alerts: 0,
            },
            |mut acc, s| {
                acc.packets_processed += s.packets_processed;
                acc.matches_found += s.matches_found;
                acc.packets_dropped += s.packets_dropped;
                acc.packets_accepted += s.packets_accepted;
                acc.active_flows += s.active_flows;
                acc.total_buffer_size += s.total_buffer_size;
                acc.pending_alerts += s.pending_alerts;
                acc
            },
        )
    }
}
