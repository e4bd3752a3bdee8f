//! Alert records and their CSV sink.
//!
//! Grounded on `retina-core::lcore::monitor::Monitor`'s use of `csv::Writer` for periodic
//! stat dumps, and on the original prototype's `worker.py`, which appended one CSV row per
//! match and flushed on a timer rather than per-row. Write failures are logged and
//! swallowed: an alert sink outage must never stall packet processing.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::matcher::{Action, Hit, Protocol, RuleKind};

/// A single rule hit, flattened for CSV output.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "timestamp")]
    pub timestamp_secs: u64,
    pub rule_id: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub offset: Option<usize>,
    pub action: Action,
    #[serde(rename = "type")]
    pub kind: RuleKind,
}

impl Alert {
    pub fn from_hit(
        hit: &Hit,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: Protocol,
    ) -> Self {
        Alert {
            timestamp_secs: now_secs(),
            rule_id: hit.rule_id,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
            offset: hit.offset,
            action: hit.action,
            kind: hit.kind,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Buffers alerts in memory and flushes them to a CSV file on demand.
///
/// One [`AlertLog`] per worker; the output file name embeds the worker's queue id so
/// concurrent workers never contend over the same file.
pub struct AlertLog {
    queue_id: u32,
    directory: PathBuf,
    pending: Vec<Alert>,
}

impl AlertLog {
    pub fn new(queue_id: u32, directory: impl Into<PathBuf>) -> Self {
        AlertLog {
            queue_id,
            directory: directory.into(),
            pending: Vec::new(),
        }
    }

    pub fn record(&mut self, alert: Alert) {
        self.pending.push(alert);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Writes every buffered alert to a new CSV file and clears the buffer. A write
    /// failure is logged and the buffered alerts are dropped rather than retried
    /// indefinitely, matching the fail-open policy for the data plane. Returns the path
    /// written to, if anything was flushed.
    pub fn flush(&mut self) -> Option<PathBuf> {
        if self.pending.is_empty() {
            return None;
        }
        let path = self.file_path();
        match self.write_csv(&path) {
            Ok(()) => log::debug!("flushed {} alerts to {}", self.pending.len(), path.display()),
            Err(e) => log::warn!("failed to flush alerts to {}: {e}", path.display()),
        }
        self.pending.clear();
        Some(path)
    }

    fn file_path(&self) -> PathBuf {
        self.directory
            .join(format!("alerts_{}_q{}.csv", now_secs(), self.queue_id))
    }

    fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for alert in &self.pending {
            wtr.serialize(alert)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_hit() -> Hit {
        Hit {
            rule_id: 7,
            action: Action::Drop,
            kind: RuleKind::Literal,
            offset: Some(3),
        }
    }

    #[test]
    fn alert_from_hit_carries_five_tuple() {
        let hit = sample_hit();
        let alert = Alert::from_hit(
            &hit,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            1234,
            80,
            Protocol::Tcp,
        );
        assert_eq!(alert.rule_id, 7);
        assert_eq!(alert.offset, Some(3));
        assert_eq!(alert.src_port, 1234);
        assert!(matches!(alert.action, Action::Drop));
    }

    #[test]
    fn flush_on_empty_buffer_is_a_no_op() {
        let dir = std::env::temp_dir();
        let mut log = AlertLog::new(0, dir);
        assert!(log.flush().is_none());
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn record_accumulates_until_flush() {
        let dir = std::env::temp_dir();
        let mut log = AlertLog::new(1, dir);
        let hit = sample_hit();
        let alert = Alert::from_hit(
            &hit,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            1234,
            80,
            Protocol::Tcp,
        );
        log.record(alert.clone());
        log.record(alert);
        assert_eq!(log.pending_len(), 2);
    }

    #[test]
    fn flush_writes_csv_and_clears_buffer() {
        let dir = std::env::temp_dir();
        let mut log = AlertLog::new(99999, dir.clone());
        let hit = sample_hit();
        log.record(Alert::from_hit(
            &hit,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            1234,
            80,
            Protocol::Tcp,
        ));
        let path = log.flush().expect("non-empty buffer flushes");
        assert_eq!(log.pending_len(), 0);
        assert!(path.exists());
        let _ = std::fs::remove_file(path);
    }
}
