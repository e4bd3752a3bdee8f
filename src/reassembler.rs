//! Per-flow payload reassembly.
//!
//! Grounded on `retina-core::conntrack::ConnTracker`: a bounded, insertion-ordered table
//! keyed by flow identity, pruned on a timer rather than by an OS connection-table event.
//! Unlike `ConnTracker`'s `ConnId` (which normalizes direction so both sides of a
//! connection share one entry), `FlowKey` here is directional, matching the original
//! prototype's `reassembler.py` (`(src, sport, dst, dport, proto)` as seen on the wire).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;

use crate::matcher::Protocol;

/// Directional flow identity: one entry per (src, dst, protocol) tuple as observed,
/// not merged with its reverse direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr, protocol: Protocol) -> Self {
        FlowKey { src, dst, protocol }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    Active,
    Closed,
}

struct FlowEntry {
    buffer: Vec<u8>,
    last_seen: Instant,
    state: FlowState,
}

/// Aggregate counters returned by [`Reassembler::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReassemblerStats {
    pub active_flows: usize,
    pub total_buffer_size: usize,
}

/// Bounded, insertion-ordered flow table holding a reassembly buffer per flow.
///
/// `max_buffer_size` bounds memory per flow: once a buffer would grow past it, the oldest
/// bytes are dropped to make room, mirroring a sliding window rather than rejecting the
/// new data.
pub struct Reassembler {
    flows: LinkedHashMap<FlowKey, FlowEntry>,
    max_buffer_size: usize,
    flow_timeout: Duration,
}

const EMPTY: &[u8] = &[];

impl Reassembler {
    pub fn new(max_buffer_size: usize, flow_timeout_secs: u64) -> Self {
        Reassembler {
            flows: LinkedHashMap::new(),
            max_buffer_size,
            flow_timeout: Duration::from_secs(flow_timeout_secs),
        }
    }

    fn entry(&mut self, key: FlowKey) -> &mut FlowEntry {
        self.flows.entry(key).or_insert_with(|| {
            log::debug!("flow created: {key:?}");
            FlowEntry {
                buffer: Vec::new(),
                last_seen: Instant::now(),
                state: FlowState::Active,
            }
        })
    }

    /// Appends a TCP segment to the flow's buffer, dropping the oldest bytes if the
    /// append would exceed `max_buffer_size`. Returns the flow's full buffer after the
    /// append.
    pub fn add_tcp_segment(&mut self, key: FlowKey, bytes: &[u8]) -> &[u8] {
        let max = self.max_buffer_size;
        let entry = self.entry(key);
        entry.last_seen = Instant::now();
        entry.buffer.extend_from_slice(bytes);
        if entry.buffer.len() > max {
            let overflow = entry.buffer.len() - max;
            log::debug!("flow {key:?} overflowed by {overflow} bytes, dropping oldest");
            entry.buffer.drain(0..overflow);
        }
        self.flows.to_back(&key);
        &self.flows.get(&key).expect("just inserted").buffer
    }

    /// Replaces the flow's buffer with a single UDP datagram: UDP has no stream to
    /// reassemble, so only the most recent datagram is scanned.
    pub fn add_udp_datagram(&mut self, key: FlowKey, bytes: &[u8]) -> &[u8] {
        let max = self.max_buffer_size;
        let entry = self.entry(key);
        entry.last_seen = Instant::now();
        entry.buffer.clear();
        entry.buffer.extend_from_slice(bytes);
        if entry.buffer.len() > max {
            let overflow = entry.buffer.len() - max;
            log::debug!("flow {key:?} overflowed by {overflow} bytes, dropping oldest");
            entry.buffer.drain(0..overflow);
        }
        self.flows.to_back(&key);
        &self.flows.get(&key).expect("just inserted").buffer
    }

    /// Returns the trailing `max_scan_window` bytes of the flow's buffer, or the whole
    /// buffer if it's smaller than the window. Returns an empty slice for an unknown flow.
    pub fn get_buffer(&self, key: &FlowKey, max_scan_window: usize) -> &[u8] {
        match self.flows.get(key) {
            Some(entry) if entry.buffer.len() > max_scan_window => {
                &entry.buffer[entry.buffer.len() - max_scan_window..]
            }
            Some(entry) => &entry.buffer,
            None => EMPTY,
        }
    }

    /// Marks a flow closed (e.g. on TCP FIN/RST). Closed flows are removed on the next
    /// [`Reassembler::prune_flows`] regardless of their idle time.
    pub fn close_flow(&mut self, key: &FlowKey) {
        if let Some(entry) = self.flows.get_mut(key) {
            entry.state = FlowState::Closed;
        }
    }

    /// Removes every flow that is closed or has been idle longer than `flow_timeout_secs`.
    pub fn prune_flows(&mut self) {
        let timeout = self.flow_timeout;
        let now = Instant::now();
        let stale: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| entry.state == FlowState::Closed || now.duration_since(entry.last_seen) > timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            log::debug!("flow pruned: {key:?}");
            self.flows.remove(&key);
        }
    }

    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            active_flows: self.flows.len(),
            total_buffer_size: self.flows.values().map(|e| e.buffer.len()).sum(),
        }
    }
}
