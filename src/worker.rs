//! Per-queue packet processing loop.
//!
//! Grounded on the original prototype's `worker.py` (`PacketWorker.packet_callback`) for
//! the seven-step pipeline, and on `retina-core::multicore::dedicated_worker` for the
//! shape of a pinned, single-purpose OS thread owning its own state with nothing crossing
//! the boundary except a stats snapshot.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert::{Alert, AlertLog};
use crate::matcher::{Action, CompiledMatcher, Protocol};
use crate::protocols::{icmp::Icmp, ipv4::Ipv4, proto_numbers, tcp, tcp::Tcp, udp::Udp};
use crate::queue::{PacketSource, QueuedPacket, Verdict};
use crate::reassembler::{FlowKey, Reassembler};
use crate::stats::{SharedStats, WorkerStats};

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);
const ICMP_EXPECTED_PAYLOAD_LEN: usize = 60;

/// Outcome of processing a single packet, returned by [`PacketWorker::process_one`] so
/// the pipeline is testable without a kernel queue or a live [`AlertLog`]/stats sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub reason: &'static str,
}

/// Configuration a [`PacketWorker`] needs beyond its queue id, factored out of
/// [`crate::config::IpsConfig`] so the worker doesn't depend on the whole config type.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub max_buffer_size: usize,
    pub max_scan_window: usize,
    pub flow_timeout_secs: u64,
    pub log_flush_interval_secs: u64,
    pub icmp_size_check: bool,
}

pub struct PacketWorker {
    queue_id: u32,
    matcher: CompiledMatcher,
    reassembler: Reassembler,
    alert_log: AlertLog,
    stats: WorkerStats,
    shared_stats: Arc<SharedStats>,
    cfg: WorkerConfig,
    last_prune: Instant,
    last_flush: Instant,
    last_snapshot: Instant,
}

impl PacketWorker {
    pub fn new(
        queue_id: u32,
        matcher: CompiledMatcher,
        cfg: WorkerConfig,
        alert_dir: impl Into<std::path::PathBuf>,
        shared_stats: Arc<SharedStats>,
    ) -> Self {
        let now = Instant::now();
        PacketWorker {
            queue_id,
            matcher,
            reassembler: Reassembler::new(cfg.max_buffer_size, cfg.flow_timeout_secs),
            alert_log: AlertLog::new(queue_id, alert_dir),
            stats: WorkerStats::default(),
            shared_stats,
            cfg,
            last_prune: now,
            last_flush: now,
            last_snapshot: now,
        }
    }

    /// Runs the blocking dequeue loop until `shutdown` is set or the source errors out.
    ///
    /// On setup, attempts to pin this thread to `queue_id mod num_cores`; a pinning
    /// failure is logged and does not abort the worker.
    pub fn run(&mut self, source: &mut dyn PacketSource, shutdown: &AtomicBool, num_cores: u32) {
        if num_cores > 0 {
            let core = self.queue_id % num_cores;
            if let Err(e) = crate::pin::pin_thread_to_core(core) {
                log::warn!("queue {}: failed to pin to core {core}: {e}", self.queue_id);
            }
        }

        while !shutdown.load(Ordering::Relaxed) {
            let packet = match source.recv() {
                Ok(packet) => packet,
                Err(e) => {
                    log::error!("queue {}: recv error, worker stopping: {e}", self.queue_id);
                    break;
                }
            };

            let outcome = self.process_one(&packet.data);
            if let Err(e) = source.set_verdict(packet.id, outcome.verdict) {
                log::error!("queue {}: failed to set verdict: {e}", self.queue_id);
            }

            self.maintain();
        }

        self.alert_log.flush();
    }

    /// Runs the decode/reassemble/scan/verdict pipeline for one raw IPv4 datagram.
    /// Any error after the initial accounting increment is fail-open: the packet is
    /// accepted and the error logged.
    pub fn process_one(&mut self, data: &[u8]) -> Outcome {
        self.stats.packets_processed += 1;

        let ip = match Ipv4::parse(data) {
            Ok(ip) => ip,
            Err(e) => {
                log::error!("queue {}: [ACCEPT] undecodable packet; reason: {e}", self.queue_id);
                self.stats.record_passthrough();
                return Outcome {
                    verdict: Verdict::Accept,
                    reason: "decode error",
                };
            }
        };

        let src_ip = IpAddr::V4(ip.src_addr());
        let dst_ip = IpAddr::V4(ip.dst_addr());

        match ip.protocol() {
            proto_numbers::TCP => self.process_tcp(ip.payload(), src_ip, dst_ip),
            proto_numbers::UDP => self.process_udp(ip.payload(), src_ip, dst_ip),
            proto_numbers::ICMP => self.process_icmp(ip.payload(), src_ip, dst_ip),
            other => {
                log::info!("queue {}: [ACCEPT] {src_ip} -> {dst_ip}; proto: {other}; no scan", self.queue_id);
                self.stats.record_passthrough();
                Outcome {
                    verdict: Verdict::Accept,
                    reason: "unscanned protocol",
                }
            }
        }
    }

    fn process_tcp(&mut self, payload: &[u8], src_ip: IpAddr, dst_ip: IpAddr) -> Outcome {
        let segment = match Tcp::parse(payload) {
            Ok(s) => s,
            Err(e) => {
                log::error!("queue {}: [ACCEPT] {src_ip} -> {dst_ip}; proto: tcp; decode error: {e}", self.queue_id);
                self.stats.record_passthrough();
                return Outcome {
                    verdict: Verdict::Accept,
                    reason: "tcp decode error",
                };
            }
        };

        let key = FlowKey::new(
            SocketAddr::new(src_ip, segment.src_port()),
            SocketAddr::new(dst_ip, segment.dst_port()),
            Protocol::Tcp,
        );
        self.reassembler.add_tcp_segment(key, segment.payload());
        let scan_data = self
            .reassembler
            .get_buffer(&key, self.cfg.max_scan_window)
            .to_vec();

        let outcome = self.scan_and_verdict(&scan_data, Protocol::Tcp, src_ip, dst_ip, segment.src_port(), segment.dst_port());

        if segment.flags() & (tcp::FIN | tcp::RST) != 0 {
            self.reassembler.close_flow(&key);
        }

        outcome
    }

    fn process_udp(&mut self, payload: &[u8], src_ip: IpAddr, dst_ip: IpAddr) -> Outcome {
        let datagram = match Udp::parse(payload) {
            Ok(d) => d,
            Err(e) => {
                log::error!("queue {}: [ACCEPT] {src_ip} -> {dst_ip}; proto: udp; decode error: {e}", self.queue_id);
                self.stats.record_passthrough();
                return Outcome {
                    verdict: Verdict::Accept,
                    reason: "udp decode error",
                };
            }
        };

        let key = FlowKey::new(
            SocketAddr::new(src_ip, datagram.src_port()),
            SocketAddr::new(dst_ip, datagram.dst_port()),
            Protocol::Udp,
        );
        let scan_data = self.reassembler.add_udp_datagram(key, datagram.payload()).to_vec();

        self.scan_and_verdict(&scan_data, Protocol::Udp, src_ip, dst_ip, datagram.src_port(), datagram.dst_port())
    }

    fn process_icmp(&mut self, payload: &[u8], src_ip: IpAddr, dst_ip: IpAddr) -> Outcome {
        let packet = match Icmp::parse(payload) {
            Ok(p) => p,
            Err(e) => {
                log::error!("queue {}: [ACCEPT] {src_ip} -> {dst_ip}; proto: icmp; decode error: {e}", self.queue_id);
                self.stats.record_passthrough();
                return Outcome {
                    verdict: Verdict::Accept,
                    reason: "icmp decode error",
                };
            }
        };

        let scan_data = packet.payload();
        if self.cfg.icmp_size_check && scan_data.len() != ICMP_EXPECTED_PAYLOAD_LEN {
            log::info!(
                "queue {}: [DROP] {src_ip} -> {dst_ip}; proto: icmp; reason: payload {} bytes, expected {ICMP_EXPECTED_PAYLOAD_LEN}",
                self.queue_id,
                scan_data.len()
            );
            self.stats.packets_dropped += 1;
            return Outcome {
                verdict: Verdict::Drop,
                reason: "icmp anti-abuse heuristic",
            };
        }

        self.scan_and_verdict(scan_data, Protocol::Icmp, src_ip, dst_ip, 0, 0)
    }

    fn scan_and_verdict(
        &mut self,
        scan_data: &[u8],
        protocol: Protocol,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
    ) -> Outcome {
        if scan_data.is_empty() {
            self.stats.record_passthrough();
            return Outcome {
                verdict: Verdict::Accept,
                reason: "empty scan window",
            };
        }

        let hits = self.matcher.match_data(scan_data, protocol);
        if hits.is_empty() {
            self.stats.record_passthrough();
            return Outcome {
                verdict: Verdict::Accept,
                reason: "no match",
            };
        }

        let dropping = hits.iter().any(|h| h.action == Action::Drop);
        self.stats.record_match(dropping);
        for hit in &hits {
            self.alert_log.record(Alert::from_hit(hit, src_ip, dst_ip, src_port, dst_port, protocol));
        }

        let verdict = if dropping { Verdict::Drop } else { Verdict::Accept };
        log::info!(
            "queue {}: [{}] {src_ip} -> {dst_ip}; proto: {protocol}; {} rule hit(s)",
            self.queue_id,
            if dropping { "DROP" } else { "ACCEPT" },
            hits.len()
        );

        Outcome {
            verdict,
            reason: "rule match",
        }
    }

    fn maintain(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_prune) >= PRUNE_INTERVAL {
            self.reassembler.prune_flows();
            self.last_prune = now;
        }

        let flush_interval = Duration::from_secs(self.cfg.log_flush_interval_secs);
        if now.duration_since(self.last_flush) >= flush_interval {
            self.alert_log.flush();
            self.last_flush = now;
        }

        if now.duration_since(self.last_snapshot) >= SNAPSHOT_INTERVAL {
            let flow_stats = self.reassembler.stats();
            self.stats.active_flows = flow_stats.active_flows;
            self.stats.total_buffer_size = flow_stats.total_buffer_size;
            self.stats.pending_alerts = self.alert_log.pending_len();
            self.shared_stats.publish(self.stats.snapshot(self.queue_id));
            self.last_snapshot = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Matcher;

    fn worker_with_rules() -> PacketWorker {
        let mut m = Matcher::new();
        m.add_literal(1, b"malware".to_vec(), Protocol::Any, Action::Drop);
        let compiled = m.build().unwrap();
        let cfg = WorkerConfig {
            max_buffer_size: 65536,
            max_scan_window: 8192,
            flow_timeout_secs: 60,
            log_flush_interval_secs: 60,
            icmp_size_check: true,
        };
        PacketWorker::new(0, compiled, cfg, std::env::temp_dir(), Arc::new(SharedStats::new(1)))
    }

    fn ipv4(proto: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 20 + payload.len()];
        pkt[0] = 0x45;
        let total_len = (20 + payload.len()) as u16;
        pkt[2..4].copy_from_slice(&total_len.to_be_bytes());
        pkt[9] = proto;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 2]);
        pkt[20..].copy_from_slice(payload);
        pkt
    }

    fn tcp_segment(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut seg = vec![0u8; 20 + payload.len()];
        seg[0..2].copy_from_slice(&1234u16.to_be_bytes());
        seg[2..4].copy_from_slice(&80u16.to_be_bytes());
        seg[12] = 5 << 4;
        seg[13] = flags;
        seg[20..].copy_from_slice(payload);
        seg
    }

    fn udp_datagram(payload: &[u8]) -> Vec<u8> {
        let mut dgram = vec![0u8; 8 + payload.len()];
        dgram[0..2].copy_from_slice(&53u16.to_be_bytes());
        dgram[2..4].copy_from_slice(&5353u16.to_be_bytes());
        dgram[8..].copy_from_slice(payload);
        dgram
    }

    #[test]
    fn tcp_payload_matching_a_drop_rule_is_dropped() {
        let mut worker = worker_with_rules();
        let pkt = ipv4(6, &tcp_segment(tcp::ACK, b"contains malware"));
        let outcome = worker.process_one(&pkt);
        assert_eq!(outcome.verdict, Verdict::Drop);
        assert_eq!(worker.stats.packets_dropped, 1);
    }

    #[test]
    fn clean_tcp_payload_is_accepted() {
        let mut worker = worker_with_rules();
        let pkt = ipv4(6, &tcp_segment(tcp::ACK, b"hello world"));
        let outcome = worker.process_one(&pkt);
        assert_eq!(outcome.verdict, Verdict::Accept);
    }

    #[test]
    fn udp_payload_matching_a_drop_rule_is_dropped() {
        let mut worker = worker_with_rules();
        let pkt = ipv4(17, &udp_datagram(b"malware payload"));
        let outcome = worker.process_one(&pkt);
        assert_eq!(outcome.verdict, Verdict::Drop);
    }

    #[test]
    fn icmp_with_60_byte_payload_is_scanned_not_dropped_by_heuristic() {
        let mut worker = worker_with_rules();
        let payload = vec![0u8; 60];
        let mut icmp = vec![0u8; 8];
        icmp.extend_from_slice(&payload);
        let pkt = ipv4(1, &icmp);
        let outcome = worker.process_one(&pkt);
        assert_eq!(outcome.verdict, Verdict::Accept);
    }

    #[test]
    fn icmp_with_non_60_byte_payload_is_dropped() {
        let mut worker = worker_with_rules();
        let mut icmp = vec![0u8; 8];
        icmp.extend_from_slice(b"short");
        let pkt = ipv4(1, &icmp);
        let outcome = worker.process_one(&pkt);
        assert_eq!(outcome.verdict, Verdict::Drop);
        assert_eq!(outcome.reason, "icmp anti-abuse heuristic");
    }

    #[test]
    fn non_tcp_udp_icmp_protocol_is_accepted_with_no_scan() {
        let mut worker = worker_with_rules();
        let pkt = ipv4(47, b"gre payload"); // GRE
        let outcome = worker.process_one(&pkt);
        assert_eq!(outcome.verdict, Verdict::Accept);
        assert_eq!(outcome.reason, "unscanned protocol");
    }

    #[test]
    fn tcp_fin_closes_flow_after_scan() {
        let mut worker = worker_with_rules();
        let pkt = ipv4(6, &tcp_segment(tcp::FIN | tcp::ACK, b"hello"));
        worker.process_one(&pkt);
        let key = FlowKey::new(
            SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)), 1234),
            SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2)), 80),
            Protocol::Tcp,
        );
        worker.reassembler.prune_flows();
        assert_eq!(worker.reassembler.stats().active_flows, 0);
        let _ = key;
    }

    #[test]
    fn undecodable_packet_fails_open() {
        let mut worker = worker_with_rules();
        let outcome = worker.process_one(&[0u8; 2]);
        assert_eq!(outcome.verdict, Verdict::Accept);
        assert_eq!(outcome.reason, "decode error");
    }
}
