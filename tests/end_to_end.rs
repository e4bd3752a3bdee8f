//! End-to-end scenarios driving the assembled Matcher + Reassembler + decode pipeline
//! through `PacketWorker::process_one`, without a real NFQUEUE socket.

use std::sync::Arc;
use std::time::Duration;

use warden::matcher::{Action, Matcher, Protocol};
use warden::queue::Verdict;
use warden::stats::SharedStats;
use warden::worker::{PacketWorker, WorkerConfig};

fn standard_rules() -> Matcher {
    let mut m = Matcher::new();
    m.add_literal(1, b"malware".to_vec(), Protocol::Any, Action::Drop);
    m.add_regex(2, r"union\s+select", Protocol::Any, Action::Drop).unwrap();
    m
}

fn worker(cfg: WorkerConfig) -> PacketWorker {
    let compiled = standard_rules().build().unwrap();
    PacketWorker::new(0, compiled, cfg, std::env::temp_dir(), Arc::new(SharedStats::new(1)))
}

fn default_cfg() -> WorkerConfig {
    WorkerConfig {
        max_buffer_size: 65536,
        max_scan_window: 8192,
        flow_timeout_secs: 60,
        log_flush_interval_secs: 60,
        icmp_size_check: true,
    }
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

fn tcp_segment(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 20 + payload.len()];
    seg[0..2].copy_from_slice(&src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
    seg[12] = 5 << 4;
    seg[13] = flags;
    seg[20..].copy_from_slice(payload);
    seg
}

fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut dgram = vec![0u8; 8 + payload.len()];
    dgram[0..2].copy_from_slice(&src_port.to_be_bytes());
    dgram[2..4].copy_from_slice(&dst_port.to_be_bytes());
    dgram[8..].copy_from_slice(payload);
    dgram
}

#[test]
fn scenario_1_clean_tcp_payload_is_accepted_and_flow_created() {
    let mut worker = worker(default_cfg());
    let pkt = ipv4(6, &tcp_segment(1234, 80, 0, b"hello world"));
    let outcome = worker.process_one(&pkt);
    assert_eq!(outcome.verdict, Verdict::Accept);
}

#[test]
fn scenario_2_malware_literal_on_same_flow_is_dropped() {
    let mut worker = worker(default_cfg());
    worker.process_one(&ipv4(6, &tcp_segment(1234, 80, 0, b"hello world")));
    let outcome = worker.process_one(&ipv4(6, &tcp_segment(1234, 80, 0, b"contains malware payload")));
    assert_eq!(outcome.verdict, Verdict::Drop);
}

#[test]
fn scenario_3_sql_injection_regex_over_udp_is_dropped() {
    let mut worker = worker(default_cfg());
    let pkt = ipv4(17, &udp_datagram(53, 5353, b"id=1 UNION SELECT * FROM users"));
    let outcome = worker.process_one(&pkt);
    assert_eq!(outcome.verdict, Verdict::Drop);
}

#[test]
fn scenario_4_trailing_malware_survives_buffer_truncation() {
    let mut cfg = default_cfg();
    cfg.max_buffer_size = 100;
    let mut worker = worker(cfg);

    // First segment fills the buffer with filler bytes well past max_buffer_size.
    let filler = vec![b'a'; 200];
    worker.process_one(&ipv4(6, &tcp_segment(1234, 80, 0, &filler)));

    // Second segment's trailing bytes ("malware") must still be visible after truncation.
    let outcome = worker.process_one(&ipv4(6, &tcp_segment(1234, 80, 0, b"malware")));
    assert_eq!(outcome.verdict, Verdict::Drop);
}

#[test]
fn scenario_5_non_transport_protocol_is_accepted_with_no_flow() {
    let mut worker = worker(default_cfg());
    let outcome = worker.process_one(&ipv4(47, b"gre encapsulated payload"));
    assert_eq!(outcome.verdict, Verdict::Accept);
    assert_eq!(outcome.reason, "unscanned protocol");
}

#[test]
fn scenario_6_flow_expires_after_timeout_and_prune() {
    use warden::matcher::Protocol as P;
    use warden::reassembler::{FlowKey, Reassembler};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    let mut r = Reassembler::new(65536, 0); // 0s timeout: immediately eligible once "idle"
    let key = FlowKey::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1234),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
        P::Tcp,
    );
    r.add_tcp_segment(key, b"data");
    assert_eq!(r.stats().active_flows, 1);
    std::thread::sleep(Duration::from_millis(5));
    r.prune_flows();
    assert_eq!(r.stats().active_flows, 0);
}
