//! Minimal IPv4/TCP/UDP/ICMP framing.
//!
//! Adapted from `retina-core`'s `protocols::packet` module, which parses headers out of
//! DPDK `Mbuf`s via a zero-copy `Packet` trait. Warden has no mbuf layer — packets arrive
//! as owned byte vectors from the kernel queue — so these parsers read straight out of a
//! `&[u8]` slice instead. Field names and the TCP flag bit layout follow `retina-core`
//! exactly; IP fragmentation and options are out of scope and are not parsed.

pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;

/// Transport/ICMP protocol numbers as they appear in the IPv4 header's `protocol` field.
pub mod proto_numbers {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("packet too short: need at least {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("IPv4 header length {0} is invalid")]
    BadHeaderLength(u8),
}
