//! Warden: an inline intrusion prevention system.
//!
//! Intercepts packets from a Linux `NFQUEUE`, reassembles per-flow transport payloads,
//! scans them against literal and regex rules, and issues an accept/drop verdict before
//! the kernel releases the packet. See each module for the corresponding design.

pub mod alert;
pub mod config;
pub mod matcher;
pub mod pin;
pub mod protocols;
pub mod queue;
pub mod reassembler;
pub mod stats;
pub mod stats_endpoint;
pub mod supervisor;
pub mod worker;
