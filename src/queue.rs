//! Kernel packet source and NFQUEUE/iptables plumbing.
//!
//! The original prototype's `worker.py` bound one `netfilterqueue.NetfilterQueue` per
//! worker and `main.py` installed/removed `NFQUEUE` targets with `os.system("iptables ...")`.
//! Here the binding is the `nfq` crate and the shell-out is `std::process::Command`, but
//! the division of responsibility is unchanged: workers only
//! read queues and issue verdicts, the supervisor owns installing and tearing down the
//! kernel rules that feed those queues.
//!
//! [`PacketSource`] abstracts over the real queue so the packet pipeline in
//! [`crate::worker`] can be exercised in tests without a real `NFQUEUE` socket.

use std::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("failed to bind nfqueue {queue_id}: {source}")]
    Bind {
        queue_id: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to receive from nfqueue: {0}")]
    Recv(#[source] std::io::Error),
    #[error("failed to set verdict: {0}")]
    Verdict(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// A raw IPv4 datagram pulled off a queue, plus the opaque id the kernel needs back to
/// apply a verdict.
pub struct QueuedPacket {
    pub id: u32,
    pub data: Vec<u8>,
}

/// Abstraction over the kernel packet queue, so workers are testable without root or a
/// real `NFQUEUE` binding.
pub trait PacketSource {
    fn recv(&mut self) -> Result<QueuedPacket, QueueError>;
    fn set_verdict(&mut self, id: u32, verdict: Verdict) -> Result<(), QueueError>;
}

/// Production packet source backed by a real Linux `NFQUEUE`.
///
/// `nfq::Message` (the handle `set_verdict`/`queue.verdict` operate on) is only valid for
/// the packet it was received with, so the source holds onto the most recently received
/// message keyed by its kernel-assigned id until a verdict is issued for it.
pub struct NfqueueSource {
    queue: nfq::Queue,
    pending: std::collections::HashMap<u32, nfq::Message>,
}

impl NfqueueSource {
    pub fn bind(queue_id: u16) -> Result<Self, QueueError> {
        let mut queue = nfq::Queue::open().map_err(|source| QueueError::Bind { queue_id, source })?;
        queue
            .bind(queue_id)
            .map_err(|source| QueueError::Bind { queue_id, source })?;
        Ok(NfqueueSource {
            queue,
            pending: std::collections::HashMap::new(),
        })
    }
}

impl PacketSource for NfqueueSource {
    fn recv(&mut self) -> Result<QueuedPacket, QueueError> {
        let msg = self.queue.recv().map_err(QueueError::Recv)?;
        let id = msg.get_id();
        let data = msg.get_payload().to_vec();
        self.pending.insert(id, msg);
        Ok(QueuedPacket { id, data })
    }

    fn set_verdict(&mut self, id: u32, verdict: Verdict) -> Result<(), QueueError> {
        let Some(mut msg) = self.pending.remove(&id) else {
            return Ok(());
        };
        msg.set_verdict(match verdict {
            Verdict::Accept => nfq::Verdict::Accept,
            Verdict::Drop => nfq::Verdict::Drop,
        });
        self.queue.verdict(msg).map_err(QueueError::Verdict)
    }
}

/// In-memory packet source for tests and for exercising the worker pipeline without a
/// kernel queue. Verdicts are recorded rather than acted on.
#[derive(Default)]
pub struct ChannelSource {
    pub inbox: std::collections::VecDeque<QueuedPacket>,
    pub verdicts: Vec<(u32, Verdict)>,
}

impl ChannelSource {
    pub fn push(&mut self, id: u32, data: Vec<u8>) {
        self.inbox.push_back(QueuedPacket { id, data });
    }
}

impl PacketSource for ChannelSource {
    fn recv(&mut self) -> Result<QueuedPacket, QueueError> {
        self.inbox
            .pop_front()
            .ok_or_else(|| QueueError::Recv(std::io::Error::new(std::io::ErrorKind::WouldBlock, "empty")))
    }

    fn set_verdict(&mut self, id: u32, verdict: Verdict) -> Result<(), QueueError> {
        self.verdicts.push((id, verdict));
        Ok(())
    }
}

/// Redirects local INPUT/OUTPUT traffic into `queue_id` via `iptables`, mirroring the
/// original's `os.system(f"iptables -I {chain} -j NFQUEUE --queue-num {queue_id}")`.
pub fn install_queue_rules(queue_id: u16) -> anyhow::Result<()> {
    for chain in ["INPUT", "OUTPUT"] {
        run_iptables(&["-I", chain, "-j", "NFQUEUE", "--queue-num", &queue_id.to_string()])?;
    }
    Ok(())
}

/// Removes the rules installed by [`install_queue_rules`]. Best-effort: every chain is
/// attempted even if an earlier one fails, and failures are logged rather than propagated,
/// since shutdown must not abort partway through.
pub fn uninstall_queue_rules(queue_id: u16) {
    for chain in ["INPUT", "OUTPUT"] {
        if let Err(e) = run_iptables(&["-D", chain, "-j", "NFQUEUE", "--queue-num", &queue_id.to_string()]) {
            log::warn!("failed to remove iptables rule for queue {queue_id} chain {chain}: {e}");
        }
    }
}

fn run_iptables(args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new("iptables").args(args).status()?;
    anyhow::ensure!(status.success(), "iptables {:?} exited with {status}", args);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_source_recv_is_fifo() {
        let mut src = ChannelSource::default();
        src.push(1, vec![0xAA]);
        src.push(2, vec![0xBB]);
        assert_eq!(src.recv().unwrap().id, 1);
        assert_eq!(src.recv().unwrap().id, 2);
        assert!(src.recv().is_err());
    }

    #[test]
    fn channel_source_records_verdicts() {
        let mut src = ChannelSource::default();
        src.push(1, vec![0x01]);
        let pkt = src.recv().unwrap();
        src.set_verdict(pkt.id, Verdict::Drop).unwrap();
        assert_eq!(src.verdicts, vec![(1, Verdict::Drop)]);
    }
}
