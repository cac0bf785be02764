//! Consumer for the BPF ring buffer the upcall probe writes into.

use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use aya::Ebpf;
use aya::maps::{MapData, PerCpuArray, RingBuf};
use aya_log::EbpfLogger;
use log::warn;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use super::RecordSource;
use crate::error::ProbeAttachError;

/// Name of the ring buffer map in the BPF object.
pub const EVENTS_MAP: &str = "EVENTS";

/// Name of the per-CPU drop counter map in the BPF object.
pub const DROP_COUNTER_MAP: &str = "DROPCNT";

/// Live ring buffer plus the BPF objects that must outlive it.
pub struct KernelRing {
    ring: RingBuf<MapData>,
    drops: PerCpuArray<MapData, u64>,
    // Dropping these detaches the probes.
    _bpf: Ebpf,
    _logger: Option<EbpfLogger<&'static dyn log::Log>>,
}

impl KernelRing {
    /// Take the ring and drop counter maps out of a loaded, attached object.
    pub fn new(mut bpf: Ebpf, logger: Option<EbpfLogger<&'static dyn log::Log>>) -> Result<Self, ProbeAttachError> {
        let events = bpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| ProbeAttachError::BpfObject(format!("{EVENTS_MAP} map not found")))?;
        let ring = RingBuf::try_from(events)?;

        let drops = bpf.take_map(DROP_COUNTER_MAP).ok_or_else(|| {
            ProbeAttachError::BpfObject(format!("{DROP_COUNTER_MAP} map not found"))
        })?;
        let drops = PerCpuArray::try_from(drops)?;

        Ok(Self {
            ring,
            drops,
            _bpf: bpf,
            _logger: logger,
        })
    }

    fn take_ready(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(item) = self.ring.next() {
            out.push(item.to_vec());
        }
        out
    }
}

/// Wait up to `timeout` for `fd` to become readable. An interrupted or
/// failed wait reads as not ready.
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> bool {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(n) => n > 0,
        Err(Errno::EINTR) => false,
        Err(e) => {
            warn!("ring buffer poll failed: {e}");
            false
        }
    }
}

impl RecordSource for KernelRing {
    fn poll(&mut self, timeout: Duration) -> Vec<Vec<u8>> {
        let batch = self.take_ready();
        if !batch.is_empty() || timeout.is_zero() {
            return batch;
        }
        if wait_readable(self.ring.as_fd(), timeout) {
            self.take_ready()
        } else {
            batch
        }
    }

    fn overflow_count(&self) -> anyhow::Result<u64> {
        let per_cpu = self.drops.get(&0, 0)?;
        Ok(per_cpu.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn wait_times_out_on_idle_fd() {
        let (rx, _tx) = UnixStream::pair().unwrap();
        let start = Instant::now();
        assert!(!wait_readable(rx.as_fd(), Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wait_returns_once_data_is_pending() {
        let (rx, mut tx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();
        let start = Instant::now();
        assert!(wait_readable(rx.as_fd(), Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn zero_timeout_does_not_block() {
        let (rx, _tx) = UnixStream::pair().unwrap();
        assert!(!wait_readable(rx.as_fd(), Duration::ZERO));
    }
}
