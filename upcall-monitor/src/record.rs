//! Owned view of one upcall record drained from a ring.

use upcall_ebpf_common::{
    CaptureConfig, DPIF_NAME_LEN, MAX_CAPTURE_SIZE, MIN_CAPTURE_SIZE, TASK_COMM_LEN,
    UPCALL_HEADER_SIZE, UpcallHeader,
};

use crate::error::ConfigurationError;

/// Packet and flow key capture capacities, validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    pub packet: u32,
    pub key: u32,
}

impl Capacities {
    pub fn new(packet: u32, key: u32) -> Result<Self, ConfigurationError> {
        check_size("packet size", packet)?;
        check_size("flow key size", key)?;
        Ok(Self { packet, key })
    }

    pub fn record_size(&self) -> usize {
        self.as_config().record_size()
    }

    pub fn as_config(&self) -> CaptureConfig {
        CaptureConfig {
            packet_capacity: self.packet,
            key_capacity: self.key,
        }
    }
}

fn check_size(what: &'static str, value: u32) -> Result<(), ConfigurationError> {
    if (MIN_CAPTURE_SIZE..=MAX_CAPTURE_SIZE).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::CaptureSize {
            what,
            value,
            min: MIN_CAPTURE_SIZE,
            max: MAX_CAPTURE_SIZE,
        })
    }
}

/// A decoded upcall.
///
/// `pkt_size` and `key_size` are what the datapath declared; `packet` and
/// `key` hold only what was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcallEvent {
    pub ts_ns: u64,
    pub cpu: u32,
    pub pid: u32,
    pub comm: String,
    pub dpif_name: String,
    pub upcall_type: u32,
    pub pkt_size: u32,
    pub key_size: u64,
    pub packet: Vec<u8>,
    pub key: Vec<u8>,
}

impl UpcallEvent {
    /// Decode a raw ring slot. Never fails: short input reads as zeros.
    pub fn from_bytes(raw: &[u8], caps: Capacities) -> Self {
        let size = caps.record_size();
        let mut slot;
        let raw = if raw.len() < size {
            slot = raw.to_vec();
            slot.resize(size, 0);
            &slot[..]
        } else {
            &raw[..size]
        };

        let header: UpcallHeader = bytemuck::pod_read_unaligned(&raw[..UPCALL_HEADER_SIZE]);
        let pkt_region = &raw[UPCALL_HEADER_SIZE..UPCALL_HEADER_SIZE + caps.packet as usize];
        let key_region = &raw[UPCALL_HEADER_SIZE + caps.packet as usize..];

        let pkt_len = header.pkt_size.min(caps.packet) as usize;
        let key_len = header.key_size.min(u64::from(caps.key)) as usize;

        Self {
            ts_ns: header.ts_ns,
            cpu: header.cpu,
            pid: header.pid,
            comm: c_str(&header.comm),
            dpif_name: c_str(&header.dpif_name),
            upcall_type: header.upcall_type,
            pkt_size: header.pkt_size,
            key_size: header.key_size,
            packet: pkt_region[..pkt_len].to_vec(),
            key: key_region[..key_len].to_vec(),
        }
    }

    /// Serialize into the wire layout the kernel program produces.
    ///
    /// Names longer than their budget are cut; captured regions longer than
    /// the capacity are cut.
    pub fn encode(&self, caps: Capacities) -> Vec<u8> {
        let mut header = UpcallHeader::zeroed();
        header.ts_ns = self.ts_ns;
        header.cpu = self.cpu;
        header.pid = self.pid;
        header.upcall_type = self.upcall_type;
        header.pkt_size = self.pkt_size;
        header.key_size = self.key_size;
        fill_name::<TASK_COMM_LEN>(&mut header.comm, &self.comm);
        fill_name::<DPIF_NAME_LEN>(&mut header.dpif_name, &self.dpif_name);

        let mut out = vec![0u8; caps.record_size()];
        out[..UPCALL_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));

        let pkt_cap = caps.packet as usize;
        let pkt = &self.packet[..self.packet.len().min(pkt_cap)];
        out[UPCALL_HEADER_SIZE..UPCALL_HEADER_SIZE + pkt.len()].copy_from_slice(pkt);

        let key_start = UPCALL_HEADER_SIZE + pkt_cap;
        let key = &self.key[..self.key.len().min(caps.key as usize)];
        out[key_start..key_start + key.len()].copy_from_slice(key);
        out
    }

    pub fn captured_packet_len(&self) -> usize {
        self.packet.len()
    }
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn fill_name<const N: usize>(dst: &mut [u8; N], src: &str) {
    let n = src.len().min(N);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capacities {
        Capacities::new(64, 64).unwrap()
    }

    fn sample() -> UpcallEvent {
        UpcallEvent {
            ts_ns: 1_234_567_890,
            cpu: 3,
            pid: 4242,
            comm: "handler1".into(),
            dpif_name: "system@ovs-system".into(),
            upcall_type: 0,
            pkt_size: 98,
            key_size: 20,
            packet: (0..64u8).collect(),
            key: vec![0xab; 20],
        }
    }

    #[test]
    fn capacities_reject_out_of_range() {
        assert!(Capacities::new(63, 64).is_err());
        assert!(Capacities::new(64, 2049).is_err());
        assert!(Capacities::new(2048, 2048).is_ok());
    }

    #[test]
    fn encode_decode_keeps_declared_sizes() {
        let ev = sample();
        let raw = ev.encode(caps());
        assert_eq!(raw.len(), UPCALL_HEADER_SIZE + 128);

        let back = UpcallEvent::from_bytes(&raw, caps());
        assert_eq!(back, ev);
        assert_eq!(back.pkt_size, 98);
        assert_eq!(back.captured_packet_len(), 64);
    }

    #[test]
    fn short_slot_is_zero_extended() {
        let raw = sample().encode(caps());
        let back = UpcallEvent::from_bytes(&raw[..UPCALL_HEADER_SIZE + 10], caps());
        assert_eq!(back.pid, 4242);
        assert_eq!(back.packet.len(), 64);
        assert_eq!(&back.packet[..10], &(0..10u8).collect::<Vec<_>>()[..]);
        assert!(back.packet[10..].iter().all(|&b| b == 0));
        assert!(back.key.iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_slot_decodes_to_defaults() {
        let back = UpcallEvent::from_bytes(&[], caps());
        assert_eq!(back.ts_ns, 0);
        assert!(back.comm.is_empty());
        assert!(back.packet.is_empty());
        assert!(back.key.is_empty());
    }

    #[test]
    fn name_without_nul_uses_whole_budget() {
        let mut ev = sample();
        ev.comm = "a-very-long-thread-name".into();
        let back = UpcallEvent::from_bytes(&ev.encode(caps()), caps());
        assert_eq!(back.comm, "a-very-long-thre");
        assert_eq!(back.comm.len(), TASK_COMM_LEN);
    }

    #[test]
    fn huge_declared_key_is_clamped() {
        let mut ev = sample();
        ev.key_size = u64::MAX;
        ev.key = vec![1; 64];
        let back = UpcallEvent::from_bytes(&ev.encode(caps()), caps());
        assert_eq!(back.key.len(), 64);
        assert_eq!(back.key_size, u64::MAX);
    }
}
