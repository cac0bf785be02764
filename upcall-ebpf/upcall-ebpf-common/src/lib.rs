#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// UPCALL RECORD - Shared Wire Layout
// =============================================================================
//
// One record is emitted per `dpif_recv:recv_upcall` USDT hit. The kernel side
// writes a fixed header followed by two capacity-bounded regions:
//
//   [0..80]                        UpcallHeader
//   [80..80+packet_capacity]       packet prefix
//   [..+key_capacity]              flow key prefix
//
// Capacities are chosen before the program is loaded (CAPTURE_CONFIG global)
// and cannot change while it is attached.
// =============================================================================

/// Length of the kernel `comm` field.
pub const TASK_COMM_LEN: usize = 16;

/// Byte budget for the datapath interface name (e.g. `system@ovs-system`).
pub const DPIF_NAME_LEN: usize = 32;

/// Smallest accepted packet / flow key capture size.
pub const MIN_CAPTURE_SIZE: u32 = 64;

/// Largest accepted packet / flow key capture size.
pub const MAX_CAPTURE_SIZE: u32 = 2048;

/// Capture size used when nothing else is configured.
pub const DEFAULT_CAPTURE_SIZE: u32 = 64;

/// Data area of the kernel scratch record: room for both regions at maximum size.
pub const MAX_RECORD_DATA: usize = 2 * MAX_CAPTURE_SIZE as usize;

/// Number of logical slots in the per-CPU drop counter map.
pub const DROP_COUNTER_SLOTS: u32 = 1;

/// Number of arguments `recv_upcall` passes.
pub const USDT_MAX_ARGS: usize = 6;

/// Fixed metadata at the front of every upcall record.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(
    all(feature = "user", not(target_os = "none")),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct UpcallHeader {
    /// bpf_ktime_get_ns() at probe time.
    pub ts_ns: u64,
    /// Flow key length as declared by the datapath.
    pub key_size: u64,
    pub cpu: u32,
    pub pid: u32,
    pub upcall_type: u32,
    /// Packet length as declared by the datapath.
    pub pkt_size: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub dpif_name: [u8; DPIF_NAME_LEN],
}

/// Size of [`UpcallHeader`] on the wire.
pub const UPCALL_HEADER_SIZE: usize = size_of::<UpcallHeader>();

impl UpcallHeader {
    pub const fn zeroed() -> Self {
        Self {
            ts_ns: 0,
            key_size: 0,
            cpu: 0,
            pid: 0,
            upcall_type: 0,
            pkt_size: 0,
            comm: [0; TASK_COMM_LEN],
            dpif_name: [0; DPIF_NAME_LEN],
        }
    }
}

/// Per-CPU scratch area the kernel program assembles a record in before
/// copying the used prefix into the ring.
#[repr(C)]
pub struct UpcallRecord {
    pub header: UpcallHeader,
    pub data: [u8; MAX_RECORD_DATA],
}

/// Capture capacities handed to the kernel program at load time.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(
    all(feature = "user", not(target_os = "none")),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct CaptureConfig {
    pub packet_capacity: u32,
    pub key_capacity: u32,
}

impl CaptureConfig {
    pub const fn zeroed() -> Self {
        Self {
            packet_capacity: 0,
            key_capacity: 0,
        }
    }

    /// Total serialized size of one record with these capacities.
    pub const fn record_size(&self) -> usize {
        UPCALL_HEADER_SIZE + self.packet_capacity as usize + self.key_capacity as usize
    }
}

/// USDT argument location kinds.
pub mod usdt_arg {
    /// `N@$imm`: the value is the immediate itself.
    pub const CONST: u32 = 0;
    /// `N@%reg`: the value lives in a register.
    pub const REG: u32 = 1;
    /// `N@off(%reg)`: the value lives in memory at register + offset.
    pub const REG_DEREF: u32 = 2;
}

/// Decoded location of one USDT argument.
///
/// `reg_off` is the byte offset of the register inside `struct pt_regs`.
/// The raw 64-bit read is narrowed with `(v << bitshift) >> bitshift`,
/// arithmetic when `signed` is non-zero.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(
    all(feature = "user", not(target_os = "none")),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct UsdtArgSpec {
    pub val_off: i64,
    pub kind: u32,
    pub reg_off: u32,
    pub bitshift: u32,
    pub signed: u32,
}

impl UsdtArgSpec {
    pub const fn zeroed() -> Self {
        Self {
            val_off: 0,
            kind: usdt_arg::CONST,
            reg_off: 0,
            bitshift: 0,
            signed: 0,
        }
    }
}

/// Argument layout of the attached probe site.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(
    all(feature = "user", not(target_os = "none")),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct UsdtSpec {
    pub args: [UsdtArgSpec; USDT_MAX_ARGS],
    pub arg_cnt: u32,
    pub _pad: u32,
}

impl UsdtSpec {
    pub const fn zeroed() -> Self {
        Self {
            args: [UsdtArgSpec::zeroed(); USDT_MAX_ARGS],
            arg_cnt: 0,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_packed() {
        assert_eq!(UPCALL_HEADER_SIZE, 80, "header must stay 80 bytes");
        assert_eq!(
            UPCALL_HEADER_SIZE % 8,
            0,
            "wire format should be 8-byte aligned"
        );
    }

    #[test]
    fn record_size_adds_both_regions() {
        let cfg = CaptureConfig {
            packet_capacity: 128,
            key_capacity: 256,
        };
        assert_eq!(cfg.record_size(), UPCALL_HEADER_SIZE + 384);
    }

    #[test]
    fn scratch_holds_largest_record() {
        let cfg = CaptureConfig {
            packet_capacity: MAX_CAPTURE_SIZE,
            key_capacity: MAX_CAPTURE_SIZE,
        };
        assert!(cfg.record_size() <= size_of::<UpcallRecord>());
    }

    #[test]
    fn usdt_spec_has_no_padding_holes() {
        assert_eq!(size_of::<UsdtArgSpec>(), 24);
        assert_eq!(size_of::<UsdtSpec>(), 24 * USDT_MAX_ARGS + 8);
    }

    #[cfg(feature = "user")]
    #[test]
    fn capture_config_roundtrip() {
        let cfg = CaptureConfig {
            packet_capacity: 64,
            key_capacity: 2048,
        };

        let json = serde_json::to_string(&cfg).expect("serialize capture config");
        let roundtrip: CaptureConfig = serde_json::from_str(&json).expect("deserialize config");
        assert_eq!(roundtrip, cfg);
    }
}
