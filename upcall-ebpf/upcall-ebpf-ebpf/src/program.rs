use core::cmp;
use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_smp_processor_id, bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_user,
        bpf_probe_read_user_buf, bpf_probe_read_user_str_bytes,
    },
    macros::{map, uprobe},
    maps::{PerCpuArray, RingBuf},
    programs::ProbeContext,
    EbpfContext,
};
use aya_log_ebpf::debug;
use upcall_ebpf_common::{
    usdt_arg, CaptureConfig, UpcallRecord, UsdtSpec, DROP_COUNTER_SLOTS, MAX_CAPTURE_SIZE,
    UPCALL_HEADER_SIZE, USDT_MAX_ARGS,
};

/// Default ring size; userspace overrides it with `set_max_entries` before load.
const DEFAULT_RING_BYTES: u32 = 1024 * 4096;

const EINVAL: i64 = 22;
const ENOMEM: i64 = 12;

// =============================================================================
// MAPS
// =============================================================================
//
// EVENTS:  BPF_MAP_TYPE_RINGBUF shared by every CPU. Producers never wait on a
//          full ring; the record is dropped and DROPCNT is bumped instead.
// DROPCNT: per-CPU drop counter, slot 0. Userspace sums it at shutdown.
// SCRATCH: per-CPU staging record; too large for the 512 byte BPF stack.

#[map(name = "EVENTS")]
static EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RING_BYTES, 0);

#[map(name = "DROPCNT")]
static DROPCNT: PerCpuArray<u64> = PerCpuArray::with_max_entries(DROP_COUNTER_SLOTS, 0);

#[map(name = "SCRATCH")]
static SCRATCH: PerCpuArray<UpcallRecord> = PerCpuArray::with_max_entries(1, 0);

// =============================================================================
// LOAD-TIME GLOBALS
// =============================================================================
//
// Both are rewritten by userspace through EbpfLoader::set_global before the
// object is loaded, so the program never sees the zeroed defaults in practice.

#[no_mangle]
static CAPTURE_CONFIG: CaptureConfig = CaptureConfig::zeroed();

#[no_mangle]
static USDT_SPEC: UsdtSpec = UsdtSpec::zeroed();

#[inline(always)]
fn load_config() -> CaptureConfig {
    unsafe { core::ptr::read_volatile(&CAPTURE_CONFIG) }
}

#[inline(always)]
fn load_spec() -> UsdtSpec {
    unsafe { core::ptr::read_volatile(&USDT_SPEC) }
}

#[inline(always)]
fn clamp_capacity(capacity: u32) -> usize {
    cmp::min(capacity, MAX_CAPTURE_SIZE) as usize
}

#[inline(always)]
fn count_drop() {
    if let Some(ptr) = DROPCNT.get_ptr_mut(0) {
        // SAFETY: the map value is a live, 8-byte aligned per-CPU slot.
        let counter = unsafe { AtomicU64::from_ptr(ptr) };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read USDT argument `idx` (zero-based) as described by the probe site spec.
#[inline(always)]
fn usdt_arg(ctx: &ProbeContext, spec: &UsdtSpec, idx: usize) -> Result<u64, i64> {
    if idx >= USDT_MAX_ARGS || idx >= spec.arg_cnt as usize {
        return Err(-EINVAL);
    }
    let arg = &spec.args[idx];

    let raw = match arg.kind {
        usdt_arg::CONST => arg.val_off as u64,
        usdt_arg::REG => read_reg(ctx, arg.reg_off)?,
        usdt_arg::REG_DEREF => {
            let base = read_reg(ctx, arg.reg_off)?;
            let addr = (base as i64).wrapping_add(arg.val_off) as *const u64;
            unsafe { bpf_probe_read_user(addr) }?
        }
        _ => return Err(-EINVAL),
    };

    let shifted = raw.wrapping_shl(arg.bitshift);
    let value = if arg.signed != 0 {
        ((shifted as i64).wrapping_shr(arg.bitshift)) as u64
    } else {
        shifted.wrapping_shr(arg.bitshift)
    };
    Ok(value)
}

#[inline(always)]
fn read_reg(ctx: &ProbeContext, reg_off: u32) -> Result<u64, i64> {
    let regs = ctx.regs as *const u8;
    let ptr = unsafe { regs.add(reg_off as usize) } as *const u64;
    unsafe { bpf_probe_read_kernel(ptr) }
}

#[uprobe]
pub fn recv_upcall(ctx: ProbeContext) -> u32 {
    match try_recv_upcall(&ctx) {
        Ok(()) => 0,
        Err(_) => {
            // Every upcall that does not reach the ring is counted.
            count_drop();
            1
        }
    }
}

fn try_recv_upcall(ctx: &ProbeContext) -> Result<(), i64> {
    let cfg = load_config();
    let spec = load_spec();

    let record = match SCRATCH.get_ptr_mut(0) {
        Some(ptr) => unsafe { &mut *ptr },
        None => return Err(-ENOMEM),
    };

    let header = &mut record.header;
    header.ts_ns = unsafe { bpf_ktime_get_ns() };
    header.cpu = unsafe { bpf_get_smp_processor_id() };
    // Thread id: handler threads are what the table distinguishes.
    header.pid = bpf_get_current_pid_tgid() as u32;
    header.comm = ctx.command().unwrap_or([0u8; 16]);

    // arg 1: datapath name
    header.dpif_name = [0u8; 32];
    let dpif_ptr = usdt_arg(ctx, &spec, 0)?;
    let _ = unsafe { bpf_probe_read_user_str_bytes(dpif_ptr as *const u8, &mut header.dpif_name) };

    // arg 2: upcall type, arg 4: packet length, arg 6: key length
    header.upcall_type = usdt_arg(ctx, &spec, 1)? as u32;
    header.pkt_size = usdt_arg(ctx, &spec, 3)? as u32;
    header.key_size = usdt_arg(ctx, &spec, 5)?;

    let pkt_cap = clamp_capacity(cfg.packet_capacity);
    let key_cap = clamp_capacity(cfg.key_capacity);

    // arg 3: packet buffer
    let pkt_len = cmp::min(header.pkt_size as usize, pkt_cap);
    if pkt_len > 0 {
        let pkt_ptr = usdt_arg(ctx, &spec, 2)?;
        if let Some(dst) = record.data.get_mut(..pkt_len) {
            let _ = unsafe { bpf_probe_read_user_buf(pkt_ptr as *const u8, dst) };
        }
    }

    // arg 5: flow key buffer, stored right after the packet region
    let key_len = cmp::min(record.header.key_size, key_cap as u64) as usize;
    if key_len > 0 {
        let key_ptr = usdt_arg(ctx, &spec, 4)?;
        if let Some(dst) = record.data.get_mut(pkt_cap..pkt_cap + key_len) {
            let _ = unsafe { bpf_probe_read_user_buf(key_ptr as *const u8, dst) };
        }
    }

    let total = cmp::min(
        UPCALL_HEADER_SIZE + pkt_cap + key_cap,
        size_of::<UpcallRecord>(),
    );
    let bytes =
        unsafe { core::slice::from_raw_parts(record as *const UpcallRecord as *const u8, total) };

    if EVENTS.output(bytes, 0).is_err() {
        debug!(ctx, "ring full, upcall dropped");
        return Err(-ENOMEM);
    }

    Ok(())
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
