//! In-process bounded MPSC record ring.
//!
//! Same contract as the kernel ring buffer: producers reserve a slot with a
//! CAS on the tail, copy their record in, then publish the slot by bumping
//! its sequence number. The consumer only ever advances past a published
//! slot, so delivery follows reservation order and a slow producer holds
//! back everything reserved after it.
//!
//! ```text
//!   slot.seq == pos          free, a producer at `pos` may take it
//!   slot.seq == pos + 1      committed, the consumer at `pos` may read it
//!   slot.seq == pos + cap    released back for the next lap
//! ```

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::debug;

use super::{RING_PAGE_SIZE, RecordOverflow, RecordSource, round_page_count};
use crate::error::ConfigurationError;

/// Per-record bookkeeping the kernel ring buffer charges, mirrored so page
/// counts size both rings alike.
const RECORD_HDR_SZ: usize = 8;

const MIN_SLOTS: usize = 2;

const EMPTY_POLL_STEP: Duration = Duration::from_millis(1);

struct Slot {
    seq: AtomicU64,
    len: UnsafeCell<usize>,
    data: UnsafeCell<Box<[u8]>>,
}

struct Shared {
    slots: Box<[Slot]>,
    slot_size: usize,
    tail: AtomicU64,
    overflow: AtomicU64,
}

// SAFETY: a slot's cells are written only by the producer that won the CAS
// for its position and read only by the consumer after the Release store to
// `seq`; the sequence protocol gives each side exclusive access in turn.
unsafe impl Sync for Shared {}

impl Shared {
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn slot(&self, pos: u64) -> &Slot {
        &self.slots[(pos % self.capacity()) as usize]
    }
}

/// Consumer end. Exactly one exists per ring.
pub struct MemoryRing {
    shared: Arc<Shared>,
    head: u64,
}

/// Cloneable producer end.
#[derive(Clone)]
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl MemoryRing {
    /// Ring sized like a kernel ring buffer of `pages` pages holding records
    /// of `record_size` bytes. `pages` is rounded up to a power of two.
    pub fn with_pages(pages: u32, record_size: usize) -> Result<Self, ConfigurationError> {
        let pages = round_page_count(pages)?;
        let footprint = (record_size + RECORD_HDR_SZ + 7) & !7;
        let slots = (pages as usize * RING_PAGE_SIZE) / footprint.max(1);
        debug!(
            "memory ring: {pages} pages, {slots} slots of {record_size} bytes",
            slots = slots.max(MIN_SLOTS)
        );
        Ok(Self::with_slots(slots, record_size))
    }

    /// Ring with exactly `slots` slots (at least two).
    pub fn with_slots(slots: usize, slot_size: usize) -> Self {
        let slots = slots.max(MIN_SLOTS);
        let slots: Box<[Slot]> = (0..slots)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                len: UnsafeCell::new(0),
                data: UnsafeCell::new(vec![0u8; slot_size].into_boxed_slice()),
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                slots,
                slot_size,
                tail: AtomicU64::new(0),
                overflow: AtomicU64::new(0),
            }),
            head: 0,
        }
    }

    pub fn producer(&self) -> RingProducer {
        RingProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    fn try_pop(&mut self) -> Option<Vec<u8>> {
        let shared = &*self.shared;
        let slot = shared.slot(self.head);
        if slot.seq.load(Ordering::Acquire) != self.head + 1 {
            return None;
        }

        // SAFETY: seq == head + 1 means the producer published this slot and
        // no producer can touch it again until we release it below.
        let record = unsafe {
            let len = *slot.len.get();
            (&(*slot.data.get()))[..len].to_vec()
        };
        slot.seq
            .store(self.head + shared.capacity(), Ordering::Release);
        self.head += 1;
        Some(record)
    }

    fn take_ready(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(record) = self.try_pop() {
            out.push(record);
        }
        out
    }
}

impl RecordSource for MemoryRing {
    fn poll(&mut self, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.take_ready();
            if !batch.is_empty() {
                return batch;
            }
            let now = Instant::now();
            if now >= deadline {
                return batch;
            }
            std::thread::sleep(EMPTY_POLL_STEP.min(deadline - now));
        }
    }

    fn drain_until_empty(&mut self) -> Vec<Vec<u8>> {
        self.take_ready()
    }

    fn overflow_count(&self) -> anyhow::Result<u64> {
        Ok(self.shared.overflow.load(Ordering::Relaxed))
    }
}

impl RingProducer {
    /// Write one record without blocking. Records longer than a slot are
    /// cut to the slot size.
    pub fn write(&self, record: &[u8]) -> Result<(), RecordOverflow> {
        let shared = &*self.shared;
        let mut pos = shared.tail.load(Ordering::Relaxed);
        let slot = loop {
            let slot = shared.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;
            if diff == 0 {
                match shared.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break slot,
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                shared.overflow.fetch_add(1, Ordering::Relaxed);
                return Err(RecordOverflow);
            } else {
                pos = shared.tail.load(Ordering::Relaxed);
            }
        };

        let len = record.len().min(shared.slot_size);
        // SAFETY: the CAS above made this producer the only owner of the slot
        // until the Release store publishes it.
        unsafe {
            (&mut (*slot.data.get()))[..len].copy_from_slice(&record[..len]);
            *slot.len.get() = len;
        }
        slot.seq.store(pos + 1, Ordering::Release);
        Ok(())
    }

    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    #[test]
    fn overflow_counts_exactly_the_excess() {
        let mut ring = MemoryRing::with_slots(4, 8);
        let producer = ring.producer();

        let mut accepted = 0;
        for i in 0..10u8 {
            if producer.write(&[i; 8]).is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);
        assert_eq!(ring.overflow_count().unwrap(), 6);

        let drained = ring.drain_until_empty();
        let firsts: Vec<u8> = drained.iter().map(|r| r[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2, 3]);
        assert!(ring.drain_until_empty().is_empty());
    }

    #[test]
    fn slots_are_reused_after_drain() {
        let mut ring = MemoryRing::with_slots(2, 4);
        let producer = ring.producer();
        for lap in 0..5u8 {
            producer.write(&[lap, 1]).unwrap();
            producer.write(&[lap, 2]).unwrap();
            assert_eq!(producer.write(&[lap, 3]), Err(RecordOverflow));
            assert_eq!(ring.poll(Duration::ZERO), vec![vec![lap, 1], vec![lap, 2]]);
        }
        assert_eq!(ring.overflow_count().unwrap(), 5);
    }

    #[test]
    fn oversized_record_is_cut_to_slot() {
        let mut ring = MemoryRing::with_slots(2, 4);
        ring.producer().write(&[9; 10]).unwrap();
        assert_eq!(ring.drain_until_empty(), vec![vec![9; 4]]);
    }

    #[test]
    fn empty_poll_respects_timeout() {
        let mut ring = MemoryRing::with_slots(2, 4);
        let start = Instant::now();
        assert!(ring.poll(Duration::from_millis(20)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn with_pages_sizes_like_kernel_ring() {
        let ring = MemoryRing::with_pages(1, 80 + 128).unwrap();
        assert_eq!(ring.capacity(), RING_PAGE_SIZE / 216);
        assert!(MemoryRing::with_pages(0, 80).is_err());
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        const PRODUCERS: u8 = 4;
        const PER_PRODUCER: u32 = 2000;

        let mut ring = MemoryRing::with_slots(64, 5);
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let producer = ring.producer();
                thread::spawn(move || {
                    for n in 0..PER_PRODUCER {
                        let mut rec = [id, 0, 0, 0, 0];
                        rec[1..].copy_from_slice(&n.to_le_bytes());
                        let _ = producer.write(&rec);
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while handles.iter().any(|h| !h.is_finished()) {
            received.extend(ring.poll(Duration::from_millis(1)));
        }
        for h in handles {
            h.join().unwrap();
        }
        received.extend(ring.drain_until_empty());

        let total = u64::from(PRODUCERS) * u64::from(PER_PRODUCER);
        assert_eq!(
            received.len() as u64 + ring.overflow_count().unwrap(),
            total
        );

        let mut last: HashMap<u8, u32> = HashMap::new();
        for rec in &received {
            let n = u32::from_le_bytes(rec[1..5].try_into().unwrap());
            if let Some(prev) = last.insert(rec[0], n) {
                assert!(n > prev, "producer {} went backwards", rec[0]);
            }
        }
    }
}
