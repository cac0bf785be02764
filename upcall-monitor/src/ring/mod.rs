//! Record channels between upcall producers and the single consumer.
//!
//! Both sources hand out whole records in commit order and keep a count of
//! records producers had to throw away because the ring was full.

use std::time::Duration;

use thiserror::Error;

use crate::error::ConfigurationError;

pub mod kernel;
pub mod memory;

pub use kernel::KernelRing;
pub use memory::{MemoryRing, RingProducer};

/// Page size used when sizing the in-process ring.
pub const RING_PAGE_SIZE: usize = 4096;

/// Page count used when nothing else is configured.
pub const DEFAULT_PAGE_COUNT: u32 = 1024;

/// A producer found the ring full and dropped its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring buffer full, record dropped")]
pub struct RecordOverflow;

/// Consumer side of a record channel.
pub trait RecordSource {
    /// Collect what has been committed, waiting at most `timeout` for the
    /// first record.
    fn poll(&mut self, timeout: Duration) -> Vec<Vec<u8>>;

    /// Collect everything that is committed right now.
    fn drain_until_empty(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let batch = self.poll(Duration::ZERO);
            if batch.is_empty() {
                return out;
            }
            out.extend(batch);
        }
    }

    /// Records dropped by producers so far.
    fn overflow_count(&self) -> anyhow::Result<u64>;
}

/// Round a requested page count up to the next power of two.
pub fn round_page_count(pages: u32) -> Result<u32, ConfigurationError> {
    if pages == 0 {
        return Err(ConfigurationError::ZeroPages);
    }
    pages
        .checked_next_power_of_two()
        .ok_or(ConfigurationError::PageCountTooLarge(pages))
}
