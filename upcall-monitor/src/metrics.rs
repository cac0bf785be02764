use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Counters for one capture session.
///
/// Updated from the poll loop and read by whoever holds a clone of the
/// `Arc`, so all fields are atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    records_received: AtomicU64,
    records_filtered: AtomicU64,
    records_undersized: AtomicU64,
    key_truncations: AtomicU64,
    pcap_packets: AtomicU64,
    present_errors: AtomicU64,
    polls: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            records_received: AtomicU64::new(0),
            records_filtered: AtomicU64::new(0),
            records_undersized: AtomicU64::new(0),
            key_truncations: AtomicU64::new(0),
            pcap_packets: AtomicU64::new(0),
            present_errors: AtomicU64::new(0),
            polls: AtomicU64::new(0),
        }
    }

    pub fn record_poll(&self, records: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.records_received
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.records_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// A record shorter than the configured record size arrived.
    pub fn record_undersized(&self) {
        self.records_undersized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_truncation(&self) {
        self.key_truncations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pcap_packet(&self) {
        self.pcap_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_present_error(&self) {
        self.present_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_received(&self) -> u64 {
        self.records_received.load(Ordering::Relaxed)
    }

    pub fn records_filtered(&self) -> u64 {
        self.records_filtered.load(Ordering::Relaxed)
    }

    pub fn records_undersized(&self) -> u64 {
        self.records_undersized.load(Ordering::Relaxed)
    }

    pub fn key_truncations(&self) -> u64 {
        self.key_truncations.load(Ordering::Relaxed)
    }

    pub fn pcap_packets(&self) -> u64 {
        self.pcap_packets.load(Ordering::Relaxed)
    }

    pub fn present_errors(&self) -> u64 {
        self.present_errors.load(Ordering::Relaxed)
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.start_time)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// One-line summary for the shutdown log.
    pub fn summary(&self) -> String {
        format!(
            "polls={} received={} filtered={} undersized={} key_truncated={} pcap={} present_errors={} uptime={}s",
            self.polls(),
            self.records_received(),
            self.records_filtered(),
            self.records_undersized(),
            self.key_truncations(),
            self.pcap_packets(),
            self.present_errors(),
            self.uptime_secs()
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
