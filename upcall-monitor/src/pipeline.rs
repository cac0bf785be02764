//! The capture loop: poll the ring, decode, present, and account for drops
//! on the way out.

use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};

use crate::error::ProbeAttachError;
use crate::metrics::Metrics;
use crate::present::Presenter;
use crate::record::{Capacities, UpcallEvent};
use crate::ring::RecordSource;

/// Poll interval used when nothing else is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No source yet; see [`CapturePipeline::attach`].
    Unattached,
    Attached,
    Polling,
    ShuttingDown,
    Stopped,
}

/// What a finished capture saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Records drained from the ring, filtered ones included.
    pub records: u64,
    /// Records producers dropped because the ring was full.
    pub dropped: u64,
}

/// Owns the record source and the presenter for one capture session.
pub struct CapturePipeline<S: RecordSource, W: Write, P: Write = BufWriter<File>> {
    source: Option<S>,
    caps: Capacities,
    presenter: Presenter<W, P>,
    metrics: Arc<Metrics>,
    upcall_filter: Option<u32>,
    poll_interval: Duration,
    state: PipelineState,
}

impl<S: RecordSource, W: Write, P: Write> CapturePipeline<S, W, P> {
    /// A pipeline over a source that is already producing.
    pub fn new(
        source: S,
        caps: Capacities,
        presenter: Presenter<W, P>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut pipeline = Self::unattached(caps, presenter, metrics);
        pipeline.source = Some(source);
        pipeline.state = PipelineState::Attached;
        pipeline
    }

    /// A pipeline waiting for [`CapturePipeline::attach`].
    pub fn unattached(caps: Capacities, presenter: Presenter<W, P>, metrics: Arc<Metrics>) -> Self {
        Self {
            source: None,
            caps,
            presenter,
            metrics,
            upcall_filter: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: PipelineState::Unattached,
        }
    }

    /// Run `attach` and take its source. On failure the pipeline stays
    /// unattached. A pipeline that already has a source keeps it and `attach`
    /// is not called.
    pub fn attach<F>(&mut self, attach: F) -> Result<(), ProbeAttachError>
    where
        F: FnOnce() -> Result<S, ProbeAttachError>,
    {
        if self.state != PipelineState::Unattached {
            return Ok(());
        }
        self.source = Some(attach()?);
        self.state = PipelineState::Attached;
        Ok(())
    }

    /// Only present upcalls of this type.
    pub fn with_upcall_filter(mut self, upcall_type: Option<u32>) -> Self {
        self.upcall_filter = upcall_type;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn presenter(&self) -> &Presenter<W, P> {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut Presenter<W, P> {
        &mut self.presenter
    }

    pub fn into_presenter(self) -> Presenter<W, P> {
        self.presenter
    }

    fn dispatch(&mut self, records: Vec<Vec<u8>>) {
        let record_size = self.caps.record_size();
        for raw in records {
            if raw.len() < record_size {
                self.metrics.record_undersized();
            }
            let ev = UpcallEvent::from_bytes(&raw, self.caps);
            if self.upcall_filter.is_some_and(|t| t != ev.upcall_type) {
                self.metrics.record_filtered();
                continue;
            }

            match self.presenter.present(&ev) {
                Ok(presented) => {
                    if presented.key_truncated {
                        self.metrics.record_key_truncation();
                    }
                    if presented.pcap_written {
                        self.metrics.record_pcap_packet();
                    }
                }
                Err(e) => {
                    self.metrics.record_present_error();
                    warn!("failed to present upcall from pid {}: {e}", ev.pid);
                }
            }
        }
    }

    /// Drain once without waiting. Returns how many records were handled.
    pub fn poll_once(&mut self) -> usize {
        let Some(source) = self.source.as_mut() else {
            return 0;
        };
        let records = source.poll(Duration::ZERO);
        let n = records.len();
        self.metrics.record_poll(n);
        self.dispatch(records);
        n
    }

    /// Poll until `shutdown` resolves, then drain what is left and report
    /// drops.
    pub async fn run<F>(&mut self, shutdown: F) -> anyhow::Result<CaptureSummary>
    where
        F: Future<Output = ()>,
    {
        if self.source.is_none() {
            anyhow::bail!("capture pipeline started before a source was attached");
        }
        self.presenter
            .write_header()
            .context("failed to write table header")?;
        self.state = PipelineState::Polling;
        info!(
            "Polling for upcalls every {:?}; press Ctrl+C to stop",
            self.poll_interval
        );

        tokio::pin!(shutdown);
        loop {
            self.poll_once();
            if let Err(e) = self.presenter.flush() {
                warn!("failed to flush output: {e}");
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.state = PipelineState::ShuttingDown;
        let rest = self
            .source
            .as_mut()
            .map(|s| s.drain_until_empty())
            .unwrap_or_default();
        debug!("final drain: {} record(s)", rest.len());
        self.metrics.record_poll(rest.len());
        self.dispatch(rest);
        if let Err(e) = self.presenter.flush() {
            warn!("failed to flush output: {e}");
        }

        let dropped = match self.source.as_ref() {
            Some(source) => source
                .overflow_count()
                .context("failed to read the drop counter")?,
            None => 0,
        };
        if dropped > 0 {
            warn!(
                "Not all upcalls were captured, {dropped} were dropped! Increase the BPF ring buffer size with the --buffer-page-count option."
            );
        }
        debug!("capture metrics: {}", self.metrics.summary());

        self.state = PipelineState::Stopped;
        Ok(CaptureSummary {
            records: self.metrics.records_received(),
            dropped,
        })
    }
}
