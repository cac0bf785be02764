pub mod config;
pub mod error;
pub mod fake_events;
pub mod metrics;
pub mod pcap;
pub mod pipeline;
pub mod present;
pub mod probe;
pub mod record;
pub mod registry;
pub mod ring;
pub mod tlv;
pub mod usdt;

pub use config::{Config, TargetConfig};
pub use error::{ConfigurationError, ProbeAttachError};
pub use metrics::Metrics;
pub use pipeline::{CapturePipeline, CaptureSummary, PipelineState};
pub use record::{Capacities, UpcallEvent};
pub use ring::{KernelRing, MemoryRing, RecordSource};
