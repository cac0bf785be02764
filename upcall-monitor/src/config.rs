use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use upcall_ebpf_common::DEFAULT_CAPTURE_SIZE;

use crate::error::ConfigurationError;
use crate::present::{KeyDecode, PacketDecode};
use crate::record::Capacities;
use crate::ring::{DEFAULT_PAGE_COUNT, round_page_count};

const DEFAULT_CONFIG_PATH: &str = "/etc/upcall-monitor/upcall-monitor.toml";
pub const ENV_CONFIG_PATH: &str = "UPCALL_MONITOR_CONFIG";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub target: TargetConfig,
}

impl Config {
    /// Load configuration from `explicit`, else the `UPCALL_MONITOR_CONFIG`
    /// environment variable, else the default path. A missing file yields
    /// defaults; a file that fails to parse is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigurationError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        match fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).map_err(|message| ConfigurationError::File {
                path: path.clone(),
                message,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound && explicit.is_none() => {
                Ok(Config::default())
            }
            Err(e) => Err(ConfigurationError::File {
                path,
                message: e.to_string(),
            }),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }

    pub fn capacities(&self) -> Result<Capacities, ConfigurationError> {
        Capacities::new(self.capture.packet_size, self.capture.flow_key_size)
    }

    /// Ring page count, rounded up to a power of two.
    pub fn page_count(&self) -> Result<u32, ConfigurationError> {
        round_page_count(self.capture.buffer_page_count)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.capture.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaptureSettings {
    #[serde(default = "default_capture_size")]
    pub packet_size: u32,
    #[serde(default = "default_capture_size")]
    pub flow_key_size: u32,
    #[serde(default = "default_buffer_page_count")]
    pub buffer_page_count: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Only show upcalls of this type.
    #[serde(default)]
    pub upcall_type: Option<u32>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            packet_size: default_capture_size(),
            flow_key_size: default_capture_size(),
            buffer_page_count: default_buffer_page_count(),
            poll_interval_ms: default_poll_interval_ms(),
            upcall_type: None,
        }
    }
}

fn default_capture_size() -> u32 {
    DEFAULT_CAPTURE_SIZE
}
fn default_buffer_page_count() -> u32 {
    DEFAULT_PAGE_COUNT
}
fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DisplayConfig {
    #[serde(default)]
    pub packet_decode: PacketDecode,
    #[serde(default)]
    pub flow_key_decode: KeyDecode,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_probe")]
    pub probe: String,
    /// Explicit probe object; `UPCALL_MONITOR_BPF_PATH` still wins.
    #[serde(default)]
    pub bpf_object: Option<PathBuf>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            provider: default_provider(),
            probe: default_probe(),
            bpf_object: None,
        }
    }
}

fn default_process_name() -> String {
    "ovs-vswitchd".to_string()
}
fn default_provider() -> String {
    "dpif_recv".to_string()
}
fn default_probe() -> String {
    "recv_upcall".to_string()
}
