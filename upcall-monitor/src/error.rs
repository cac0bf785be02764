//! Fatal error taxonomy.
//!
//! Both kinds abort before (or during) attachment. Non-fatal conditions, flow
//! key truncation and ring overflow, are not errors: they are carried as
//! [`crate::tlv::DecodeTruncation`]s and counters respectively.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid capture parameters. Reported before any probe is attached.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{what} must be between {min} and {max} bytes, got {value}")]
    CaptureSize {
        what: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("ring buffer page count must be greater than zero")]
    ZeroPages,

    #[error("ring buffer page count {0} cannot be rounded to a power of two")]
    PageCountTooLarge(u32),

    #[error("destination capture file \"{}\" already exists", .0.display())]
    PcapExists(PathBuf),

    #[error("cannot create capture file {}: {source}", path.display())]
    PcapCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {message}", path.display())]
    File { path: PathBuf, message: String },
}

/// Failure to locate the target or to get the probe program attached to it.
#[derive(Debug, Error)]
pub enum ProbeAttachError {
    #[error("failed to find a running {process_name} process; pass --pid explicitly")]
    TargetNotFound { process_name: String },

    #[error("multiple {process_name} processes running ({pids:?}), use the --pid option")]
    MultipleTargets { process_name: String, pids: Vec<i32> },

    #[error("cannot inspect process {pid}: {message}")]
    Process { pid: i32, message: String },

    #[error("failed to read target binary {}: {source}", path.display())]
    Binary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ELF {}: {message}", path.display())]
    Elf { path: PathBuf, message: String },

    #[error(
        "no USDT probe {provider}:{probe} in {}; rebuild the target with USDT probe support enabled",
        binary.display()
    )]
    ProbeNotFound {
        provider: String,
        probe: String,
        binary: PathBuf,
    },

    #[error("USDT argument decoding is not supported for {0} binaries")]
    UnsupportedArch(String),

    #[error("cannot decode USDT argument spec \"{args}\": {reason}")]
    ArgSpec { args: String, reason: String },

    #[error("{0}")]
    BpfObject(String),

    #[error("failed to load BPF object: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("BPF program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("BPF map error: {0}")]
    Map(#[from] aya::maps::MapError),
}
