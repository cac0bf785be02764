use anyhow::Context;
use caps::{CapSet, Capability};
use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, info, warn};
use std::io::{self, BufWriter, Stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, thread};

use upcall_monitor::config::Config;
use upcall_monitor::error::{ConfigurationError, ProbeAttachError};
use upcall_monitor::fake_events::DemoProducers;
use upcall_monitor::metrics::Metrics;
use upcall_monitor::pcap::PcapWriter;
use upcall_monitor::pipeline::{CapturePipeline, CaptureSummary};
use upcall_monitor::present::{KeyDecode, PacketDecode, Presenter};
use upcall_monitor::probe;
use upcall_monitor::record::Capacities;
use upcall_monitor::ring::{MemoryRing, RecordSource};
use upcall_ebpf_common::{MAX_CAPTURE_SIZE, MIN_CAPTURE_SIZE};

const DEMO_RATE_ENV: &str = "UPCALL_DEMO_RATE";
const DEMO_MAX_CPUS: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "upcall-monitor")]
#[command(about = "Show Open vSwitch datapath upcalls as they reach ovs-vswitchd")]
struct Args {
    /// ovs-vswitchd's PID; discovered when omitted
    #[arg(short = 'p', long, value_name = "VSWITCHD_PID")]
    pid: Option<i32>,
    /// Maximum packet size to capture, default 64
    #[arg(
        short = 's',
        long,
        value_name = "[64-2048]",
        value_parser = clap::value_parser!(u32).range(MIN_CAPTURE_SIZE as i64..=MAX_CAPTURE_SIZE as i64)
    )]
    packet_size: Option<u32>,
    /// Maximum flow key size to capture, default 64
    #[arg(
        short = 'f',
        long,
        value_name = "[64-2048]",
        value_parser = clap::value_parser!(u32).range(MIN_CAPTURE_SIZE as i64..=MAX_CAPTURE_SIZE as i64)
    )]
    flow_key_size: Option<u32>,
    /// Number of BPF ring buffer pages, default 1024
    #[arg(long, value_name = "NUMBER")]
    buffer_page_count: Option<u32>,
    /// Display packet content in selected mode, default none
    #[arg(short = 'd', long, value_enum)]
    packet_decode: Option<PacketDecode>,
    /// Display flow-key content in selected mode, default none
    #[arg(short = 'k', long, value_enum)]
    flow_key_decode: Option<KeyDecode>,
    /// Write upcall packets to specified pcap file
    #[arg(short = 'w', long, value_name = "PCAP_FILE")]
    pcap: Option<PathBuf>,
    /// Only show upcalls of this type
    #[arg(long, value_name = "TYPE")]
    upcall_type: Option<u32>,
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Feed the pipeline from synthetic producers instead of the kernel
    #[arg(long)]
    demo: bool,
    /// Verbose logging
    #[arg(short = 'D', long)]
    debug: bool,
}

impl Args {
    /// Command line values win over the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(v) = self.packet_size {
            config.capture.packet_size = v;
        }
        if let Some(v) = self.flow_key_size {
            config.capture.flow_key_size = v;
        }
        if let Some(v) = self.buffer_page_count {
            config.capture.buffer_page_count = v;
        }
        if let Some(v) = self.packet_decode {
            config.display.packet_decode = v;
        }
        if let Some(v) = self.flow_key_decode {
            config.display.flow_key_decode = v;
        }
        if self.upcall_type.is_some() {
            config.capture.upcall_type = self.upcall_type;
        }
    }
}

fn init_logging(debug: bool) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if debug {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

fn check_capabilities() -> anyhow::Result<()> {
    if std::env::var("UPCALL_MONITOR_SKIP_CAP_CHECK").is_ok() {
        warn!("Skipping capability check (UPCALL_MONITOR_SKIP_CAP_CHECK set)");
        return Ok(());
    }

    let has_bpf = caps::has_cap(None, CapSet::Effective, Capability::CAP_BPF)
        .context("failed to query CAP_BPF")?;
    let has_perfmon = caps::has_cap(None, CapSet::Effective, Capability::CAP_PERFMON)
        .context("failed to query CAP_PERFMON")?;

    if has_bpf && has_perfmon {
        info!("Running with CAP_BPF + CAP_PERFMON");
        return Ok(());
    }

    eprintln!("\nERROR: Missing required capabilities CAP_BPF and CAP_PERFMON");
    eprintln!("\nFix:");
    eprintln!("  sudo setcap cap_bpf,cap_perfmon,cap_sys_ptrace=ep $(which upcall-monitor)");
    eprintln!("\nOr try --demo to exercise the pipeline without a kernel probe.\n");

    anyhow::bail!("missing CAP_BPF and CAP_PERFMON")
}

fn check_kernel_version(min_major: u32, min_minor: u32) -> anyhow::Result<()> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("failed to read /proc/sys/kernel/osrelease")?;
    let version =
        parse_kernel_version(&release).context("unable to parse kernel release string")?;

    if version < (min_major, min_minor) {
        anyhow::bail!(
            "kernel {}.{} lacks BPF ring buffer support (need >= {}.{})",
            version.0,
            version.1,
            min_major,
            min_minor
        );
    }
    Ok(())
}

fn ensure_environment() -> anyhow::Result<()> {
    check_capabilities()?;
    check_kernel_version(5, 8)?;
    Ok(())
}

fn parse_kernel_version(raw: &str) -> Option<(u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

/// Resolves on Ctrl+C. If the handler cannot be installed the capture runs
/// until killed.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted, draining remaining upcalls"),
        Err(e) => {
            warn!("cannot listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Attach the source, then open the pcap file so a failed attach leaves
/// nothing behind, then poll until Ctrl+C.
async fn capture<S, F>(
    attach: F,
    config: &Config,
    caps: Capacities,
    pcap: Option<&Path>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<CaptureSummary>
where
    S: RecordSource,
    F: FnOnce() -> Result<S, ProbeAttachError>,
{
    let presenter: Presenter<BufWriter<Stdout>> = Presenter::new(
        BufWriter::new(io::stdout()),
        config.display.packet_decode,
        config.display.flow_key_decode,
    );
    let mut pipeline = CapturePipeline::unattached(caps, presenter, metrics)
        .with_upcall_filter(config.capture.upcall_type)
        .with_poll_interval(config.poll_interval());
    pipeline.attach(attach)?;

    if let Some(path) = pcap {
        pipeline
            .presenter_mut()
            .set_pcap(PcapWriter::create(path, caps.packet)?);
        info!("Writing upcall packets to {}", path.display());
    }
    pipeline.run(shutdown_signal()).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let caps = config.capacities()?;
    let pages = config.page_count()?;
    if pages != config.capture.buffer_page_count {
        info!(
            "Rounded ring buffer page count {} up to {pages}",
            config.capture.buffer_page_count
        );
    }
    if let Some(path) = args.pcap.as_deref().filter(|p| p.exists()) {
        return Err(ConfigurationError::PcapExists(path.to_path_buf()).into());
    }

    let metrics = Arc::new(Metrics::new());

    let summary = if args.demo {
        let ring = MemoryRing::with_pages(pages, caps.record_size())?;
        let rate = std::env::var(DEMO_RATE_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(DEMO_MAX_CPUS) as u32;
        let producers = DemoProducers::spawn(ring.producer(), caps, cpus, rate);
        let summary = capture(
            move || Ok(ring),
            &config,
            caps,
            args.pcap.as_deref(),
            metrics,
        )
        .await;
        producers.stop();
        summary?
    } else {
        ensure_environment()?;
        let pid = match args.pid {
            Some(pid) => pid,
            None => probe::discover_target(&config.target.process_name)?,
        };
        info!("Attaching to {} (pid {pid})", config.target.process_name);
        let target = &config.target;
        capture(
            || probe::attach(pid, target, caps, pages),
            &config,
            caps,
            args.pcap.as_deref(),
            metrics,
        )
        .await?
    };

    info!(
        "Captured {} upcall record(s), {} dropped",
        summary.records, summary.dropped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kernel_version_handles_suffixes() {
        assert_eq!(parse_kernel_version("6.18.44-fc-v139\n"), Some((6, 18)));
        assert_eq!(parse_kernel_version("5.8"), Some((5, 8)));
        assert_eq!(parse_kernel_version("garbage"), None);
    }

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "upcall-monitor",
            "--packet-size",
            "128",
            "--flow-key-decode",
            "nlraw",
            "--upcall-type",
            "1",
        ]);
        let mut config = Config::default();
        config.capture.flow_key_size = 256;
        args.apply(&mut config);

        assert_eq!(config.capture.packet_size, 128);
        assert_eq!(config.capture.flow_key_size, 256);
        assert_eq!(config.display.flow_key_decode, KeyDecode::Nlraw);
        assert_eq!(config.capture.upcall_type, Some(1));
    }

    #[test]
    fn capture_size_range_is_enforced() {
        assert!(Args::try_parse_from(["upcall-monitor", "--packet-size", "63"]).is_err());
        assert!(Args::try_parse_from(["upcall-monitor", "--flow-key-size", "2049"]).is_err());
        assert!(Args::try_parse_from(["upcall-monitor", "-s", "2048", "-f", "64"]).is_ok());
    }
}
