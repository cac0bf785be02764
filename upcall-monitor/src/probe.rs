//! Finding the datapath daemon and attaching the upcall probe to it.

use std::fs;
use std::path::{Path, PathBuf};

use std::num::NonZeroU32;

use aya::programs::UProbe;
use aya::programs::uprobe::UProbeScope;
use aya::{Ebpf, EbpfLoader, Pod};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use procfs::process::{Process, all_processes};
use upcall_ebpf_common::{CaptureConfig, USDT_MAX_ARGS, UsdtSpec};

use crate::config::TargetConfig;
use crate::error::ProbeAttachError;
use crate::record::Capacities;
use crate::ring::KernelRing;
use crate::ring::kernel::EVENTS_MAP;
use crate::usdt::{self, ProbeSite};

/// Environment override for the BPF object location.
pub const BPF_PATH_ENV: &str = "UPCALL_MONITOR_BPF_PATH";

const BPF_OBJECT_NAME: &str = "upcall-ebpf-ebpf";
const PROGRAM_NAME: &str = "recv_upcall";

#[repr(transparent)]
#[derive(Copy, Clone)]
struct CaptureConfigPod(CaptureConfig);

unsafe impl Pod for CaptureConfigPod {}

#[repr(transparent)]
#[derive(Copy, Clone)]
struct UsdtSpecPod(UsdtSpec);

unsafe impl Pod for UsdtSpecPod {}

/// Pick the single process whose name contains `process_name`.
pub fn select_target<I>(process_name: &str, candidates: I) -> Result<i32, ProbeAttachError>
where
    I: IntoIterator<Item = (i32, String)>,
{
    let pids: Vec<i32> = candidates
        .into_iter()
        .filter(|(_, comm)| comm.contains(process_name))
        .map(|(pid, _)| pid)
        .collect();

    match pids.as_slice() {
        [] => Err(ProbeAttachError::TargetNotFound {
            process_name: process_name.to_string(),
        }),
        [pid] => Ok(*pid),
        _ => Err(ProbeAttachError::MultipleTargets {
            process_name: process_name.to_string(),
            pids,
        }),
    }
}

/// Scan `/proc` for the target daemon.
pub fn discover_target(process_name: &str) -> Result<i32, ProbeAttachError> {
    let procs = all_processes().map_err(|e| ProbeAttachError::Process {
        pid: 0,
        message: e.to_string(),
    })?;
    // Processes can exit mid-scan; those are simply skipped.
    let candidates = procs
        .flatten()
        .filter_map(|p| p.stat().ok().map(|stat| (p.pid, stat.comm)));
    select_target(process_name, candidates)
}

fn target_binary(pid: i32) -> Result<PathBuf, ProbeAttachError> {
    Process::new(pid)
        .and_then(|p| p.exe())
        .map_err(|e| ProbeAttachError::Process {
            pid,
            message: e.to_string(),
        })
}

/// Candidate BPF object locations, install location first.
fn bpf_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(format!("/usr/local/share/upcall-monitor/{BPF_OBJECT_NAME}")),
        PathBuf::from(format!("/usr/local/share/upcall-monitor/{BPF_OBJECT_NAME}.o")),
    ];
    for prefix in ["target", "../target", "../../target"] {
        for profile in ["release", "debug"] {
            paths.push(PathBuf::from(format!(
                "{prefix}/bpfel-unknown-none/{profile}/{BPF_OBJECT_NAME}"
            )));
        }
    }
    paths
}

/// Locate and read the probe object: environment, then config, then the
/// search paths.
pub fn read_bpf_object(configured: Option<&Path>) -> Result<(Vec<u8>, PathBuf), ProbeAttachError> {
    let explicit = std::env::var_os(BPF_PATH_ENV)
        .map(PathBuf::from)
        .or_else(|| configured.map(Path::to_path_buf));
    if let Some(path) = explicit {
        let data = fs::read(&path).map_err(|e| {
            ProbeAttachError::BpfObject(format!(
                "failed to read BPF object {}: {e}",
                path.display()
            ))
        })?;
        return Ok((data, path));
    }

    let candidates = bpf_search_paths();
    for candidate in &candidates {
        if candidate.exists() {
            let data = fs::read(candidate).map_err(|e| {
                ProbeAttachError::BpfObject(format!(
                    "failed to read BPF object {}: {e}",
                    candidate.display()
                ))
            })?;
            return Ok((data, candidate.clone()));
        }
    }

    let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
    Err(ProbeAttachError::BpfObject(format!(
        "BPF object '{BPF_OBJECT_NAME}' not found. Searched:\n  {}\n\nSet {BPF_PATH_ENV} to specify a custom location",
        searched.join("\n  ")
    )))
}

fn system_page_size() -> u32 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u32::try_from(size).unwrap_or(4096)
}

/// Sites that share the first site's argument layout. The probe program
/// carries a single layout, so the rest cannot be decoded.
fn usable_sites(sites: Vec<ProbeSite>) -> Vec<ProbeSite> {
    let Some(first) = sites.first().map(|s| s.spec) else {
        return sites;
    };
    sites
        .into_iter()
        .filter(|site| {
            let same = site.spec == first;
            if !same {
                warn!(
                    "skipping probe site at {:#x}: argument layout \"{}\" differs from the first site",
                    site.pc, site.args
                );
            }
            same
        })
        .collect()
}

/// The probe program reads all six `recv_upcall` arguments on every hit.
fn check_arg_count(site: &ProbeSite) -> Result<(), ProbeAttachError> {
    if site.spec.arg_cnt as usize == USDT_MAX_ARGS {
        return Ok(());
    }
    Err(ProbeAttachError::ArgSpec {
        args: site.args.clone(),
        reason: format!(
            "probe site at {:#x} carries {} argument(s), {USDT_MAX_ARGS} are required",
            site.pc, site.spec.arg_cnt
        ),
    })
}

/// Load the probe object sized for `caps` and `pages` ring pages, attach it
/// to every matching probe site in `pid`, and hand back the ring.
pub fn attach(
    pid: i32,
    target: &TargetConfig,
    caps: Capacities,
    pages: u32,
) -> Result<KernelRing, ProbeAttachError> {
    let binary = target_binary(pid)?;
    let image = usdt::read_binary(&binary)?;
    let sites = usable_sites(usdt::find_probes(
        &image,
        &binary,
        &target.provider,
        &target.probe,
    )?);
    let Some(first) = sites.first() else {
        return Err(ProbeAttachError::ProbeNotFound {
            provider: target.provider.clone(),
            probe: target.probe.clone(),
            binary,
        });
    };
    check_arg_count(first)?;
    debug!(
        "{}:{} args \"{}\" at {} site(s)",
        target.provider,
        target.probe,
        first.args,
        sites.len()
    );

    let (bpf_bytes, chosen) = read_bpf_object(target.bpf_object.as_deref())?;
    info!("Using BPF object: {}", chosen.display());

    let ring_bytes = pages.saturating_mul(system_page_size());
    let capture = CaptureConfigPod(caps.as_config());
    let spec = UsdtSpecPod(first.spec);
    let mut loader = EbpfLoader::new();
    loader
        .set_global("CAPTURE_CONFIG", &capture, true)
        .set_global("USDT_SPEC", &spec, true)
        .set_max_entries(EVENTS_MAP, ring_bytes);
    let mut bpf = loader.load(&bpf_bytes)?;

    let logger = match EbpfLogger::init(&mut bpf) {
        Ok(logger) => {
            info!("BPF logger initialized.");
            Some(logger)
        }
        Err(e) => {
            warn!("BPF logger not active: {e}");
            None
        }
    };

    attach_sites(&mut bpf, pid, &binary, &sites)?;
    info!(
        "Attached {}:{} to pid {pid} ({} site(s), ring {ring_bytes} bytes)",
        target.provider,
        target.probe,
        sites.len()
    );

    KernelRing::new(bpf, logger)
}

fn attach_sites(
    bpf: &mut Ebpf,
    pid: i32,
    binary: &Path,
    sites: &[ProbeSite],
) -> Result<(), ProbeAttachError> {
    let program: &mut UProbe = bpf
        .program_mut(PROGRAM_NAME)
        .ok_or_else(|| ProbeAttachError::BpfObject(format!("{PROGRAM_NAME} program not found")))?
        .try_into()?;
    program.load()?;

    for site in sites {
        if site.semaphore != 0 {
            warn!(
                "probe site at {:#x} is guarded by semaphore {:#x}; it only fires once another tracer enables it",
                site.pc, site.semaphore
            );
        }
        let scope = match u32::try_from(pid).ok() {
            None => UProbeScope::AllProcesses,
            Some(p) => NonZeroU32::new(p).map_or(UProbeScope::CallingProcess, UProbeScope::OneProcess),
        };
        program.attach(site.file_offset, binary, scope)?;
    }
    Ok(())
}
