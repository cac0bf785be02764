use anyhow::{Context, Result};
use std::process::Command;

const EBPF_PACKAGE: &str = "upcall-ebpf-ebpf";
const EBPF_TARGET: &str = "bpfel-unknown-none";
const EBPF_TOOLCHAIN: &str = "nightly-2024-12-10";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: cargo xtask <command> [--debug]");
        eprintln!("Commands:");
        eprintln!("  build-ebpf    Build the recv_upcall probe object");
        std::process::exit(1);
    }

    let release = !args[2..].iter().any(|a| a == "--debug");
    match args[1].as_str() {
        "build-ebpf" => build_ebpf(release),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            std::process::exit(1);
        }
    }
}

fn build_ebpf(release: bool) -> Result<()> {
    which::which("bpf-linker")
        .context("bpf-linker not found in PATH; install it with `cargo install bpf-linker`")?;

    let mut cmd = Command::new("cargo");
    cmd.args([
        "build",
        "--package",
        EBPF_PACKAGE,
        "--target",
        EBPF_TARGET,
        "-Z",
        "build-std=core",
    ]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .env("RUSTUP_TOOLCHAIN", EBPF_TOOLCHAIN)
        .status()
        .context("Failed to execute cargo build for eBPF")?;

    if !status.success() {
        anyhow::bail!("eBPF build failed with exit code: {}", status);
    }

    let profile = if release { "release" } else { "debug" };
    println!("built target/{EBPF_TARGET}/{profile}/{EBPF_PACKAGE}");
    Ok(())
}
