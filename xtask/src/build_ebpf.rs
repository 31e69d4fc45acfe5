use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context as _};
use clap::Parser;

#[derive(Debug, Copy, Clone)]
pub enum Architecture {
    BpfEl,
    BpfEb,
}

impl std::str::FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bpfel-unknown-none" => Architecture::BpfEl,
            "bpfeb-unknown-none" => Architecture::BpfEb,
            _ => return Err("invalid target".to_owned()),
        })
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Architecture::BpfEl => "bpfel-unknown-none",
            Architecture::BpfEb => "bpfeb-unknown-none",
        })
    }
}

#[derive(Debug, Parser)]
pub struct Options {
    /// Set the endianness of the BPF target
    #[clap(default_value = "bpfel-unknown-none", long)]
    pub target: Architecture,
    /// Build the release target
    #[clap(long)]
    pub release: bool,
}

/// The object records the host architecture it was built for; the agent
/// refuses to load it anywhere else.
pub fn host_arch_feature() -> Result<&'static str, anyhow::Error> {
    if cfg!(target_arch = "aarch64") {
        Ok("aarch64")
    } else if cfg!(target_arch = "x86_64") {
        Ok("x86_64")
    } else {
        bail!("unsupported host architecture")
    }
}

pub fn build_ebpf(opts: &Options, check_only: bool) -> Result<(), anyhow::Error> {
    let dir = PathBuf::from("pyperf-ebpf");
    let target = format!("--target={}", opts.target);
    let arch = host_arch_feature()?;
    let mut args = vec![
        "+nightly",
        if check_only { "check" } else { "build" },
        target.as_str(),
        "--features",
        arch,
        "-Z",
        "build-std=core",
    ];
    if opts.release {
        args.push("--release")
    }
    let status = Command::new("cargo")
        .current_dir(&dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(&args)
        .status()
        .context("failed to run cargo for pyperf-ebpf")?;
    if !status.success() {
        bail!("building pyperf-ebpf failed: {status}");
    }
    Ok(())
}
