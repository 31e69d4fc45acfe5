use std::process::Command;

use anyhow::{bail, Context as _};
use clap::Parser;

use crate::build_ebpf::{build_ebpf, Architecture, Options as BuildOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Set the endianness of the BPF target
    #[clap(default_value = "bpfel-unknown-none", long)]
    pub bpf_target: Architecture,
    /// Build and run the release target
    #[clap(long)]
    pub release: bool,
    /// Build only
    #[clap(long)]
    pub build: bool,
    /// The command used to wrap your application
    #[clap(short, long, default_value = "sudo -E")]
    pub runner: String,
    /// Arguments to pass to your application
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

/// Build the agent
pub fn build(opts: &Options) -> Result<(), anyhow::Error> {
    let mut args = vec!["build", "-p", "pyperf"];
    if opts.release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(args)
        .status()
        .context("failed to build userspace")?;
    if !status.success() {
        bail!("building pyperf failed: {status}");
    }
    Ok(())
}

pub fn run(opts: Options) -> Result<(), anyhow::Error> {
    // build our ebpf program followed by our application
    build_ebpf(
        &BuildOptions {
            target: opts.bpf_target,
            release: opts.release,
        },
        false,
    )
    .context("Error while building eBPF program")?;
    build(&opts).context("Error while building userspace application")?;

    if opts.build {
        return Ok(());
    }

    // profile we are building (release or debug)
    let profile = if opts.release { "release" } else { "debug" };
    let bin_path = format!("target/{profile}/pyperf");

    // configure args
    let mut args: Vec<_> = opts.runner.trim().split_terminator(' ').collect();
    args.push(bin_path.as_str());
    args.extend(opts.run_args.iter().map(String::as_str));

    let Some((program, rest)) = args.split_first() else {
        bail!("empty runner");
    };
    let mut child = Command::new(program)
        .args(rest)
        .spawn()
        .with_context(|| format!("failed to run `{}`", args.join(" ")))?;

    // ctrl-c reaches the agent too; it stops on its own and we wait for it
    let _ = ctrlc::set_handler(|| {});
    let status = child.wait()?;
    if !status.success() {
        bail!("pyperf exited with {status}");
    }
    Ok(())
}
