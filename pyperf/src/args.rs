use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pyperf_common::python::PythonVersion;

use crate::config::DEFAULT_CONFIG;

#[derive(Debug, Parser)]
#[clap(name = "pyperf", version, about = "Sampling profiler for Python processes")]
pub struct Opt {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample stacks system wide and write the aggregated profile as JSON
    Run {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Only profile this pid
        #[clap(short, long)]
        pid: Option<u32>,
        /// Samples per second per cpu, overrides the config
        #[clap(short, long)]
        frequency: Option<u64>,
        /// Seconds to sample, 0 runs until Ctrl-C
        #[clap(short, long)]
        duration: Option<u64>,
        /// Output file, overrides the config
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the offset table used for a Python version
    Offsets {
        /// e.g. 3.11 or 3.11.4
        version: PythonVersion,
    },
    /// Validate a config file without loading anything
    CheckConfig {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}
