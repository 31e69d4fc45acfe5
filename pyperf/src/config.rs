use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs::File, io::Read};

use pyperf_common::kernel::KernelOffsets;
use pyperf_common::python::state::{PyAllocSizes, PyTypeRefs};
use pyperf_common::python::PythonVersion;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub const DEFAULT_CONFIG: &str = "Pyperf.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PyperfConfig {
    /// Default filter when `RUST_LOG` isn't set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub bpf: Bpf,
    #[serde(default)]
    pub sampling: Sampling,
    /// Offsets into kernel structures for the running kernel. Without them
    /// every Python sample fails to find its thread pointer.
    pub kernel: Option<KernelOffsets>,
    #[serde(default)]
    pub export: Export,
    #[serde(default)]
    pub python: Vec<PythonProcess>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Bpf {
    /// Compiled kernel object. Defaults to the xtask output for this profile.
    pub object: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Sampling {
    /// Samples per second per cpu
    pub frequency: u64,
    /// 0 runs until interrupted
    pub duration_secs: u64,
    pub collect_kernel: bool,
    pub collect_user: bool,
    /// Report pids as seen from the agent's pid namespace
    pub pid_namespace: bool,
    /// Count native stacks of processes that aren't listed under `[[python]]`
    pub native: bool,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            frequency: 97,
            duration_secs: 10,
            collect_kernel: false,
            collect_user: true,
            pid_namespace: true,
            native: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Export {
    pub path: PathBuf,
}

impl Default for Export {
    fn default() -> Self {
        Self { path: PathBuf::from("pyperf.json") }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibcKind {
    #[serde(rename = "glibc")]
    Glibc,
    #[serde(rename = "musl-1.1")]
    Musl11,
    #[serde(rename = "musl-1.2")]
    Musl12,
}

/// One Python process and the addresses the controller resolved for it.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PythonProcess {
    pub pid: u32,
    #[serde(deserialize_with = "version_from_str")]
    pub version: PythonVersion,
    pub libc: LibcKind,
    pub tss_key: i32,
    /// `sizeof(struct pthread)` where the thread pointer sits past the TCB (aarch64)
    pub pthread_size: Option<i16>,
    /// Override of the pthread specific data offset
    pub tsd: Option<i16>,
    #[serde(default)]
    pub types: PyTypeRefs,
    #[serde(default)]
    pub sizes: PyAllocSizes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sampling frequency must be positive")]
    ZeroFrequency,
    #[error("pid {0} is listed more than once")]
    DuplicatePid(u32),
    #[error("pid {pid}: no known layout for Python {version}")]
    UnsupportedVersion { pid: u32, version: PythonVersion },
    #[error("pid {pid}: tss_key {key} is out of range for {libc:?}")]
    TssKeyOutOfRange { pid: u32, key: i32, libc: LibcKind },
    #[error("pid {pid}: type object `{name}` is not resolved")]
    UnresolvedType { pid: u32, name: &'static str },
    #[error("pid {pid}: negative {field} offset {value}")]
    BadOffset { pid: u32, field: &'static str, value: i16 },
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn version_from_str<'de, D: Deserializer<'de>>(d: D) -> Result<PythonVersion, D::Error> {
    String::deserialize(d)?.parse().map_err(serde::de::Error::custom)
}

impl PyperfConfig {
    pub fn new() -> Result<Self> {
        Self::from_path(DEFAULT_CONFIG)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let current_dir = std::env::current_dir().context("unable to get current dir")?;
        let mut config_file = File::open(path)
            .with_context(move || format!("{} not found in {current_dir:?}", path.display()))?;
        let mut contents = String::new();
        config_file
            .read_to_string(&mut contents)
            .with_context(|| format!("something went wrong reading {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: PyperfConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Checks everything that can be checked without a kernel, so a bad config
    /// fails before anything gets loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.frequency == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        let mut seen = HashSet::new();
        for p in &self.python {
            if !seen.insert(p.pid) {
                return Err(ConfigError::DuplicatePid(p.pid));
            }
            crate::descriptor::build(p, &self.sampling)?;
        }
        Ok(())
    }
}
