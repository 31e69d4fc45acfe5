//! Turns the `[[python]]` entries of the config into what the kernel side reads:
//! one [`PidConfig`] per pid for dispatch and one [`PyPidData`] descriptor per
//! Python process.

use fnv::FnvHashMap;
use pyperf_common::python::offsets::Offset;
use pyperf_common::python::state::{
    LibcDescriptor, PidConfig, ProfilingType, PyAllocSizes, PyPidData,
};
use pyperf_common::python::thread::{GLIBC_KEYS_1STBLOCK, MUSL_KEYS_MAX};
use pyperf_common::tracemgmt::{PidEvent, PidOp};

use crate::config::{ConfigError, LibcKind, PythonProcess, Sampling};

impl LibcKind {
    pub fn descriptor(self, pthread_size: Option<i16>, tsd: Option<i16>) -> LibcDescriptor {
        let mut libc = match self {
            LibcKind::Glibc => LibcDescriptor::glibc_x86_64(),
            LibcKind::Musl11 => LibcDescriptor::musl_1_1_x86_64(),
            LibcKind::Musl12 => LibcDescriptor::musl_1_2_x86_64(),
        };
        if let Some(size) = pthread_size {
            libc.pthread_size = Offset(size);
        }
        if let Some(tsd) = tsd {
            libc.tsd = Offset(tsd);
        }
        libc
    }

    fn max_keys(self) -> i32 {
        match self {
            LibcKind::Glibc => GLIBC_KEYS_1STBLOCK,
            LibcKind::Musl11 | LibcKind::Musl12 => MUSL_KEYS_MAX,
        }
    }
}

/// Descriptor of one configured process.
pub fn build(p: &PythonProcess, sampling: &Sampling) -> Result<PyPidData, ConfigError> {
    let mut data = PyPidData::for_version(p.version).ok_or(ConfigError::UnsupportedVersion {
        pid: p.pid,
        version: p.version,
    })?;

    if !(0..p.libc.max_keys()).contains(&p.tss_key) {
        return Err(ConfigError::TssKeyOutOfRange { pid: p.pid, key: p.tss_key, libc: p.libc });
    }
    for (field, value) in [("pthread_size", p.pthread_size), ("tsd", p.tsd)] {
        if let Some(value) = value.filter(|v| *v < 0) {
            return Err(ConfigError::BadOffset { pid: p.pid, field, value });
        }
    }
    // without these no frame can be read at all
    for (name, addr) in [("code", p.types.code), ("unicode", p.types.unicode)] {
        if addr == 0 {
            return Err(ConfigError::UnresolvedType { pid: p.pid, name });
        }
    }

    data.types = p.types;
    // allocation sizes are checked against glibc chunk headers only
    data.sizes = match p.libc {
        LibcKind::Glibc => p.sizes,
        LibcKind::Musl11 | LibcKind::Musl12 => PyAllocSizes::default(),
    };
    data.tss_key = p.tss_key;
    data.libc = p.libc.descriptor(p.pthread_size, p.tsd);
    data.collect_kernel = sampling.collect_kernel as u8;
    Ok(data)
}

/// Settings that are accepted but leave part of the walk unchecked or
/// unresolved.
pub fn warnings(p: &PythonProcess) -> Vec<String> {
    let mut out = Vec::new();
    let mut missing = Vec::new();
    for (name, addr) in [("tuple", p.types.tuple), ("type_", p.types.type_)] {
        if addr == 0 {
            missing.push(name);
        }
    }
    if !missing.is_empty() {
        out.push(format!(
            "pid {}: types.{} not set, class names are not resolved",
            p.pid,
            missing.join(" and types.")
        ));
    }
    if p.types.cell == 0 {
        out.push(format!("pid {}: types.cell not set, closed-over self is not unwrapped", p.pid));
    }
    let frames_owned = p.version.offsets().map_or(false, |o| o.py_frame.owner.is_present());
    if p.types.frame == 0 && !frames_owned {
        out.push(format!("pid {}: types.frame not set, frame objects are not type checked", p.pid));
    }
    if p.libc != LibcKind::Glibc && p.sizes != PyAllocSizes::default() {
        out.push(format!("pid {}: sizes are ignored for {:?}", p.pid, p.libc));
    }
    out
}

/// What the controller writes back for a pid event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Python(PidConfig, PyPidData),
    Native(PidConfig),
    NotProfiled,
    /// The process is gone, drop its descriptor.
    Forget,
}

/// Answers the kernel's classification requests from the configured process list.
#[derive(Debug, Clone)]
pub struct Classifier {
    descriptors: FnvHashMap<u32, PyPidData>,
    collect_user: bool,
    collect_kernel: bool,
    native: bool,
    /// Everything else is not profiled
    only: Option<u32>,
}

impl Classifier {
    pub fn new(processes: &[PythonProcess], sampling: &Sampling) -> Result<Self, ConfigError> {
        let descriptors = processes
            .iter()
            .map(|p| Ok((p.pid, build(p, sampling)?)))
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self {
            descriptors,
            collect_user: sampling.collect_user,
            collect_kernel: sampling.collect_kernel,
            native: sampling.native,
            only: None,
        })
    }

    /// Profiles `pid` alone.
    pub fn restrict_to(mut self, pid: u32) -> Self {
        self.only = Some(pid);
        self
    }

    /// Configured processes that are in scope.
    pub fn descriptors(&self) -> impl Iterator<Item = (&u32, &PyPidData)> {
        self.descriptors
            .iter()
            .filter(move |(pid, _)| self.only.map_or(true, |only| only == **pid))
    }

    pub fn classify_pid(&self, pid: u32) -> Classification {
        if self.only.map_or(false, |only| only != pid) {
            return Classification::NotProfiled;
        }
        match self.descriptors.get(&pid) {
            Some(data) => Classification::Python(
                PidConfig::new(ProfilingType::Python, self.collect_user, self.collect_kernel),
                *data,
            ),
            None if self.native => Classification::Native(PidConfig::new(
                ProfilingType::FramePointers,
                self.collect_user,
                self.collect_kernel,
            )),
            None => Classification::NotProfiled,
        }
    }

    /// `None` for an op this agent doesn't know.
    pub fn classify(&self, event: &PidEvent) -> Option<Classification> {
        Some(match event.op()? {
            PidOp::RequestUnknownProcessInfo | PidOp::RequestExecProcessInfo => {
                self.classify_pid(event.pid)
            }
            PidOp::Dead => Classification::Forget,
        })
    }
}
