#![allow(non_camel_case_types)]
#![cfg_attr(not(any(test, feature = "user")), no_std)]

pub mod aggregate;
pub mod context;
pub mod dispatch;
pub mod hash;
pub mod kernel;
pub mod maps;
pub mod mem;
pub mod metrics;
pub mod pidtgid;
pub mod python;
pub mod tracemgmt;

#[cfg(any(test, feature = "user"))]
pub mod host;

/// Keys of the `CONFIG` map.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigMapKey {
    /// Device number of the agent's pid namespace
    DEV = 0,
    /// Inode of the agent's pid namespace. 0 means samples use flat pids.
    INO = 1,
}

/// Maximum number of nested pid namespaces walked when resolving a pid.
pub const MAX_PID_NS_LEVELS: u32 = 8;

/// Names of every map the kernel object must define.
pub const REQUIRED_MAPS: &[&str] = &[
    "CONFIG",
    "KERNEL_OFFSETS",
    "PIDS",
    "PY_PID_CONFIG",
    "PY_SYMBOLS",
    "PY_STACKS",
    "COUNTS",
    "ERRORS",
    "PID_EVENTS",
    "DIAGNOSTICS",
    "PY_STATE_HEAP",
    "PY_PROGS",
    "KERNEL_STACKS",
    "USER_STACKS",
];

/// Symbol carrying the architecture a kernel object was built for.
pub const ARCH_SYMBOL: &str = "PYPERF_ARCH";
pub const ARCH_X86_64: u32 = 1;
pub const ARCH_AARCH64: u32 = 2;
