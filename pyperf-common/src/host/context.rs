use crate::context::{PidNsEntry, SampleContext};
use crate::mem::{ProcessMemory, ReadFault};
use crate::metrics::{PyError, SampleError};
use crate::pidtgid::PidTgid;

use super::SparseMemory;

/// A sample as the kernel would have seen it: which task, on which cpu, and
/// the memory of its process.
#[derive(Clone, Debug)]
pub struct HostContext {
    mem: SparseMemory,
    cpu: u32,
    pid_tgid: PidTgid,
    ns_levels: Vec<PidNsEntry>,
    tls: Option<u64>,
    kernel_stack: i64,
    user_stack: i64,
}

impl HostContext {
    pub fn new(mem: SparseMemory) -> Self {
        Self {
            mem,
            cpu: 0,
            pid_tgid: PidTgid::default(),
            ns_levels: Vec::new(),
            tls: None,
            kernel_stack: -1,
            user_stack: -1,
        }
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_pid(mut self, pid_tgid: PidTgid) -> Self {
        self.pid_tgid = pid_tgid;
        self
    }

    pub fn with_tls(mut self, tls: u64) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Namespace levels from the root down.
    pub fn with_ns_levels(mut self, levels: Vec<PidNsEntry>) -> Self {
        self.ns_levels = levels;
        self
    }

    pub fn with_stack_ids(mut self, kernel: i64, user: i64) -> Self {
        self.kernel_stack = kernel;
        self.user_stack = user;
        self
    }

    pub fn memory_mut(&mut self) -> &mut SparseMemory {
        &mut self.mem
    }
}

impl ProcessMemory for HostContext {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadFault> {
        self.mem.read_bytes(addr, buf)
    }
}

impl SampleContext for HostContext {
    fn cpu(&self) -> u32 {
        self.cpu
    }

    fn pid_tgid(&self) -> PidTgid {
        self.pid_tgid
    }

    fn pid_ns_entry(&self, level: u32) -> Option<PidNsEntry> {
        self.ns_levels.get(level as usize).copied()
    }

    fn tls_base(&self) -> Result<u64, SampleError> {
        self.tls.ok_or(PyError::BadTlsBase.at(0))
    }

    fn kernel_stack_id(&self) -> i64 {
        self.kernel_stack
    }

    fn user_stack_id(&self) -> i64 {
        self.user_stack
    }
}
