/// Field offsets inside kernel structures, resolved by the agent for the running
/// kernel and stored in the `KERNEL_OFFSETS` map. A zero offset means unknown.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(default))]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelOffsets {
    /// `task_struct.thread.fsbase` (x86_64) or `task_struct.thread.uw.tp_value` (aarch64)
    pub task_tls_base: u32,
    /// `task_struct.group_leader`
    pub task_group_leader: u32,
    /// `task_struct.thread_pid`
    pub task_thread_pid: u32,
    /// `pid.level`
    pub pid_level: u32,
    /// `pid.numbers`
    pub pid_numbers: u32,
    /// `sizeof(struct upid)`
    pub upid_size: u32,
    /// `upid.ns`
    pub upid_ns: u32,
    /// `pid_namespace.ns.inum`
    pub pid_ns_inum: u32,
}

impl KernelOffsets {
    pub fn has_tls(&self) -> bool {
        self.task_tls_base != 0
    }

    pub fn has_pid_ns(&self) -> bool {
        self.task_thread_pid != 0 && self.pid_numbers != 0 && self.upid_size != 0
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for KernelOffsets {}
