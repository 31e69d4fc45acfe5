use crate::mem::ProcessMemory;
use crate::metrics::SampleError;
use crate::pidtgid::PidTgid;
use crate::python::state::PythonSymbol;

/// One level of the current task's pid namespace hierarchy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PidNsEntry {
    /// Inode of the namespace at this level
    pub inode: u64,
    /// Thread group id as seen from that namespace
    pub tgid: u32,
}

/// What the interrupted context can see: the current task and the memory of
/// the process it belongs to.
pub trait SampleContext: ProcessMemory {
    fn cpu(&self) -> u32;

    /// Pids as seen from the root namespace.
    fn pid_tgid(&self) -> PidTgid;

    /// Namespace at `level` of the current task's thread group leader, `None`
    /// past the deepest level.
    fn pid_ns_entry(&self, level: u32) -> Option<PidNsEntry>;

    /// User thread pointer saved in the task (`fsbase` on x86_64, `tp_value`
    /// on aarch64).
    fn tls_base(&self) -> Result<u64, SampleError>;

    /// Id in the kernel stack table, negative on failure.
    fn kernel_stack_id(&self) -> i64;

    /// Id in the user stack table, negative on failure.
    fn user_stack_id(&self) -> i64;

    /// Zeroes the scratch symbol before it is filled. The kernel can't memset
    /// a buffer this size from a program, so the BPF side overrides this.
    fn clear_symbol(&self, sym: &mut PythonSymbol) {
        *sym = PythonSymbol::default();
    }
}
