use crate::metrics::{Diagnostic, ErrorKind, SampleError};
use crate::python::state::{PidConfig, PyPidData, PythonStack, PythonSymbol, SampleKey};
use crate::tracemgmt::PidEvent;
use crate::ConfigMapKey;

/// Why an insert-if-absent didn't happen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// Someone else inserted the key first
    Exists,
    /// The map is at capacity
    Full,
}

/// The shared, bounded maps. Every operation touches a single key and is
/// atomic on its own; nothing here blocks or takes a lock across calls.
pub trait ProfileMaps {
    fn config_value(&self, key: ConfigMapKey) -> Option<u64>;

    fn pid_config(&self, pid: u32) -> Option<PidConfig>;
    fn insert_pid_config(&self, pid: u32, config: &PidConfig) -> Result<(), InsertError>;
    fn remove_pid_config(&self, pid: u32) -> bool;
    /// Copies the descriptor of `pid` into `out`, `false` if there is none.
    fn copy_pid_data(&self, pid: u32, out: &mut PyPidData) -> bool;

    fn symbol_id(&self, sym: &PythonSymbol) -> Option<u32>;
    fn insert_symbol(&self, sym: &PythonSymbol, id: u32) -> Result<(), InsertError>;

    /// Stores a stack under its hash, replacing whatever was there.
    fn put_stack(&self, hash: u64, stack: &PythonStack) -> Result<(), InsertError>;

    /// Adds one to an existing count, `false` if the key isn't there.
    fn add_count(&self, key: &SampleKey) -> bool;
    fn insert_count(&self, key: &SampleKey, value: u64) -> Result<(), InsertError>;

    fn increment_error(&self, kind: ErrorKind);

    fn emit_pid_event(&self, event: &PidEvent);
    fn emit_diagnostic(&self, diag: &Diagnostic);

    /// Accounts an abandoned sample: one counter bump, one diagnostic.
    fn report(&self, pid: u32, err: SampleError) {
        self.increment_error(err.kind());
        self.emit_diagnostic(&Diagnostic::new(pid, err));
    }
}
