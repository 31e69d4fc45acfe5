use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::maps::{InsertError, ProfileMaps};
use crate::metrics::{Diagnostic, ErrorKind};
use crate::python::state::{PidConfig, PyPidData, PythonStack, PythonSymbol, SampleKey};
use crate::tracemgmt::PidEvent;
use crate::ConfigMapKey;

/// Capacities of the bounded maps, `max_entries` on the kernel side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapLimits {
    pub pids: usize,
    pub symbols: usize,
    pub stacks: usize,
    pub counts: usize,
}

impl Default for MapLimits {
    fn default() -> Self {
        Self {
            pids: 4096,
            symbols: 32768,
            stacks: 16384,
            counts: 32768,
        }
    }
}

/// Maps with BPF hash map semantics. Each call locks one map for the
/// duration of that call only.
pub struct HostMaps {
    limits: MapLimits,
    config: Mutex<FnvHashMap<u32, u64>>,
    pids: Mutex<FnvHashMap<u32, PidConfig>>,
    pid_data: Mutex<FnvHashMap<u32, PyPidData>>,
    symbols: Mutex<FnvHashMap<PythonSymbol, u32>>,
    stacks: Mutex<FnvHashMap<u64, PythonStack>>,
    counts: Mutex<FnvHashMap<SampleKey, u64>>,
    errors: [AtomicU64; ErrorKind::COUNT],
    pid_events: Mutex<Vec<PidEvent>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl Default for HostMaps {
    fn default() -> Self {
        Self::with_capacity(MapLimits::default())
    }
}

fn insert_bounded<K: std::hash::Hash + Eq, V>(
    map: &mut FnvHashMap<K, V>,
    limit: usize,
    key: K,
    value: V,
) -> Result<(), InsertError> {
    if map.contains_key(&key) {
        return Err(InsertError::Exists);
    }
    if map.len() >= limit {
        return Err(InsertError::Full);
    }
    map.insert(key, value);
    Ok(())
}

impl HostMaps {
    pub fn with_capacity(limits: MapLimits) -> Self {
        Self {
            limits,
            config: Default::default(),
            pids: Default::default(),
            pid_data: Default::default(),
            symbols: Default::default(),
            stacks: Default::default(),
            counts: Default::default(),
            errors: core::array::from_fn(|_| AtomicU64::new(0)),
            pid_events: Default::default(),
            diagnostics: Default::default(),
        }
    }

    pub fn limits(&self) -> MapLimits {
        self.limits
    }

    // controller side

    pub fn set_config(&self, key: ConfigMapKey, value: u64) {
        self.config.lock().insert(key as u32, value);
    }

    /// Overwrites, the way the controller updates a classification.
    pub fn set_pid_config(&self, pid: u32, config: PidConfig) {
        self.pids.lock().insert(pid, config);
    }

    pub fn set_pid_data(&self, pid: u32, data: PyPidData) {
        self.pid_data.lock().insert(pid, data);
    }

    // snapshots

    pub fn counts(&self) -> Vec<(SampleKey, u64)> {
        self.counts.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn count(&self, key: &SampleKey) -> Option<u64> {
        self.counts.lock().get(key).copied()
    }

    pub fn stacks(&self) -> Vec<(u64, PythonStack)> {
        self.stacks.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn stack(&self, hash: u64) -> Option<PythonStack> {
        self.stacks.lock().get(&hash).copied()
    }

    pub fn symbols(&self) -> Vec<(PythonSymbol, u32)> {
        self.symbols.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> Vec<(ErrorKind, u64)> {
        ErrorKind::iter()
            .into_iter()
            .map(|k| (k, self.error_count(k)))
            .filter(|(_, n)| *n != 0)
            .collect()
    }

    pub fn take_pid_events(&self) -> Vec<PidEvent> {
        std::mem::take(&mut *self.pid_events.lock())
    }

    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }
}

impl ProfileMaps for HostMaps {
    fn config_value(&self, key: ConfigMapKey) -> Option<u64> {
        self.config.lock().get(&(key as u32)).copied()
    }

    fn pid_config(&self, pid: u32) -> Option<PidConfig> {
        self.pids.lock().get(&pid).copied()
    }

    fn insert_pid_config(&self, pid: u32, config: &PidConfig) -> Result<(), InsertError> {
        insert_bounded(&mut *self.pids.lock(), self.limits.pids, pid, *config)
    }

    fn remove_pid_config(&self, pid: u32) -> bool {
        self.pids.lock().remove(&pid).is_some()
    }

    fn copy_pid_data(&self, pid: u32, out: &mut PyPidData) -> bool {
        match self.pid_data.lock().get(&pid) {
            Some(data) => {
                *out = *data;
                true
            }
            None => false,
        }
    }

    fn symbol_id(&self, sym: &PythonSymbol) -> Option<u32> {
        self.symbols.lock().get(sym).copied()
    }

    fn insert_symbol(&self, sym: &PythonSymbol, id: u32) -> Result<(), InsertError> {
        insert_bounded(&mut *self.symbols.lock(), self.limits.symbols, *sym, id)
    }

    fn put_stack(&self, hash: u64, stack: &PythonStack) -> Result<(), InsertError> {
        let mut stacks = self.stacks.lock();
        if !stacks.contains_key(&hash) && stacks.len() >= self.limits.stacks {
            return Err(InsertError::Full);
        }
        stacks.insert(hash, *stack);
        Ok(())
    }

    fn add_count(&self, key: &SampleKey) -> bool {
        match self.counts.lock().get_mut(key) {
            Some(count) => {
                *count = count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    fn insert_count(&self, key: &SampleKey, value: u64) -> Result<(), InsertError> {
        insert_bounded(&mut *self.counts.lock(), self.limits.counts, *key, value)
    }

    fn increment_error(&self, kind: ErrorKind) {
        // saturating, like the counts
        let _ = self.errors[kind as usize].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            n.checked_add(1)
        });
    }

    fn emit_pid_event(&self, event: &PidEvent) {
        self.pid_events.lock().push(*event);
    }

    fn emit_diagnostic(&self, diag: &Diagnostic) {
        self.diagnostics.lock().push(*diag);
    }
}
