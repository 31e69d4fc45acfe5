use parking_lot::{Mutex, MutexGuard};

use crate::python::state::SampleState;

/// One slot per cpu, allocated once and reused by every sample on that cpu.
/// A slot is only ever locked by the cpu that owns it, so the lock is never
/// contended; it only makes the arena shareable.
pub struct PerCpu<T> {
    slots: Vec<Mutex<Box<T>>>,
}

impl<T> PerCpu<T> {
    pub fn new_with(cpus: usize, mut init: impl FnMut() -> Box<T>) -> Self {
        Self {
            slots: (0..cpus).map(|_| Mutex::new(init())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, cpu: u32) -> Option<MutexGuard<'_, Box<T>>> {
        self.slots.get(cpu as usize).map(|s| s.lock())
    }
}

impl PerCpu<SampleState> {
    pub fn new(cpus: usize) -> Self {
        Self::new_with(cpus, || Box::new(SampleState::zeroed()))
    }
}
