use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    bindings::{bpf_perf_event_data, bpf_perf_event_value, BPF_ANY, BPF_F_USER_STACK, BPF_NOEXIST},
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_current_task, bpf_get_smp_processor_id,
        bpf_probe_read_kernel, bpf_probe_read_user_buf, bpf_probe_read_user_str_bytes,
        gen::bpf_perf_prog_read_value,
    },
    EbpfContext,
};
use pyperf_common::{
    context::{PidNsEntry, SampleContext},
    kernel::KernelOffsets,
    maps::{InsertError, ProfileMaps},
    mem::{ProcessMemory, ReadFault},
    metrics::{Diagnostic, ErrorKind, PyError, SampleError},
    pidtgid::PidTgid,
    python::state::{PidConfig, PyPidData, PythonStack, PythonSymbol, SampleKey},
    tracemgmt::PidEvent,
    ConfigMapKey,
};

use crate::maps::*;

const EEXIST: i64 = 17;

/// Map helpers return negative errno.
fn insert_error(err: i64) -> InsertError {
    if err == -EEXIST {
        InsertError::Exists
    } else {
        InsertError::Full
    }
}

#[inline(always)]
fn kernel_offsets() -> Option<&'static KernelOffsets> {
    KERNEL_OFFSETS.get(0)
}

#[inline(always)]
unsafe fn read_kernel<T>(addr: u64) -> Option<T> {
    bpf_probe_read_kernel(addr as *const T).ok()
}

/// The current task and its user memory, as seen from a BPF program.
pub struct BpfSampleContext<'a, C: EbpfContext> {
    ctx: &'a C,
    /// Only perf event programs can use the buffer clearing helper
    perf_event: bool,
}

impl<'a, C: EbpfContext> BpfSampleContext<'a, C> {
    pub fn new(ctx: &'a C) -> Self {
        Self { ctx, perf_event: false }
    }
}

impl<'a> BpfSampleContext<'a, aya_ebpf::programs::PerfEventContext> {
    pub fn perf_event(ctx: &'a aya_ebpf::programs::PerfEventContext) -> Self {
        Self { ctx, perf_event: true }
    }
}

impl<C: EbpfContext> ProcessMemory for BpfSampleContext<'_, C> {
    #[inline(always)]
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadFault> {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, buf) }.map_err(|_| ReadFault { addr })
    }

    #[inline(always)]
    fn read_str(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault> {
        unsafe { bpf_probe_read_user_str_bytes(addr as *const u8, buf) }
            .map(|s| s.len())
            .map_err(|_| ReadFault { addr })
    }
}

impl<C: EbpfContext> SampleContext for BpfSampleContext<'_, C> {
    #[inline(always)]
    fn cpu(&self) -> u32 {
        unsafe { bpf_get_smp_processor_id() }
    }

    #[inline(always)]
    fn pid_tgid(&self) -> PidTgid {
        PidTgid::from_raw(bpf_get_current_pid_tgid())
    }

    fn pid_ns_entry(&self, level: u32) -> Option<PidNsEntry> {
        let off = kernel_offsets().filter(|o| o.has_pid_ns())?;
        unsafe {
            let task = bpf_get_current_task();
            let leader: u64 = read_kernel(task + off.task_group_leader as u64)?;
            let pid: u64 = read_kernel(leader + off.task_thread_pid as u64)?;
            let depth: u32 = read_kernel(pid + off.pid_level as u64)?;
            if level > depth {
                return None;
            }
            let upid = pid + off.pid_numbers as u64 + level as u64 * off.upid_size as u64;
            // upid.nr is the first field
            let tgid: i32 = read_kernel(upid)?;
            let ns: u64 = read_kernel(upid + off.upid_ns as u64)?;
            let inode: u32 = read_kernel(ns + off.pid_ns_inum as u64)?;
            Some(PidNsEntry {
                inode: inode as u64,
                tgid: tgid as u32,
            })
        }
    }

    fn tls_base(&self) -> Result<u64, SampleError> {
        let off = kernel_offsets()
            .filter(|o| o.has_tls())
            .ok_or(PyError::BadTlsBase.at(0))?;
        unsafe {
            let task = bpf_get_current_task();
            let addr = task + off.task_tls_base as u64;
            read_kernel(addr).ok_or(PyError::BadTlsBase.at(addr))
        }
    }

    #[inline(always)]
    fn kernel_stack_id(&self) -> i64 {
        unsafe { KERNEL_STACKS.get_stackid(self.ctx, 0) }.unwrap_or(-1)
    }

    #[inline(always)]
    fn user_stack_id(&self) -> i64 {
        unsafe { USER_STACKS.get_stackid(self.ctx, BPF_F_USER_STACK as u64) }.unwrap_or(-1)
    }

    /// The symbol is too large to zero from a program. This helper zeroes its
    /// output buffer whenever the size isn't `bpf_perf_event_value`'s.
    fn clear_symbol(&self, sym: &mut PythonSymbol) {
        if !self.perf_event {
            *sym = PythonSymbol::default();
            return;
        }
        unsafe {
            bpf_perf_prog_read_value(
                self.ctx.as_ptr() as *mut bpf_perf_event_data,
                sym as *mut PythonSymbol as *mut bpf_perf_event_value,
                size_of::<PythonSymbol>() as u32,
            );
        }
    }
}

/// The shared maps, bound to the program context for event output.
pub struct BpfMaps<'a, C: EbpfContext> {
    ctx: &'a C,
}

impl<'a, C: EbpfContext> BpfMaps<'a, C> {
    pub fn new(ctx: &'a C) -> Self {
        Self { ctx }
    }
}

impl<C: EbpfContext> ProfileMaps for BpfMaps<'_, C> {
    fn config_value(&self, key: ConfigMapKey) -> Option<u64> {
        unsafe { CONFIG.get(&(key as u32)) }.copied()
    }

    fn pid_config(&self, pid: u32) -> Option<PidConfig> {
        unsafe { PIDS.get(&pid) }.copied()
    }

    fn insert_pid_config(&self, pid: u32, config: &PidConfig) -> Result<(), InsertError> {
        PIDS.insert(&pid, config, BPF_NOEXIST as u64).map_err(insert_error)
    }

    fn remove_pid_config(&self, pid: u32) -> bool {
        PIDS.remove(&pid).is_ok()
    }

    fn copy_pid_data(&self, pid: u32, out: &mut PyPidData) -> bool {
        match unsafe { PY_PID_CONFIG.get(&pid) } {
            Some(data) => {
                *out = *data;
                true
            }
            None => false,
        }
    }

    fn symbol_id(&self, sym: &PythonSymbol) -> Option<u32> {
        unsafe { PY_SYMBOLS.get(sym) }.copied()
    }

    fn insert_symbol(&self, sym: &PythonSymbol, id: u32) -> Result<(), InsertError> {
        PY_SYMBOLS.insert(sym, &id, BPF_NOEXIST as u64).map_err(insert_error)
    }

    fn put_stack(&self, hash: u64, stack: &PythonStack) -> Result<(), InsertError> {
        PY_STACKS
            .insert(&hash, stack, BPF_ANY as u64)
            .map_err(|_| InsertError::Full)
    }

    fn add_count(&self, key: &SampleKey) -> bool {
        match COUNTS.get_ptr_mut(key) {
            Some(count) => {
                // other CPUs update the same value
                unsafe { AtomicU64::from_ptr(count) }.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn insert_count(&self, key: &SampleKey, value: u64) -> Result<(), InsertError> {
        COUNTS.insert(key, &value, BPF_NOEXIST as u64).map_err(insert_error)
    }

    fn increment_error(&self, kind: ErrorKind) {
        if let Some(count) = ERRORS.get_ptr_mut(kind as u32) {
            unsafe { *count += 1 };
        }
    }

    fn emit_pid_event(&self, event: &PidEvent) {
        PID_EVENTS.output(self.ctx, event, 0);
    }

    fn emit_diagnostic(&self, diag: &Diagnostic) {
        DIAGNOSTICS.output(self.ctx, diag, 0);
    }
}
