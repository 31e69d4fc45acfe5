use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, PerCpuArray, PerfEventArray, ProgramArray, StackTrace},
};
use pyperf_common::{
    kernel::KernelOffsets,
    metrics::{Diagnostic, ErrorKind},
    python::state::{PidConfig, PyPidData, PythonStack, PythonSymbol, SampleKey, SampleState},
    tracemgmt::PidEvent,
};

/// Used to store misc config, see `ConfigMapKey`
#[map(name = "CONFIG")]
pub(crate) static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(10, 0);

/// Kernel struct offsets, one entry
#[map(name = "KERNEL_OFFSETS")]
pub(crate) static KERNEL_OFFSETS: Array<KernelOffsets> = Array::with_max_entries(1, 0);

/// pid -> classification, written by the agent
#[map(name = "PIDS")]
pub(crate) static PIDS: HashMap<u32, PidConfig> = HashMap::with_max_entries(4096, 0);

/// pid -> interpreter descriptor, written by the agent
#[map(name = "PY_PID_CONFIG")]
pub(crate) static PY_PID_CONFIG: HashMap<u32, PyPidData> = HashMap::with_max_entries(4096, 0);

/// symbol -> interned id, append only
#[map(name = "PY_SYMBOLS")]
pub(crate) static PY_SYMBOLS: HashMap<PythonSymbol, u32> = HashMap::with_max_entries(32768, 0);

/// stack hash -> symbol ids
#[map(name = "PY_STACKS")]
pub(crate) static PY_STACKS: HashMap<u64, PythonStack> = HashMap::with_max_entries(16384, 0);

/// sample key -> count
#[map(name = "COUNTS")]
pub(crate) static COUNTS: HashMap<SampleKey, u64> = HashMap::with_max_entries(32768, 0);

/// ErrorKind -> count
#[map(name = "ERRORS")]
pub(crate) static ERRORS: PerCpuArray<u64> = PerCpuArray::with_max_entries(ErrorKind::COUNT as u32, 0);

/// Used to send pid events to user space
#[map(name = "PID_EVENTS")]
pub(crate) static PID_EVENTS: PerfEventArray<PidEvent> = PerfEventArray::new(0);

/// One record per abandoned sample
#[map(name = "DIAGNOSTICS")]
pub(crate) static DIAGNOSTICS: PerfEventArray<Diagnostic> = PerfEventArray::new(0);

/// Used as a heap
#[map(name = "PY_STATE_HEAP")]
pub(crate) static PY_STATE_HEAP: PerCpuArray<SampleState> = PerCpuArray::with_max_entries(1, 0);

/// Walker fragments, indexed by `ProgIdx`
#[map(name = "PY_PROGS")]
pub(crate) static PY_PROGS: ProgramArray = ProgramArray::with_max_entries(1, 0);

#[map(name = "KERNEL_STACKS")]
pub(crate) static KERNEL_STACKS: StackTrace = StackTrace::with_max_entries(16384, 0);

#[map(name = "USER_STACKS")]
pub(crate) static USER_STACKS: StackTrace = StackTrace::with_max_entries(16384, 0);
