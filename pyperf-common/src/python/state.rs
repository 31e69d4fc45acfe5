use core::fmt::Debug;
use core::mem::size_of;

use super::offsets::{Offset, PythonOffsets};
use super::PythonVersion;

/// Frames read by one walker fragment.
pub const PYTHON_STACK_FRAMES_PER_PROG: usize = 32;
/// Walker fragments chained per sample.
pub const PYTHON_STACK_PROG_CNT: usize = 3;
pub const PYTHON_STACK_MAX_LEN: usize = PYTHON_STACK_FRAMES_PER_PROG * PYTHON_STACK_PROG_CNT;
pub const PYTHON_CLASS_NAME_LEN: usize = 32;
pub const PYTHON_FUNCTION_NAME_LEN: usize = 64;
pub const PYTHON_FILE_NAME_LEN: usize = 128;

/// Symbol ids are `counter * PY_NUM_CPU + cpu`, so cpus must stay below this.
pub const PY_NUM_CPU: u32 = 512;

pub const SAMPLE_KEY_FLAG_PYTHON_STACK: u32 = 1;
pub const SAMPLE_KEY_FLAG_STACK_TRUNCATED: u32 = 2;

/// How the bytes of a decoded string are to be read back.
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StrType {
    /// Code unit width in bytes: 1, 2 or 4
    pub kind: u8,
    pub ascii: u8,
    pub _pad: u16,
    /// Code points actually copied, after truncation
    pub size_codepoints: u32,
}

/// Identity of one call site. Interned into a symbol id, so two reads of the
/// same frame must produce byte-identical records: buffers are cleared before
/// every read and never contain leftovers past the copied data.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PythonSymbol {
    pub classname: [u8; PYTHON_CLASS_NAME_LEN],
    pub classname_type: StrType,
    pub name: [u8; PYTHON_FUNCTION_NAME_LEN],
    pub name_type: StrType,
    pub file: [u8; PYTHON_FILE_NAME_LEN],
    pub file_type: StrType,
}

impl Default for PythonSymbol {
    fn default() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

impl Debug for PythonSymbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PythonSymbol")
            .field("classname_type", &self.classname_type)
            .field("name_type", &self.name_type)
            .field("file_type", &self.file_type)
            .finish()
    }
}

/// Layout of the kernel's `struct bpf_perf_event_value`. The symbol buffer is
/// cleared through a helper that zeroes its output on a size mismatch, so the
/// two must never have the same size.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct PerfEventValue {
    pub counter: u64,
    pub enabled: u64,
    pub running: u64,
}

const _: () = assert!(size_of::<PythonSymbol>() != size_of::<PerfEventValue>());

/// Ordered symbol ids of one stack, zero padded. Value of the stack table.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PythonStack {
    pub ids: [u32; PYTHON_STACK_MAX_LEN],
}

impl PythonStack {
    pub fn as_bytes(&self) -> &[u8] {
        // u32 array has no padding
        unsafe {
            core::slice::from_raw_parts(self.ids.as_ptr() as *const u8, size_of::<Self>())
        }
    }

    /// Ids up to the first zero.
    pub fn frames(&self) -> &[u32] {
        let len = self.ids.iter().position(|id| *id == 0).unwrap_or(self.ids.len());
        &self.ids[..len]
    }
}

impl Default for PythonStack {
    fn default() -> Self {
        Self { ids: [0; PYTHON_STACK_MAX_LEN] }
    }
}

impl Debug for PythonStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.frames()).finish()
    }
}

/// The stack being assembled for the current sample.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PythonEvent {
    pub pid: u32,
    pub stack_len: u32,
    pub kern_stack: i64,
    pub stack: PythonStack,
}

/// Key of the count map.
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub pid: u32,
    pub flags: u32,
    /// Kernel stack id, negative if not collected
    pub kern_stack: i64,
    /// User stack id for native samples, stack table hash for Python samples
    pub user_stack: i64,
}

impl SampleKey {
    pub fn is_python(&self) -> bool {
        self.flags & SAMPLE_KEY_FLAG_PYTHON_STACK != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & SAMPLE_KEY_FLAG_STACK_TRUNCATED != 0
    }

    pub fn stack_hash(&self) -> Option<u64> {
        self.is_python().then_some(self.user_stack as u64)
    }
}

#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProfilingType {
    /// Seen, not classified yet
    Unknown = 0,
    FramePointers = 1,
    Python = 2,
    /// Not profiled
    Error = 3,
}

/// Value of the `PIDS` map.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PidConfig {
    pub profiling_type: u8,
    pub collect_user: u8,
    pub collect_kernel: u8,
    pub _pad: u8,
}

impl PidConfig {
    pub const fn new(ty: ProfilingType, collect_user: bool, collect_kernel: bool) -> Self {
        Self {
            profiling_type: ty as u8,
            collect_user: collect_user as u8,
            collect_kernel: collect_kernel as u8,
            _pad: 0,
        }
    }

    pub const fn unknown() -> Self {
        Self::new(ProfilingType::Unknown, false, false)
    }

    /// Values the controller never writes are treated as not profiled.
    pub fn profiling_type(&self) -> ProfilingType {
        match self.profiling_type {
            0 => ProfilingType::Unknown,
            1 => ProfilingType::FramePointers,
            2 => ProfilingType::Python,
            _ => ProfilingType::Error,
        }
    }
}

/// Identifies the POSIX threads implementation used by a Python process.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PthreadsImpl {
    Glibc = 0,
    Musl = 1,
}

/// Where the libc keeps pthread specific data.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LibcDescriptor {
    pub pthreads_impl: u8,
    pub _pad: u8,
    /// `sizeof(struct pthread)` on layouts where the thread pointer sits
    /// right after it (aarch64). Absent when the thread pointer is `pthread_self()`.
    pub pthread_size: Offset,
    /// glibc: `offsetof(struct pthread, specific_1stblock)`,
    /// musl: `offsetof(struct pthread, tsd)`
    pub tsd: Offset,
}

impl LibcDescriptor {
    pub const fn glibc(pthread_size: Offset, specific_1stblock: i16) -> Self {
        Self {
            pthreads_impl: PthreadsImpl::Glibc as u8,
            _pad: 0,
            pthread_size,
            tsd: Offset(specific_1stblock),
        }
    }

    pub const fn musl(pthread_size: Offset, tsd: i16) -> Self {
        Self {
            pthreads_impl: PthreadsImpl::Musl as u8,
            _pad: 0,
            pthread_size,
            tsd: Offset(tsd),
        }
    }

    /// x86_64 glibc, `%fs` points at `struct pthread`
    pub const fn glibc_x86_64() -> Self {
        Self::glibc(Offset::NONE, 0x310)
    }

    /// x86_64 musl 1.1.x
    pub const fn musl_1_1_x86_64() -> Self {
        Self::musl(Offset::NONE, 0x98)
    }

    /// x86_64 musl 1.2.x
    pub const fn musl_1_2_x86_64() -> Self {
        Self::musl(Offset::NONE, 0x80)
    }

    pub fn pthreads_impl(&self) -> Option<PthreadsImpl> {
        match self.pthreads_impl {
            0 => Some(PthreadsImpl::Glibc),
            1 => Some(PthreadsImpl::Musl),
            _ => None,
        }
    }
}

impl Default for LibcDescriptor {
    fn default() -> Self {
        Self::glibc_x86_64()
    }
}

/// Addresses of the built-in type objects in the target process.
/// 0 means unresolved, and every check against it fails.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(default))]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PyTypeRefs {
    pub code: u64,
    pub frame: u64,
    pub dict: u64,
    pub tuple: u64,
    pub unicode: u64,
    pub type_: u64,
    pub module: u64,
    pub bytes: u64,
    pub none: u64,
    pub cell: u64,
}

/// Expected allocation sizes. 0 skips the check.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(default))]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PyAllocSizes {
    pub thread_state: u32,
    #[cfg_attr(feature = "user", serde(skip))]
    pub _pad: u32,
}

/// Everything the walker needs to know about one Python process. Written by
/// the controller, read-only here.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PyPidData {
    pub types: PyTypeRefs,
    pub sizes: PyAllocSizes,
    /// pthread key holding the thread state
    pub tss_key: i32,
    pub offsets: PythonOffsets,
    pub libc: LibcDescriptor,
    pub version: PythonVersion,
    pub collect_kernel: u8,
}

impl PyPidData {
    /// Descriptor with the known layout of `version` and nothing resolved yet.
    pub fn for_version(version: PythonVersion) -> Option<Self> {
        Some(Self {
            types: PyTypeRefs::default(),
            sizes: PyAllocSizes::default(),
            tss_key: 0,
            offsets: version.offsets()?,
            libc: LibcDescriptor::default(),
            version,
            collect_kernel: 0,
        })
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WalkStatus {
    Init = 0,
    Walking = 1,
    /// Fragment budget spent, frames remain, continuing in the next fragment
    Continue = 2,
    /// Reached the end of the chain
    Done = 3,
    /// Ran out of fragments with frames remaining
    Truncated = 4,
    Error = 5,
}

/// Per-CPU scratch, reused by every sample on that CPU. Fields are overwritten
/// at the start of a sample; nothing is assumed to be zero.
#[repr(C)]
pub struct SampleState {
    pub pid_data: PyPidData,
    pub cur_cpu: u32,
    /// Monotonic per CPU, survives across samples
    pub symbol_counter: u32,
    pub frame_ptr: u64,
    pub python_stack_prog_call_cnt: u32,
    pub walk: WalkStatus,
    pub symbol: PythonSymbol,
    pub event: PythonEvent,
}

impl SampleState {
    /// Fresh slot, as the kernel hands out per-CPU array entries.
    pub fn zeroed() -> Self {
        // WalkStatus::Init is 0, everything else is plain data
        unsafe { core::mem::zeroed() }
    }
}

#[cfg(feature = "user")]
mod pod {
    use super::*;

    unsafe impl aya::Pod for PythonSymbol {}
    unsafe impl aya::Pod for PythonStack {}
    unsafe impl aya::Pod for SampleKey {}
    unsafe impl aya::Pod for PidConfig {}
    unsafe impl aya::Pod for PyPidData {}
}

#[cfg(any(test, feature = "user"))]
mod decode {
    use super::*;

    impl StrType {
        /// Rebuilds the text from the copied code units.
        pub fn decode(&self, buf: &[u8]) -> String {
            let kind = self.kind.max(1) as usize;
            let n = (self.size_codepoints as usize).min(buf.len() / kind);
            let data = &buf[..n * kind];
            match kind {
                1 if self.ascii != 0 => String::from_utf8_lossy(data).into_owned(),
                // latin-1
                1 => data.iter().map(|b| *b as char).collect(),
                2 => data
                    .chunks_exact(2)
                    .map(|c| u16::from_ne_bytes([c[0], c[1]]) as u32)
                    .map(|c| char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect(),
                _ => data
                    .chunks_exact(4)
                    .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .map(|c| char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect(),
            }
        }
    }

    impl PythonSymbol {
        pub fn class_name(&self) -> String {
            self.classname_type.decode(&self.classname)
        }

        pub fn function_name(&self) -> String {
            self.name_type.decode(&self.name)
        }

        pub fn file_name(&self) -> String {
            self.file_type.decode(&self.file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_has_no_padding() {
        assert_eq!(
            size_of::<PythonSymbol>(),
            PYTHON_CLASS_NAME_LEN + PYTHON_FUNCTION_NAME_LEN + PYTHON_FILE_NAME_LEN
                + 3 * size_of::<StrType>()
        );
        assert_eq!(size_of::<PyPidData>() % 8, 0);
    }

    #[test]
    fn decode_wide_strings() {
        let text: Vec<u16> = "héllo→".encode_utf16().collect();
        let mut buf = [0u8; 64];
        for (i, u) in text.iter().enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&u.to_ne_bytes());
        }
        let ty = StrType { kind: 2, ascii: 0, _pad: 0, size_codepoints: text.len() as u32 };
        assert_eq!(ty.decode(&buf), "héllo→");

        let mut buf = [0u8; 16];
        buf[..4].copy_from_slice(&0x1F40Du32.to_ne_bytes());
        let ty = StrType { kind: 4, ascii: 0, _pad: 0, size_codepoints: 1 };
        assert_eq!(ty.decode(&buf), "\u{1F40D}");

        let ty = StrType { kind: 1, ascii: 0, _pad: 0, size_codepoints: 2 };
        assert_eq!(ty.decode(&[0xe9, 0x41]), "éA");
    }

    #[test]
    fn garbage_profiling_type_is_not_profiled() {
        let cfg = PidConfig { profiling_type: 77, collect_user: 1, collect_kernel: 0, _pad: 0 };
        assert_eq!(cfg.profiling_type(), ProfilingType::Error);
        assert_eq!(PidConfig::unknown().profiling_type(), ProfilingType::Unknown);
    }

    #[test]
    fn stack_frames_stop_at_terminator() {
        let mut st = PythonStack::default();
        st.ids[0] = 513;
        st.ids[1] = 1026;
        assert_eq!(st.frames(), &[513, 1026]);
        assert_eq!(st.as_bytes().len(), PYTHON_STACK_MAX_LEN * 4);
    }
}
