use crate::mem::ReadFault;

macro_rules! count {
    () => (0usize);
    ( $x:tt $($xs:tt)* ) => (1usize + count!($($xs)*));
}

/// https://stackoverflow.com/a/64678145/10854888
macro_rules! iterable_enum {
    ($(#[$derives:meta])* $(vis $visibility:vis)? enum $name:ident { $($(#[$nested_meta:meta])* $member:ident),* $(,)? }) => {
        $(#[$derives])*
        $($visibility)? enum $name {
            $($(#[$nested_meta])* $member),*
        }
        impl $name {
            pub const COUNT: usize = count!($($member)*);

            pub const fn iter() -> [$name; Self::COUNT] {
                [$($name::$member,)*]
            }

            pub fn from_raw(raw: u32) -> Option<Self> {
                Self::iter().into_iter().find(|m| *m as u32 == raw)
            }
        }
    };
}

iterable_enum! {
    #[cfg_attr(feature = "user", derive(serde::Serialize))]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    #[repr(u32)]
    vis pub enum ErrorKind {
        /// First sample of a pid; the controller has been asked to classify it.
        /// Not an error.
        ClassificationPending,
        /// The pid is classified as not profiled.
        NotProfiled,
        /// The process uses a layout we don't know how to read.
        UnsupportedLayout,
        /// Target memory was unreadable.
        ReadFault,
        /// A pointer didn't look like the object we expected.
        TypeValidation,
        /// The frame chain was longer than the walker budget. The sample is still counted.
        DepthExhausted,
        /// The symbol map is full or an insert race could not be resolved.
        InternerExhaustion,
        /// An aggregation map is full.
        MapFull,
        /// A count increment was lost to a concurrent insert.
        CountRace,
        /// The current task isn't visible from the configured pid namespace.
        PidNamespace,
        /// A tail call failed.
        CallFailed,
        /// Enum Max
        Max,
    }
}

iterable_enum! {
    #[cfg_attr(feature = "user", derive(serde::Serialize))]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    #[repr(u32)]
    vis pub enum PyError {
        /// Reading the thread pointer out of the task faulted, or it's not configured.
        BadTlsBase,
        /// The pthreads implementation set for the process is invalid.
        InvalidPthreadsImpl,
        /// The thread-specific-data key can't be resolved without a second-level block.
        UnsupportedTssKey,
        /// Reading the pthread specific data faulted.
        ThreadStateRead,
        /// No way to get from the thread state to the top frame in this version.
        NoTopFrame,
        /// Reading the top frame pointer faulted.
        TopFrameRead,
        /// Reading a frame field faulted.
        FrameRead,
        /// A frame owner tag outside of the known range.
        InvalidFrameOwner,
        /// Object header unreadable.
        ObjectRead,
        /// Negative refcount, most likely freed memory.
        NegativeRefcount,
        /// `ob_type` doesn't match the expected type object.
        TypeMismatch,
        /// The controller didn't resolve the address of a type object we need.
        UnresolvedType,
        /// Allocator header unreadable.
        AllocHeaderRead,
        /// Allocator block size doesn't match the expected object size.
        AllocSizeMismatch,
        /// A field we need isn't present in the offset table.
        MissingOffset,
        /// Reading a string object faulted.
        StringRead,
        /// Legacy (non-compact) unicode object.
        NonCompactString,
        /// Code unit width other than 1, 2 or 4 bytes.
        InvalidStringKind,
        /// Negative string length.
        InvalidStringLength,
        /// The cpu id doesn't fit the symbol id layout.
        CpuOutOfRange,
        /// The per-cpu symbol counter ran out of ids.
        SymbolCounterExhausted,
        /// The symbol map is full.
        SymbolMapFull,
        /// Lost an insert race and couldn't find the winner's id.
        SymbolRace,
        /// The stack table is full.
        StackMapFull,
        /// The count map is full.
        CountMapFull,
        /// Lost a count insert race twice in a row.
        CountRace,
        /// The pid config map is full.
        PidMapFull,
        /// The task isn't visible from the configured pid namespace.
        PidNamespace,
        /// Classified as Python, but there is no descriptor for the pid.
        NoPidData,
        /// A tail call to a BPF program failed.
        CallFailed,
    }
}

impl PyError {
    pub fn kind(self) -> ErrorKind {
        use PyError::*;
        match self {
            InvalidPthreadsImpl | UnsupportedTssKey | NoTopFrame | UnresolvedType
            | MissingOffset | NonCompactString | InvalidStringKind | NoPidData => {
                ErrorKind::UnsupportedLayout
            }
            BadTlsBase | ThreadStateRead | TopFrameRead | FrameRead | ObjectRead
            | AllocHeaderRead | StringRead => ErrorKind::ReadFault,
            InvalidFrameOwner | NegativeRefcount | TypeMismatch | AllocSizeMismatch
            | InvalidStringLength => ErrorKind::TypeValidation,
            CpuOutOfRange | SymbolCounterExhausted | SymbolMapFull | SymbolRace => {
                ErrorKind::InternerExhaustion
            }
            StackMapFull | CountMapFull | PidMapFull => ErrorKind::MapFull,
            CountRace => ErrorKind::CountRace,
            PidNamespace => ErrorKind::PidNamespace,
            CallFailed => ErrorKind::CallFailed,
        }
    }

    #[inline(always)]
    pub fn at(self, addr: u64) -> SampleError {
        SampleError { code: self, addr }
    }

    /// Adapter for `map_err` on target memory reads.
    #[inline(always)]
    pub fn on_fault(self) -> impl Fn(ReadFault) -> SampleError {
        move |fault| SampleError { code: self, addr: fault.addr }
    }
}

/// Why a sample was abandoned, and where.
#[cfg_attr(feature = "user", derive(thiserror::Error))]
#[cfg_attr(feature = "user", error("{code:?} at {addr:#x}"))]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SampleError {
    pub code: PyError,
    /// Faulting or rejected address, 0 when there is none.
    pub addr: u64,
}

impl SampleError {
    #[inline(always)]
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl From<PyError> for SampleError {
    fn from(code: PyError) -> Self {
        code.at(0)
    }
}

/// Record sent to user space for every abandoned sample.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    pub pid: u32,
    pub code: u32,
    pub kind: u32,
    pub _pad: u32,
    pub addr: u64,
}

impl Diagnostic {
    pub fn new(pid: u32, err: SampleError) -> Self {
        Self {
            pid,
            code: err.code as u32,
            kind: err.kind() as u32,
            _pad: 0,
            addr: err.addr,
        }
    }

    pub fn error(&self) -> Option<PyError> {
        PyError::from_raw(self.code)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Diagnostic {}
