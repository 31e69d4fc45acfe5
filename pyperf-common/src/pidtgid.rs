use core::hash::{Hash, Hasher};

/// Value of `bpf_get_current_pid_tgid`: thread group id in the upper half,
/// thread id in the lower half.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Default)]
pub struct PidTgid(u64);

impl PartialEq for PidTgid {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Hash for PidTgid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PidTgid {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn new(tgid: u32, tid: u32) -> Self {
        Self((tgid as u64) << 32 | tid as u64)
    }

    #[inline(always)]
    pub fn tgid(&self) -> u32 {
        (self.0 >> 32) as _
    }

    #[inline(always)]
    pub fn tid(&self) -> u32 {
        (self.0 & 0xffffffff) as _
    }

    /// The main thread of a process has `tid == tgid`.
    #[inline(always)]
    pub fn is_group_leader(&self) -> bool {
        self.tgid() == self.tid()
    }
}

impl core::fmt::Debug for PidTgid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PidTgid")
            .field(&self.tgid())
            .field(&self.tid())
            .finish()
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for PidTgid {}
