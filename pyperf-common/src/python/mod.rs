use self::offsets::*;

pub mod interner;
pub mod names;
pub mod offsets;
pub mod pystr;
pub mod state;
pub mod thread;
pub mod validate;
pub mod walker;

#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
#[derive(Debug, Default, Eq, PartialEq, Clone, Copy)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl PythonVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    /// Offset table for this version, `None` for layouts we don't support.
    pub fn offsets(&self) -> Option<PythonOffsets> {
        match &self {
            PythonVersion { major: 3, minor: 8, patch: _ } => Some(PY38_OFFSETS),
            PythonVersion { major: 3, minor: 9, patch: _ } => Some(PY39_OFFSETS),
            PythonVersion { major: 3, minor: 10, patch: _ } => Some(PY310_OFFSETS),
            PythonVersion { major: 3, minor: 11, patch: _ } => Some(PY311_OFFSETS),
            PythonVersion { major: 3, minor: 12, patch: _ } => Some(PY312_OFFSETS),
            _ => None,
        }
    }
}

#[cfg(feature = "user")]
impl core::fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(feature = "user")]
impl core::str::FromStr for PythonVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.').map(|p| p.parse::<u8>());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), patch, None) => {
                let patch = match patch {
                    Some(p) => p.map_err(|e| format!("invalid patch version in {s:?}: {e}"))?,
                    None => 0,
                };
                Ok(Self::new(major, minor, patch))
            }
            _ => Err(format!("invalid python version {s:?}, expected major.minor[.patch]")),
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for PythonVersion {}
