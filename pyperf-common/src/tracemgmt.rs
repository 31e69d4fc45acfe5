/// Notifications sent to the controller over the `PID_EVENTS` stream.
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PidOp {
    /// First sample of a pid we know nothing about
    RequestUnknownProcessInfo = 0,
    /// The process exited; its config is gone
    Dead = 1,
    /// A known process called exec and has to be classified again
    RequestExecProcessInfo = 2,
}

impl PidOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PidOp::RequestUnknownProcessInfo),
            1 => Some(PidOp::Dead),
            2 => Some(PidOp::RequestExecProcessInfo),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PidEvent {
    pub pid: u32,
    pub op: u32,
}

impl PidEvent {
    pub const fn new(pid: u32, op: PidOp) -> Self {
        Self { pid, op: op as u32 }
    }

    pub fn op(&self) -> Option<PidOp> {
        PidOp::from_raw(self.op)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for PidEvent {}
