use tracing::{debug, trace};

use crate::context::SampleContext;
use crate::dispatch::{on_process_exec, on_process_exit, profile_sample};
use crate::maps::ProfileMaps;
use crate::metrics::PyError;
use crate::python::state::{SampleState, WalkStatus};
use crate::python::walker::{read_python_stack, tail_call_failed, ProgIdx, Step};

use super::{HostMaps, MapLimits, PerCpu};

/// The kernel refuses a tail call past this many in one chain.
pub const MAX_TAIL_CALLS: u32 = 33;

/// Runs one sample to completion, re-entering fragments the way chained tail
/// calls would.
pub fn run_sample<C: SampleContext, M: ProfileMaps>(
    ctx: &C,
    maps: &M,
    state: &mut SampleState,
) -> WalkStatus {
    let mut step = profile_sample(ctx, maps, state);
    let mut calls = 0;
    while let Step::TailCall(prog) = step {
        if calls == MAX_TAIL_CALLS {
            tail_call_failed(maps, state);
            break;
        }
        calls += 1;
        step = match prog {
            ProgIdx::ReadPythonStack => read_python_stack(ctx, maps, state),
        };
    }
    trace!(pid = state.event.pid, calls, walk = ?state.walk, "sample done");
    state.walk
}

/// Maps plus per-cpu scratch: everything the programs share, in one place.
pub struct Profiler {
    maps: HostMaps,
    scratch: PerCpu<SampleState>,
}

impl Profiler {
    pub fn new(cpus: usize, limits: MapLimits) -> Self {
        debug!(cpus, ?limits, "host profiler");
        Self {
            maps: HostMaps::with_capacity(limits),
            scratch: PerCpu::new(cpus),
        }
    }

    pub fn maps(&self) -> &HostMaps {
        &self.maps
    }

    /// Timer tick on `ctx.cpu()`.
    pub fn sample<C: SampleContext>(&self, ctx: &C) -> WalkStatus {
        let Some(mut state) = self.scratch.get(ctx.cpu()) else {
            self.maps.report(ctx.pid_tgid().tgid(), PyError::CpuOutOfRange.at(ctx.cpu() as u64));
            return WalkStatus::Error;
        };
        run_sample(ctx, &self.maps, &mut state)
    }

    pub fn process_exit<C: SampleContext>(&self, ctx: &C) {
        on_process_exit(ctx, &self.maps);
    }

    pub fn process_exec<C: SampleContext>(&self, ctx: &C) {
        on_process_exec(ctx, &self.maps);
    }
}
