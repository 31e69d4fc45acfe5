//! Entry points of the sampler: find out which process was interrupted and
//! route the sample by how the controller classified it.

use crate::aggregate::count_sample;
use crate::context::SampleContext;
use crate::maps::{InsertError, ProfileMaps};
use crate::metrics::{ErrorKind, PyError, SampleError};
use crate::python::state::{PidConfig, ProfilingType, SampleKey, SampleState, WalkStatus};
use crate::python::walker::{prepare_sample, pyperf_collect, Step};
use crate::tracemgmt::{PidEvent, PidOp};
use crate::{ConfigMapKey, MAX_PID_NS_LEVELS};

/// Pid of the current process as seen from the agent's namespace.
pub fn resolve_pid<C: SampleContext, M: ProfileMaps>(ctx: &C, maps: &M) -> Result<u32, SampleError> {
    let ino = maps.config_value(ConfigMapKey::INO).unwrap_or(0);
    if ino == 0 {
        return Ok(ctx.pid_tgid().tgid());
    }
    for level in 0..MAX_PID_NS_LEVELS {
        match ctx.pid_ns_entry(level) {
            Some(entry) if entry.inode == ino => return Ok(entry.tgid),
            Some(_) => continue,
            None => break,
        }
    }
    Err(PyError::PidNamespace.at(ino))
}

/// Handles one timer sample. Returns the walker's next step for Python
/// processes, [`Step::Exit`] otherwise.
pub fn profile_sample<C: SampleContext, M: ProfileMaps>(
    ctx: &C,
    maps: &M,
    state: &mut SampleState,
) -> Step {
    state.walk = WalkStatus::Init;
    let pid = match resolve_pid(ctx, maps) {
        Ok(pid) => pid,
        Err(err) => {
            maps.report(ctx.pid_tgid().tgid(), err);
            return Step::Exit;
        }
    };

    let Some(config) = maps.pid_config(pid) else {
        match maps.insert_pid_config(pid, &PidConfig::unknown()) {
            Ok(()) => {
                // only the CPU that created the entry asks
                maps.emit_pid_event(&PidEvent::new(pid, PidOp::RequestUnknownProcessInfo));
                maps.increment_error(ErrorKind::ClassificationPending);
            }
            Err(InsertError::Exists) => maps.increment_error(ErrorKind::ClassificationPending),
            Err(InsertError::Full) => maps.report(pid, PyError::PidMapFull.into()),
        }
        return Step::Exit;
    };

    match config.profiling_type() {
        ProfilingType::Unknown => {
            maps.increment_error(ErrorKind::ClassificationPending);
            Step::Exit
        }
        ProfilingType::Error => {
            maps.increment_error(ErrorKind::NotProfiled);
            Step::Exit
        }
        ProfilingType::FramePointers => {
            let key = SampleKey {
                pid,
                flags: 0,
                kern_stack: if config.collect_kernel != 0 { ctx.kernel_stack_id() } else { -1 },
                user_stack: if config.collect_user != 0 { ctx.user_stack_id() } else { -1 },
            };
            if let Err(err) = count_sample(maps, &key) {
                maps.report(pid, err);
            }
            Step::Exit
        }
        ProfilingType::Python => {
            if !maps.copy_pid_data(pid, &mut state.pid_data) {
                maps.report(pid, PyError::NoPidData.into());
                return Step::Exit;
            }
            prepare_sample(ctx, state, pid);
            pyperf_collect(ctx, maps, state)
        }
    }
}

/// A thread group leader exited: forget the process.
pub fn on_process_exit<C: SampleContext, M: ProfileMaps>(ctx: &C, maps: &M) {
    if !ctx.pid_tgid().is_group_leader() {
        return;
    }
    let Ok(pid) = resolve_pid(ctx, maps) else {
        return;
    };
    if maps.remove_pid_config(pid) {
        maps.emit_pid_event(&PidEvent::new(pid, PidOp::Dead));
    }
}

/// A known process replaced its image: ask for a new classification.
pub fn on_process_exec<C: SampleContext, M: ProfileMaps>(ctx: &C, maps: &M) {
    let Ok(pid) = resolve_pid(ctx, maps) else {
        return;
    };
    if maps.pid_config(pid).is_some() {
        maps.emit_pid_event(&PidEvent::new(pid, PidOp::RequestExecProcessInfo));
    }
}
