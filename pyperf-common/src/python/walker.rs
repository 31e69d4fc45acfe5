//! The frame walker, split into fragments the kernel can verify on their own.
//! State between fragments lives in the per-CPU [`SampleState`]; a fragment
//! returns the next [`Step`] instead of calling its successor directly.

use crate::aggregate::submit_sample;
use crate::context::SampleContext;
use crate::maps::ProfileMaps;
use crate::metrics::{PyError, SampleError};
use crate::python::interner::get_symbol_id;
use crate::python::names::read_symbol;
use crate::python::offsets::{FRAME_OWNED_BY_CSTACK, PythonOffsets};
use crate::python::state::{
    PthreadsImpl, SampleState, WalkStatus, PYTHON_STACK_FRAMES_PER_PROG, PYTHON_STACK_MAX_LEN,
    PYTHON_STACK_PROG_CNT,
};
use crate::python::thread::{get_thread_state, get_top_frame};
use crate::python::validate::{validate_allocation_size, validate_type};

/// Slots of the `PY_PROGS` program array.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProgIdx {
    ReadPythonStack = 0,
}

/// What the driver does after a fragment returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    TailCall(ProgIdx),
    Exit,
}

/// Resets the per-sample parts of the scratch state. The descriptor copy and
/// the symbol counter are left alone.
pub fn prepare_sample<C: SampleContext>(ctx: &C, state: &mut SampleState, pid: u32) {
    state.cur_cpu = ctx.cpu();
    state.python_stack_prog_call_cnt = 0;
    state.frame_ptr = 0;
    state.walk = WalkStatus::Init;
    state.event.pid = pid;
    state.event.stack_len = 0;
    state.event.kern_stack = if state.pid_data.collect_kernel != 0 {
        ctx.kernel_stack_id()
    } else {
        -1
    };
}

fn abort<M: ProfileMaps>(maps: &M, state: &mut SampleState, err: SampleError) -> Step {
    state.walk = WalkStatus::Error;
    maps.report(state.event.pid, err);
    Step::Exit
}

fn finish<M: ProfileMaps>(maps: &M, state: &mut SampleState, walk: WalkStatus) -> Step {
    state.walk = walk;
    if let Err(err) = submit_sample(maps, state) {
        return abort(maps, state, err);
    }
    Step::Exit
}

/// Entry fragment: finds the thread state and its top frame.
pub fn pyperf_collect<C: SampleContext, M: ProfileMaps>(
    ctx: &C,
    maps: &M,
    state: &mut SampleState,
) -> Step {
    match locate_top_frame(ctx, state) {
        Ok(0) => finish(maps, state, WalkStatus::Done),
        Ok(frame) => {
            state.frame_ptr = frame;
            state.walk = WalkStatus::Walking;
            Step::TailCall(ProgIdx::ReadPythonStack)
        }
        Err(err) => abort(maps, state, err),
    }
}

fn locate_top_frame<C: SampleContext>(ctx: &C, state: &SampleState) -> Result<u64, SampleError> {
    let pid_data = &state.pid_data;
    let tstate = get_thread_state(ctx, pid_data)?;
    if tstate == 0 {
        // thread never ran Python
        return Ok(0);
    }
    // chunk headers are only known for glibc's allocator
    if pid_data.libc.pthreads_impl() == Some(PthreadsImpl::Glibc) {
        validate_allocation_size(ctx, tstate, pid_data.sizes.thread_state as u64)?;
    }
    get_top_frame(ctx, &pid_data.offsets, tstate)
}

/// Walker fragment: reads up to [`PYTHON_STACK_FRAMES_PER_PROG`] frames and
/// either schedules itself again or submits the stack.
pub fn read_python_stack<C: SampleContext, M: ProfileMaps>(
    ctx: &C,
    maps: &M,
    state: &mut SampleState,
) -> Step {
    state.python_stack_prog_call_cnt += 1;
    state.walk = WalkStatus::Walking;

    for _ in 0..PYTHON_STACK_FRAMES_PER_PROG {
        if state.frame_ptr == 0 {
            break;
        }
        if let Err(err) = read_frame(ctx, maps, state) {
            return abort(maps, state, err);
        }
    }

    if state.frame_ptr == 0 {
        finish(maps, state, WalkStatus::Done)
    } else if (state.python_stack_prog_call_cnt as usize) < PYTHON_STACK_PROG_CNT {
        state.walk = WalkStatus::Continue;
        Step::TailCall(ProgIdx::ReadPythonStack)
    } else {
        finish(maps, state, WalkStatus::Truncated)
    }
}

fn read_u8_at<C: SampleContext>(ctx: &C, addr: u64) -> Result<u8, SampleError> {
    ctx.read_u8(addr).map_err(PyError::FrameRead.on_fault())
}

fn previous<C: SampleContext>(ctx: &C, offsets: &PythonOffsets, frame: u64) -> Result<u64, SampleError> {
    let previous = offsets
        .py_frame
        .previous
        .get()
        .ok_or(PyError::MissingOffset.at(frame))?;
    ctx.read_ptr(frame.wrapping_add(previous))
        .map_err(PyError::FrameRead.on_fault())
}

/// Reads the symbol of `state.frame_ptr`, appends it and moves to the caller.
fn read_frame<C: SampleContext, M: ProfileMaps>(
    ctx: &C,
    maps: &M,
    state: &mut SampleState,
) -> Result<(), SampleError> {
    let frame = state.frame_ptr;
    let offsets = state.pid_data.offsets;

    match offsets.py_frame.owner.get() {
        Some(owner) => {
            let owner = read_u8_at(ctx, frame.wrapping_add(owner))?;
            if owner == FRAME_OWNED_BY_CSTACK {
                // shim frame for a C call, no code
                state.frame_ptr = previous(ctx, &offsets, frame)?;
                return Ok(());
            }
            if owner > FRAME_OWNED_BY_CSTACK {
                return Err(PyError::InvalidFrameOwner.at(frame));
            }
        }
        None if state.pid_data.types.frame != 0 => {
            validate_type(ctx, &offsets, frame, state.pid_data.types.frame)?;
        }
        None => {}
    }

    let code_off = offsets
        .py_frame
        .code
        .get()
        .ok_or(PyError::MissingOffset.at(frame))?;
    let code = ctx
        .read_ptr(frame.wrapping_add(code_off))
        .map_err(PyError::FrameRead.on_fault())?;
    if code == 0 {
        // nothing more to extract
        state.frame_ptr = 0;
        return Ok(());
    }
    validate_type(ctx, &offsets, code, state.pid_data.types.code)?;

    read_symbol(ctx, &state.pid_data, frame, code, &mut state.symbol)?;
    let id = get_symbol_id(maps, state)?;

    let len = state.event.stack_len as usize;
    if len < PYTHON_STACK_MAX_LEN {
        state.event.stack.ids[len] = id;
        state.event.stack_len += 1;
    }

    state.frame_ptr = previous(ctx, &offsets, frame)?;
    Ok(())
}

/// Reports a tail call the kernel refused to make.
pub fn tail_call_failed<M: ProfileMaps>(maps: &M, state: &mut SampleState) {
    abort(maps, state, PyError::CallFailed.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FakeInterpreter, HostContext, HostMaps};
    use crate::metrics::ErrorKind;
    use crate::python::offsets::FRAME_OWNED_BY_GENERATOR;
    use crate::python::PythonVersion;

    fn walk(py: &FakeInterpreter, top: u64, maps: &HostMaps) -> Box<SampleState> {
        let mut py = py.clone();
        let tls = py.thread(top);
        let ctx = HostContext::new(py.memory()).with_tls(tls).with_cpu(2);
        let mut st = Box::new(SampleState::zeroed());
        st.pid_data = py.pid_data();
        prepare_sample(&ctx, &mut st, 4242);
        let mut step = pyperf_collect(&ctx, maps, &mut st);
        while step == Step::TailCall(ProgIdx::ReadPythonStack) {
            step = read_python_stack(&ctx, maps, &mut st);
        }
        st
    }

    #[test]
    fn cstack_frames_are_skipped() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 12, 0)).unwrap();
        let inner = py.code("inner", "m.py", &[]);
        let outer = py.code("outer", "m.py", &[]);
        let bottom = py.frame(outer, 0, &[]);
        let shim = py.frame(0, bottom, &[]);
        py.set_owner(shim, FRAME_OWNED_BY_CSTACK);
        let top = py.frame(inner, shim, &[]);

        let maps = HostMaps::default();
        let st = walk(&py, top, &maps);
        assert_eq!(st.walk, WalkStatus::Done);
        assert_eq!(st.event.stack_len, 2);
        assert_eq!(maps.symbols().len(), 2);
    }

    #[test]
    fn generator_frames_are_walked() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 11, 0)).unwrap();
        let gen = py.code("produce", "g.py", &[]);
        let top = py.frame(gen, 0, &[]);
        py.set_owner(top, FRAME_OWNED_BY_GENERATOR);
        let maps = HostMaps::default();
        let st = walk(&py, top, &maps);
        assert_eq!(st.event.stack_len, 1);
    }

    #[test]
    fn unknown_owner_aborts() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 11, 0)).unwrap();
        let code = py.code("f", "f.py", &[]);
        let top = py.frame(code, 0, &[]);
        py.set_owner(top, 9);
        let maps = HostMaps::default();
        let st = walk(&py, top, &maps);
        assert_eq!(st.walk, WalkStatus::Error);
        assert_eq!(maps.error_count(ErrorKind::TypeValidation), 1);
        assert!(maps.counts().is_empty());
        assert_eq!(maps.take_diagnostics()[0].error(), Some(PyError::InvalidFrameOwner));
    }

    #[test]
    fn null_code_ends_the_walk() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 10, 0)).unwrap();
        let code = py.code("f", "f.py", &[]);
        let bottom = py.frame(0, 0, &[]);
        let top = py.frame(code, bottom, &[]);
        let maps = HostMaps::default();
        let st = walk(&py, top, &maps);
        assert_eq!(st.walk, WalkStatus::Done);
        assert_eq!(st.event.stack_len, 1);
    }

    #[test]
    fn idle_thread_is_an_empty_stack() {
        let py = FakeInterpreter::new(PythonVersion::new(3, 9, 0)).unwrap();
        let maps = HostMaps::default();
        let st = walk(&py, 0, &maps);
        assert_eq!(st.walk, WalkStatus::Done);
        let (key, count) = maps.counts()[0];
        assert_eq!(count, 1);
        assert!(maps.stack(key.user_stack as u64).unwrap().frames().is_empty());
    }

    #[test]
    fn caller_at_top_of_address_space_faults() {
        for (minor, code) in [(11, PyError::FrameRead), (10, PyError::ObjectRead)] {
            let mut py = FakeInterpreter::new(PythonVersion::new(3, minor, 0)).unwrap();
            let f = py.code("f", "f.py", &[]);
            let top = py.frame(f, 0xffff_ffff_ffff_fff0, &[]);
            let maps = HostMaps::default();
            let st = walk(&py, top, &maps);
            assert_eq!(st.walk, WalkStatus::Error, "3.{minor}");
            assert_eq!(maps.error_count(ErrorKind::ReadFault), 1);
            assert!(maps.counts().is_empty());
            assert_eq!(maps.take_diagnostics()[0].error(), Some(code));
        }
    }

    #[test]
    fn frame_type_checked_before_311() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 8, 0)).unwrap();
        let code = py.code("f", "f.py", &[]);
        // code object where a frame should be
        let maps = HostMaps::default();
        let st = walk(&py, code, &maps);
        assert_eq!(st.walk, WalkStatus::Error);
        assert_eq!(maps.take_diagnostics()[0].error(), Some(PyError::TypeMismatch));
    }
}
