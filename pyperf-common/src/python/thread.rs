use crate::context::SampleContext;
use crate::metrics::{PyError, SampleError};
use crate::python::offsets::{Offset, PythonOffsets};
use crate::python::state::{PthreadsImpl, PyPidData};

/// glibc `PTHREAD_KEY_2NDLEVEL_SIZE`: keys past the first block need a second
/// dereference we don't do.
pub const GLIBC_KEYS_1STBLOCK: i32 = 32;
/// `sizeof(struct pthread_key_data)`
const GLIBC_KEY_DATA_SIZE: u64 = 16;
/// `offsetof(struct pthread_key_data, data)`
const GLIBC_KEY_DATA_DATA: u64 = 8;

/// musl `PTHREAD_KEYS_MAX`
pub const MUSL_KEYS_MAX: i32 = 128;

#[inline(always)]
fn need(offset: Offset) -> Result<u64, SampleError> {
    offset.get().ok_or(SampleError::from(PyError::MissingOffset))
}

/// Finds the `PyThreadState` of the interrupted thread through the pthread
/// specific data slot Python stored it in. Returns 0 for a thread that never
/// ran Python code.
pub fn get_thread_state<C: SampleContext>(ctx: &C, pid_data: &PyPidData) -> Result<u64, SampleError> {
    let tls = ctx.tls_base()?;
    if tls == 0 {
        return Err(PyError::BadTlsBase.at(0));
    }
    let libc = &pid_data.libc;
    let key = pid_data.tss_key;

    match libc.pthreads_impl() {
        Some(PthreadsImpl::Glibc) => {
            if !(0..GLIBC_KEYS_1STBLOCK).contains(&key) {
                return Err(PyError::UnsupportedTssKey.at(key as u64));
            }
            // the TCB sits either at the thread pointer or right below it
            let pthread = match libc.pthread_size.get() {
                Some(size) => tls.wrapping_sub(size),
                None => tls,
            };
            let slot = pthread
                .wrapping_add(need(libc.tsd)?)
                .wrapping_add(key as u64 * GLIBC_KEY_DATA_SIZE + GLIBC_KEY_DATA_DATA);
            ctx.read_ptr(slot).map_err(PyError::ThreadStateRead.on_fault())
        }
        Some(PthreadsImpl::Musl) => {
            if !(0..MUSL_KEYS_MAX).contains(&key) {
                return Err(PyError::UnsupportedTssKey.at(key as u64));
            }
            let this = match libc.pthread_size.get() {
                Some(size) => tls.wrapping_sub(size),
                // `struct pthread` starts with its own address
                None => ctx.read_ptr(tls).map_err(PyError::ThreadStateRead.on_fault())?,
            };
            let tsd = ctx
                .read_ptr(this.wrapping_add(need(libc.tsd)?))
                .map_err(PyError::ThreadStateRead.on_fault())?;
            if tsd == 0 {
                return Err(PyError::ThreadStateRead.at(this));
            }
            ctx.read_ptr(tsd.wrapping_add(key as u64 * 8))
                .map_err(PyError::ThreadStateRead.on_fault())
        }
        None => Err(PyError::InvalidPthreadsImpl.at(libc.pthreads_impl as u64)),
    }
}

/// Top frame of a thread state: `tstate->frame` up to 3.10, then
/// `tstate->cframe->current_frame`. 0 when nothing is executing.
pub fn get_top_frame<C: SampleContext>(
    ctx: &C,
    offsets: &PythonOffsets,
    tstate: u64,
) -> Result<u64, SampleError> {
    let ts = &offsets.py_thread_state;
    if let Some(frame) = ts.frame.get() {
        return ctx
            .read_ptr(tstate.wrapping_add(frame))
            .map_err(PyError::TopFrameRead.on_fault());
    }
    match (ts.cframe.get(), offsets.py_cframe.current_frame.get()) {
        (Some(cframe), Some(current_frame)) => {
            let cframe = ctx
                .read_ptr(tstate.wrapping_add(cframe))
                .map_err(PyError::TopFrameRead.on_fault())?;
            if cframe == 0 {
                return Ok(0);
            }
            ctx.read_ptr(cframe.wrapping_add(current_frame))
                .map_err(PyError::TopFrameRead.on_fault())
        }
        _ => Err(PyError::NoTopFrame.at(tstate)),
    }
}
