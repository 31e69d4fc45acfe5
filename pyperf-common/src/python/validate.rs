//! Checks applied to every interpreter pointer before it is followed. The
//! target's memory is untrusted: a stale pointer into freed memory reads
//! fine, it just isn't the object we think it is.

use crate::mem::ProcessMemory;
use crate::metrics::{PyError, SampleError};
use crate::python::offsets::PythonOffsets;

/// Smallest chunk the allocator hands out.
const MIN_CHUNK_SIZE: u64 = 32;
const CHUNK_ALIGN: u64 = 16;
/// Low bits of the chunk header are flags, not size.
const CHUNK_FLAG_MASK: u64 = 0x7;
const CHUNK_HEADER_SIZE: u64 = 8;

/// Checks that `ptr` is a live object of type `expected`: refcount not
/// negative, `ob_type` exactly the type object resolved by the controller.
pub fn validate_type<M: ProcessMemory>(
    mem: &M,
    offsets: &PythonOffsets,
    ptr: u64,
    expected: u64,
) -> Result<(), SampleError> {
    if expected == 0 {
        return Err(PyError::UnresolvedType.at(ptr));
    }
    if ptr == 0 {
        return Err(PyError::ObjectRead.at(0));
    }
    let (Some(refcnt), Some(ob_type)) = (
        offsets.py_object.ob_refcnt.get(),
        offsets.py_object.ob_type.get(),
    ) else {
        return Err(PyError::MissingOffset.at(ptr));
    };

    let refcnt = mem
        .read_i64(ptr.wrapping_add(refcnt))
        .map_err(PyError::ObjectRead.on_fault())?;
    if refcnt < 0 {
        return Err(PyError::NegativeRefcount.at(ptr));
    }
    let ty = mem
        .read_ptr(ptr.wrapping_add(ob_type))
        .map_err(PyError::ObjectRead.on_fault())?;
    if ty != expected {
        return Err(PyError::TypeMismatch.at(ptr));
    }
    Ok(())
}

/// Size of the allocator chunk that holds an object of `size` bytes.
pub const fn chunk_size_for(size: u64) -> u64 {
    let n = (size + CHUNK_HEADER_SIZE + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1);
    if n < MIN_CHUNK_SIZE {
        MIN_CHUNK_SIZE
    } else {
        n
    }
}

/// Compares the malloc chunk header in front of `ptr` with the chunk size an
/// object of `expected` bytes would get. `expected == 0` skips the check.
pub fn validate_allocation_size<M: ProcessMemory>(
    mem: &M,
    ptr: u64,
    expected: u64,
) -> Result<(), SampleError> {
    if expected == 0 {
        return Ok(());
    }
    let header = ptr
        .checked_sub(CHUNK_HEADER_SIZE)
        .ok_or(PyError::AllocHeaderRead.at(ptr))?;
    let size = mem
        .read_u64(header)
        .map_err(PyError::AllocHeaderRead.on_fault())?
        & !CHUNK_FLAG_MASK;
    if size != chunk_size_for(expected) {
        return Err(PyError::AllocSizeMismatch.at(ptr));
    }
    Ok(())
}
