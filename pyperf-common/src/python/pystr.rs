use crate::mem::ProcessMemory;
use crate::metrics::{PyError, SampleError};
use crate::python::state::{PyPidData, StrType};
use crate::python::validate::validate_type;

/// `PyASCIIObject.state` bits
const STATE_KIND_SHIFT: u32 = 2;
const STATE_KIND_MASK: u32 = 0x7;
const STATE_COMPACT: u32 = 1 << 5;
const STATE_ASCII: u32 = 1 << 6;

/// Copies the code units of a compact `str` object into `out`, truncating to
/// whole code units that fit. Bytes of `out` past the copy are left alone.
pub fn pystr_read<M: ProcessMemory>(
    mem: &M,
    pid_data: &PyPidData,
    ptr: u64,
    out: &mut [u8],
    ty: &mut StrType,
) -> Result<(), SampleError> {
    let offsets = &pid_data.offsets;
    validate_type(mem, offsets, ptr, pid_data.types.unicode)?;

    let s = &offsets.py_string;
    let (Some(length), Some(state), Some(ascii_data), Some(compact_data)) = (
        s.length.get(),
        s.state.get(),
        s.ascii_data.get(),
        s.compact_data.get(),
    ) else {
        return Err(PyError::MissingOffset.at(ptr));
    };

    let length = mem
        .read_i64(ptr.wrapping_add(length))
        .map_err(PyError::StringRead.on_fault())?;
    let state = mem
        .read_u32(ptr.wrapping_add(state))
        .map_err(PyError::StringRead.on_fault())?;

    if state & STATE_COMPACT == 0 {
        return Err(PyError::NonCompactString.at(ptr));
    }
    let kind = (state >> STATE_KIND_SHIFT) & STATE_KIND_MASK;
    if !matches!(kind, 1 | 2 | 4) {
        return Err(PyError::InvalidStringKind.at(ptr));
    }
    if length < 0 {
        return Err(PyError::InvalidStringLength.at(ptr));
    }
    let ascii = state & STATE_ASCII != 0;

    let kind = kind as usize;
    let mut byte_len = (length as u64)
        .saturating_mul(kind as u64)
        .min(out.len() as u64) as usize;
    byte_len -= byte_len % kind;

    let data = ptr.wrapping_add(if ascii { ascii_data } else { compact_data });
    mem.read_bytes(data, &mut out[..byte_len])
        .map_err(PyError::StringRead.on_fault())?;

    *ty = StrType {
        kind: kind as u8,
        ascii: ascii as u8,
        _pad: 0,
        size_codepoints: (byte_len / kind) as u32,
    };
    Ok(())
}
