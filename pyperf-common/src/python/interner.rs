use crate::maps::{InsertError, ProfileMaps};
use crate::metrics::{PyError, SampleError};
use crate::python::state::{SampleState, PY_NUM_CPU};

/// Interns `state.symbol` and returns its id.
///
/// Ids are `counter * PY_NUM_CPU + cpu` with a per-CPU counter, so CPUs never
/// mint the same id and no lock is needed. The counter is bumped before use:
/// id 0 never exists and terminates stacks.
pub fn get_symbol_id<M: ProfileMaps>(maps: &M, state: &mut SampleState) -> Result<u32, SampleError> {
    if let Some(id) = maps.symbol_id(&state.symbol) {
        return Ok(id);
    }

    if state.cur_cpu >= PY_NUM_CPU {
        return Err(PyError::CpuOutOfRange.at(state.cur_cpu as u64));
    }
    let counter = state
        .symbol_counter
        .checked_add(1)
        .filter(|c| c.checked_mul(PY_NUM_CPU).is_some())
        .ok_or(PyError::SymbolCounterExhausted.at(state.symbol_counter as u64))?;
    state.symbol_counter = counter;
    // counter * PY_NUM_CPU fits, so adding cpu < PY_NUM_CPU does too
    let id = counter * PY_NUM_CPU + state.cur_cpu;

    match maps.insert_symbol(&state.symbol, id) {
        Ok(()) => Ok(id),
        // another CPU interned the same symbol in between
        Err(InsertError::Exists) => maps
            .symbol_id(&state.symbol)
            .ok_or(PyError::SymbolRace.at(id as u64)),
        Err(InsertError::Full) => Err(PyError::SymbolMapFull.at(id as u64)),
    }
}
