use crate::hash::{murmur_hash64a, STACK_HASH_SEED};
use crate::maps::{InsertError, ProfileMaps};
use crate::metrics::{ErrorKind, PyError, SampleError};
use crate::python::state::{
    SampleKey, SampleState, WalkStatus, PYTHON_STACK_MAX_LEN, SAMPLE_KEY_FLAG_PYTHON_STACK,
    SAMPLE_KEY_FLAG_STACK_TRUNCATED,
};

/// Stores the finished stack of `state` and counts the sample.
///
/// Two different stacks with the same hash share a slot in the stack table;
/// the last one written wins.
pub fn submit_sample<M: ProfileMaps>(maps: &M, state: &mut SampleState) -> Result<(), SampleError> {
    let truncated = state.walk == WalkStatus::Truncated;
    let event = &mut state.event;

    // scratch holds the previous sample's ids past stack_len
    let len = (event.stack_len as usize).min(PYTHON_STACK_MAX_LEN);
    event.stack.ids[len..].fill(0);

    // hashed over the whole zero padded array
    let hash = murmur_hash64a(event.stack.as_bytes(), STACK_HASH_SEED);
    maps.put_stack(hash, &event.stack)
        .map_err(|_| PyError::StackMapFull.at(hash))?;

    let mut flags = SAMPLE_KEY_FLAG_PYTHON_STACK;
    if truncated {
        flags |= SAMPLE_KEY_FLAG_STACK_TRUNCATED;
        maps.increment_error(ErrorKind::DepthExhausted);
    }
    let key = SampleKey {
        pid: event.pid,
        flags,
        kern_stack: event.kern_stack,
        user_stack: hash as i64,
    };
    count_sample(maps, &key)
}

/// Increments the count of `key`, inserting it at 1 on first sight.
///
/// Losing the insert to another CPU retries the increment once; if that
/// still misses the sample is dropped and counted as a race.
pub fn count_sample<M: ProfileMaps>(maps: &M, key: &SampleKey) -> Result<(), SampleError> {
    if maps.add_count(key) {
        return Ok(());
    }
    match maps.insert_count(key, 1) {
        Ok(()) => Ok(()),
        Err(InsertError::Exists) if maps.add_count(key) => Ok(()),
        Err(InsertError::Exists) => Err(PyError::CountRace.at(key.user_stack as u64)),
        Err(InsertError::Full) => Err(PyError::CountMapFull.at(key.user_stack as u64)),
    }
}
