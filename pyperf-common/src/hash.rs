//! MurmurHash64A, used to turn a symbol id sequence into the stack table key.

const M: u64 = 0xc6a4a7935bd1e995;
const R: u32 = 47;

pub const STACK_HASH_SEED: u64 = 0x5079_7065_7266;

pub fn murmur_hash64a(key: &[u8], seed: u64) -> u64 {
    let len = key.len();
    let mut h = seed ^ (len as u64).wrapping_mul(M);

    let mut chunks = key.chunks_exact(8);
    for chunk in &mut chunks {
        let mut block = [0u8; 8];
        block.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(block);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, b) in tail.iter().enumerate() {
            h ^= (*b as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}
