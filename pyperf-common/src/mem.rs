/// A read of target memory failed (page fault, unmapped, permissions).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadFault {
    pub addr: u64,
}

/// Read-only view of the sampled process' address space.
///
/// Every read is bounded and synchronous; a failed read returns immediately and
/// is never retried.
pub trait ProcessMemory {
    /// Fills `buf` with the bytes at `addr`.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadFault>;

    /// Reads a NUL-terminated string into `buf`, returning the length without
    /// the terminator. The result is always NUL-terminated inside `buf` and
    /// truncated to fit.
    fn read_str(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault> {
        let Some(last) = buf.len().checked_sub(1) else {
            return Ok(0);
        };
        for i in 0..last {
            let mut b = [0u8; 1];
            self.read_bytes(addr.wrapping_add(i as u64), &mut b)?;
            buf[i] = b[0];
            if b[0] == 0 {
                return Ok(i);
            }
        }
        buf[last] = 0;
        Ok(last)
    }

    #[inline(always)]
    fn read_u8(&self, addr: u64) -> Result<u8, ReadFault> {
        let mut b = [0u8; 1];
        self.read_bytes(addr, &mut b)?;
        Ok(b[0])
    }

    #[inline(always)]
    fn read_u32(&self, addr: u64) -> Result<u32, ReadFault> {
        let mut b = [0u8; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(u32::from_ne_bytes(b))
    }

    #[inline(always)]
    fn read_u64(&self, addr: u64) -> Result<u64, ReadFault> {
        let mut b = [0u8; 8];
        self.read_bytes(addr, &mut b)?;
        Ok(u64::from_ne_bytes(b))
    }

    #[inline(always)]
    fn read_i64(&self, addr: u64) -> Result<i64, ReadFault> {
        self.read_u64(addr).map(|v| v as i64)
    }

    /// Pointer-sized read. Only 64-bit targets are supported.
    #[inline(always)]
    fn read_ptr(&self, addr: u64) -> Result<u64, ReadFault> {
        self.read_u64(addr)
    }
}

impl<T: ProcessMemory + ?Sized> ProcessMemory for &T {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadFault> {
        (**self).read_bytes(addr, buf)
    }

    fn read_str(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ReadFault> {
        (**self).read_str(addr, buf)
    }
}
