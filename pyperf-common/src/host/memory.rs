use std::collections::BTreeMap;

use crate::mem::{ProcessMemory, ReadFault};
use crate::python::offsets::PythonOffsets;

const PAGE_SIZE: u64 = 4096;

/// Byte image of a process address space. Only pages that were written to
/// exist; everything else faults.
#[derive(Clone, Debug, Default)]
pub struct SparseMemory {
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
}

impl SparseMemory {
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let mut addr = addr;
        let mut data = data;
        while !data.is_empty() {
            let page = addr / PAGE_SIZE;
            let off = (addr % PAGE_SIZE) as usize;
            let n = data.len().min(PAGE_SIZE as usize - off);
            let p = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
            p[off..off + n].copy_from_slice(&data[..n]);
            addr += n as u64;
            data = &data[n..];
        }
    }

    pub fn write_u8(&mut self, addr: u64, v: u8) {
        self.write(addr, &[v]);
    }

    pub fn write_u32(&mut self, addr: u64, v: u32) {
        self.write(addr, &v.to_ne_bytes());
    }

    pub fn write_u64(&mut self, addr: u64, v: u64) {
        self.write(addr, &v.to_ne_bytes());
    }

    /// NUL-terminated.
    pub fn write_cstr(&mut self, addr: u64, s: &str) {
        self.write(addr, s.as_bytes());
        self.write_u8(addr + s.len() as u64, 0);
    }

    /// Writes a compact `str` object with the narrowest code unit width that
    /// holds `text`. Returns the object size.
    pub fn write_unicode(&mut self, offsets: &PythonOffsets, addr: u64, unicode_type: u64, text: &str) -> u64 {
        let chars: Vec<u32> = text.chars().map(|c| c as u32).collect();
        let max = chars.iter().copied().max().unwrap_or(0);
        let (kind, ascii) = match max {
            0..=0x7f => (1u64, true),
            0x80..=0xff => (1, false),
            0x100..=0xffff => (2, false),
            _ => (4, false),
        };
        let s = &offsets.py_string;
        let get = |o: crate::python::offsets::Offset| o.get().unwrap_or(0);

        self.write_u64(addr + get(offsets.py_object.ob_refcnt), 1);
        self.write_u64(addr + get(offsets.py_object.ob_type), unicode_type);
        self.write_u64(addr + get(s.length), chars.len() as u64);
        let state = (kind as u32) << 2 | 1 << 5 | (ascii as u32) << 6;
        self.write_u32(addr + get(s.state), state);

        let data = addr + if ascii { get(s.ascii_data) } else { get(s.compact_data) };
        let mut bytes = Vec::with_capacity((chars.len() + 1) * kind as usize);
        for c in chars.iter().chain(core::iter::once(&0)) {
            match kind {
                1 => bytes.push(*c as u8),
                2 => bytes.extend_from_slice(&(*c as u16).to_ne_bytes()),
                _ => bytes.extend_from_slice(&c.to_ne_bytes()),
            }
        }
        self.write(data, &bytes);
        data + bytes.len() as u64 - addr
    }

    /// Drops every page overlapping `[addr, addr + len)`.
    pub fn unmap(&mut self, addr: u64, len: u64) {
        let first = addr / PAGE_SIZE;
        let last = (addr + len.max(1) - 1) / PAGE_SIZE;
        for page in first..=last {
            self.pages.remove(&page);
        }
    }
}

impl ProcessMemory for SparseMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadFault> {
        let mut cur = addr;
        let mut done = 0;
        while done < buf.len() {
            let page = self
                .pages
                .get(&(cur / PAGE_SIZE))
                .ok_or(ReadFault { addr: cur })?;
            let off = (cur % PAGE_SIZE) as usize;
            let n = (buf.len() - done).min(PAGE_SIZE as usize - off);
            buf[done..done + n].copy_from_slice(&page[off..off + n]);
            done += n;
            cur = cur.wrapping_add(n as u64);
        }
        Ok(())
    }
}
