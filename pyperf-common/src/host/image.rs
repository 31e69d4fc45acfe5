use crate::python::offsets::{Offset, PythonOffsets, FRAME_OWNED_BY_THREAD};
use crate::python::state::{LibcDescriptor, PyAllocSizes, PyPidData, PyTypeRefs};
use crate::python::validate::chunk_size_for;
use crate::python::PythonVersion;

use super::SparseMemory;

const HEAP_BASE: u64 = 0x10_0000;
const THREAD_STATE_SIZE: u64 = 0x110;
const TSS_KEY: i32 = 1;

/// Builds the memory image of a Python process: type objects, strings, code
/// objects, frames and a thread whose TLS points at its thread state. Objects
/// are laid out with the offsets of the chosen version and carry allocator
/// chunk headers.
#[derive(Clone, Debug)]
pub struct FakeInterpreter {
    version: PythonVersion,
    offsets: PythonOffsets,
    mem: SparseMemory,
    next: u64,
    types: PyTypeRefs,
}

fn at(o: Offset) -> u64 {
    o.get().unwrap_or(0)
}

impl FakeInterpreter {
    /// `None` for versions without a known layout.
    pub fn new(version: PythonVersion) -> Option<Self> {
        let offsets = version.offsets()?;
        let mut py = Self {
            version,
            offsets,
            mem: SparseMemory::default(),
            next: HEAP_BASE,
            types: PyTypeRefs::default(),
        };

        let type_ = py.raw_type_object("type", 0);
        py.mem.write_u64(type_ + at(offsets.py_object.ob_type), type_);
        py.types.type_ = type_;
        py.types.code = py.type_object("code");
        py.types.frame = py.type_object("frame");
        py.types.dict = py.type_object("dict");
        py.types.tuple = py.type_object("tuple");
        py.types.unicode = py.type_object("str");
        py.types.module = py.type_object("module");
        py.types.bytes = py.type_object("bytes");
        py.types.none = py.type_object("NoneType");
        py.types.cell = py.type_object("cell");
        Some(py)
    }

    pub fn version(&self) -> PythonVersion {
        self.version
    }

    pub fn offsets(&self) -> &PythonOffsets {
        &self.offsets
    }

    pub fn types(&self) -> PyTypeRefs {
        self.types
    }

    /// Snapshot of the image.
    pub fn memory(&self) -> SparseMemory {
        self.mem.clone()
    }

    pub fn memory_mut(&mut self) -> &mut SparseMemory {
        &mut self.mem
    }

    /// Descriptor the controller would build for this process.
    pub fn pid_data(&self) -> PyPidData {
        PyPidData {
            types: self.types,
            sizes: PyAllocSizes {
                thread_state: THREAD_STATE_SIZE as u32,
                _pad: 0,
            },
            tss_key: TSS_KEY,
            offsets: self.offsets,
            libc: LibcDescriptor::glibc_x86_64(),
            version: self.version,
            collect_kernel: 0,
        }
    }

    /// Zeroed heap block with a malloc chunk header.
    pub fn alloc(&mut self, size: u64) -> u64 {
        let chunk = chunk_size_for(size);
        let ptr = self.next + 16;
        self.mem.write(ptr, &vec![0; size as usize]);
        // PREV_INUSE set, as it is on most live chunks
        self.mem.write_u64(ptr - 8, chunk | 1);
        self.next = (ptr + chunk + 15) & !15;
        ptr
    }

    fn object(&mut self, size: u64, ty: u64) -> u64 {
        let ptr = self.alloc(size);
        self.mem.write_u64(ptr + at(self.offsets.py_object.ob_refcnt), 1);
        self.mem.write_u64(ptr + at(self.offsets.py_object.ob_type), ty);
        ptr
    }

    fn cstr(&mut self, s: &str) -> u64 {
        let ptr = self.alloc(s.len() as u64 + 1);
        self.mem.write_cstr(ptr, s);
        ptr
    }

    fn raw_type_object(&mut self, name: &str, ty: u64) -> u64 {
        let name = self.cstr(name);
        let obj = self.object(0x1a0, ty);
        self.mem.write_u64(obj + at(self.offsets.py_type_object.tp_name), name);
        obj
    }

    /// A class named `name`.
    pub fn type_object(&mut self, name: &str) -> u64 {
        self.raw_type_object(name, self.types.type_)
    }

    /// An instance of `class`.
    pub fn instance(&mut self, class: u64) -> u64 {
        self.object(0x20, class)
    }

    pub fn cell(&mut self, referent: u64) -> u64 {
        let cell = self.object(0x18, self.types.cell);
        self.mem.write_u64(cell + at(self.offsets.py_cell_object.ob_ref), referent);
        cell
    }

    pub fn str(&mut self, text: &str) -> u64 {
        // worst case: 4 byte code units plus the terminator
        let size = at(self.offsets.py_string.compact_data) + 4 * (text.chars().count() as u64 + 1);
        let ptr = self.alloc(size);
        let offsets = self.offsets;
        self.mem.write_unicode(&offsets, ptr, self.types.unicode, text);
        ptr
    }

    pub fn tuple(&mut self, items: &[u64]) -> u64 {
        let ob_item = at(self.offsets.py_tuple_object.ob_item);
        let tuple = self.object(ob_item + 8 * items.len() as u64, self.types.tuple);
        self.mem.write_u64(tuple + at(self.offsets.py_var_object.ob_size), items.len() as u64);
        for (i, item) in items.iter().enumerate() {
            self.mem.write_u64(tuple + ob_item + 8 * i as u64, *item);
        }
        tuple
    }

    /// Code object of function `name` in `file` with positional parameter names `args`.
    pub fn code(&mut self, name: &str, file: &str, args: &[&str]) -> u64 {
        let names: Vec<u64> = args.iter().map(|a| self.str(a)).collect();
        let varnames = self.tuple(&names);
        let file = self.str(file);
        let name = self.str(name);

        let co = self.offsets.py_code_object;
        let code = self.object(0xc0, self.types.code);
        self.mem.write_u64(code + at(co.co_filename), file);
        self.mem.write_u64(code + at(co.co_name), name);
        let varnames_at = co.co_varnames.get().or(co.co_localsplusnames.get()).unwrap_or(0);
        self.mem.write_u64(code + varnames_at, varnames);
        code
    }

    /// A frame running `code`, called from `previous` (0 for the bottom
    /// frame), with `locals` in its localsplus array. Frame objects before
    /// 3.11, interpreter frames after.
    pub fn frame(&mut self, code: u64, previous: u64, locals: &[u64]) -> u64 {
        let f = self.offsets.py_frame;
        let localsplus = at(f.localsplus);
        let size = localsplus + 8 * locals.len().max(1) as u64;
        let frame = match f.owner.get() {
            Some(owner) => {
                let frame = self.alloc(size);
                self.mem.write_u8(frame + owner, FRAME_OWNED_BY_THREAD);
                frame
            }
            None => self.object(size, self.types.frame),
        };
        self.mem.write_u64(frame + at(f.code), code);
        self.mem.write_u64(frame + at(f.previous), previous);
        for (i, local) in locals.iter().enumerate() {
            self.mem.write_u64(frame + localsplus + 8 * i as u64, *local);
        }
        frame
    }

    /// Points `frame` at a new caller.
    pub fn link(&mut self, frame: u64, previous: u64) {
        self.mem.write_u64(frame + at(self.offsets.py_frame.previous), previous);
    }

    pub fn set_owner(&mut self, frame: u64, owner: u8) {
        if let Some(o) = self.offsets.py_frame.owner.get() {
            self.mem.write_u8(frame + o, owner);
        }
    }

    /// Frames for `codes`, innermost first, linked into one chain. Returns the
    /// innermost frame.
    pub fn chain(&mut self, codes: &[u64]) -> u64 {
        codes
            .iter()
            .rev()
            .fold(0, |previous, code| self.frame(*code, previous, &[]))
    }

    /// A thread state whose top frame is `top`.
    pub fn thread_state(&mut self, top: u64) -> u64 {
        let ts = self.offsets.py_thread_state;
        let tstate = self.alloc(THREAD_STATE_SIZE);
        match (ts.frame.get(), ts.cframe.get()) {
            (Some(frame), _) => self.mem.write_u64(tstate + frame, top),
            (None, Some(cframe_at)) => {
                let cframe = self.alloc(0x20);
                self.mem.write_u64(tstate + cframe_at, cframe);
                self.mem.write_u64(cframe + at(self.offsets.py_cframe.current_frame), top);
            }
            (None, None) => {}
        }
        tstate
    }

    /// TLS block of a glibc thread whose Python key slot holds `tstate`.
    /// Returns the thread pointer.
    pub fn tls_for(&mut self, tstate: u64) -> u64 {
        let tls = self.alloc(0x800);
        let libc = LibcDescriptor::glibc_x86_64();
        let slot = tls + at(libc.tsd) + TSS_KEY as u64 * 16 + 8;
        self.mem.write_u64(slot, tstate);
        tls
    }

    /// A thread running the chain that starts at `top`. Returns its thread pointer.
    pub fn thread(&mut self, top: u64) -> u64 {
        let tstate = self.thread_state(top);
        self.tls_for(tstate)
    }
}
