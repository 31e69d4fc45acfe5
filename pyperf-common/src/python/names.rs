use crate::context::SampleContext;
use crate::mem::ProcessMemory;
use crate::metrics::{PyError, SampleError};
use crate::python::pystr::pystr_read;
use crate::python::state::{PyPidData, PythonSymbol, StrType};
use crate::python::validate::validate_type;

/// What the first positional parameter of a code object is called.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FirstArg {
    None,
    /// `self`: an instance, the class is its type
    SelfArg,
    /// `cls`: the class itself
    ClsArg,
}

// compared as integers, cheaper than a string compare in the kernel
const SELF: u32 = u32::from_ne_bytes(*b"self");
const CLS: u32 = u32::from_ne_bytes(*b"cls\0");

/// Class name placeholders, one per failure site.
pub mod placeholder {
    pub const NO_LOCALSPLUS: &str = "<no-localsplus>";
    pub const SELF_UNREADABLE: &str = "<self-unreadable>";
    pub const CELL_UNREADABLE: &str = "<cell-unreadable>";
    pub const TYPE_UNREADABLE: &str = "<type-unreadable>";
    pub const TYPE_INVALID: &str = "<type-invalid>";
    pub const NAME_UNREADABLE: &str = "<name-unreadable>";
    pub const ARGS_UNREADABLE: &str = "<args-unreadable>";
}

/// Looks at the name of parameter zero to guess whether the code object is a
/// method.
pub fn check_first_argument<M: ProcessMemory>(
    mem: &M,
    pid_data: &PyPidData,
    code: u64,
) -> Result<FirstArg, SampleError> {
    if pid_data.types.tuple == 0 || pid_data.types.type_ == 0 {
        // no way to get to a class name anyway
        return Ok(FirstArg::None);
    }
    let offsets = &pid_data.offsets;
    let co = &offsets.py_code_object;
    // 3.11 folded co_varnames into co_localsplusnames
    let varnames = co
        .co_varnames
        .get()
        .or(co.co_localsplusnames.get())
        .ok_or(SampleError::from(PyError::MissingOffset))?;
    let (Some(ob_size), Some(ob_item), Some(length), Some(ascii_data)) = (
        offsets.py_var_object.ob_size.get(),
        offsets.py_tuple_object.ob_item.get(),
        offsets.py_string.length.get(),
        offsets.py_string.ascii_data.get(),
    ) else {
        return Err(PyError::MissingOffset.at(code));
    };

    let args = mem
        .read_ptr(code.wrapping_add(varnames))
        .map_err(PyError::ObjectRead.on_fault())?;
    validate_type(mem, offsets, args, pid_data.types.tuple)?;
    let size = mem
        .read_i64(args.wrapping_add(ob_size))
        .map_err(PyError::ObjectRead.on_fault())?;
    if size <= 0 {
        return Ok(FirstArg::None);
    }

    let first = mem
        .read_ptr(args.wrapping_add(ob_item))
        .map_err(PyError::ObjectRead.on_fault())?;
    validate_type(mem, offsets, first, pid_data.types.unicode)?;
    let len = mem
        .read_i64(first.wrapping_add(length))
        .map_err(PyError::StringRead.on_fault())?;
    let head = mem
        .read_u32(first.wrapping_add(ascii_data))
        .map_err(PyError::StringRead.on_fault())?;

    Ok(match (head, len) {
        (SELF, 4) => FirstArg::SelfArg,
        (CLS, 3) => FirstArg::ClsArg,
        _ => FirstArg::None,
    })
}

fn class_name_into<M: ProcessMemory>(
    mem: &M,
    pid_data: &PyPidData,
    frame: u64,
    first_arg: FirstArg,
    out: &mut [u8],
) -> Result<usize, &'static str> {
    let offsets = &pid_data.offsets;
    let types = &pid_data.types;
    let localsplus = offsets
        .py_frame
        .localsplus
        .get()
        .ok_or(placeholder::NO_LOCALSPLUS)?;
    let (Some(ob_type), Some(ob_ref), Some(tp_name)) = (
        offsets.py_object.ob_type.get(),
        offsets.py_cell_object.ob_ref.get(),
        offsets.py_type_object.tp_name.get(),
    ) else {
        return Err(placeholder::NO_LOCALSPLUS);
    };

    let mut obj = mem
        .read_ptr(frame.wrapping_add(localsplus))
        .map_err(|_| placeholder::SELF_UNREADABLE)?;
    if obj == 0 {
        // deleted, or not bound yet
        return Err(placeholder::SELF_UNREADABLE);
    }

    // closed over by a nested function: the slot holds a cell
    if types.cell != 0 {
        let ty = mem
            .read_ptr(obj.wrapping_add(ob_type))
            .map_err(|_| placeholder::SELF_UNREADABLE)?;
        if ty == types.cell {
            obj = mem
                .read_ptr(obj.wrapping_add(ob_ref))
                .map_err(|_| placeholder::CELL_UNREADABLE)?;
            if obj == 0 {
                return Err(placeholder::CELL_UNREADABLE);
            }
        }
    }

    if first_arg == FirstArg::SelfArg {
        obj = mem
            .read_ptr(obj.wrapping_add(ob_type))
            .map_err(|_| placeholder::TYPE_UNREADABLE)?;
    }
    validate_type(mem, offsets, obj, types.type_).map_err(|_| placeholder::TYPE_INVALID)?;

    // tp_name is a plain C string
    let name = mem
        .read_ptr(obj.wrapping_add(tp_name))
        .map_err(|_| placeholder::NAME_UNREADABLE)?;
    mem.read_str(name, out)
        .map_err(|_| placeholder::NAME_UNREADABLE)
}

fn ascii_type(len: usize) -> StrType {
    StrType {
        kind: 1,
        ascii: 1,
        _pad: 0,
        size_codepoints: len as u32,
    }
}

fn write_placeholder(out: &mut [u8], ty: &mut StrType, text: &str) {
    out.fill(0);
    let n = text.len().min(out.len());
    out[..n].copy_from_slice(&text.as_bytes()[..n]);
    *ty = ascii_type(n);
}

/// Name of the class a method frame belongs to. Never fails: unreadable or
/// unexpected objects leave a placeholder naming where it went wrong.
pub fn get_class_name<M: ProcessMemory>(
    mem: &M,
    pid_data: &PyPidData,
    frame: u64,
    first_arg: FirstArg,
    out: &mut [u8],
    ty: &mut StrType,
) {
    match class_name_into(mem, pid_data, frame, first_arg, out) {
        Ok(len) => *ty = ascii_type(len),
        Err(text) => write_placeholder(out, ty, text),
    }
}

/// Fills `sym` with the identity of one frame. File and function names are
/// required, the class name is best effort.
pub fn read_symbol<C: SampleContext>(
    ctx: &C,
    pid_data: &PyPidData,
    frame: u64,
    code: u64,
    sym: &mut PythonSymbol,
) -> Result<(), SampleError> {
    ctx.clear_symbol(sym);

    match check_first_argument(ctx, pid_data, code) {
        Ok(FirstArg::None) => {}
        Ok(arg) => get_class_name(
            ctx,
            pid_data,
            frame,
            arg,
            &mut sym.classname,
            &mut sym.classname_type,
        ),
        Err(_) => write_placeholder(
            &mut sym.classname,
            &mut sym.classname_type,
            placeholder::ARGS_UNREADABLE,
        ),
    }

    let co = &pid_data.offsets.py_code_object;
    let (Some(co_filename), Some(co_name)) = (co.co_filename.get(), co.co_name.get()) else {
        return Err(PyError::MissingOffset.at(code));
    };

    let file = ctx
        .read_ptr(code.wrapping_add(co_filename))
        .map_err(PyError::ObjectRead.on_fault())?;
    pystr_read(ctx, pid_data, file, &mut sym.file, &mut sym.file_type)?;

    let name = ctx
        .read_ptr(code.wrapping_add(co_name))
        .map_err(PyError::ObjectRead.on_fault())?;
    pystr_read(ctx, pid_data, name, &mut sym.name, &mut sym.name_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FakeInterpreter, HostContext};
    use crate::python::PythonVersion;

    fn method_frame(minor: u8, first: &str, cell: bool) -> (FakeInterpreter, u64, u64) {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, minor, 0)).unwrap();
        let class = py.type_object("Worker");
        let inst = py.instance(class);
        let code = py.code("run", "/srv/app/worker.py", &[first, "n"]);
        let slot = if cell { py.cell(inst) } else { inst };
        let frame = py.frame(code, 0, &[slot]);
        (py, frame, code)
    }

    #[test]
    fn self_resolves_instance_type() {
        for minor in [9, 10, 11, 12] {
            let (py, frame, code) = method_frame(minor, "self", false);
            let data = py.pid_data();
            let ctx = HostContext::new(py.memory());
            assert_eq!(check_first_argument(&ctx, &data, code), Ok(FirstArg::SelfArg));
            let mut sym = PythonSymbol::default();
            read_symbol(&ctx, &data, frame, code, &mut sym).unwrap();
            assert_eq!(sym.class_name(), "Worker");
            assert_eq!(sym.function_name(), "run");
            assert_eq!(sym.file_name(), "/srv/app/worker.py");
        }
    }

    #[test]
    fn cls_reads_class_directly() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 11, 0)).unwrap();
        let class = py.type_object("Registry");
        let code = py.code("create", "reg.py", &["cls"]);
        let frame = py.frame(code, 0, &[class]);
        let data = py.pid_data();
        let ctx = HostContext::new(py.memory());
        let mut sym = PythonSymbol::default();
        read_symbol(&ctx, &data, frame, code, &mut sym).unwrap();
        assert_eq!(sym.class_name(), "Registry");
    }

    #[test]
    fn cell_is_unwrapped() {
        let (py, frame, code) = method_frame(11, "self", true);
        let data = py.pid_data();
        let ctx = HostContext::new(py.memory());
        let mut sym = PythonSymbol::default();
        read_symbol(&ctx, &data, frame, code, &mut sym).unwrap();
        assert_eq!(sym.class_name(), "Worker");
    }

    #[test]
    fn selfish_is_not_self() {
        let (py, frame, code) = method_frame(10, "selfish", false);
        let data = py.pid_data();
        let ctx = HostContext::new(py.memory());
        assert_eq!(check_first_argument(&ctx, &data, code), Ok(FirstArg::None));
        let mut sym = PythonSymbol::default();
        read_symbol(&ctx, &data, frame, code, &mut sym).unwrap();
        assert_eq!(sym.class_name(), "");
    }

    #[test]
    fn no_arguments() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 10, 0)).unwrap();
        let code = py.code("main", "main.py", &[]);
        let data = py.pid_data();
        let ctx = HostContext::new(py.memory());
        assert_eq!(check_first_argument(&ctx, &data, code), Ok(FirstArg::None));
    }

    #[test]
    fn bad_class_degrades_to_placeholder() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 10, 0)).unwrap();
        let code = py.code("run", "w.py", &["self"]);
        // slot points at an object whose type isn't a type object
        let bogus = py.instance(0xdead_0000);
        let frame = py.frame(code, 0, &[bogus]);
        let data = py.pid_data();
        let ctx = HostContext::new(py.memory());
        let mut sym = PythonSymbol::default();
        read_symbol(&ctx, &data, frame, code, &mut sym).unwrap();
        assert_eq!(sym.class_name(), placeholder::TYPE_INVALID);
        assert_eq!(sym.function_name(), "run");

        let empty = py.frame(code, 0, &[0]);
        let ctx = HostContext::new(py.memory());
        read_symbol(&ctx, &data, empty, code, &mut sym).unwrap();
        assert_eq!(sym.class_name(), placeholder::SELF_UNREADABLE);
    }

    #[test]
    fn unresolved_tuple_or_type_skips_class_names() {
        let (py, frame, code) = method_frame(11, "self", false);
        let clears: [fn(&mut PyPidData); 2] = [|d| d.types.tuple = 0, |d| d.types.type_ = 0];
        for clear in clears {
            let mut data = py.pid_data();
            clear(&mut data);
            let ctx = HostContext::new(py.memory());
            assert_eq!(check_first_argument(&ctx, &data, code), Ok(FirstArg::None));
            let mut sym = PythonSymbol::default();
            read_symbol(&ctx, &data, frame, code, &mut sym).unwrap();
            assert_eq!(sym.class_name(), "");
            assert_eq!(sym.function_name(), "run");
        }
    }

    #[test]
    fn self_near_top_of_address_space() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 12, 0)).unwrap();
        let code = py.code("run", "w.py", &["self"]);
        let frame = py.frame(code, 0, &[0xffff_ffff_ffff_fffc]);
        let data = py.pid_data();
        let ctx = HostContext::new(py.memory());
        let mut sym = PythonSymbol::default();
        read_symbol(&ctx, &data, frame, code, &mut sym).unwrap();
        assert_eq!(sym.class_name(), placeholder::SELF_UNREADABLE);
    }

    #[test]
    fn missing_file_name_is_fatal() {
        let mut py = FakeInterpreter::new(PythonVersion::new(3, 12, 0)).unwrap();
        let code = py.code("run", "w.py", &[]);
        let mut data = py.pid_data();
        data.types.unicode = 0x1;
        let ctx = HostContext::new(py.memory());
        let mut sym = PythonSymbol::default();
        let err = read_symbol(&ctx, &data, 0, code, &mut sym).unwrap_err();
        assert_eq!(err.code, PyError::TypeMismatch);
    }
}
