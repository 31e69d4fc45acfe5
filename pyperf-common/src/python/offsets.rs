/// Offset of a field inside an interpreter structure. Fields that don't exist in
/// a given version carry [`Offset::NONE`]; always go through [`Offset::get`].
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Offset(pub i16);

impl Offset {
    pub const NONE: Offset = Offset(-1);

    #[inline(always)]
    pub const fn get(self) -> Option<u64> {
        if self.0 >= 0 {
            Some(self.0 as u64)
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn is_present(self) -> bool {
        self.0 >= 0
    }

    /// Either a real offset or exactly the sentinel.
    pub const fn is_well_formed(self) -> bool {
        self.0 >= 0 || self.0 == Self::NONE.0
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::NONE
    }
}

structstruck::strike! {
    #[strikethrough[repr(C)]]
    #[strikethrough[derive(Clone, Copy, Debug, PartialEq, Eq)]]
    #[strikethrough[cfg_attr(feature = "user", derive(serde::Serialize))]]
    pub struct PythonOffsets {
        pub py_object: pub struct PyObjectOffsets {
            pub ob_refcnt: Offset,
            pub ob_type: Offset,
        },
        pub py_var_object: pub struct PyVarObjectOffsets {
            pub ob_size: Offset,
        },
        pub py_type_object: pub struct PyTypeObjectOffsets {
            pub tp_name: Offset,
        },
        pub py_thread_state: pub struct PyThreadStateOffsets {
            /// Direct top frame pointer (<= 3.10)
            pub frame: Offset,
            /// `_PyCFrame *` (3.11, 3.12)
            pub cframe: Offset,
        },
        pub py_cframe: pub struct PyCFrameOffsets {
            pub current_frame: Offset,
        },
        /// `PyFrameObject` before 3.11, `_PyInterpreterFrame` after.
        pub py_frame: pub struct PyFrameOffsets {
            pub previous: Offset,
            pub code: Offset,
            pub localsplus: Offset,
            pub owner: Offset,
        },
        pub py_code_object: pub struct PyCodeObjectOffsets {
            pub co_filename: Offset,
            pub co_name: Offset,
            pub co_varnames: Offset,
            pub co_localsplusnames: Offset,
        },
        pub py_tuple_object: pub struct PyTupleObjectOffsets {
            pub ob_item: Offset,
        },
        pub py_cell_object: pub struct PyCellObjectOffsets {
            pub ob_ref: Offset,
        },
        /// Compact unicode layout
        pub py_string: pub struct PyStringOffsets {
            pub length: Offset,
            pub state: Offset,
            /// `sizeof(PyASCIIObject)`, where ASCII data starts
            pub ascii_data: Offset,
            /// `sizeof(PyCompactUnicodeObject)`, where non-ASCII data starts
            pub compact_data: Offset,
        },
    }
}

impl PythonOffsets {
    pub fn fields(&self) -> [Offset; 21] {
        [
            self.py_object.ob_refcnt,
            self.py_object.ob_type,
            self.py_var_object.ob_size,
            self.py_type_object.tp_name,
            self.py_thread_state.frame,
            self.py_thread_state.cframe,
            self.py_cframe.current_frame,
            self.py_frame.previous,
            self.py_frame.code,
            self.py_frame.localsplus,
            self.py_frame.owner,
            self.py_code_object.co_filename,
            self.py_code_object.co_name,
            self.py_code_object.co_varnames,
            self.py_code_object.co_localsplusnames,
            self.py_tuple_object.ob_item,
            self.py_cell_object.ob_ref,
            self.py_string.length,
            self.py_string.state,
            self.py_string.ascii_data,
            self.py_string.compact_data,
        ]
    }

    pub fn is_well_formed(&self) -> bool {
        self.fields().iter().all(|o| o.is_well_formed())
    }
}

/// `_PyInterpreterFrame.owner` values.
pub const FRAME_OWNED_BY_THREAD: u8 = 0;
pub const FRAME_OWNED_BY_GENERATOR: u8 = 1;
pub const FRAME_OWNED_BY_FRAME_OBJECT: u8 = 2;
/// 3.12+: shim frame pushed by a C call, no code of its own.
pub const FRAME_OWNED_BY_CSTACK: u8 = 3;

const N: Offset = Offset::NONE;

const OBJECT: PyObjectOffsets = PyObjectOffsets {
    ob_refcnt: Offset(0),
    ob_type: Offset(8),
};
const VAR_OBJECT: PyVarObjectOffsets = PyVarObjectOffsets { ob_size: Offset(16) };
const TYPE_OBJECT: PyTypeObjectOffsets = PyTypeObjectOffsets { tp_name: Offset(24) };
const TUPLE: PyTupleObjectOffsets = PyTupleObjectOffsets { ob_item: Offset(24) };
const CELL: PyCellObjectOffsets = PyCellObjectOffsets { ob_ref: Offset(16) };

/// 3.8 - 3.11: PyASCIIObject still carries `wstr`
const STRING_WSTR: PyStringOffsets = PyStringOffsets {
    length: Offset(16),
    state: Offset(32),
    ascii_data: Offset(48),
    compact_data: Offset(72),
};

pub const PY38_OFFSETS: PythonOffsets = PythonOffsets {
    py_object: OBJECT,
    py_var_object: VAR_OBJECT,
    py_type_object: TYPE_OBJECT,
    py_thread_state: PyThreadStateOffsets {
        frame: Offset(24),
        cframe: N,
    },
    py_cframe: PyCFrameOffsets { current_frame: N },
    py_frame: PyFrameOffsets {
        previous: Offset(24),    // f_back
        code: Offset(32),        // f_code
        localsplus: Offset(360), // f_localsplus
        owner: N,
    },
    py_code_object: PyCodeObjectOffsets {
        co_filename: Offset(104),
        co_name: Offset(112),
        co_varnames: Offset(72),
        co_localsplusnames: N,
    },
    py_tuple_object: TUPLE,
    py_cell_object: CELL,
    py_string: STRING_WSTR,
};

// 3.9 has the same layout for everything we read
pub const PY39_OFFSETS: PythonOffsets = PY38_OFFSETS;

pub const PY310_OFFSETS: PythonOffsets = PythonOffsets {
    py_frame: PyFrameOffsets {
        previous: Offset(24),
        code: Offset(32),
        localsplus: Offset(352),
        owner: N,
    },
    ..PY38_OFFSETS
};

pub const PY311_OFFSETS: PythonOffsets = PythonOffsets {
    py_object: OBJECT,
    py_var_object: VAR_OBJECT,
    py_type_object: TYPE_OBJECT,
    py_thread_state: PyThreadStateOffsets {
        frame: N,
        cframe: Offset(56),
    },
    py_cframe: PyCFrameOffsets {
        current_frame: Offset(8),
    },
    py_frame: PyFrameOffsets {
        previous: Offset(48),
        code: Offset(32),
        localsplus: Offset(72),
        owner: Offset(69),
    },
    py_code_object: PyCodeObjectOffsets {
        co_filename: Offset(112),
        co_name: Offset(120),
        co_varnames: N,
        co_localsplusnames: Offset(96),
    },
    py_tuple_object: TUPLE,
    py_cell_object: CELL,
    py_string: STRING_WSTR,
};

pub const PY312_OFFSETS: PythonOffsets = PythonOffsets {
    py_cframe: PyCFrameOffsets {
        current_frame: Offset(0),
    },
    py_frame: PyFrameOffsets {
        previous: Offset(8),
        code: Offset(0),
        localsplus: Offset(72),
        owner: Offset(70),
    },
    // wstr is gone
    py_string: PyStringOffsets {
        length: Offset(16),
        state: Offset(32),
        ascii_data: Offset(40),
        compact_data: Offset(56),
    },
    ..PY311_OFFSETS
};
