use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumType {
    I32, // 0x7F
    I64, // 0x7E
    F32, // 0x7D
    F64, // 0x7C
}

/// Built-in heap types that need no type index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbstractHeapType {
    Func,     // 0x70
    Extern,   // 0x6F
    Any,      // 0x6E
    Eq,       // 0x6D
    I31,      // 0x6C
    Struct,   // 0x6B
    Array,    // 0x6A
    Exn,      // 0x69
    None,     // 0x71
    NoExtern, // 0x72
    NoFunc,   // 0x73
    NoExn,    // 0x74
}

impl AbstractHeapType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let ty = match byte {
            0x70 => Self::Func,
            0x6F => Self::Extern,
            0x6E => Self::Any,
            0x6D => Self::Eq,
            0x6C => Self::I31,
            0x6B => Self::Struct,
            0x6A => Self::Array,
            0x69 => Self::Exn,
            0x71 => Self::None,
            0x72 => Self::NoExtern,
            0x73 => Self::NoFunc,
            0x74 => Self::NoExn,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Func => "func",
            Self::Extern => "extern",
            Self::Any => "any",
            Self::Eq => "eq",
            Self::I31 => "i31",
            Self::Struct => "struct",
            Self::Array => "array",
            Self::Exn => "exn",
            Self::None => "none",
            Self::NoExtern => "noextern",
            Self::NoFunc => "nofunc",
            Self::NoExn => "noexn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    Abstract(AbstractHeapType),
    Index(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Num(NumType),
    Ref(RefType),
}

impl ValueType {
    pub const I32: ValueType = ValueType::Num(NumType::I32);
    pub const I64: ValueType = ValueType::Num(NumType::I64);
    pub const F32: ValueType = ValueType::Num(NumType::F32);
    pub const F64: ValueType = ValueType::Num(NumType::F64);

    pub fn type_index(&self) -> Option<u32> {
        match self {
            ValueType::Ref(RefType {
                heap: HeapType::Index(index),
                ..
            }) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::Abstract(ty) => f.write_str(ty.name()),
            HeapType::Index(index) => write!(f, "{}", index),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Num(NumType::I32) => f.write_str("i32"),
            ValueType::Num(NumType::I64) => f.write_str("i64"),
            ValueType::Num(NumType::F32) => f.write_str("f32"),
            ValueType::Num(NumType::F64) => f.write_str("f64"),
            ValueType::Ref(RefType { nullable, heap }) => {
                if *nullable {
                    write!(f, "(ref null {})", heap)
                } else {
                    write!(f, "(ref {})", heap)
                }
            }
        }
    }
}

/// Field storage; packed integers only occur inside structs and arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    Value(ValueType),
    I8,
    I16,
}

impl StorageType {
    /// The type a value of this storage has once it is on the operand stack.
    pub fn unpacked(&self) -> ValueType {
        match self {
            StorageType::Value(ty) => *ty,
            StorageType::I8 | StorageType::I16 => ValueType::I32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldType {
    pub storage: StorageType,
    pub mutable: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompositeType {
    Array(FieldType),
    Struct(Vec<FieldType>),
    Func(FuncType),
}

/// One entry of the type table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubType {
    pub open: bool,
    pub supertypes: Vec<u32>,
    pub composite: CompositeType,
}

impl SubType {
    pub fn func(params: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        Self {
            open: false,
            supertypes: vec![],
            composite: CompositeType::Func(FuncType { params, results }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Empty,
    Value(ValueType),
    Func(u32),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u64,
    pub max: Option<u64>,
    pub shared: bool,
    pub memory64: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub align: u32,
    pub memory: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionLocal {
    pub type_count: u32,
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportDesc {
    Func(u32),
    Table { element: RefType, limits: Limits },
    Memory(Limits),
    Global { ty: ValueType, mutable: bool },
    Tag(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportDesc {
    Func(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
    Tag(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub desc: ExportDesc,
}
