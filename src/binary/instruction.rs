use super::{
    opcode::Opcode,
    types::{BlockType, HeapType, MemArg, RefType, ValueType},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    Try(BlockType),
    Catch(u32),
    CatchAll,
    Throw(u32),
    Rethrow(u32),
    End,
    Br(u32),
    BrIf(u32),
    BrTable(Vec<u32>, u32),
    BrOnNull(u32),
    BrOnNonNull(u32),
    BrOnCast(u32),
    BrOnCastFail(u32),
    Return,
    Call(u32),
    CallIndirect { type_idx: u32, table_idx: u32 },
    CallRef(u32),
    ReturnCall(u32),
    ReturnCallIndirect { type_idx: u32, table_idx: u32 },
    ReturnCallRef(u32),

    Drop,
    /// Typed select carries its result types; the plain form has none.
    Select(Vec<ValueType>),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    TableGet(u32),
    TableSet(u32),

    Load { op: Opcode, memarg: MemArg },
    Store { op: Opcode, memarg: MemArg },
    MemorySize(u32),
    MemoryGrow(u32),

    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    /// Any operator from `i32.eqz` through `i64.extend32_s`.
    Numeric(Opcode),

    RefNull(HeapType),
    RefIsNull,
    RefFunc(u32),
    RefEq,
    RefAsNonNull,

    Misc(MiscInstruction),
    Gc(GcInstruction),
}

/// `0xFC`-prefixed instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiscInstruction {
    /// Saturating truncations, sub-opcodes 0 to 7.
    TruncSat(u32),
    MemoryInit { data_idx: u32, memory: u32 },
    DataDrop(u32),
    MemoryCopy { dst: u32, src: u32 },
    MemoryFill(u32),
    TableInit { elem_idx: u32, table: u32 },
    ElemDrop(u32),
    TableCopy { dst: u32, src: u32 },
    TableGrow(u32),
    TableSize(u32),
    TableFill(u32),
}

/// Sign handling of a packed field read; `None` for unpacked reads.
pub type Extension = Option<bool>;

/// `0xFB`-prefixed instructions, except the two cast branches which are
/// reported as branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcInstruction {
    StructNew(u32),
    StructNewDefault(u32),
    StructGet {
        type_idx: u32,
        field: u32,
        signed: Extension,
    },
    StructSet { type_idx: u32, field: u32 },
    ArrayNew(u32),
    ArrayNewDefault(u32),
    ArrayNewFixed { type_idx: u32, size: u32 },
    ArrayNewData { type_idx: u32, data_idx: u32 },
    ArrayNewElem { type_idx: u32, elem_idx: u32 },
    ArrayGet { type_idx: u32, signed: Extension },
    ArraySet(u32),
    ArrayLen,
    ArrayFill(u32),
    ArrayCopy { dst: u32, src: u32 },
    ArrayInitData { type_idx: u32, data_idx: u32 },
    ArrayInitElem { type_idx: u32, elem_idx: u32 },
    RefTest(RefType),
    RefCast(RefType),
    AnyConvertExtern,
    ExternConvertAny,
    RefI31,
    I31Get { signed: bool },
}

impl Instruction {
    /// Instructions after which control never falls through.
    pub fn is_divergent(&self) -> bool {
        matches!(
            self,
            Instruction::Unreachable
                | Instruction::Return
                | Instruction::Throw(_)
                | Instruction::Rethrow(_)
                | Instruction::ReturnCall(_)
                | Instruction::ReturnCallIndirect { .. }
                | Instruction::ReturnCallRef(_)
        )
    }
}
