//! Opcode stream and code section decoding.
//!
//! Function bodies and constant expressions are decoded by the same
//! [`parse_expression`] loop, which reports structured control flow and
//! every other instruction through a [`CodeListener`].

use super::{
    instruction::{GcInstruction, Instruction, MiscInstruction},
    opcode::{BranchOpcode, Opcode},
    reader::Reader,
    types::{BlockType, HeapType, RefType, ValueType},
};
use crate::error::{DecodeError, Result};
use num_traits::FromPrimitive as _;
use std::ops::Range;

/// Receives the decoded opcode stream of one expression.
///
/// Block tokens are chosen by the listener and handed back on the matching
/// `else`, `catch` and `end`. Branch targets are tokens of the labelled
/// block, or `None` when the label is the function body itself.
pub trait CodeListener {
    /// Called before every instruction, including the final `end`.
    fn address(&mut self, _address: usize) {}

    fn start_block(&mut self, _is_loop: bool, _ty: &BlockType) -> usize {
        0
    }

    fn start_conditional_block(&mut self, ty: &BlockType) -> usize {
        self.start_block(false, ty)
    }

    fn start_else_section(&mut self, _token: usize) {}

    fn start_try(&mut self, ty: &BlockType) -> usize {
        self.start_block(false, ty)
    }

    /// `tag` is `None` for `catch_all`.
    fn start_catch(&mut self, _token: usize, _tag: Option<u32>) {}

    fn end_block(&mut self, _token: usize, _is_loop: bool) {}

    fn branch(&mut self, _op: BranchOpcode, _depth: u32, _target: Option<usize>) {}

    fn table_branch(
        &mut self,
        _depths: &[u32],
        _targets: &[Option<usize>],
        _default_depth: u32,
        _default_target: Option<usize>,
    ) {
    }

    fn call(&mut self, _function: u32) {}

    fn indirect_call(&mut self, _type_idx: u32, _table_idx: u32) {}

    fn call_reference(&mut self, _type_idx: u32) {}

    fn throw_instruction(&mut self, _tag: u32) {}

    fn rethrow(&mut self, _depth: u32, _target: Option<usize>) {}

    /// `unreachable`, `nop`, `return`, and the `end` closing the expression.
    fn opcode(&mut self, _op: Opcode) {}

    /// Every instruction not covered by a dedicated method.
    fn instruction(&mut self, _instruction: &Instruction) {}
}

impl CodeListener for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop,
    If,
    Try,
}

#[derive(Debug)]
struct Frame {
    token: usize,
    kind: BlockKind,
}

fn label_target(frames: &[Frame], depth: u32, at: usize) -> Result<Option<usize>> {
    let depth = depth as usize;
    match depth.cmp(&frames.len()) {
        std::cmp::Ordering::Less => Ok(Some(frames[frames.len() - 1 - depth].token)),
        std::cmp::Ordering::Equal => Ok(None),
        std::cmp::Ordering::Greater => Err(DecodeError::malformed(
            at,
            format!("branch depth {} exceeds nesting {}", depth, frames.len()),
        )),
    }
}

/// Decodes instructions up to and including the `end` that closes the
/// expression at depth zero.
pub fn parse_expression(reader: &mut Reader, listener: &mut dyn CodeListener) -> Result<()> {
    let mut frames: Vec<Frame> = vec![];
    loop {
        let at = reader.position();
        listener.address(at);
        let byte = reader.u8()?;
        let op = Opcode::from_u8(byte)
            .ok_or_else(|| DecodeError::malformed(at, format!("unknown opcode 0x{:02X}", byte)))?;
        match op {
            Opcode::Unreachable | Opcode::Nop | Opcode::Return => listener.opcode(op),
            Opcode::Block | Opcode::Loop => {
                let ty = reader.block_type()?;
                let is_loop = op == Opcode::Loop;
                let token = listener.start_block(is_loop, &ty);
                let kind = if is_loop {
                    BlockKind::Loop
                } else {
                    BlockKind::Block
                };
                frames.push(Frame { token, kind });
            }
            Opcode::If => {
                let ty = reader.block_type()?;
                let token = listener.start_conditional_block(&ty);
                frames.push(Frame {
                    token,
                    kind: BlockKind::If,
                });
            }
            Opcode::Try => {
                let ty = reader.block_type()?;
                let token = listener.start_try(&ty);
                frames.push(Frame {
                    token,
                    kind: BlockKind::Try,
                });
            }
            Opcode::Else => match frames.last() {
                Some(frame) if frame.kind == BlockKind::If => {
                    listener.start_else_section(frame.token)
                }
                _ => return Err(DecodeError::malformed(at, "else outside of if")),
            },
            Opcode::Catch | Opcode::CatchAll => {
                let tag = if op == Opcode::Catch {
                    Some(reader.uleb32()?)
                } else {
                    None
                };
                match frames.last() {
                    Some(frame) if frame.kind == BlockKind::Try => {
                        listener.start_catch(frame.token, tag)
                    }
                    _ => return Err(DecodeError::malformed(at, "catch outside of try")),
                }
            }
            Opcode::End => match frames.pop() {
                Some(frame) => listener.end_block(frame.token, frame.kind == BlockKind::Loop),
                None => {
                    listener.opcode(Opcode::End);
                    return Ok(());
                }
            },
            Opcode::Throw => listener.throw_instruction(reader.uleb32()?),
            Opcode::Rethrow => {
                let depth = reader.uleb32()?;
                listener.rethrow(depth, label_target(&frames, depth, at)?);
            }
            Opcode::Br | Opcode::BrIf | Opcode::BrOnNull | Opcode::BrOnNonNull => {
                let depth = reader.uleb32()?;
                let branch = match op {
                    Opcode::Br => BranchOpcode::Br,
                    Opcode::BrIf => BranchOpcode::BrIf,
                    Opcode::BrOnNull => BranchOpcode::BrOnNull,
                    _ => BranchOpcode::BrOnNonNull,
                };
                listener.branch(branch, depth, label_target(&frames, depth, at)?);
            }
            Opcode::BrTable => {
                let depths = reader.vec(|r| r.uleb32())?;
                let default_depth = reader.uleb32()?;
                let targets = depths
                    .iter()
                    .map(|depth| label_target(&frames, *depth, at))
                    .collect::<Result<Vec<_>>>()?;
                let default_target = label_target(&frames, default_depth, at)?;
                listener.table_branch(&depths, &targets, default_depth, default_target);
            }
            Opcode::Call => listener.call(reader.uleb32()?),
            Opcode::CallIndirect => {
                let type_idx = reader.uleb32()?;
                let table_idx = reader.uleb32()?;
                listener.indirect_call(type_idx, table_idx);
            }
            Opcode::CallRef => listener.call_reference(reader.uleb32()?),
            Opcode::GcPrefix => parse_gc(reader, &frames, at, listener)?,
            Opcode::MiscPrefix => {
                let instruction = Instruction::Misc(parse_misc(reader, at)?);
                listener.instruction(&instruction);
            }
            _ => {
                let instruction = parse_plain(op, reader, at)?;
                listener.instruction(&instruction);
            }
        }
    }
}

/// Instructions that do not affect control flow structure.
fn parse_plain(op: Opcode, reader: &mut Reader, at: usize) -> Result<Instruction> {
    let instruction = match op {
        Opcode::ReturnCall => Instruction::ReturnCall(reader.uleb32()?),
        Opcode::ReturnCallIndirect => Instruction::ReturnCallIndirect {
            type_idx: reader.uleb32()?,
            table_idx: reader.uleb32()?,
        },
        Opcode::ReturnCallRef => Instruction::ReturnCallRef(reader.uleb32()?),
        Opcode::Drop => Instruction::Drop,
        Opcode::Select => Instruction::Select(vec![]),
        Opcode::SelectTyped => Instruction::Select(reader.vec(|r| r.value_type())?),
        Opcode::LocalGet => Instruction::LocalGet(reader.uleb32()?),
        Opcode::LocalSet => Instruction::LocalSet(reader.uleb32()?),
        Opcode::LocalTee => Instruction::LocalTee(reader.uleb32()?),
        Opcode::GlobalGet => Instruction::GlobalGet(reader.uleb32()?),
        Opcode::GlobalSet => Instruction::GlobalSet(reader.uleb32()?),
        Opcode::TableGet => Instruction::TableGet(reader.uleb32()?),
        Opcode::TableSet => Instruction::TableSet(reader.uleb32()?),
        Opcode::MemorySize => Instruction::MemorySize(reader.uleb32()?),
        Opcode::MemoryGrow => Instruction::MemoryGrow(reader.uleb32()?),
        Opcode::I32Const => Instruction::I32Const(reader.sleb32()?),
        Opcode::I64Const => Instruction::I64Const(reader.sleb64()?),
        Opcode::F32Const => Instruction::F32Const(reader.f32()?),
        Opcode::F64Const => Instruction::F64Const(reader.f64()?),
        Opcode::RefNull => Instruction::RefNull(reader.heap_type()?),
        Opcode::RefIsNull => Instruction::RefIsNull,
        Opcode::RefFunc => Instruction::RefFunc(reader.uleb32()?),
        Opcode::RefEq => Instruction::RefEq,
        Opcode::RefAsNonNull => Instruction::RefAsNonNull,
        op if op.is_load() => Instruction::Load {
            op,
            memarg: reader.mem_arg()?,
        },
        op if op.is_store() => Instruction::Store {
            op,
            memarg: reader.mem_arg()?,
        },
        op if op.is_numeric() => Instruction::Numeric(op),
        op => {
            return Err(DecodeError::malformed(
                at,
                format!("{:?} cannot appear here", op),
            ));
        }
    };
    Ok(instruction)
}

fn parse_misc(reader: &mut Reader, at: usize) -> Result<MiscInstruction> {
    let sub = reader.uleb32()?;
    let instruction = match sub {
        0..=7 => MiscInstruction::TruncSat(sub),
        8 => MiscInstruction::MemoryInit {
            data_idx: reader.uleb32()?,
            memory: reader.uleb32()?,
        },
        9 => MiscInstruction::DataDrop(reader.uleb32()?),
        10 => MiscInstruction::MemoryCopy {
            dst: reader.uleb32()?,
            src: reader.uleb32()?,
        },
        11 => MiscInstruction::MemoryFill(reader.uleb32()?),
        12 => MiscInstruction::TableInit {
            elem_idx: reader.uleb32()?,
            table: reader.uleb32()?,
        },
        13 => MiscInstruction::ElemDrop(reader.uleb32()?),
        14 => MiscInstruction::TableCopy {
            dst: reader.uleb32()?,
            src: reader.uleb32()?,
        },
        15 => MiscInstruction::TableGrow(reader.uleb32()?),
        16 => MiscInstruction::TableSize(reader.uleb32()?),
        17 => MiscInstruction::TableFill(reader.uleb32()?),
        other => {
            return Err(DecodeError::malformed(
                at,
                format!("unknown 0xFC sub-opcode {}", other),
            ));
        }
    };
    Ok(instruction)
}

fn parse_gc(
    reader: &mut Reader,
    frames: &[Frame],
    at: usize,
    listener: &mut dyn CodeListener,
) -> Result<()> {
    let sub = reader.uleb32()?;
    let ref_of = |nullable: bool, heap: HeapType| RefType { nullable, heap };
    let instruction = match sub {
        0 => GcInstruction::StructNew(reader.uleb32()?),
        1 => GcInstruction::StructNewDefault(reader.uleb32()?),
        2..=4 => GcInstruction::StructGet {
            type_idx: reader.uleb32()?,
            field: reader.uleb32()?,
            signed: extension(sub - 2),
        },
        5 => GcInstruction::StructSet {
            type_idx: reader.uleb32()?,
            field: reader.uleb32()?,
        },
        6 => GcInstruction::ArrayNew(reader.uleb32()?),
        7 => GcInstruction::ArrayNewDefault(reader.uleb32()?),
        8 => GcInstruction::ArrayNewFixed {
            type_idx: reader.uleb32()?,
            size: reader.uleb32()?,
        },
        9 => GcInstruction::ArrayNewData {
            type_idx: reader.uleb32()?,
            data_idx: reader.uleb32()?,
        },
        10 => GcInstruction::ArrayNewElem {
            type_idx: reader.uleb32()?,
            elem_idx: reader.uleb32()?,
        },
        11..=13 => GcInstruction::ArrayGet {
            type_idx: reader.uleb32()?,
            signed: extension(sub - 11),
        },
        14 => GcInstruction::ArraySet(reader.uleb32()?),
        15 => GcInstruction::ArrayLen,
        16 => GcInstruction::ArrayFill(reader.uleb32()?),
        17 => GcInstruction::ArrayCopy {
            dst: reader.uleb32()?,
            src: reader.uleb32()?,
        },
        18 => GcInstruction::ArrayInitData {
            type_idx: reader.uleb32()?,
            data_idx: reader.uleb32()?,
        },
        19 => GcInstruction::ArrayInitElem {
            type_idx: reader.uleb32()?,
            elem_idx: reader.uleb32()?,
        },
        20 | 21 => GcInstruction::RefTest(ref_of(sub == 21, reader.heap_type()?)),
        22 | 23 => GcInstruction::RefCast(ref_of(sub == 23, reader.heap_type()?)),
        24 | 25 => {
            let flags = reader.u8()?;
            if flags > 0x03 {
                return Err(DecodeError::malformed(
                    at,
                    format!("invalid cast flags 0x{:02X}", flags),
                ));
            }
            let depth = reader.uleb32()?;
            reader.heap_type()?;
            reader.heap_type()?;
            let op = if sub == 24 {
                BranchOpcode::BrOnCast
            } else {
                BranchOpcode::BrOnCastFail
            };
            listener.branch(op, depth, label_target(frames, depth, at)?);
            return Ok(());
        }
        26 => GcInstruction::AnyConvertExtern,
        27 => GcInstruction::ExternConvertAny,
        28 => GcInstruction::RefI31,
        29 | 30 => GcInstruction::I31Get { signed: sub == 29 },
        other => {
            return Err(DecodeError::malformed(
                at,
                format!("unknown 0xFB sub-opcode {}", other),
            ));
        }
    };
    listener.instruction(&Instruction::Gc(instruction));
    Ok(())
}

/// Maps the `get`, `get_s`, `get_u` sub-opcode triple onto an extension.
fn extension(variant: u32) -> Option<bool> {
    match variant {
        0 => None,
        1 => Some(true),
        _ => Some(false),
    }
}

/// Receives the function bodies of a code section.
pub trait CodeSectionListener {
    fn section_start(&mut self, _function_count: u32) {}

    /// `body` spans the locals and the instructions. Returning false skips
    /// the function.
    fn function_start(&mut self, _index: u32, _body: Range<usize>) -> bool {
        true
    }

    fn locals_start(&mut self, _run_count: u32) {}

    /// A run of `count` locals of one type, the first one numbered `start`.
    fn local(&mut self, _start: u32, _count: u32, _ty: &ValueType) {}

    /// Where the opcode stream of the current function goes. `None` skips it.
    fn code(&mut self) -> Option<&mut dyn CodeListener> {
        None
    }

    fn function_end(&mut self, _index: u32) {}

    fn section_end(&mut self) {}
}

/// Decodes a code section payload. Addresses are offsets into `payload`.
pub fn parse_code_section(payload: &[u8], listener: &mut dyn CodeSectionListener) -> Result<()> {
    let mut reader = Reader::new(payload);
    let count = reader.uleb32()?;
    listener.section_start(count);
    for index in 0..count {
        let size = reader.count()?;
        let start = reader.position();
        let mut body = reader.sub_reader(size)?;
        if !listener.function_start(index, start..start + size) {
            continue;
        }
        let runs = body.uleb32()?;
        listener.locals_start(runs);
        let mut next_local = 0u32;
        for _ in 0..runs {
            let at = body.position();
            let run = body.uleb32()?;
            let ty = body.value_type()?;
            listener.local(next_local, run, &ty);
            next_local = next_local
                .checked_add(run)
                .ok_or_else(|| DecodeError::malformed(at, "too many locals"))?;
        }
        if let Some(code) = listener.code() {
            parse_expression(&mut body, code)?;
            if !body.is_empty() {
                return Err(body.malformed("trailing bytes after function body"));
            }
        }
        listener.function_end(index);
    }
    if !reader.is_empty() {
        return Err(reader.malformed("trailing bytes after code section"));
    }
    listener.section_end();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_code_section, parse_expression, CodeListener, CodeSectionListener};
    use crate::binary::{
        instruction::{GcInstruction, Instruction, MiscInstruction},
        opcode::{BranchOpcode, Opcode},
        reader::Reader,
        types::{BlockType, ValueType},
    };
    use crate::error::DecodeError;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::ops::Range;

    #[derive(Default)]
    struct Trace {
        next_token: usize,
        events: Vec<String>,
    }

    impl CodeListener for Trace {
        fn address(&mut self, address: usize) {
            self.events.push(format!("@{}", address));
        }

        fn start_block(&mut self, is_loop: bool, _ty: &BlockType) -> usize {
            self.next_token += 1;
            self.events
                .push(format!("{} {}", if is_loop { "loop" } else { "block" }, self.next_token));
            self.next_token
        }

        fn start_else_section(&mut self, token: usize) {
            self.events.push(format!("else {}", token));
        }

        fn end_block(&mut self, token: usize, is_loop: bool) {
            self.events.push(format!("end {} {}", token, is_loop));
        }

        fn branch(&mut self, op: BranchOpcode, depth: u32, target: Option<usize>) {
            self.events.push(format!("{:?} {} {:?}", op, depth, target));
        }

        fn table_branch(
            &mut self,
            _depths: &[u32],
            targets: &[Option<usize>],
            _default_depth: u32,
            default_target: Option<usize>,
        ) {
            self.events.push(format!("table {:?} {:?}", targets, default_target));
        }

        fn call(&mut self, function: u32) {
            self.events.push(format!("call {}", function));
        }

        fn opcode(&mut self, op: Opcode) {
            self.events.push(format!("{:?}", op));
        }

        fn instruction(&mut self, instruction: &Instruction) {
            self.events.push(format!("{:?}", instruction));
        }
    }

    fn trace(bytes: &[u8]) -> Result<Vec<String>, DecodeError> {
        let mut trace = Trace::default();
        parse_expression(&mut Reader::new(bytes), &mut trace)?;
        Ok(trace.events)
    }

    #[test]
    fn nested_blocks_resolve_labels() -> Result<()> {
        // block; loop; br 1; br_if 0; br 2; end; end; end
        let bytes = [
            0x02, 0x40, 0x03, 0x40, 0x0C, 0x01, 0x0D, 0x00, 0x0C, 0x02, 0x0B, 0x0B, 0x0B,
        ];
        assert_eq!(
            trace(&bytes)?,
            vec![
                "@0", "block 1", "@2", "loop 2", "@4", "Br 1 Some(1)", "@6",
                "BrIf 0 Some(2)", "@8", "Br 2 None", "@10", "end 2 true", "@11",
                "end 1 false", "@12", "End",
            ]
        );
        Ok(())
    }

    #[test]
    fn if_else_and_table_branch() -> Result<()> {
        // if; i32.const 1; drop; else; br_table [0] 1; end; end
        let bytes = [
            0x04, 0x40, 0x41, 0x01, 0x1A, 0x05, 0x0E, 0x01, 0x00, 0x01, 0x0B, 0x0B,
        ];
        assert_eq!(
            trace(&bytes)?,
            vec![
                "@0", "block 1", "@2", "I32Const(1)", "@4", "Drop", "@5", "else 1", "@6",
                "table [Some(1)] None", "@10", "end 1 false", "@11", "End",
            ]
        );
        Ok(())
    }

    #[test]
    fn prefixed_instructions() -> Result<()> {
        let bytes = [
            0xFC, 0x0A, 0x00, 0x00, // memory.copy
            0xFB, 0x03, 0x02, 0x01, // struct.get_s 2 1
            0xFB, 0x18, 0x01, 0x00, 0x6E, 0x6B, // br_on_cast 0 any struct
            0xFB, 0x1E, // i31.get_u
            0x0B,
        ];
        let events = trace(&bytes)?;
        assert_eq!(
            events[1],
            format!(
                "{:?}",
                Instruction::Misc(MiscInstruction::MemoryCopy { dst: 0, src: 0 })
            )
        );
        assert_eq!(
            events[3],
            format!(
                "{:?}",
                Instruction::Gc(GcInstruction::StructGet {
                    type_idx: 2,
                    field: 1,
                    signed: Some(true),
                })
            )
        );
        assert_eq!(events[5], "BrOnCast 0 None");
        assert_eq!(
            events[7],
            format!("{:?}", Instruction::Gc(GcInstruction::I31Get { signed: false }))
        );
        Ok(())
    }

    #[test]
    fn malformed_streams() {
        // unknown opcode
        assert!(matches!(
            trace(&[0x01, 0x0A, 0x0B]),
            Err(DecodeError::MalformedInput { offset: 1, .. })
        ));
        // label deeper than the nesting
        assert!(matches!(
            trace(&[0x0C, 0x01, 0x0B]),
            Err(DecodeError::MalformedInput { offset: 0, .. })
        ));
        // else without if
        assert!(matches!(
            trace(&[0x02, 0x40, 0x05, 0x0B, 0x0B]),
            Err(DecodeError::MalformedInput { offset: 2, .. })
        ));
        // missing end
        assert!(matches!(
            trace(&[0x02, 0x40, 0x0B]),
            Err(DecodeError::UnexpectedEndOfStream { .. })
        ));
        // bad 0xFB sub-opcode
        assert!(matches!(
            trace(&[0xFB, 0x40, 0x0B]),
            Err(DecodeError::MalformedInput { offset: 0, .. })
        ));
    }

    #[derive(Default)]
    struct Bodies {
        functions: Vec<(u32, Range<usize>)>,
        locals: Vec<(u32, u32, ValueType)>,
        trace: Trace,
        skip: Option<u32>,
    }

    impl CodeSectionListener for Bodies {
        fn function_start(&mut self, index: u32, body: Range<usize>) -> bool {
            self.functions.push((index, body));
            self.skip != Some(index)
        }

        fn local(&mut self, start: u32, count: u32, ty: &ValueType) {
            self.locals.push((start, count, *ty));
        }

        fn code(&mut self) -> Option<&mut dyn CodeListener> {
            Some(&mut self.trace)
        }
    }

    #[test]
    fn code_section_bodies_and_locals() -> Result<()> {
        let payload = [
            0x02, // two functions
            0x06, 0x02, 0x02, 0x7F, 0x01, 0x7E, 0x0B, // (local i32 i32 i64)
            0x04, 0x00, 0x10, 0x00, 0x0B, // call 0
        ];
        let mut bodies = Bodies {
            skip: Some(0),
            ..Default::default()
        };
        parse_code_section(&payload, &mut bodies)?;
        assert_eq!(bodies.functions, vec![(0, 2..8), (1, 9..13)]);
        assert!(bodies.locals.is_empty());
        assert_eq!(bodies.trace.events, vec!["@10", "call 0", "@12", "End"]);

        let mut bodies = Bodies::default();
        parse_code_section(&payload, &mut bodies)?;
        assert_eq!(
            bodies.locals,
            vec![(0, 2, ValueType::I32), (2, 1, ValueType::I64)]
        );
        Ok(())
    }

    #[test]
    fn trailing_bytes_in_body_are_malformed() {
        let payload = [0x01, 0x03, 0x00, 0x0B, 0x01];
        let err = parse_code_section(&payload, &mut Bodies::default()).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedInput { offset: 4, .. }));
    }
}
