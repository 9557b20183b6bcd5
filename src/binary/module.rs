use super::{
    code_section::{parse_code_section, CodeListener, CodeSectionListener},
    global_section::{parse_global_section, GlobalSectionListener},
    import_section::{parse_import_section, ImportSectionListener},
    instruction::Instruction,
    name_section::{parse_name_section, NameSectionListener},
    opcode::{BranchOpcode, Opcode},
    parser::ModuleParser,
    reader::Reader,
    section::{SectionCode, SectionConsumer, SectionHeader},
    source::SliceSource,
    type_section::{parse_type_section, TypeSectionListener},
    types::{BlockType, Export, ExportDesc, FunctionLocal, Import, Limits, SubType, ValueType},
};
use crate::error::{DecodeError, Result};
use std::{collections::BTreeMap, ops::Range};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Function {
    pub locals: Vec<FunctionLocal>,
    /// Ends with the `end` that closes the body.
    pub code: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub ty: ValueType,
    pub mutable: bool,
    pub init: Vec<Instruction>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Names {
    pub module: Option<String>,
    pub functions: BTreeMap<u32, String>,
    pub locals: BTreeMap<(u32, u32), String>,
    pub types: BTreeMap<u32, String>,
    pub globals: BTreeMap<u32, String>,
    pub fields: BTreeMap<(u32, u32), String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Module {
    pub type_section: Option<Vec<SubType>>,
    /// `(first type index, size)` of every recursion group.
    pub rec_groups: Vec<(u32, u32)>,
    pub import_section: Option<Vec<Import>>,
    pub function_section: Option<Vec<u32>>,
    pub memory_section: Option<Vec<Limits>>,
    pub global_section: Option<Vec<Global>>,
    pub export_section: Option<Vec<Export>>,
    pub code_section: Option<Vec<Function>>,
    pub names: Names,
}

impl Module {
    pub fn new(input: &[u8]) -> anyhow::Result<Module> {
        let mut builder = ModuleBuilder::default();
        ModuleParser::new(&mut builder).parse(&mut SliceSource::new(input))?;
        Ok(builder.module)
    }
}

/// Rebuilds the flat instruction list of an expression from the listener
/// callbacks.
#[derive(Debug, Default)]
pub struct InstructionRecorder {
    code: Vec<Instruction>,
}

impl InstructionRecorder {
    pub fn take(&mut self) -> Vec<Instruction> {
        std::mem::take(&mut self.code)
    }
}

impl CodeListener for InstructionRecorder {
    fn start_block(&mut self, is_loop: bool, ty: &BlockType) -> usize {
        self.code.push(if is_loop {
            Instruction::Loop(*ty)
        } else {
            Instruction::Block(*ty)
        });
        0
    }

    fn start_conditional_block(&mut self, ty: &BlockType) -> usize {
        self.code.push(Instruction::If(*ty));
        0
    }

    fn start_else_section(&mut self, _token: usize) {
        self.code.push(Instruction::Else);
    }

    fn start_try(&mut self, ty: &BlockType) -> usize {
        self.code.push(Instruction::Try(*ty));
        0
    }

    fn start_catch(&mut self, _token: usize, tag: Option<u32>) {
        self.code.push(match tag {
            Some(tag) => Instruction::Catch(tag),
            None => Instruction::CatchAll,
        });
    }

    fn end_block(&mut self, _token: usize, _is_loop: bool) {
        self.code.push(Instruction::End);
    }

    fn branch(&mut self, op: BranchOpcode, depth: u32, _target: Option<usize>) {
        self.code.push(match op {
            BranchOpcode::Br => Instruction::Br(depth),
            BranchOpcode::BrIf => Instruction::BrIf(depth),
            BranchOpcode::BrOnNull => Instruction::BrOnNull(depth),
            BranchOpcode::BrOnNonNull => Instruction::BrOnNonNull(depth),
            BranchOpcode::BrOnCast => Instruction::BrOnCast(depth),
            BranchOpcode::BrOnCastFail => Instruction::BrOnCastFail(depth),
        });
    }

    fn table_branch(
        &mut self,
        depths: &[u32],
        _targets: &[Option<usize>],
        default_depth: u32,
        _default_target: Option<usize>,
    ) {
        self.code.push(Instruction::BrTable(depths.to_vec(), default_depth));
    }

    fn call(&mut self, function: u32) {
        self.code.push(Instruction::Call(function));
    }

    fn indirect_call(&mut self, type_idx: u32, table_idx: u32) {
        self.code.push(Instruction::CallIndirect {
            type_idx,
            table_idx,
        });
    }

    fn call_reference(&mut self, type_idx: u32) {
        self.code.push(Instruction::CallRef(type_idx));
    }

    fn throw_instruction(&mut self, tag: u32) {
        self.code.push(Instruction::Throw(tag));
    }

    fn rethrow(&mut self, depth: u32, _target: Option<usize>) {
        self.code.push(Instruction::Rethrow(depth));
    }

    fn opcode(&mut self, op: Opcode) {
        let instruction = match op {
            Opcode::Unreachable => Instruction::Unreachable,
            Opcode::Nop => Instruction::Nop,
            Opcode::Return => Instruction::Return,
            _ => Instruction::End,
        };
        self.code.push(instruction);
    }

    fn instruction(&mut self, instruction: &Instruction) {
        self.code.push(instruction.clone());
    }
}

#[derive(Default)]
struct ModuleBuilder {
    module: Module,
    recorder: InstructionRecorder,
}

impl TypeSectionListener for ModuleBuilder {
    fn rec_group(&mut self, first: u32, size: u32) {
        self.module.rec_groups.push((first, size));
    }

    fn sub_type(&mut self, _index: u32, ty: &SubType) {
        self.module
            .type_section
            .get_or_insert_with(Vec::new)
            .push(ty.clone());
    }
}

impl ImportSectionListener for ModuleBuilder {
    fn import(&mut self, _index: u32, import: &Import) {
        self.module
            .import_section
            .get_or_insert_with(Vec::new)
            .push(import.clone());
    }
}

impl GlobalSectionListener for ModuleBuilder {
    fn global(
        &mut self,
        _index: u32,
        ty: &ValueType,
        mutable: bool,
    ) -> Option<&mut dyn CodeListener> {
        self.module
            .global_section
            .get_or_insert_with(Vec::new)
            .push(Global {
                ty: *ty,
                mutable,
                init: vec![],
            });
        Some(&mut self.recorder)
    }

    fn global_end(&mut self, _index: u32) {
        let init = self.recorder.take();
        if let Some(global) = self
            .module
            .global_section
            .as_mut()
            .and_then(|globals| globals.last_mut())
        {
            global.init = init;
        }
    }
}

impl CodeSectionListener for ModuleBuilder {
    fn section_start(&mut self, function_count: u32) {
        self.module.code_section = Some(Vec::with_capacity(function_count.min(1024) as usize));
    }

    fn function_start(&mut self, _index: u32, _body: Range<usize>) -> bool {
        if let Some(functions) = self.module.code_section.as_mut() {
            functions.push(Function::default());
        }
        true
    }

    fn local(&mut self, _start: u32, count: u32, ty: &ValueType) {
        if let Some(function) = self
            .module
            .code_section
            .as_mut()
            .and_then(|functions| functions.last_mut())
        {
            function.locals.push(FunctionLocal {
                type_count: count,
                value_type: *ty,
            });
        }
    }

    fn code(&mut self) -> Option<&mut dyn CodeListener> {
        Some(&mut self.recorder)
    }

    fn function_end(&mut self, _index: u32) {
        let code = self.recorder.take();
        if let Some(function) = self
            .module
            .code_section
            .as_mut()
            .and_then(|functions| functions.last_mut())
        {
            function.code = code;
        }
    }
}

impl NameSectionListener for ModuleBuilder {
    fn module_name(&mut self, name: &str) {
        self.module.names.module = Some(name.to_string());
    }

    fn function_name(&mut self, function: u32, name: &str) {
        self.module.names.functions.insert(function, name.to_string());
    }

    fn local_name(&mut self, function: u32, local: u32, name: &str) {
        self.module.names.locals.insert((function, local), name.to_string());
    }

    fn type_name(&mut self, ty: u32, name: &str) {
        self.module.names.types.insert(ty, name.to_string());
    }

    fn global_name(&mut self, global: u32, name: &str) {
        self.module.names.globals.insert(global, name.to_string());
    }

    fn field_name(&mut self, ty: u32, field: u32, name: &str) {
        self.module.names.fields.insert((ty, field), name.to_string());
    }
}

impl SectionConsumer for ModuleBuilder {
    fn wants(&mut self, header: &SectionHeader) -> bool {
        match header.code() {
            Some(SectionCode::Custom) => header.is_custom("name"),
            Some(
                SectionCode::Type
                | SectionCode::Import
                | SectionCode::Function
                | SectionCode::Memory
                | SectionCode::Global
                | SectionCode::Export
                | SectionCode::Code,
            ) => true,
            _ => false,
        }
    }

    fn consume(&mut self, header: &SectionHeader, payload: &[u8]) -> Result<()> {
        self.decode(header, payload)
            .map_err(|e| e.rebase(header.offset))
    }
}

impl ModuleBuilder {
    fn decode(&mut self, header: &SectionHeader, payload: &[u8]) -> Result<()> {
        match header.code() {
            Some(SectionCode::Type) => parse_type_section(payload, self),
            Some(SectionCode::Import) => parse_import_section(payload, self),
            Some(SectionCode::Function) => {
                self.module.function_section = Some(decode_function_section(payload)?);
                Ok(())
            }
            Some(SectionCode::Memory) => {
                self.module.memory_section = Some(decode_memory_section(payload)?);
                Ok(())
            }
            Some(SectionCode::Global) => parse_global_section(payload, self),
            Some(SectionCode::Export) => {
                self.module.export_section = Some(decode_export_section(payload)?);
                Ok(())
            }
            Some(SectionCode::Code) => parse_code_section(payload, self),
            Some(SectionCode::Custom) => parse_name_section(payload, self),
            _ => Ok(()),
        }
    }
}

fn read_all<T>(payload: &[u8], entry: impl FnMut(&mut Reader) -> Result<T>) -> Result<Vec<T>> {
    let mut reader = Reader::new(payload);
    let entries = reader.vec(entry)?;
    if !reader.is_empty() {
        return Err(reader.malformed("trailing bytes after section entries"));
    }
    Ok(entries)
}

fn decode_function_section(payload: &[u8]) -> Result<Vec<u32>> {
    read_all(payload, |reader| reader.uleb32())
}

fn decode_memory_section(payload: &[u8]) -> Result<Vec<Limits>> {
    read_all(payload, |reader| reader.limits())
}

fn decode_export_section(payload: &[u8]) -> Result<Vec<Export>> {
    read_all(payload, |reader| {
        let name = reader.name()?;
        let at = reader.position();
        let kind = reader.u8()?;
        let index = reader.uleb32()?;
        let desc = match kind {
            0x00 => ExportDesc::Func(index),
            0x01 => ExportDesc::Table(index),
            0x02 => ExportDesc::Memory(index),
            0x03 => ExportDesc::Global(index),
            0x04 => ExportDesc::Tag(index),
            _ => {
                return Err(DecodeError::malformed(
                    at,
                    format!("unknown export kind 0x{:02X}", kind),
                ));
            }
        };
        Ok(Export { name, desc })
    })
}
