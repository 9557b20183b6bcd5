//! Branch and call-site reconstruction from the structured opcode stream.
//!
//! Every branch starts out unresolved and is settled by the next address
//! the stream reaches in the context it was parked in: the enclosing block
//! for forward edges, the current instruction sequence for fallthrough.
//! Loop targets are known immediately.

use crate::{
    binary::{
        code_section::{parse_code_section, CodeListener, CodeSectionListener},
        instruction::Instruction,
        opcode::{BranchOpcode, Opcode},
        types::BlockType,
    },
    error::Result,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Range,
};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    Branch,
    /// A call site; execution may be suspended here and resumes at the
    /// next instruction.
    Call,
}

#[derive(Debug)]
struct Branch {
    address: usize,
    kind: BranchKind,
    targets: BTreeSet<usize>,
}

#[derive(Debug)]
struct Block {
    is_loop: bool,
    start: usize,
    /// Branches that resolve to the first address after this block.
    pending: Vec<usize>,
    /// The edge around a non-loop block, retargeted when an `else` or
    /// `catch` arm opens.
    skip: Option<usize>,
    has_arms: bool,
}

/// All branches leaving one address, merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPoint {
    pub address: usize,
    pub targets: BTreeSet<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionControlFlow {
    pub index: u32,
    /// Offsets into the code section payload.
    pub range: Range<usize>,
    pub branches: Vec<BranchPoint>,
    pub calls: Vec<BranchPoint>,
}

fn find_point(points: &[BranchPoint], address: usize) -> Option<&BranchPoint> {
    points
        .binary_search_by_key(&address, |point| point.address)
        .ok()
        .map(|index| &points[index])
}

impl FunctionControlFlow {
    pub fn branch_at(&self, address: usize) -> Option<&BranchPoint> {
        find_point(&self.branches, address)
    }

    pub fn call_at(&self, address: usize) -> Option<&BranchPoint> {
        find_point(&self.calls, address)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlFlowInfo {
    functions: Vec<FunctionControlFlow>,
}

impl ControlFlowInfo {
    /// Reconstructs every function of a code section payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reconstructor = ControlFlowReconstructor::new();
        parse_code_section(payload, &mut reconstructor)?;
        Ok(reconstructor.finish())
    }

    pub fn functions(&self) -> &[FunctionControlFlow] {
        &self.functions
    }

    /// The function whose body contains `address`.
    pub fn find(&self, address: usize) -> Option<&FunctionControlFlow> {
        let candidates = self
            .functions
            .partition_point(|function| function.range.start <= address);
        self.functions[..candidates]
            .last()
            .filter(|function| address < function.range.end)
    }
}

/// A [`CodeSectionListener`] that records the branch structure of every
/// function body it is given.
#[derive(Debug, Default)]
pub struct ControlFlowReconstructor {
    branches: Vec<Branch>,
    blocks: Vec<Block>,
    /// Branches that fall through to the next instruction.
    pending: Vec<usize>,
    current: usize,
    previous: usize,
    index: u32,
    range: Range<usize>,
    functions: Vec<FunctionControlFlow>,
}

impl ControlFlowReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> ControlFlowInfo {
        ControlFlowInfo {
            functions: self.functions,
        }
    }

    fn add_branch(&mut self, address: usize, kind: BranchKind) -> usize {
        self.branches.push(Branch {
            address,
            kind,
            targets: BTreeSet::new(),
        });
        self.branches.len() - 1
    }

    fn divergent(&mut self) {
        self.add_branch(self.current, BranchKind::Branch);
    }

    fn suspension_point(&mut self) {
        let id = self.add_branch(self.current, BranchKind::Call);
        self.pending.push(id);
    }

    /// Sends branch `id` to the block `token`.
    fn jump(&mut self, id: usize, token: usize) {
        let Some(block) = self.blocks.get_mut(token) else {
            return;
        };
        if block.is_loop {
            self.branches[id].targets.insert(block.start);
        } else {
            block.pending.push(id);
        }
    }

    /// The edge leaving the arm that ended at the previous instruction. A
    /// branch already sitting on that instruction is reused, so an arm
    /// ending in a single branch does not get a second one.
    fn close_arm(&mut self) -> usize {
        let reusable = self
            .branches
            .last()
            .is_some_and(|branch| branch.address == self.previous);
        if reusable {
            self.branches.len() - 1
        } else {
            self.add_branch(self.previous, BranchKind::Branch)
        }
    }

    fn start_arm(&mut self, token: usize) {
        let arm = self.close_arm();
        let Some(block) = self.blocks.get_mut(token) else {
            return;
        };
        if let Some(skip) = block.skip.take() {
            block.pending.retain(|id| *id != skip);
            // resolved by the first instruction of the new arm
            self.pending.push(skip);
        }
        block.pending.push(arm);
        block.has_arms = true;
    }

    fn snapshot(&mut self) -> FunctionControlFlow {
        let mut branches: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        let mut calls: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for branch in self.branches.drain(..) {
            let points = match branch.kind {
                BranchKind::Branch => &mut branches,
                BranchKind::Call => &mut calls,
            };
            points
                .entry(branch.address)
                .or_default()
                .extend(branch.targets);
        }
        let points = |map: BTreeMap<usize, BTreeSet<usize>>| {
            map.into_iter()
                .map(|(address, targets)| BranchPoint { address, targets })
                .collect::<Vec<_>>()
        };
        FunctionControlFlow {
            index: self.index,
            range: self.range.clone(),
            branches: points(branches),
            calls: points(calls),
        }
    }
}

impl CodeListener for ControlFlowReconstructor {
    fn address(&mut self, address: usize) {
        for id in self.pending.drain(..) {
            self.branches[id].targets.insert(address);
        }
        self.previous = self.current;
        self.current = address;
    }

    fn start_block(&mut self, is_loop: bool, _ty: &BlockType) -> usize {
        let skip = (!is_loop).then(|| self.add_branch(self.current, BranchKind::Branch));
        self.blocks.push(Block {
            is_loop,
            start: self.current,
            pending: skip.into_iter().collect(),
            skip,
            has_arms: false,
        });
        self.blocks.len() - 1
    }

    fn start_else_section(&mut self, token: usize) {
        self.start_arm(token);
    }

    fn start_catch(&mut self, token: usize, _tag: Option<u32>) {
        self.start_arm(token);
    }

    fn end_block(&mut self, _token: usize, _is_loop: bool) {
        let Some(mut block) = self.blocks.pop() else {
            return;
        };
        if block.has_arms {
            let arm = self.close_arm();
            self.pending.push(arm);
        }
        self.pending.append(&mut block.pending);
        if block.is_loop {
            let id = self.add_branch(self.current, BranchKind::Branch);
            self.branches[id].targets.insert(block.start);
        }
    }

    fn branch(&mut self, op: BranchOpcode, _depth: u32, target: Option<usize>) {
        let id = self.add_branch(self.current, BranchKind::Branch);
        if let Some(token) = target {
            self.jump(id, token);
        }
        if op.is_conditional() {
            self.pending.push(id);
        }
    }

    fn table_branch(
        &mut self,
        _depths: &[u32],
        targets: &[Option<usize>],
        _default_depth: u32,
        default_target: Option<usize>,
    ) {
        let id = self.add_branch(self.current, BranchKind::Branch);
        for token in targets.iter().chain([&default_target]).flatten() {
            self.jump(id, *token);
        }
    }

    fn call(&mut self, _function: u32) {
        self.suspension_point();
    }

    fn indirect_call(&mut self, _type_idx: u32, _table_idx: u32) {
        self.suspension_point();
    }

    fn call_reference(&mut self, _type_idx: u32) {
        self.suspension_point();
    }

    fn throw_instruction(&mut self, _tag: u32) {
        self.divergent();
    }

    fn rethrow(&mut self, _depth: u32, _target: Option<usize>) {
        self.divergent();
    }

    fn opcode(&mut self, op: Opcode) {
        if matches!(op, Opcode::Return | Opcode::Unreachable) {
            self.divergent();
        }
    }

    fn instruction(&mut self, instruction: &Instruction) {
        if instruction.is_divergent() {
            self.divergent();
        }
    }
}

impl CodeSectionListener for ControlFlowReconstructor {
    fn function_start(&mut self, index: u32, body: Range<usize>) -> bool {
        self.branches.clear();
        self.blocks.clear();
        self.pending.clear();
        self.current = body.start;
        self.previous = body.start;
        self.index = index;
        self.range = body;
        true
    }

    fn code(&mut self) -> Option<&mut dyn CodeListener> {
        Some(self)
    }

    fn function_end(&mut self, index: u32) {
        let function = self.snapshot();
        trace!(
            index,
            branches = function.branches.len(),
            calls = function.calls.len(),
            "reconstructed control flow"
        );
        self.functions.push(function);
    }
}

fn write_points(f: &mut fmt::Formatter<'_>, label: &str, points: &[BranchPoint]) -> fmt::Result {
    for point in points {
        write!(f, "    {} @{:#x} ->", label, point.address)?;
        if point.targets.is_empty() {
            write!(f, " (none)")?;
        }
        for target in &point.targets {
            write!(f, " {:#x}", target)?;
        }
        writeln!(f)?;
    }
    Ok(())
}

impl fmt::Display for ControlFlowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for function in &self.functions {
            writeln!(
                f,
                "  function #{} [{:#x}, {:#x})",
                function.index, function.range.start, function.range.end
            )?;
            write_points(f, "branch", &function.branches)?;
            write_points(f, "call", &function.calls)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BranchPoint, ControlFlowInfo};
    use crate::binary::{
        parser::ModuleParser,
        section::{SectionCode, SectionRegistry},
        source::SliceSource,
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    /// A code section holding one body without locals. The instructions
    /// start at payload offset 3.
    fn single_body(instructions: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x01, instructions.len() as u8 + 1, 0x00];
        payload.extend_from_slice(instructions);
        payload
    }

    fn targets(addresses: &[usize]) -> BTreeSet<usize> {
        addresses.iter().copied().collect()
    }

    fn code_payload(wasm: &[u8]) -> Result<Vec<u8>> {
        let mut payload = vec![];
        let mut registry = SectionRegistry::new();
        registry.on_section(SectionCode::Code, |bytes| {
            payload = bytes.to_vec();
            Ok(())
        });
        ModuleParser::new(registry).parse(&mut SliceSource::new(wasm))?;
        Ok(payload)
    }

    #[test]
    fn loop_branch_is_back_edge() -> Result<()> {
        // 3: loop, 5: br 0, 7: end, 8: end
        let info = ControlFlowInfo::parse(&single_body(&[0x03, 0x40, 0x0C, 0x00, 0x0B, 0x0B]))?;
        let function = &info.functions()[0];
        assert_eq!(function.range, 2..9);
        assert_eq!(
            function.branch_at(5).map(|point| &point.targets),
            Some(&targets(&[3]))
        );
        // the end of a loop also leads back to its start
        assert_eq!(
            function.branch_at(7).map(|point| &point.targets),
            Some(&targets(&[3]))
        );
        Ok(())
    }

    #[test]
    fn block_branch_is_forward_edge() -> Result<()> {
        // 3: block, 5: br 0, 7: end, 8: end
        let info = ControlFlowInfo::parse(&single_body(&[0x02, 0x40, 0x0C, 0x00, 0x0B, 0x0B]))?;
        let function = &info.functions()[0];
        assert_eq!(
            function.branches,
            vec![
                BranchPoint {
                    address: 3,
                    targets: targets(&[8]),
                },
                BranchPoint {
                    address: 5,
                    targets: targets(&[8]),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn both_arms_of_if_reach_join() -> Result<()> {
        // 3: i32.const 1, 5: if, 7: nop, 8: else, 9: nop, 10: end, 11: end
        let info = ControlFlowInfo::parse(&single_body(&[
            0x41, 0x01, 0x04, 0x40, 0x01, 0x05, 0x01, 0x0B, 0x0B,
        ]))?;
        let function = &info.functions()[0];
        let into_join: Vec<_> = function
            .branches
            .iter()
            .filter(|point| point.targets.contains(&11))
            .map(|point| point.address)
            .collect();
        assert_eq!(into_join, vec![7, 9]);
        // a false condition enters the else arm
        assert_eq!(
            function.branch_at(5).map(|point| &point.targets),
            Some(&targets(&[9]))
        );
        Ok(())
    }

    #[test]
    fn empty_then_arm_skips_to_both() -> Result<()> {
        // 3: i32.const 0, 5: if, 7: else, 8: nop, 9: end, 10: end
        let info = ControlFlowInfo::parse(&single_body(&[
            0x41, 0x00, 0x04, 0x40, 0x05, 0x01, 0x0B, 0x0B,
        ]))?;
        let function = &info.functions()[0];
        assert_eq!(
            function.branch_at(5).map(|point| &point.targets),
            Some(&targets(&[8, 10]))
        );
        Ok(())
    }

    #[test]
    fn conditional_and_table_branches() -> Result<()> {
        // 3: block, 5: i32.const 0, 7: br_if 0, 9: i32.const 0,
        // 11: br_table [0 1] 0, 16: end, 17: end
        let info = ControlFlowInfo::parse(&single_body(&[
            0x02, 0x40, 0x41, 0x00, 0x0D, 0x00, 0x41, 0x00, 0x0E, 0x02, 0x00, 0x01, 0x00, 0x0B,
            0x0B,
        ]))?;
        let function = &info.functions()[0];
        assert_eq!(
            function.branch_at(7).map(|point| &point.targets),
            Some(&targets(&[9, 17]))
        );
        // depth 1 leaves the function and adds no target
        assert_eq!(
            function.branch_at(11).map(|point| &point.targets),
            Some(&targets(&[17]))
        );
        Ok(())
    }

    #[test]
    fn divergent_instructions_have_no_targets() -> Result<()> {
        // 3: unreachable, 4: return, 5: end
        let info = ControlFlowInfo::parse(&single_body(&[0x00, 0x0F, 0x0B]))?;
        let function = &info.functions()[0];
        assert_eq!(function.branches.len(), 2);
        assert!(function
            .branches
            .iter()
            .all(|point| point.targets.is_empty()));
        Ok(())
    }

    #[test]
    fn calls_resume_at_next_instruction() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/calls.wat")?;
        let info = ControlFlowInfo::parse(&code_payload(&wasm)?)?;
        assert_eq!(info.functions().len(), 3);

        let twice = &info.functions()[0];
        assert_eq!(twice.calls.len(), 2);
        for (call, next) in twice.calls.iter().zip(twice.calls.iter().skip(1)) {
            assert_eq!(call.targets, targets(&[next.address]));
        }
        let double = &info.functions()[1];
        assert!(double.calls.is_empty());

        let dispatch = &info.functions()[2];
        assert_eq!(dispatch.calls.len(), 1);
        let returns = &dispatch.branches;
        assert_eq!(returns.len(), 1);
        assert_eq!(dispatch.calls[0].targets, targets(&[returns[0].address]));

        assert_eq!(info.find(dispatch.range.start), Some(dispatch));
        assert_eq!(info.find(double.range.end - 1), Some(double));
        assert_eq!(info.find(0), None);
        Ok(())
    }
}
