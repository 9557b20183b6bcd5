//! The `lines` section: a byte-coded line number program.
//!
//! Each outermost START/END pair forms a sequence covering a method's code.
//! Nested pairs describe inlined calls.

use super::{classes::MethodTable, trees::NameTree};
use crate::{
    binary::reader::Reader,
    error::{DecodeError, Result},
};
use std::fmt;
use tracing::trace;

const START: u8 = 0;
const END: u8 = 1;
const LINE: u8 = 2;
const FILE: u8 = 3;
const PTR: u8 = 4;
/// First byte of the packed address/line opcodes.
const USER: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCommand {
    Enter { address: u32, method: usize },
    Exit { address: u32 },
    Line { address: u32, line: i32 },
    FileChange { address: u32, file: Option<usize>, line: i32 },
}

impl LineCommand {
    pub fn address(&self) -> u32 {
        match *self {
            LineCommand::Enter { address, .. }
            | LineCommand::Exit { address }
            | LineCommand::Line { address, .. }
            | LineCommand::FileChange { address, .. } => address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSequence {
    pub start: u32,
    pub end: u32,
    pub method: usize,
    pub commands: Vec<LineCommand>,
}

/// One level of the inline call chain at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineFrame {
    pub method: usize,
    pub file: Option<usize>,
    pub line: i32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LineInfo {
    sequences: Vec<LineSequence>,
}

#[derive(Debug, Clone, Copy)]
struct State {
    file: Option<usize>,
    line: i32,
}

struct Program<'a> {
    files: &'a NameTree,
    methods: &'a MethodTable,
    address: u32,
    open: Option<LineSequence>,
    state: Option<State>,
    stack: Vec<State>,
    sequences: Vec<LineSequence>,
}

impl Program<'_> {
    fn sequence(&mut self, at: usize) -> Result<(&mut LineSequence, &mut State)> {
        match (self.open.as_mut(), self.state.as_mut()) {
            (Some(sequence), Some(state)) => Ok((sequence, state)),
            _ => Err(DecodeError::malformed(at, "line command outside of a sequence")),
        }
    }

    fn advance(&mut self, delta: u32, at: usize) -> Result<()> {
        self.address = self
            .address
            .checked_add(delta)
            .ok_or_else(|| DecodeError::malformed(at, "address overflow"))?;
        Ok(())
    }

    fn start(&mut self, method: usize) {
        let outer = self.state.replace(State {
            file: None,
            line: 0,
        });
        match self.open.as_mut() {
            Some(sequence) => {
                self.stack.extend(outer);
                sequence.commands.push(LineCommand::Enter {
                    address: self.address,
                    method,
                });
            }
            None => {
                self.open = Some(LineSequence {
                    start: self.address,
                    end: self.address,
                    method,
                    commands: vec![],
                });
            }
        }
    }

    fn end(&mut self, at: usize) -> Result<()> {
        let address = self.address;
        let Some(mut sequence) = self.open.take() else {
            return Err(DecodeError::malformed(at, "END without matching START"));
        };
        match self.stack.pop() {
            Some(outer) => {
                sequence.commands.push(LineCommand::Exit { address });
                self.state = Some(outer);
                self.open = Some(sequence);
            }
            None => {
                sequence.end = address;
                trace!(
                    start = sequence.start,
                    end = address,
                    method = sequence.method,
                    "line sequence"
                );
                self.sequences.push(sequence);
                self.state = None;
            }
        }
        Ok(())
    }

    fn line(&mut self, delta: i32, at: usize) -> Result<()> {
        let address = self.address;
        let (sequence, state) = self.sequence(at)?;
        state.line = state
            .line
            .checked_add(delta)
            .ok_or_else(|| DecodeError::malformed(at, "line number overflow"))?;
        sequence.commands.push(LineCommand::Line {
            address,
            line: state.line,
        });
        Ok(())
    }

    fn run(mut self, reader: &mut Reader) -> Result<Vec<LineSequence>> {
        while !reader.is_empty() {
            let at = reader.position();
            match reader.u8()? {
                START => {
                    let method = self.methods.check(reader.uleb32()? as usize, at)?;
                    self.start(method);
                }
                END => self.end(at)?,
                LINE => {
                    let delta = reader.sleb32()?;
                    self.line(delta, at)?;
                }
                FILE => {
                    let value = reader.uleb32()?;
                    let file = match (value >> 1) as usize {
                        0 => None,
                        file => Some(self.files.check(file - 1, at, "file")?),
                    };
                    let delta = if value & 1 != 0 { reader.sleb32()? } else { 0 };
                    let address = self.address;
                    let (sequence, state) = self.sequence(at)?;
                    state.file = file;
                    state.line = state
                        .line
                        .checked_add(delta)
                        .ok_or_else(|| DecodeError::malformed(at, "line number overflow"))?;
                    sequence.commands.push(LineCommand::FileChange {
                        address,
                        file,
                        line: state.line,
                    });
                }
                PTR => {
                    let delta = reader.uleb32()?;
                    self.advance(delta, at)?;
                }
                command if command >= USER => {
                    let value = u32::from(command - USER);
                    self.advance(value % 32, at)?;
                    self.line(value as i32 / 32 - 3, at)?;
                }
                command => {
                    return Err(DecodeError::malformed(
                        at,
                        format!("unknown line command {}", command),
                    ));
                }
            }
        }
        if self.open.is_some() {
            return Err(reader.malformed("line sequence is not closed"));
        }
        Ok(self.sequences)
    }
}

impl LineInfo {
    pub fn parse(payload: &[u8], files: &NameTree, methods: &MethodTable) -> Result<Self> {
        let program = Program {
            files,
            methods,
            address: 0,
            open: None,
            state: None,
            stack: vec![],
            sequences: vec![],
        };
        let mut sequences = program.run(&mut Reader::new(payload))?;
        sequences.sort_by_key(|sequence| sequence.start);
        Ok(Self { sequences })
    }

    pub fn sequences(&self) -> &[LineSequence] {
        &self.sequences
    }

    /// The sequence whose `[start, end)` covers `address`.
    pub fn sequence_at(&self, address: u32) -> Option<&LineSequence> {
        let candidates = self
            .sequences
            .partition_point(|sequence| sequence.start <= address);
        self.sequences[..candidates]
            .iter()
            .rev()
            .find(|sequence| address < sequence.end)
    }

    /// Replays the covering sequence up to `address`. Frames go from the
    /// outermost method to the innermost inlined one.
    pub fn find(&self, address: u32) -> Option<Vec<LineFrame>> {
        let sequence = self.sequence_at(address)?;
        let mut frames = vec![LineFrame {
            method: sequence.method,
            file: None,
            line: 0,
        }];
        for command in sequence
            .commands
            .iter()
            .take_while(|command| command.address() <= address)
        {
            match *command {
                LineCommand::Enter { method, .. } => frames.push(LineFrame {
                    method,
                    file: None,
                    line: 0,
                }),
                LineCommand::Exit { .. } => {
                    if frames.len() > 1 {
                        frames.pop();
                    }
                }
                LineCommand::Line { line, .. } => {
                    if let Some(top) = frames.last_mut() {
                        top.line = line;
                    }
                }
                LineCommand::FileChange { file, line, .. } => {
                    if let Some(top) = frames.last_mut() {
                        top.file = file;
                        top.line = line;
                    }
                }
            }
        }
        Some(frames)
    }
}

impl fmt::Display for LineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for sequence in &self.sequences {
            writeln!(
                f,
                "  sequence [{:#x}, {:#x}) method #{}",
                sequence.start, sequence.end, sequence.method
            )?;
            for command in &sequence.commands {
                match command {
                    LineCommand::Enter { address, method } => {
                        writeln!(f, "    {:#x} enter method #{}", address, method)?
                    }
                    LineCommand::Exit { address } => writeln!(f, "    {:#x} exit", address)?,
                    LineCommand::Line { address, line } => {
                        writeln!(f, "    {:#x} line {}", address, line)?
                    }
                    LineCommand::FileChange {
                        address,
                        file: Some(file),
                        line,
                    } => writeln!(f, "    {:#x} file #{} line {}", address, file, line)?,
                    LineCommand::FileChange {
                        address,
                        file: None,
                        line,
                    } => writeln!(f, "    {:#x} no file, line {}", address, line)?,
                }
            }
        }
        Ok(())
    }
}
