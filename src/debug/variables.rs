use super::strings::StringTable;
use crate::{
    binary::reader::Reader,
    error::{DecodeError, Result},
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum VariableType {
    Undefined = 0,
    Int = 1,
    Long = 2,
    Float = 3,
    Double = 4,
    Object = 5,
    Address = 6,
}

impl VariableType {
    pub fn name(self) -> &'static str {
        match self {
            VariableType::Undefined => "undefined",
            VariableType::Int => "int",
            VariableType::Long => "long",
            VariableType::Float => "float",
            VariableType::Double => "double",
            VariableType::Object => "object",
            VariableType::Address => "address",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub ty: VariableType,
}

/// A variable lives at `location` for addresses in `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableRange {
    pub variable: usize,
    pub start: u32,
    pub end: u32,
    pub location: i32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VariablesInfo {
    variables: Vec<VariableInfo>,
    /// Sorted by `start`.
    ranges: Vec<VariableRange>,
}

fn overflow(at: usize) -> DecodeError {
    DecodeError::malformed(at, "variable range overflows")
}

impl VariablesInfo {
    pub fn parse(payload: &[u8], strings: &StringTable) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let mut variables = vec![];
        let mut ranges = vec![];
        while !reader.is_empty() {
            let mut address = reader.uleb32()?;
            let mut location = 0i32;
            let count = reader.uleb32()?;
            for _ in 0..count {
                let name = strings.read_ref(&mut reader)?;
                let at = reader.position();
                let tag = reader.u8()?;
                let ty = VariableType::from_u8(tag).ok_or_else(|| {
                    DecodeError::malformed(at, format!("unknown variable type {}", tag))
                })?;
                let variable = variables.len();
                variables.push(VariableInfo { name, ty });

                let range_count = reader.uleb32()?;
                for _ in 0..range_count {
                    let at = reader.position();
                    let start_delta = reader.sleb32()?;
                    let size = reader.uleb32()?;
                    let location_delta = reader.sleb32()?;
                    address = address
                        .checked_add_signed(start_delta)
                        .ok_or_else(|| overflow(at))?;
                    location = location
                        .checked_add(location_delta)
                        .ok_or_else(|| overflow(at))?;
                    let end = address.checked_add(size).ok_or_else(|| overflow(at))?;
                    ranges.push(VariableRange {
                        variable,
                        start: address,
                        end,
                        location,
                    });
                }
            }
        }
        // stable, so ranges sharing a start keep their declaration order
        ranges.sort_by_key(|range| range.start);
        Ok(Self { variables, ranges })
    }

    pub fn variables(&self) -> &[VariableInfo] {
        &self.variables
    }

    pub fn ranges(&self) -> &[VariableRange] {
        &self.ranges
    }

    pub fn variable(&self, range: &VariableRange) -> Option<&VariableInfo> {
        self.variables.get(range.variable)
    }

    /// Ranges live at `address`, in start order.
    pub fn find(&self, address: u32) -> impl Iterator<Item = &VariableRange> {
        let candidates = self.ranges.partition_point(|range| range.start <= address);
        self.ranges[..candidates]
            .iter()
            .filter(move |range| address < range.end)
    }
}

impl fmt::Display for VariablesInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for range in &self.ranges {
            let (name, ty) = self
                .variable(range)
                .map_or(("?", "?"), |variable| (variable.name.as_str(), variable.ty.name()));
            writeln!(
                f,
                "  [{:#x}, {:#x}) {}: {} at {}",
                range.start, range.end, name, ty, range.location
            )?;
        }
        Ok(())
    }
}
