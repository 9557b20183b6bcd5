use crate::{
    binary::reader::Reader,
    error::{DecodeError, Result},
};
use std::fmt;

/// Flat string table every other debug section refers into.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StringTable {
    strings: Vec<String>,
}

impl StringTable {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let mut strings = vec![];
        while !reader.is_empty() {
            strings.push(reader.name()?);
        }
        Ok(Self { strings })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }

    /// Resolves a string index read by the caller at `at`.
    pub(crate) fn resolve(&self, index: u32, at: usize) -> Result<String> {
        self.get(index as usize).map(str::to_owned).ok_or_else(|| {
            DecodeError::malformed(
                at,
                format!("string index {} out of range ({} strings)", index, self.len()),
            )
        })
    }

    /// Reads a ULEB128 string index and resolves it.
    pub(crate) fn read_ref(&self, reader: &mut Reader) -> Result<String> {
        let at = reader.position();
        let index = reader.uleb32()?;
        self.resolve(index, at)
    }
}

impl fmt::Display for StringTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, string) in self.strings.iter().enumerate() {
            writeln!(f, "  #{} {:?}", index, string)?;
        }
        Ok(())
    }
}
