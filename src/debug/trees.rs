//! `files` and `packages`: forests of named nodes.

use super::strings::StringTable;
use crate::{
    binary::reader::Reader,
    error::{DecodeError, Result},
    refs::ForwardRefs,
};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    pub parent: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NameTree {
    nodes: Vec<TreeNode>,
    separator: &'static str,
}

/// Reads a parent link: 0 is the root, anything else is `index + 1`.
fn read_parent(reader: &mut Reader, refs: &mut ForwardRefs) -> Result<Option<usize>> {
    let at = reader.position();
    let parent = reader.uleb32()? as usize;
    if parent == 0 {
        return Ok(None);
    }
    refs.reference(parent - 1, at);
    Ok(Some(parent - 1))
}

impl NameTree {
    fn parse_with(
        payload: &[u8],
        separator: &'static str,
        mut name: impl FnMut(&mut Reader) -> Result<String>,
    ) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let mut refs = ForwardRefs::new();
        let mut nodes = vec![];
        while !reader.is_empty() {
            let parent = read_parent(&mut reader, &mut refs)?;
            let name = name(&mut reader)?;
            nodes.push(TreeNode { name, parent });
            refs.define();
        }
        refs.finish()?;
        Ok(Self { nodes, separator })
    }

    /// File names carry a flag in the low bit of their string index: when
    /// set, an extension string follows and the name is `base.ext`.
    pub fn parse_files(payload: &[u8], strings: &StringTable) -> Result<Self> {
        Self::parse_with(payload, "/", |reader| {
            let at = reader.position();
            let name = reader.uleb32()?;
            let base = strings.resolve(name >> 1, at)?;
            if name & 1 == 0 {
                return Ok(base);
            }
            let extension = strings.read_ref(reader)?;
            Ok(format!("{}.{}", base, extension))
        })
    }

    pub fn parse_packages(payload: &[u8], strings: &StringTable) -> Result<Self> {
        Self::parse_with(payload, ".", |reader| strings.read_ref(reader))
    }

    pub fn get(&self, index: usize) -> Option<&TreeNode> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }

    /// Checks an index read from another section at `at`.
    pub(crate) fn check(&self, index: usize, at: usize, what: &str) -> Result<usize> {
        if index < self.nodes.len() {
            Ok(index)
        } else {
            Err(DecodeError::malformed(
                at,
                format!("{} index {} out of range ({} entries)", what, index, self.nodes.len()),
            ))
        }
    }

    /// The names from the root down to `index`, joined by the tree's
    /// separator. `None` for unknown indices and cyclic parent chains.
    pub fn full_name(&self, index: usize) -> Option<String> {
        let mut parts = vec![];
        let mut current = Some(index);
        while let Some(index) = current {
            if parts.len() > self.nodes.len() {
                return None;
            }
            let node = self.nodes.get(index)?;
            parts.push(node.name.as_str());
            current = node.parent;
        }
        parts.reverse();
        Some(parts.join(self.separator))
    }
}

impl fmt::Display for NameTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.nodes.len() {
            let name = self.full_name(index).unwrap_or_else(|| "<cycle>".to_string());
            writeln!(f, "  #{} {}", index, name)?;
        }
        Ok(())
    }
}
