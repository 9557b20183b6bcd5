//! Index-addressed forward references.
//!
//! Records are appended to a growable arena in declaration order and may
//! name entries that have not been declared yet. References are stored as
//! plain indices; this table only remembers which of them still point past
//! the end of the arena so the section can be rejected once it is complete.

use crate::error::{DecodeError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ForwardRefs {
    defined: usize,
    /// Not yet defined target index -> offsets of the records naming it.
    pending: BTreeMap<usize, Vec<usize>>,
}

impl ForwardRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries declared so far.
    pub fn defined(&self) -> usize {
        self.defined
    }

    /// Declares the next entry and returns its index. References that were
    /// waiting for it are settled.
    pub fn define(&mut self) -> usize {
        let index = self.defined;
        self.defined += 1;
        self.pending.remove(&index);
        index
    }

    /// Declares every entry below `count`.
    pub fn define_all(&mut self, count: usize) {
        while self.defined < count {
            self.define();
        }
    }

    /// Notes that the record at `offset` refers to entry `target`.
    pub fn reference(&mut self, target: usize, offset: usize) {
        if target >= self.defined {
            self.pending.entry(target).or_default().push(offset);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fails on the earliest reference whose target was never declared.
    pub fn finish(self) -> Result<()> {
        let unresolved = self
            .pending
            .iter()
            .flat_map(|(target, offsets)| offsets.iter().map(move |offset| (*offset, *target)))
            .min();
        match unresolved {
            Some((offset, target)) => Err(DecodeError::malformed(
                offset,
                format!("unresolved reference to entry {}", target),
            )),
            None => Ok(()),
        }
    }
}
