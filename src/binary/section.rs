use crate::error::Result;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum SectionCode {
    Custom = 0x00,
    Type = 0x01,
    Import = 0x02,
    Function = 0x03,
    Table = 0x04,
    Memory = 0x05,
    Global = 0x06,
    Export = 0x07,
    Start = 0x08,
    Element = 0x09,
    Code = 0x0a,
    Data = 0x0b,
    DataCount = 0x0c,
    Tag = 0x0d,
}

/// Where a section sits in the module and what it is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub id: u32,
    /// Only custom sections carry a name.
    pub name: Option<String>,
    /// Absolute offset of the first payload byte.
    pub offset: usize,
    pub size: usize,
}

impl SectionHeader {
    pub fn code(&self) -> Option<SectionCode> {
        u8::try_from(self.id).ok().and_then(SectionCode::from_u8)
    }

    pub fn is_custom(&self, name: &str) -> bool {
        self.id == SectionCode::Custom as u32 && self.name.as_deref() == Some(name)
    }
}

/// Receives section payloads from [`ModuleParser`](super::parser::ModuleParser).
///
/// Sections for which `wants` returns false are skipped without buffering.
/// Errors returned from `consume` must carry absolute stream offsets; decoders
/// work on payload-relative ones, so consumers rebase by `header.offset`.
pub trait SectionConsumer {
    fn wants(&mut self, header: &SectionHeader) -> bool;

    fn consume(&mut self, header: &SectionHeader, payload: &[u8]) -> Result<()>;
}

impl<C: SectionConsumer + ?Sized> SectionConsumer for &mut C {
    fn wants(&mut self, header: &SectionHeader) -> bool {
        (**self).wants(header)
    }

    fn consume(&mut self, header: &SectionHeader, payload: &[u8]) -> Result<()> {
        (**self).consume(header, payload)
    }
}

type Handler<'a> = Box<dyn FnMut(&[u8]) -> Result<()> + 'a>;

/// A [`SectionConsumer`] built from closures keyed by `(id, name)`.
#[derive(Default)]
pub struct SectionRegistry<'a> {
    handlers: HashMap<(u32, Option<String>), Handler<'a>>,
}

impl<'a> SectionRegistry<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_section(
        &mut self,
        code: SectionCode,
        handler: impl FnMut(&[u8]) -> Result<()> + 'a,
    ) -> &mut Self {
        self.handlers.insert((code as u32, None), Box::new(handler));
        self
    }

    pub fn on_custom(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(&[u8]) -> Result<()> + 'a,
    ) -> &mut Self {
        self.handlers.insert(
            (SectionCode::Custom as u32, Some(name.into())),
            Box::new(handler),
        );
        self
    }

    fn key(header: &SectionHeader) -> (u32, Option<String>) {
        (header.id, header.name.clone())
    }
}

impl SectionConsumer for SectionRegistry<'_> {
    fn wants(&mut self, header: &SectionHeader) -> bool {
        self.handlers.contains_key(&Self::key(header))
    }

    fn consume(&mut self, header: &SectionHeader, payload: &[u8]) -> Result<()> {
        match self.handlers.get_mut(&Self::key(header)) {
            Some(handler) => handler(payload).map_err(|e| e.rebase(header.offset)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SectionCode, SectionConsumer, SectionHeader, SectionRegistry};
    use anyhow::Result;

    fn header(id: u32, name: Option<&str>) -> SectionHeader {
        SectionHeader {
            id,
            name: name.map(Into::into),
            offset: 0,
            size: 0,
        }
    }

    #[test]
    fn registry_dispatches_by_id_and_name() -> Result<()> {
        let mut seen = vec![];
        {
            let mut registry = SectionRegistry::new();
            registry.on_section(SectionCode::Code, |payload| {
                seen.push(("code", payload.to_vec()));
                Ok(())
            });
            assert!(registry.wants(&header(10, None)));
            assert!(!registry.wants(&header(1, None)));
            assert!(!registry.wants(&header(0, Some("strings"))));
            registry.consume(&header(10, None), &[1, 2])?;
        }
        assert_eq!(seen, vec![("code", vec![1, 2])]);
        Ok(())
    }

    #[test]
    fn section_codes() {
        assert_eq!(header(10, None).code(), Some(SectionCode::Code));
        assert_eq!(header(42, None).code(), None);
        assert!(header(0, Some("name")).is_custom("name"));
        assert!(!header(0, Some("names")).is_custom("name"));
    }
}
