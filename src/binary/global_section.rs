use super::{
    code_section::{parse_expression, CodeListener},
    reader::Reader,
    types::ValueType,
};
use crate::error::Result;

pub trait GlobalSectionListener {
    fn section_start(&mut self, _count: u32) {}

    /// Returns where the init expression goes, or `None` to only validate it.
    fn global(
        &mut self,
        _index: u32,
        _ty: &ValueType,
        _mutable: bool,
    ) -> Option<&mut dyn CodeListener> {
        None
    }

    fn global_end(&mut self, _index: u32) {}
}

impl GlobalSectionListener for () {}

pub fn parse_global_section(
    payload: &[u8],
    listener: &mut dyn GlobalSectionListener,
) -> Result<()> {
    let mut reader = Reader::new(payload);
    let count = reader.uleb32()?;
    listener.section_start(count);
    for index in 0..count {
        let ty = reader.value_type()?;
        let mutable = reader.flag("mutability")?;
        match listener.global(index, &ty, mutable) {
            Some(code) => parse_expression(&mut reader, code)?,
            None => parse_expression(&mut reader, &mut ())?,
        }
        listener.global_end(index);
    }
    if !reader.is_empty() {
        return Err(reader.malformed("trailing bytes after global section"));
    }
    Ok(())
}
