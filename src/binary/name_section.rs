//! The `name` custom section. Every subsection is optional and unknown ones
//! are skipped.

use super::reader::Reader;
use crate::error::Result;

const MODULE: u8 = 0;
const FUNCTIONS: u8 = 1;
const LOCALS: u8 = 2;
const TYPES: u8 = 4;
const GLOBALS: u8 = 7;
const FIELDS: u8 = 10;

pub trait NameSectionListener {
    fn module_name(&mut self, _name: &str) {}

    fn function_name(&mut self, _function: u32, _name: &str) {}

    fn local_name(&mut self, _function: u32, _local: u32, _name: &str) {}

    fn type_name(&mut self, _ty: u32, _name: &str) {}

    fn global_name(&mut self, _global: u32, _name: &str) {}

    fn field_name(&mut self, _ty: u32, _field: u32, _name: &str) {}
}

fn name_map(reader: &mut Reader, mut entry: impl FnMut(u32, &str)) -> Result<()> {
    let count = reader.uleb32()?;
    for _ in 0..count {
        let index = reader.uleb32()?;
        let name = reader.name()?;
        entry(index, &name);
    }
    Ok(())
}

fn indirect_name_map(reader: &mut Reader, mut entry: impl FnMut(u32, u32, &str)) -> Result<()> {
    let count = reader.uleb32()?;
    for _ in 0..count {
        let outer = reader.uleb32()?;
        name_map(reader, |inner, name| entry(outer, inner, name))?;
    }
    Ok(())
}

pub fn parse_name_section(payload: &[u8], listener: &mut dyn NameSectionListener) -> Result<()> {
    let mut reader = Reader::new(payload);
    while !reader.is_empty() {
        let id = reader.u8()?;
        let size = reader.count()?;
        let mut sub = reader.sub_reader(size)?;
        match id {
            MODULE => listener.module_name(&sub.name()?),
            FUNCTIONS => name_map(&mut sub, |index, name| listener.function_name(index, name))?,
            LOCALS => indirect_name_map(&mut sub, |function, local, name| {
                listener.local_name(function, local, name)
            })?,
            TYPES => name_map(&mut sub, |index, name| listener.type_name(index, name))?,
            GLOBALS => name_map(&mut sub, |index, name| listener.global_name(index, name))?,
            FIELDS => indirect_name_map(&mut sub, |ty, field, name| {
                listener.field_name(ty, field, name)
            })?,
            _ => continue,
        }
        if !sub.is_empty() {
            return Err(sub.malformed(format!("trailing bytes in name subsection {}", id)));
        }
    }
    Ok(())
}
