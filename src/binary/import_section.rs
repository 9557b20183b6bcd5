use super::{
    reader::Reader,
    types::{Import, ImportDesc},
};
use crate::error::{DecodeError, Result};

pub trait ImportSectionListener {
    fn section_start(&mut self, _count: u32) {}

    fn import(&mut self, _index: u32, _import: &Import) {}
}

impl ImportSectionListener for () {}

fn import_desc(reader: &mut Reader) -> Result<ImportDesc> {
    let at = reader.position();
    let desc = match reader.u8()? {
        0x00 => ImportDesc::Func(reader.uleb32()?),
        0x01 => {
            let element = reader.ref_type()?;
            let limits = reader.limits()?;
            ImportDesc::Table { element, limits }
        }
        0x02 => ImportDesc::Memory(reader.limits()?),
        0x03 => {
            let ty = reader.value_type()?;
            let mutable = reader.flag("mutability")?;
            ImportDesc::Global { ty, mutable }
        }
        0x04 => {
            let attribute_at = reader.position();
            let attribute = reader.u8()?;
            if attribute != 0 {
                return Err(DecodeError::malformed(
                    attribute_at,
                    format!("invalid tag attribute {}", attribute),
                ));
            }
            ImportDesc::Tag(reader.uleb32()?)
        }
        kind => {
            return Err(DecodeError::malformed(
                at,
                format!("unknown import kind 0x{:02X}", kind),
            ));
        }
    };
    Ok(desc)
}

pub fn parse_import_section(
    payload: &[u8],
    listener: &mut dyn ImportSectionListener,
) -> Result<()> {
    let mut reader = Reader::new(payload);
    let count = reader.uleb32()?;
    listener.section_start(count);
    for index in 0..count {
        let module = reader.name()?;
        let field = reader.name()?;
        let desc = import_desc(&mut reader)?;
        listener.import(
            index,
            &Import {
                module,
                field,
                desc,
            },
        );
    }
    if !reader.is_empty() {
        return Err(reader.malformed("trailing bytes after import section"));
    }
    Ok(())
}
