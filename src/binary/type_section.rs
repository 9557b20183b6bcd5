use super::{
    reader::Reader,
    types::{CompositeType, FieldType, FuncType, StorageType, SubType},
};
use crate::{
    error::{DecodeError, Result},
    refs::ForwardRefs,
};

pub trait TypeSectionListener {
    fn section_start(&mut self, _entry_count: u32) {}

    /// A recursion group of `size` types starting at type index `first`.
    /// Types outside an explicit group form a group of one.
    fn rec_group(&mut self, _first: u32, _size: u32) {}

    fn sub_type(&mut self, _index: u32, _ty: &SubType) {}
}

impl TypeSectionListener for () {}

fn composite_type(reader: &mut Reader) -> Result<CompositeType> {
    let at = reader.position();
    let ty = match reader.u8()? {
        0x5E => CompositeType::Array(reader.field_type()?),
        0x5F => CompositeType::Struct(reader.vec(|r| r.field_type())?),
        0x60 => CompositeType::Func(FuncType {
            params: reader.vec(|r| r.value_type())?,
            results: reader.vec(|r| r.value_type())?,
        }),
        other => {
            return Err(DecodeError::malformed(
                at,
                format!("unknown composite type tag 0x{:02X}", other),
            ));
        }
    };
    Ok(ty)
}

fn sub_type(reader: &mut Reader) -> Result<SubType> {
    let open = match reader.peek() {
        Some(0x50) => true,
        Some(0x4F) => false,
        _ => {
            return Ok(SubType {
                open: false,
                supertypes: vec![],
                composite: composite_type(reader)?,
            });
        }
    };
    reader.u8()?;
    let supertypes = reader.vec(|r| r.uleb32())?;
    let composite = composite_type(reader)?;
    Ok(SubType {
        open,
        supertypes,
        composite,
    })
}

/// Type indices a sub type mentions.
fn referenced_types(ty: &SubType) -> Vec<u32> {
    let field = |field: &FieldType| match field.storage {
        StorageType::Value(value) => value.type_index(),
        StorageType::I8 | StorageType::I16 => None,
    };
    let mut indices = ty.supertypes.clone();
    match &ty.composite {
        CompositeType::Array(element) => indices.extend(field(element)),
        CompositeType::Struct(fields) => indices.extend(fields.iter().filter_map(field)),
        CompositeType::Func(func) => indices.extend(
            func.params
                .iter()
                .chain(&func.results)
                .filter_map(|ty| ty.type_index()),
        ),
    }
    indices
}

/// Decodes a type section. Types may refer to types declared later in the
/// same section, but every reference must be satisfied by its end.
pub fn parse_type_section(payload: &[u8], listener: &mut dyn TypeSectionListener) -> Result<()> {
    let mut reader = Reader::new(payload);
    let mut refs = ForwardRefs::new();
    let count = reader.uleb32()?;
    listener.section_start(count);
    for _ in 0..count {
        let size = if reader.peek() == Some(0x4E) {
            reader.u8()?;
            reader.uleb32()?
        } else {
            1
        };
        listener.rec_group(refs.defined() as u32, size);
        for _ in 0..size {
            let at = reader.position();
            let ty = sub_type(&mut reader)?;
            for index in referenced_types(&ty) {
                refs.reference(index as usize, at);
            }
            let index = refs.define();
            listener.sub_type(index as u32, &ty);
        }
    }
    if !reader.is_empty() {
        return Err(reader.malformed("trailing bytes after type section"));
    }
    refs.finish()
}
