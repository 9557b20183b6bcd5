//! `classLayout`: runtime type descriptors keyed by their tag address.

use super::{classes::ClassTable, strings::StringTable};
use crate::{
    binary::reader::Reader,
    error::{DecodeError, Result},
    refs::ForwardRefs,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::{collections::BTreeMap, fmt};

const CLASS: u8 = 0;
const INTERFACE: u8 = 1;
const ARRAY: u8 = 2;
const UNKNOWN: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum FieldType {
    Boolean = 1,
    Byte = 2,
    Short = 3,
    Char = 4,
    Int = 5,
    Long = 6,
    Float = 7,
    Double = 8,
    Object = 9,
    Address = 10,
    Undefined = 11,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Byte => "byte",
            FieldType::Short => "short",
            FieldType::Char => "char",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Object => "object",
            FieldType::Address => "address",
            FieldType::Undefined => "undefined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub offset: i32,
    pub ty: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum PrimitiveKind {
    Boolean = 3,
    Byte = 4,
    Short = 5,
    Char = 6,
    Int = 7,
    Long = 8,
    Float = 9,
    Double = 10,
    Void = 11,
}

impl PrimitiveKind {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Boolean => "boolean",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::Short => "short",
            PrimitiveKind::Char => "char",
            PrimitiveKind::Int => "int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
            PrimitiveKind::Void => "void",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutKind {
    Class {
        class: usize,
        /// Index of the superclass layout.
        superclass: Option<usize>,
        size: u32,
        static_fields: Vec<FieldInfo>,
        instance_fields: Vec<FieldInfo>,
    },
    Interface {
        class: usize,
    },
    Array {
        /// Index of the element type layout.
        element: usize,
    },
    Primitive(PrimitiveKind),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLayout {
    pub address: i32,
    pub kind: LayoutKind,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassLayoutInfo {
    layouts: Vec<TypeLayout>,
    by_address: BTreeMap<i32, usize>,
}

struct LayoutParser<'a, 'b> {
    reader: Reader<'a>,
    strings: &'b StringTable,
    classes: &'b ClassTable,
    refs: ForwardRefs,
}

impl LayoutParser<'_, '_> {
    /// `current - N`; zero means no reference when `optional`.
    fn back_ref(&mut self, optional: bool) -> Result<Option<usize>> {
        let at = self.reader.position();
        let delta = self.reader.sleb32()?;
        if delta == 0 {
            return if optional {
                Ok(None)
            } else {
                Err(DecodeError::malformed(at, "layout reference to itself"))
            };
        }
        let current = self.refs.defined() as i64;
        let target = usize::try_from(current - i64::from(delta)).map_err(|_| {
            DecodeError::malformed(at, format!("layout reference {} before first entry", delta))
        })?;
        self.refs.reference(target, at);
        Ok(Some(target))
    }

    fn class(&mut self) -> Result<usize> {
        let at = self.reader.position();
        let class = self.reader.uleb32()? as usize;
        self.classes.check(class, at)
    }

    fn fields(&mut self) -> Result<Vec<FieldInfo>> {
        let mut fields = vec![];
        let mut offset = 0i32;
        loop {
            let at = self.reader.position();
            let tag = self.reader.u8()?;
            if tag == 0 {
                return Ok(fields);
            }
            let ty = FieldType::from_u8(tag).ok_or_else(|| {
                DecodeError::malformed(at, format!("unknown field type {}", tag))
            })?;
            let name = self.strings.read_ref(&mut self.reader)?;
            let at = self.reader.position();
            let delta = self.reader.sleb32()?;
            offset = offset
                .checked_add(delta)
                .ok_or_else(|| DecodeError::malformed(at, "field offset overflows"))?;
            fields.push(FieldInfo { name, offset, ty });
        }
    }

    fn kind(&mut self, tag: u8, at: usize) -> Result<LayoutKind> {
        Ok(match tag {
            CLASS => {
                let class = self.class()?;
                let superclass = self.back_ref(true)?;
                let size = self.reader.uleb32()?;
                let static_fields = self.fields()?;
                let instance_fields = self.fields()?;
                LayoutKind::Class {
                    class,
                    superclass,
                    size,
                    static_fields,
                    instance_fields,
                }
            }
            INTERFACE => LayoutKind::Interface {
                class: self.class()?,
            },
            ARRAY => {
                let element = self.back_ref(false)?.unwrap_or_default();
                LayoutKind::Array { element }
            }
            UNKNOWN => LayoutKind::Unknown,
            tag => PrimitiveKind::from_u8(tag)
                .map(LayoutKind::Primitive)
                .ok_or_else(|| DecodeError::malformed(at, format!("unknown layout kind {}", tag)))?,
        })
    }
}

impl ClassLayoutInfo {
    pub fn parse(payload: &[u8], strings: &StringTable, classes: &ClassTable) -> Result<Self> {
        let mut parser = LayoutParser {
            reader: Reader::new(payload),
            strings,
            classes,
            refs: ForwardRefs::new(),
        };
        let mut layouts = vec![];
        let mut by_address = BTreeMap::new();
        let mut address = 0i32;
        while !parser.reader.is_empty() {
            let at = parser.reader.position();
            let tag = parser.reader.u8()?;
            let delta = parser.reader.sleb32()?;
            address = address
                .checked_add(delta)
                .ok_or_else(|| DecodeError::malformed(at, "layout address overflows"))?;
            let kind = parser.kind(tag, at)?;
            let index = parser.refs.define();
            by_address.entry(address).or_insert(index);
            layouts.push(TypeLayout { address, kind });
        }
        parser.refs.finish()?;
        Ok(Self {
            layouts,
            by_address,
        })
    }

    pub fn get(&self, index: usize) -> Option<&TypeLayout> {
        self.layouts.get(index)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeLayout> {
        self.layouts.iter()
    }

    /// Looks up the layout whose tag is `address`.
    pub fn find(&self, address: i32) -> Option<&TypeLayout> {
        self.by_address
            .get(&address)
            .and_then(|index| self.layouts.get(*index))
    }

    /// Inherited fields first, following the superclass chain.
    pub fn instance_fields(&self, index: usize) -> Vec<&FieldInfo> {
        let mut chain = vec![];
        let mut current = Some(index);
        while let Some(index) = current {
            if chain.len() > self.layouts.len() {
                break;
            }
            match self.layouts.get(index).map(|layout| &layout.kind) {
                Some(LayoutKind::Class {
                    superclass,
                    instance_fields,
                    ..
                }) => {
                    chain.push(instance_fields);
                    current = *superclass;
                }
                _ => break,
            }
        }
        chain.into_iter().rev().flatten().collect()
    }
}

fn write_fields(f: &mut fmt::Formatter<'_>, label: &str, fields: &[FieldInfo]) -> fmt::Result {
    for field in fields {
        writeln!(
            f,
            "      {} {}: {} at {}",
            label,
            field.name,
            field.ty.name(),
            field.offset
        )?;
    }
    Ok(())
}

impl fmt::Display for ClassLayoutInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, layout) in self.layouts.iter().enumerate() {
            write!(f, "  #{} @{:#x} ", index, layout.address)?;
            match &layout.kind {
                LayoutKind::Class {
                    class,
                    superclass,
                    size,
                    static_fields,
                    instance_fields,
                } => {
                    write!(f, "class #{} size {}", class, size)?;
                    if let Some(superclass) = superclass {
                        write!(f, " extends #{}", superclass)?;
                    }
                    writeln!(f)?;
                    write_fields(f, "static", static_fields)?;
                    write_fields(f, "field", instance_fields)?;
                }
                LayoutKind::Interface { class } => writeln!(f, "interface #{}", class)?,
                LayoutKind::Array { element } => writeln!(f, "array of #{}", element)?,
                LayoutKind::Primitive(kind) => writeln!(f, "{}", kind.name())?,
                LayoutKind::Unknown => writeln!(f, "unknown")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ClassLayoutInfo, FieldType, LayoutKind, PrimitiveKind};
    use crate::binary::reader::tests::{encode_sleb, encode_uleb};
    use crate::debug::{
        classes::ClassTable,
        strings::{tests::encode_strings, StringTable},
        trees::NameTree,
    };
    use crate::error::DecodeError;
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn tables() -> Result<(StringTable, ClassTable)> {
        let strings = StringTable::parse(&encode_strings(&["Object", "Point", "x", "y", "count"]))?;
        let classes = ClassTable::parse(&[0x00, 0x00, 0x00, 0x01], &strings, &NameTree::default())?;
        Ok((strings, classes))
    }

    fn node(kind: u8, address_delta: i64, out: &mut Vec<u8>) {
        out.push(kind);
        encode_sleb(address_delta, out);
    }

    fn field(ty: u8, name: u64, offset_delta: i64, out: &mut Vec<u8>) {
        out.push(ty);
        encode_uleb(name, out);
        encode_sleb(offset_delta, out);
    }

    #[test]
    fn classes_with_forward_superclass_and_fields() -> Result<()> {
        let (strings, classes) = tables()?;
        let mut payload = vec![];
        // #0 Point extends #1, declared before its superclass
        node(0, 0x40, &mut payload);
        encode_uleb(1, &mut payload);
        encode_sleb(-1, &mut payload);
        encode_uleb(16, &mut payload);
        field(5, 4, 0x100, &mut payload);
        payload.push(0);
        field(5, 2, 8, &mut payload);
        field(5, 3, 4, &mut payload);
        payload.push(0);
        // #1 Object
        node(0, 0x40, &mut payload);
        encode_uleb(0, &mut payload);
        encode_sleb(0, &mut payload);
        encode_uleb(8, &mut payload);
        payload.extend_from_slice(&[0, 0]);
        // #2 int[], #3 int
        node(2, 0x10, &mut payload);
        encode_sleb(-1, &mut payload);
        node(7, 0x10, &mut payload);

        let layouts = ClassLayoutInfo::parse(&payload, &strings, &classes)?;
        assert_eq!(layouts.len(), 4);

        let point = layouts.find(0x40).map(|layout| &layout.kind);
        let Some(LayoutKind::Class {
            class,
            superclass,
            size,
            static_fields,
            instance_fields,
        }) = point
        else {
            panic!("expected a class at 0x40, got {:?}", point);
        };
        assert_eq!((*class, *superclass, *size), (1, Some(1), 16));
        assert_eq!(static_fields[0].offset, 0x100);
        let offsets: Vec<_> = instance_fields
            .iter()
            .map(|field| (field.name.as_str(), field.offset, field.ty))
            .collect();
        assert_eq!(offsets, vec![("x", 8, FieldType::Int), ("y", 12, FieldType::Int)]);

        assert_eq!(layouts.find(0x80).map(|layout| layout.address), Some(0x80));
        assert_eq!(
            layouts.find(0x90).map(|layout| &layout.kind),
            Some(&LayoutKind::Array { element: 3 })
        );
        assert_eq!(
            layouts.find(0xA0).map(|layout| &layout.kind),
            Some(&LayoutKind::Primitive(PrimitiveKind::Int))
        );
        assert_eq!(layouts.find(0x41), None);
        assert_eq!(layouts.instance_fields(0).len(), 2);
        Ok(())
    }

    #[test]
    fn unresolved_back_reference_is_malformed() -> Result<()> {
        let (strings, classes) = tables()?;
        let mut payload = vec![];
        node(2, 0, &mut payload);
        encode_sleb(-5, &mut payload);
        assert!(matches!(
            ClassLayoutInfo::parse(&payload, &strings, &classes),
            Err(DecodeError::MalformedInput { offset: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn bad_references_and_tags_are_malformed() -> Result<()> {
        let (strings, classes) = tables()?;
        // array element delta 0
        assert!(matches!(
            ClassLayoutInfo::parse(&[0x02, 0x00, 0x00], &strings, &classes),
            Err(DecodeError::MalformedInput { offset: 2, .. })
        ));
        // reference before the first entry
        assert!(matches!(
            ClassLayoutInfo::parse(&[0x02, 0x00, 0x01], &strings, &classes),
            Err(DecodeError::MalformedInput { offset: 2, .. })
        ));
        // class index out of range
        assert!(matches!(
            ClassLayoutInfo::parse(&[0x01, 0x00, 0x09], &strings, &classes),
            Err(DecodeError::MalformedInput { offset: 2, .. })
        ));
        assert!(matches!(
            ClassLayoutInfo::parse(&[0x0D, 0x00], &strings, &classes),
            Err(DecodeError::MalformedInput { offset: 0, .. })
        ));
        Ok(())
    }
}
