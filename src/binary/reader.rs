//! Cursor over an in-memory payload plus the LEB128 codec shared by every
//! decoder in the crate.
//!
//! The varint parsers are ordinary nom parsers, so the streaming module
//! parser and the in-memory [`Reader`] run exactly the same code.

use super::types::{
    AbstractHeapType, BlockType, FieldType, HeapType, Limits, MemArg, NumType, RefType,
    StorageType, ValueType,
};
use crate::error::{DecodeError, Result};
use nom::{
    bytes::complete::take,
    error::{Error, ErrorKind},
    number::complete::{le_f32, le_f64, le_u8, le_u32, le_u64},
    IResult, Needed,
};
use nom_leb128::{leb128_i32, leb128_i64, leb128_u32, leb128_u64};

/// Finds the terminating byte of a LEB128 number that may take at most
/// `max_len` bytes. Anything longer is rejected before it is decoded.
fn leb128_extent(input: &[u8], max_len: usize) -> IResult<&[u8], usize> {
    match input.iter().take(max_len).position(|byte| byte & 0x80 == 0) {
        Some(last) => Ok((input, last + 1)),
        None if input.len() >= max_len => {
            Err(nom::Err::Error(Error::new(input, ErrorKind::TooLarge)))
        }
        None => Err(nom::Err::Incomplete(Needed::new(1))),
    }
}

fn strict_leb128<'a, T>(
    input: &'a [u8],
    max_len: usize,
    last_byte_fits: fn(u8) -> bool,
    mut decode: impl FnMut(&'a [u8]) -> IResult<&'a [u8], T>,
) -> IResult<&'a [u8], T> {
    let (_, len) = leb128_extent(input, max_len)?;
    // bits beyond the target width must not carry information
    if len == max_len && !last_byte_fits(input[len - 1]) {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::TooLarge)));
    }
    decode(input)
}

pub fn uleb32(input: &[u8]) -> IResult<&[u8], u32> {
    strict_leb128(input, 5, |b| b & 0x70 == 0, leb128_u32)
}

pub fn uleb64(input: &[u8]) -> IResult<&[u8], u64> {
    strict_leb128(input, 10, |b| b & 0x7E == 0, leb128_u64)
}

pub fn sleb32(input: &[u8]) -> IResult<&[u8], i32> {
    strict_leb128(
        input,
        5,
        |b| {
            let extension = b & 0x70;
            if b & 0x08 != 0 {
                extension == 0x70
            } else {
                extension == 0
            }
        },
        leb128_i32,
    )
}

pub fn sleb64(input: &[u8]) -> IResult<&[u8], i64> {
    strict_leb128(
        input,
        10,
        |b| {
            let extension = b & 0x7E;
            if b & 0x01 != 0 {
                extension == 0x7E
            } else {
                extension == 0
            }
        },
        leb128_i64,
    )
}

/// Signed 33-bit integer, the encoding of type indices in block and heap
/// types. At most five bytes; bits 33 and up must copy the sign bit.
pub fn sleb33(input: &[u8]) -> IResult<&[u8], i64> {
    strict_leb128(
        input,
        5,
        |b| {
            let extension = b & 0x60;
            if b & 0x10 != 0 {
                extension == 0x60
            } else {
                extension == 0
            }
        },
        leb128_i64,
    )
}

/// Translates a nom failure at `input` (a suffix of `whole`) into a decode error.
pub(crate) fn nom_error(whole: &[u8], err: nom::Err<Error<&[u8]>>) -> DecodeError {
    match err {
        nom::Err::Incomplete(_) => DecodeError::UnexpectedEndOfStream {
            offset: whole.len(),
        },
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = whole.len() - e.input.len();
            match e.code {
                ErrorKind::Eof => DecodeError::UnexpectedEndOfStream {
                    offset: whole.len(),
                },
                ErrorKind::TooLarge => {
                    DecodeError::malformed(offset, "LEB128 value overflows its target width")
                }
                ErrorKind::Tag => DecodeError::malformed(offset, "unexpected bytes"),
                code => DecodeError::malformed(offset, format!("{:?}", code)),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn malformed(&self, message: impl Into<String>) -> DecodeError {
        DecodeError::malformed(self.pos, message)
    }

    /// Runs a nom parser at the cursor and advances past what it consumed.
    pub fn run<T>(
        &mut self,
        mut parser: impl FnMut(&'a [u8]) -> IResult<&'a [u8], T>,
    ) -> Result<T> {
        match parser(&self.data[self.pos..]) {
            Ok((rest, value)) => {
                self.pos = self.data.len() - rest.len();
                Ok(value)
            }
            Err(e) => Err(nom_error(self.data, e)),
        }
    }

    /// Splits off the next `len` bytes as a reader whose positions still
    /// count from the start of this reader's data.
    pub fn sub_reader(&mut self, len: usize) -> Result<Reader<'a>> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::UnexpectedEndOfStream {
                offset: self.data.len(),
            })?;
        let sub = Reader {
            data: &self.data[..end],
            pos: self.pos,
        };
        self.pos = end;
        Ok(sub)
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.run(le_u8)
    }

    pub fn uleb32(&mut self) -> Result<u32> {
        self.run(uleb32)
    }

    pub fn uleb64(&mut self) -> Result<u64> {
        self.run(uleb64)
    }

    pub fn sleb32(&mut self) -> Result<i32> {
        self.run(sleb32)
    }

    pub fn sleb64(&mut self) -> Result<i64> {
        self.run(sleb64)
    }

    pub fn fixed_u32(&mut self) -> Result<u32> {
        self.run(le_u32)
    }

    pub fn fixed_u64(&mut self) -> Result<u64> {
        self.run(le_u64)
    }

    pub fn f32(&mut self) -> Result<f32> {
        self.run(le_f32)
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.run(le_f64)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.run(take(len))
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn count(&mut self) -> Result<usize> {
        self.uleb32().map(|n| n as usize)
    }

    pub fn name(&mut self) -> Result<String> {
        let start = self.pos;
        let len = self.count()?;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::malformed(start, "invalid UTF-8 in name"))
    }

    /// Reads a count-prefixed vector.
    pub fn vec<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.count()?;
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(item(self)?);
        }
        Ok(items)
    }

    pub fn flag(&mut self, what: &str) -> Result<bool> {
        let start = self.pos;
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::malformed(
                start,
                format!("invalid {} flag 0x{:02X}", what, other),
            )),
        }
    }

    /// Type index encoded as a non-negative s33.
    fn type_index(&mut self) -> Result<u32> {
        let start = self.pos;
        let index = self.run(sleb33)?;
        u32::try_from(index)
            .map_err(|_| DecodeError::malformed(start, format!("invalid type index {}", index)))
    }

    pub fn value_type(&mut self) -> Result<ValueType> {
        let start = self.pos;
        let byte = self.u8()?;
        let ty = match byte {
            0x7F => ValueType::Num(NumType::I32),
            0x7E => ValueType::Num(NumType::I64),
            0x7D => ValueType::Num(NumType::F32),
            0x7C => ValueType::Num(NumType::F64),
            0x63 => ValueType::Ref(RefType {
                nullable: true,
                heap: self.heap_type()?,
            }),
            0x64 => ValueType::Ref(RefType {
                nullable: false,
                heap: self.heap_type()?,
            }),
            other => match AbstractHeapType::from_byte(other) {
                Some(heap) => ValueType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Abstract(heap),
                }),
                None => {
                    return Err(DecodeError::malformed(
                        start,
                        format!("unknown value type 0x{:02X}", other),
                    ));
                }
            },
        };
        Ok(ty)
    }

    pub fn heap_type(&mut self) -> Result<HeapType> {
        if let Some(heap) = self.peek().and_then(AbstractHeapType::from_byte) {
            self.pos += 1;
            return Ok(HeapType::Abstract(heap));
        }
        self.type_index().map(HeapType::Index)
    }

    pub fn ref_type(&mut self) -> Result<RefType> {
        let start = self.pos;
        match self.value_type()? {
            ValueType::Ref(ty) => Ok(ty),
            other => Err(DecodeError::malformed(
                start,
                format!("expected reference type, got {}", other),
            )),
        }
    }

    pub fn storage_type(&mut self) -> Result<StorageType> {
        match self.peek() {
            Some(0x78) => {
                self.pos += 1;
                Ok(StorageType::I8)
            }
            Some(0x77) => {
                self.pos += 1;
                Ok(StorageType::I16)
            }
            _ => self.value_type().map(StorageType::Value),
        }
    }

    pub fn field_type(&mut self) -> Result<FieldType> {
        let storage = self.storage_type()?;
        let mutable = self.flag("mutability")?;
        Ok(FieldType { storage, mutable })
    }

    pub fn block_type(&mut self) -> Result<BlockType> {
        match self.peek() {
            Some(0x40) => {
                self.pos += 1;
                Ok(BlockType::Empty)
            }
            Some(byte) if byte & 0xC0 == 0x40 => self.value_type().map(BlockType::Value),
            _ => self.type_index().map(BlockType::Func),
        }
    }

    pub fn limits(&mut self) -> Result<Limits> {
        let start = self.pos;
        let flags = self.u8()?;
        if flags > 0x07 {
            return Err(DecodeError::malformed(
                start,
                format!("invalid limits flags 0x{:02X}", flags),
            ));
        }
        let memory64 = flags & 0x04 != 0;
        let bound = |reader: &mut Self| -> Result<u64> {
            if memory64 {
                reader.uleb64()
            } else {
                reader.uleb32().map(u64::from)
            }
        };
        let min = bound(self)?;
        let max = if flags & 0x01 != 0 {
            Some(bound(self)?)
        } else {
            None
        };
        Ok(Limits {
            min,
            max,
            shared: flags & 0x02 != 0,
            memory64,
        })
    }

    pub fn mem_arg(&mut self) -> Result<MemArg> {
        let mut align = self.uleb32()?;
        // bit 6 of the alignment announces an explicit memory index
        let memory = if align & 0x40 != 0 {
            align &= !0x40;
            self.uleb32()?
        } else {
            0
        };
        let offset = self.uleb64()?;
        Ok(MemArg {
            align,
            memory,
            offset,
        })
    }
}
