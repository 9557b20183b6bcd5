//! Top-level container walker. Drives a [`ByteSource`] through the module
//! preamble and the `(id, length, payload)` section triples, handing complete
//! payloads to a [`SectionConsumer`].

use super::{
    reader::{nom_error, uleb32},
    section::{SectionCode, SectionConsumer, SectionHeader},
    source::ByteSource,
};
use crate::error::{DecodeError, Result};
use nom::{
    bytes::streaming::{tag, take},
    number::streaming::le_u32,
    sequence::pair,
    IResult,
};
use std::{task::Poll, thread, time::Duration};
use tracing::{debug, trace};

pub const MAGIC: &[u8; 4] = b"\0asm";
pub const VERSION: u32 = 1;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Idle polls `parse` answers with a plain yield before it starts parking.
const SPIN_POLLS: u32 = 16;
const IDLE_PARK: Duration = Duration::from_millis(1);

enum State {
    Preamble,
    Header,
    Skip { remaining: usize },
    Collect { header: SectionHeader, payload: Vec<u8> },
    Finished,
    /// An error was reported at `offset`; every later call reports it again.
    Failed { offset: usize },
}

enum Step {
    Progress,
    NeedMore,
    Finished,
}

struct RawHeader {
    id: u32,
    name: Option<String>,
    /// Bytes of the section left after the header, custom name included.
    size: usize,
}

fn preamble(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, _) = tag(&MAGIC[..])(input)?;
    le_u32(input)
}

fn section_header(input: &[u8]) -> IResult<&[u8], RawHeader> {
    let (rest, (id, size)) = pair(uleb32, uleb32)(input)?;
    if id != SectionCode::Custom as u32 {
        return Ok((
            rest,
            RawHeader {
                id,
                name: None,
                size: size as usize,
            },
        ));
    }
    let (after_len, name_len) = uleb32(rest)?;
    let name_header = (rest.len() - after_len.len()) + name_len as usize;
    if name_header > size as usize {
        return Err(nom::Err::Failure(nom::error::Error::new(
            rest,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    let (after_name, name) = take(name_len)(after_len)?;
    Ok((
        after_name,
        RawHeader {
            id,
            name: Some(String::from_utf8_lossy(name).into_owned()),
            size: size as usize - name_header,
        },
    ))
}

/// Streaming module parser.
///
/// `resume` makes as much progress as the source allows and returns
/// `Pending` when the source does, so the same parser can sit behind a
/// socket, a file or an in-memory buffer. Any error ends the parse for good.
pub struct ModuleParser<C> {
    consumer: C,
    state: State,
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    /// Absolute stream offset of `buffer[start]`.
    offset: usize,
    chunk_size: usize,
    eof: bool,
}

impl<C: SectionConsumer> ModuleParser<C> {
    pub fn new(consumer: C) -> Self {
        Self {
            consumer,
            state: State::Preamble,
            buffer: vec![],
            start: 0,
            end: 0,
            offset: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            eof: false,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn into_consumer(self) -> C {
        self.consumer
    }

    /// Runs the parse to completion on the calling thread.
    ///
    /// While the source reports `Pending` the thread first yields, then parks
    /// for a millisecond at a time until bytes show up again. A source that
    /// stays `Pending` blocks this call forever; callers that need a deadline
    /// should drive [`ModuleParser::resume`] themselves.
    pub fn parse(&mut self, source: &mut dyn ByteSource) -> Result<()> {
        let mut idle = 0;
        loop {
            let seen = (self.offset, self.end);
            match self.resume(source) {
                Poll::Ready(result) => return result,
                Poll::Pending if seen != (self.offset, self.end) => idle = 0,
                Poll::Pending if idle < SPIN_POLLS => {
                    idle += 1;
                    thread::yield_now();
                }
                Poll::Pending => thread::park_timeout(IDLE_PARK),
            }
        }
    }

    pub fn resume(&mut self, source: &mut dyn ByteSource) -> Poll<Result<()>> {
        loop {
            let step = match self.step() {
                Ok(step) => step,
                Err(e) => return self.fail(e),
            };
            match step {
                Step::Progress => continue,
                Step::Finished => {
                    self.state = State::Finished;
                    return Poll::Ready(Ok(()));
                }
                Step::NeedMore if self.eof => {
                    return self.fail(DecodeError::UnexpectedEndOfStream {
                        offset: self.offset + self.available(),
                    });
                }
                Step::NeedMore => match self.fill(source) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(0)) => self.eof = true,
                    Poll::Ready(Ok(n)) => trace!(bytes = n, "refilled module buffer"),
                    Poll::Ready(Err(e)) => return self.fail(e.into()),
                },
            }
        }
    }

    fn fail(&mut self, e: DecodeError) -> Poll<Result<()>> {
        self.state = State::Failed {
            offset: e.offset().unwrap_or(self.offset),
        };
        Poll::Ready(Err(e))
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    fn advance(&mut self, n: usize) {
        self.start += n;
        self.offset += n;
    }

    fn fill(&mut self, source: &mut dyn ByteSource) -> Poll<std::io::Result<usize>> {
        if self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let limit = self.end + self.chunk_size;
        if self.buffer.len() < limit {
            self.buffer.resize(limit, 0);
        }
        match source.request(&mut self.buffer[self.end..limit]) {
            Poll::Ready(Ok(n)) => {
                self.end += n;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn step(&mut self) -> Result<Step> {
        let state = std::mem::replace(&mut self.state, State::Finished);
        let (next, step) = match state {
            State::Preamble => self.read_preamble()?,
            State::Header => self.read_header()?,
            State::Skip { remaining } => {
                let n = remaining.min(self.available());
                self.advance(n);
                match remaining - n {
                    0 => (State::Header, Step::Progress),
                    remaining => (State::Skip { remaining }, Step::NeedMore),
                }
            }
            State::Collect {
                header,
                mut payload,
            } => {
                let n = (header.size - payload.len()).min(self.available());
                payload.extend_from_slice(&self.buffer[self.start..self.start + n]);
                self.advance(n);
                if payload.len() < header.size {
                    (State::Collect { header, payload }, Step::NeedMore)
                } else {
                    debug!(
                        id = header.id,
                        name = ?header.name,
                        size = header.size,
                        "decoding section"
                    );
                    self.consumer.consume(&header, &payload)?;
                    (State::Header, Step::Progress)
                }
            }
            State::Finished => (State::Finished, Step::Finished),
            State::Failed { offset } => {
                self.state = State::Failed { offset };
                return Err(DecodeError::malformed(offset, "module parse already failed"));
            }
        };
        self.state = next;
        Ok(step)
    }

    fn read_preamble(&mut self) -> Result<(State, Step)> {
        let input = &self.buffer[self.start..self.end];
        match preamble(input) {
            Ok((_, version)) => {
                if version != VERSION {
                    return Err(DecodeError::malformed(
                        self.offset + MAGIC.len(),
                        format!("unsupported version {}", version),
                    ));
                }
                self.advance(MAGIC.len() + 4);
                Ok((State::Header, Step::Progress))
            }
            Err(nom::Err::Incomplete(_)) => Ok((State::Preamble, Step::NeedMore)),
            Err(_) => Err(DecodeError::malformed(self.offset, "invalid magic number")),
        }
    }

    fn read_header(&mut self) -> Result<(State, Step)> {
        let input = &self.buffer[self.start..self.end];
        if input.is_empty() {
            let step = if self.eof {
                Step::Finished
            } else {
                Step::NeedMore
            };
            return Ok((State::Header, step));
        }
        let (rest, raw) = match section_header(input) {
            Ok(parsed) => parsed,
            Err(nom::Err::Incomplete(_)) => return Ok((State::Header, Step::NeedMore)),
            Err(nom::Err::Failure(_)) => {
                return Err(DecodeError::malformed(
                    self.offset,
                    "custom section name exceeds section size",
                ));
            }
            Err(e) => return Err(nom_error(input, e).rebase(self.offset)),
        };
        let header_len = input.len() - rest.len();
        self.advance(header_len);
        let header = SectionHeader {
            id: raw.id,
            name: raw.name,
            offset: self.offset,
            size: raw.size,
        };
        if self.consumer.wants(&header) {
            let payload = Vec::with_capacity(header.size.min(self.chunk_size.max(1 << 16)));
            Ok((State::Collect { header, payload }, Step::Progress))
        } else {
            debug!(
                id = header.id,
                name = ?header.name,
                size = header.size,
                "skipping section"
            );
            Ok((
                State::Skip {
                    remaining: header.size,
                },
                Step::Progress,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ModuleParser;
    use crate::binary::reader::tests::encode_uleb;
    use crate::binary::section::{SectionCode, SectionRegistry};
    use crate::binary::source::{ByteSource, SliceSource};
    use crate::error::DecodeError;
    use anyhow::Result;
    use std::cell::RefCell;
    use std::task::Poll;

    fn section(id: u8, payload: &[u8], out: &mut Vec<u8>) {
        out.push(id);
        encode_uleb(payload.len() as u64, out);
        out.extend_from_slice(payload);
    }

    fn custom(name: &str, payload: &[u8], out: &mut Vec<u8>) {
        let mut body = vec![];
        encode_uleb(name.len() as u64, &mut body);
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(payload);
        section(0, &body, out);
    }

    fn module(sections: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut out = b"\0asm\x01\x00\x00\x00".to_vec();
        sections(&mut out);
        out
    }

    fn collect(bytes: &[u8], chunk: usize) -> Result<Vec<(String, Vec<u8>)>, DecodeError> {
        let seen = RefCell::new(vec![]);
        let mut registry = SectionRegistry::new();
        registry
            .on_custom("first", |payload| {
                seen.borrow_mut().push(("first".to_string(), payload.to_vec()));
                Ok(())
            })
            .on_custom("second", |payload| {
                seen.borrow_mut().push(("second".to_string(), payload.to_vec()));
                Ok(())
            })
            .on_section(SectionCode::Memory, |payload| {
                seen.borrow_mut().push(("memory".to_string(), payload.to_vec()));
                Ok(())
            });
        let mut source = SliceSource::new(bytes).with_max_chunk(chunk);
        ModuleParser::new(registry)
            .with_chunk_size(chunk)
            .parse(&mut source)?;
        Ok(seen.into_inner())
    }

    #[test]
    fn empty_module() -> Result<()> {
        let bytes = module(|_| {});
        assert!(collect(&bytes, 1024)?.is_empty());
        Ok(())
    }

    #[test]
    fn skips_unregistered_sections_exactly() -> Result<()> {
        for filler_len in [0usize, 1, 127, 128, 300] {
            let filler: Vec<u8> = (0..filler_len).map(|i| (i % 251) as u8 | 0x80).collect();
            let bytes = module(|out| {
                custom("first", &[1, 2, 3], out);
                custom("unrelated", &filler, out);
                section(SectionCode::Type as u8, &filler, out);
                custom("second", &[4, 5], out);
                section(SectionCode::Memory as u8, &[1, 0, 1], out);
            });
            for chunk in [1usize, 3, 7, 4096] {
                let seen = collect(&bytes, chunk)?;
                assert_eq!(
                    seen,
                    vec![
                        ("first".to_string(), vec![1, 2, 3]),
                        ("second".to_string(), vec![4, 5]),
                        ("memory".to_string(), vec![1, 0, 1]),
                    ]
                );
            }
        }
        Ok(())
    }

    #[test]
    fn invalid_magic_and_version() {
        let err = collect(b"\0asn\x01\x00\x00\x00", 64).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedInput { offset: 0, .. }));

        let err = collect(b"\0asm\x02\x00\x00\x00", 64).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedInput { offset: 4, .. }));

        let err = collect(b"\0as", 64).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEndOfStream { .. }));
    }

    #[test]
    fn truncated_section_is_end_of_stream() {
        let mut bytes = module(|out| custom("first", &[1, 2, 3, 4], out));
        bytes.pop();
        let err = collect(&bytes, 2).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEndOfStream { .. }));

        // header cut in the middle of its length
        let mut bytes = module(|_| {});
        bytes.extend_from_slice(&[0x05, 0x80]);
        let err = collect(&bytes, 64).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEndOfStream { .. }));
    }

    #[test]
    fn oversized_length_is_malformed() {
        let mut bytes = module(|_| {});
        bytes.extend_from_slice(&[0x05, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        let err = collect(&bytes, 64).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedInput { offset: 9, .. }));
    }

    #[test]
    fn handler_errors_are_rebased() {
        let bytes = module(|out| section(SectionCode::Memory as u8, &[0, 0], out));
        let mut registry = SectionRegistry::new();
        registry.on_section(SectionCode::Memory, |_| {
            Err(DecodeError::malformed(1, "rejected"))
        });
        let err = ModuleParser::new(registry)
            .parse(&mut SliceSource::new(&bytes))
            .unwrap_err();
        // preamble (8) + id (1) + length (1) + payload offset (1)
        assert_eq!(err.offset(), Some(11));
    }

    /// Hands out one byte per call and reports `Pending` in between.
    struct Trickle<'a> {
        data: &'a [u8],
        pos: usize,
        ready: bool,
    }

    impl ByteSource for Trickle<'_> {
        fn request(&mut self, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
            self.ready = !self.ready;
            if !self.ready {
                return Poll::Pending;
            }
            let n = (self.data.len() - self.pos).min(buf.len()).min(1);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Poll::Ready(Ok(n))
        }
    }

    #[test]
    fn resumes_after_pending() -> Result<()> {
        let bytes = module(|out| {
            custom("first", &[9; 20], out);
            custom("second", &[], out);
        });
        let seen = RefCell::new(vec![]);
        let mut registry = SectionRegistry::new();
        registry.on_custom("first", |payload| {
            seen.borrow_mut().push(payload.len());
            Ok(())
        });
        registry.on_custom("second", |payload| {
            seen.borrow_mut().push(payload.len());
            Ok(())
        });
        let mut parser = ModuleParser::new(registry);
        let mut source = Trickle {
            data: &bytes,
            pos: 0,
            ready: false,
        };
        let mut pendings = 0;
        loop {
            match parser.resume(&mut source) {
                Poll::Ready(result) => {
                    result?;
                    break;
                }
                Poll::Pending => pendings += 1,
            }
        }
        drop(parser);
        assert!(pendings >= bytes.len());
        assert_eq!(seen.into_inner(), vec![20, 0]);
        Ok(())
    }

    #[test]
    fn errors_are_sticky() {
        let bytes = b"\0asn\x01\x00\x00\x00";
        let mut parser = ModuleParser::new(SectionRegistry::new());
        let mut source = SliceSource::new(bytes);
        for _ in 0..2 {
            assert!(matches!(
                parser.resume(&mut source),
                Poll::Ready(Err(DecodeError::MalformedInput { offset: 0, .. }))
            ));
        }
        assert!(parser.parse(&mut source).is_err());

        // a truncated stream keeps failing where it ended
        let mut parser = ModuleParser::new(SectionRegistry::new());
        let mut source = SliceSource::new(b"\0as");
        assert!(matches!(
            parser.resume(&mut source),
            Poll::Ready(Err(DecodeError::UnexpectedEndOfStream { offset: 3 }))
        ));
        assert!(matches!(
            parser.resume(&mut source),
            Poll::Ready(Err(DecodeError::MalformedInput { offset: 3, .. }))
        ));
    }

    /// Reports `Pending` a fixed number of times before handing out anything.
    struct Stalled<'a> {
        stalls: usize,
        inner: SliceSource<'a>,
    }

    impl ByteSource for Stalled<'_> {
        fn request(&mut self, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
            if self.stalls > 0 {
                self.stalls -= 1;
                return Poll::Pending;
            }
            self.inner.request(buf)
        }
    }

    #[test]
    fn parse_waits_out_a_stalled_source() -> Result<()> {
        let bytes = module(|out| custom("first", &[7; 3], out));
        let seen = RefCell::new(vec![]);
        let mut registry = SectionRegistry::new();
        registry.on_custom("first", |payload| {
            seen.borrow_mut().push(payload.to_vec());
            Ok(())
        });
        let mut source = Stalled {
            stalls: 40,
            inner: SliceSource::new(&bytes),
        };
        ModuleParser::new(registry).parse(&mut source)?;
        assert_eq!(source.stalls, 0);
        assert_eq!(seen.into_inner(), vec![vec![7; 3]]);
        Ok(())
    }
}
