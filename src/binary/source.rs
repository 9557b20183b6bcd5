use std::io::{self, Read};
use std::task::Poll;

/// A chunked supplier of bytes.
///
/// `request` copies whatever is available right now into `buf` and returns
/// the number of bytes written. `Ready(Ok(0))` means the stream is over,
/// `Pending` means more bytes may show up later and the caller should resume
/// once they do. Short reads are always allowed.
pub trait ByteSource {
    fn request(&mut self, buf: &mut [u8]) -> Poll<io::Result<usize>>;
}

/// In-memory source. `max_chunk` caps the size of each read, which makes it
/// easy to exercise chunk boundaries.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
    max_chunk: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            max_chunk: usize::MAX,
        }
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }
}

impl ByteSource for SliceSource<'_> {
    fn request(&mut self, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let rest = &self.data[self.pos..];
        let n = rest.len().min(buf.len()).min(self.max_chunk);
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Poll::Ready(Ok(n))
    }
}

/// Adapts any `io::Read`. Non-blocking readers surface `WouldBlock` as `Pending`.
#[derive(Debug)]
pub struct ReaderSource<R> {
    inner: R,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn request(&mut self, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteSource, ReaderSource, SliceSource};
    use std::collections::VecDeque;
    use std::io::{self, Read};
    use std::task::Poll;

    #[test]
    fn slice_source_respects_max_chunk() {
        let data = [1u8, 2, 3, 4, 5];
        let mut source = SliceSource::new(&data).with_max_chunk(2);
        let mut buf = [0u8; 8];

        let mut seen = vec![];
        loop {
            match source.request(&mut buf) {
                Poll::Ready(Ok(0)) => break,
                Poll::Ready(Ok(n)) => {
                    assert!(n <= 2);
                    seen.extend_from_slice(&buf[..n]);
                }
                other => panic!("unexpected poll result: {:?}", other),
            }
        }
        assert_eq!(seen, data);
    }

    #[test]
    fn reader_source_reads_until_eof() {
        let mut source = ReaderSource::new(&b"abc"[..]);
        let mut buf = [0u8; 2];
        assert!(matches!(source.request(&mut buf), Poll::Ready(Ok(2))));
        assert!(matches!(source.request(&mut buf), Poll::Ready(Ok(1))));
        assert!(matches!(source.request(&mut buf), Poll::Ready(Ok(0))));
    }

    /// Replays a script of read outcomes, then reports end of stream.
    struct Scripted(VecDeque<io::Result<&'static [u8]>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn reader_source_maps_would_block_and_retries_interrupts() {
        let mut source = ReaderSource::new(Scripted(VecDeque::from([
            Err(io::ErrorKind::WouldBlock.into()),
            Err(io::ErrorKind::Interrupted.into()),
            Ok(&b"ab"[..]),
            Err(io::ErrorKind::PermissionDenied.into()),
        ])));
        let mut buf = [0u8; 4];
        assert!(matches!(source.request(&mut buf), Poll::Pending));
        assert!(matches!(source.request(&mut buf), Poll::Ready(Ok(2))));
        assert_eq!(&buf[..2], b"ab");
        match source.request(&mut buf) {
            Poll::Ready(Err(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected poll result: {:?}", other),
        }
        assert!(matches!(source.request(&mut buf), Poll::Ready(Ok(0))));
        assert!(source.into_inner().0.is_empty());
    }
}
