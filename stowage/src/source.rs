//! Byte source and sink backends.
//!
//! Everything the engines read or write goes through [`ByteSource`] and
//! [`ByteSink`]; file paths, memory buffers, raw descriptors and
//! caller-supplied callbacks are adapters over these two traits. Memory and
//! file backends are seekable; descriptor and callback backends are
//! forward-only and answer seek requests with [`Error::NotSeekable`].

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use crate::error::{Error, Result};

const SKIP_BUF: usize = 8 * 1024;

/// Pull side of the byte boundary. `read` returning 0 means end of stream.
pub trait ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard up to `len` bytes, returning how many were skipped. The
    /// default reads and throws away; seekable backends override.
    fn skip(&mut self, len: u64) -> Result<u64> {
        let mut scratch = [0u8; SKIP_BUF];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(SKIP_BUF as u64) as usize;
            let n = self.read(&mut scratch[..want])?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
        }
        Ok(len - remaining)
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::NotSeekable)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

/// Push side of the byte boundary.
pub trait ByteSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::NotSeekable)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

/// Buffered, seekable source over a file path.
pub struct FileSource {
    inner: BufReader<File>,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileSource> {
        let file = File::open(path)?;
        Ok(FileSource {
            inner: BufReader::new(file),
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn skip(&mut self, len: u64) -> Result<u64> {
        self.inner.seek_relative(len as i64)?;
        Ok(len)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.inner.seek(pos)?)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Buffered, seekable sink over a file path. Truncates on create.
pub struct FileSink {
    inner: BufWriter<File>,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<FileSink> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileSink {
            inner: BufWriter::new(file),
        })
    }
}

impl ByteSink for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.inner.seek(pos)?)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Seekable source over a borrowed byte slice.
pub struct MemorySource<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> MemorySource<'a> {
    pub fn new(data: &'a [u8]) -> MemorySource<'a> {
        MemorySource {
            cursor: Cursor::new(data),
        }
    }
}

impl ByteSource for MemorySource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }

    fn skip(&mut self, len: u64) -> Result<u64> {
        let total = self.cursor.get_ref().len() as u64;
        let pos = self.cursor.position();
        let skipped = len.min(total.saturating_sub(pos));
        self.cursor.set_position(pos + skipped);
        Ok(skipped)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.cursor.seek(pos)?)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Seekable sink appending into a caller-owned `Vec<u8>`.
pub struct MemorySink<'a> {
    cursor: Cursor<&'a mut Vec<u8>>,
}

impl<'a> MemorySink<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> MemorySink<'a> {
        buf.clear();
        MemorySink {
            cursor: Cursor::new(buf),
        }
    }
}

impl ByteSink for MemorySink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.cursor.seek(pos)?)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Forward-only source over a raw file descriptor the caller keeps
/// ownership of. The descriptor is never closed here.
#[cfg(unix)]
pub struct FdSource {
    fd: std::os::unix::io::RawFd,
}

#[cfg(unix)]
impl FdSource {
    pub fn new(fd: std::os::unix::io::RawFd) -> FdSource {
        FdSource { fd }
    }
}

#[cfg(unix)]
impl ByteSource for FdSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Forward-only sink over a raw file descriptor the caller keeps
/// ownership of.
#[cfg(unix)]
pub struct FdSink {
    fd: std::os::unix::io::RawFd,
}

#[cfg(unix)]
impl FdSink {
    pub fn new(fd: std::os::unix::io::RawFd) -> FdSink {
        FdSink { fd }
    }
}

#[cfg(unix)]
impl ByteSink for FdSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Forward-only source driven by a caller-supplied closure. The closure
/// fills the buffer and returns how many bytes it produced; 0 is end of
/// stream. Partial reads are fine and handed through as-is.
pub struct CallbackSource<'a> {
    read_cb: Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + 'a>,
}

impl<'a> CallbackSource<'a> {
    pub fn new(read_cb: impl FnMut(&mut [u8]) -> io::Result<usize> + 'a) -> CallbackSource<'a> {
        CallbackSource {
            read_cb: Box::new(read_cb),
        }
    }
}

impl ByteSource for CallbackSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (self.read_cb)(buf)
    }
}

/// Forward-only sink driven by a caller-supplied closure. The closure may
/// accept fewer bytes than offered; this wrapper retries until the whole
/// buffer is consumed, so partial writes never leak into the codec.
pub struct CallbackSink<'a> {
    write_cb: Box<dyn FnMut(&[u8]) -> io::Result<usize> + 'a>,
}

impl<'a> CallbackSink<'a> {
    pub fn new(write_cb: impl FnMut(&[u8]) -> io::Result<usize> + 'a) -> CallbackSink<'a> {
        CallbackSink {
            write_cb: Box::new(write_cb),
        }
    }
}

impl ByteSink for CallbackSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let n = (self.write_cb)(&buf[written..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write callback accepted no bytes",
                ));
            }
            written += n;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Raw source plus the session's running byte counter. The counter tracks
/// pre-decompression bytes, which is what progress reporting wants.
pub(crate) struct Tracked<'a> {
    src: Box<dyn ByteSource + 'a>,
    count: Rc<Cell<u64>>,
}

impl<'a> Tracked<'a> {
    pub(crate) fn new(src: Box<dyn ByteSource + 'a>, count: Rc<Cell<u64>>) -> Tracked<'a> {
        Tracked { src, count }
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.src.seek(pos)
    }

    pub(crate) fn is_seekable(&self) -> bool {
        self.src.is_seekable()
    }

    pub(crate) fn position(&self) -> u64 {
        self.count.get()
    }

    pub(crate) fn reset_count(&self) {
        self.count.set(0);
    }
}

impl Read for Tracked<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.src.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_skip_clamps_to_end() {
        let data = [1u8, 2, 3, 4, 5];
        let mut src = MemorySource::new(&data);
        let mut buf = [0u8; 2];
        assert_eq!(src.read(&mut buf).unwrap(), 2);
        assert_eq!(src.skip(10).unwrap(), 3);
        assert_eq!(src.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn callback_source_is_forward_only() {
        let data = b"abc";
        let mut pos = 0;
        let mut src = CallbackSource::new(|buf: &mut [u8]| {
            let n = (data.len() - pos).min(buf.len()).min(1); // 1 byte at a time
            buf[..n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
            Ok(n)
        });
        assert!(!src.is_seekable());
        assert!(matches!(src.seek(SeekFrom::Start(0)), Err(Error::NotSeekable)));

        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let n = src.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abc");
    }

    #[test]
    fn callback_sink_retries_partial_writes() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut sink = CallbackSink::new(|buf: &[u8]| {
                // Accept at most two bytes per call.
                let n = buf.len().min(2);
                out.extend_from_slice(&buf[..n]);
                Ok(n)
            });
            assert_eq!(sink.write(b"hello world").unwrap(), 11);
        }
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn tracked_counts_raw_bytes() {
        let data = vec![0u8; 100];
        let count = Rc::new(Cell::new(0));
        let mut tracked = Tracked::new(Box::new(MemorySource::new(&data)), count.clone());
        let mut buf = [0u8; 64];
        tracked.read(&mut buf).unwrap();
        tracked.read(&mut buf).unwrap();
        assert_eq!(count.get(), 100);
    }

    #[test]
    fn memory_sink_seek_backfills() {
        let mut buf = Vec::new();
        {
            let mut sink = MemorySink::new(&mut buf);
            sink.write(b"....tail").unwrap();
            sink.seek(SeekFrom::Start(0)).unwrap();
            sink.write(b"head").unwrap();
        }
        assert_eq!(buf, b"headtail");
    }
}
