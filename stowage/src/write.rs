//! Writer engine: serializes entries and payload bytes through a container
//! codec and a filter chain into a byte sink.

use std::cell::Cell;
use std::io::{self, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use crate::entry::Entry;
use crate::error::{Error, Fault, Result};
use crate::filter::{encode_stack, Codec, Encoder, FilterConfig};
use crate::format::{tar, zip, ContainerWriter, Format};
use crate::source::{ByteSink, FileSink, MemorySink};

/// The bottom of the encode stack: the bare sink plus the session's
/// raw-byte counter. Seek requests pass straight through, which is what
/// lets the zip codec backfill local headers when no filter sits above.
pub(crate) struct SinkWriter<'a> {
    sink: Box<dyn ByteSink + 'a>,
    count: Rc<Cell<u64>>,
}

impl<'a> SinkWriter<'a> {
    fn new(sink: Box<dyn ByteSink + 'a>, count: Rc<Cell<u64>>) -> SinkWriter<'a> {
        SinkWriter { sink, count }
    }
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.sink.write(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl Encoder for SinkWriter<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.sink.flush()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.sink.seek(pos)
    }

    fn is_seekable(&self) -> bool {
        self.sink.is_seekable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    InEntry,
    Closed,
}

/// A write session over one archive: `create_* → add_entry → write_payload*
/// → close`.
///
/// The session owns its sink exclusively. `close` is reachable on every
/// exit path: the explicit call flushes trailers and reports errors, and
/// `Drop` performs the same finalization best-effort if the caller bails
/// early, so the sink is released exactly once either way.
pub struct ArchiveWriter<'a> {
    container: Option<Box<dyn ContainerWriter + 'a>>,
    format: Format,
    chain: Vec<Codec>,
    state: WriterState,
    declared: Option<u64>,
    written: u64,
    fault: Option<Fault>,
    bytes_written: Rc<Cell<u64>>,
}

impl ArchiveWriter<'static> {
    /// Create an archive file at `path`, truncating any existing file.
    pub fn create_path<P: AsRef<Path>>(
        path: P,
        format: Format,
        filters: &[FilterConfig],
    ) -> Result<ArchiveWriter<'static>> {
        let sink = FileSink::create(path)?;
        ArchiveWriter::create_sink(Box::new(sink), format, filters)
    }

    /// Write an archive to a raw file descriptor the caller owns. The
    /// descriptor is treated as forward-only and is not closed.
    #[cfg(unix)]
    pub fn create_fd(
        fd: std::os::unix::io::RawFd,
        format: Format,
        filters: &[FilterConfig],
    ) -> Result<ArchiveWriter<'static>> {
        ArchiveWriter::create_sink(Box::new(crate::source::FdSink::new(fd)), format, filters)
    }
}

impl<'a> ArchiveWriter<'a> {
    /// Write an archive into a caller-owned buffer. The buffer is cleared
    /// first and holds the complete archive once the session closes.
    pub fn create_bytes(
        buf: &'a mut Vec<u8>,
        format: Format,
        filters: &[FilterConfig],
    ) -> Result<ArchiveWriter<'a>> {
        Self::create_sink(Box::new(MemorySink::new(buf)), format, filters)
    }

    /// Write an archive to any [`ByteSink`], including caller-supplied
    /// callback backends.
    pub fn create_sink(
        sink: Box<dyn ByteSink + 'a>,
        format: Format,
        filters: &[FilterConfig],
    ) -> Result<ArchiveWriter<'a>> {
        let bytes_written = Rc::new(Cell::new(0u64));
        let bottom = SinkWriter::new(sink, Rc::clone(&bytes_written));
        let stack = encode_stack(filters, Box::new(bottom))?;
        let container: Box<dyn ContainerWriter + 'a> = if format.is_tar() {
            Box::new(tar::TarWriter::new(stack, format))
        } else {
            // With filters above the sink the stack is forward-only and
            // the codec drops into streaming mode by itself.
            Box::new(zip::ZipWriter::new(stack))
        };
        tracing::debug!(%format, filters = filters.len(), "opened write session");
        Ok(ArchiveWriter {
            container: Some(container),
            format,
            chain: filters.iter().map(|f| f.codec).collect(),
            state: WriterState::Open,
            declared: None,
            written: 0,
            fault: None,
            bytes_written,
        })
    }

    /// Begin a new member. Any previous member must have received exactly
    /// its declared payload.
    pub fn add_entry(&mut self, entry: &Entry) -> Result<()> {
        self.check_usable()?;
        self.complete_current()?;
        entry.validate()?;

        let declared = entry.size();
        let container = self.container.as_mut().unwrap();
        match container.add_entry(entry) {
            Ok(()) => {
                self.state = WriterState::InEntry;
                self.declared = declared;
                self.written = 0;
                Ok(())
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    /// Append payload bytes to the current member. Writing past the
    /// declared size fails before anything reaches the wire.
    pub fn write_payload(&mut self, buf: &[u8]) -> Result<()> {
        self.check_usable()?;
        if self.state != WriterState::InEntry {
            return Err(Error::InvalidState {
                state: "no entry open for writing",
            });
        }
        if let Some(declared) = self.declared {
            if self.written + buf.len() as u64 > declared {
                return Err(Error::SizeMismatch {
                    declared,
                    actual: self.written + buf.len() as u64,
                });
            }
        }
        let container = self.container.as_mut().unwrap();
        match container.write_data(buf) {
            Ok(()) => {
                self.written += buf.len() as u64;
                Ok(())
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    /// Total raw bytes pushed to the sink so far, after compression.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// The configured filter chain, outermost first.
    pub fn filters(&self) -> &[Codec] {
        &self.chain
    }

    /// Finish the archive: completes the last member, writes the end
    /// marker or central directory, flushes filter trailers innermost-out
    /// and releases the sink.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(fault) = self.fault {
            return Err(fault.raise());
        }
        if self.state == WriterState::Closed {
            return Err(Error::InvalidState {
                state: "session is closed",
            });
        }
        Ok(())
    }

    /// Verify the open member got its declared payload and pad it out.
    fn complete_current(&mut self) -> Result<()> {
        if self.state != WriterState::InEntry {
            return Ok(());
        }
        if let Some(declared) = self.declared {
            if self.written != declared {
                return Err(Error::SizeMismatch {
                    declared,
                    actual: self.written,
                });
            }
        }
        let container = self.container.as_mut().unwrap();
        match container.finish_entry() {
            Ok(()) => {
                self.state = WriterState::Open;
                self.declared = None;
                self.written = 0;
                Ok(())
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        let result = (|| {
            if self.fault.is_none() {
                self.complete_current()?;
                let container = self.container.as_mut().unwrap();
                container.finish()
            } else {
                Ok(())
            }
        })();
        // The sink is released regardless of how finalization went.
        self.container = None;
        self.state = WriterState::Closed;
        result
    }

    fn latch(&mut self, error: Error) -> Error {
        if let Some(fault) = Fault::of(&error) {
            self.fault = Some(fault);
        }
        error
    }
}

impl Drop for ArchiveWriter<'_> {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

impl std::fmt::Debug for ArchiveWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("format", &self.format)
            .field("filters", &self.chain)
            .field("state", &self.state)
            .field("bytes_written", &self.bytes_written.get())
            .finish_non_exhaustive()
    }
}
