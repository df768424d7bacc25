//! Reader engine: drives a container codec and a filter chain to produce a
//! lazy sequence of entries and payload blocks.

use std::cell::Cell;
use std::io::{self, Read, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use crate::entry::Entry;
use crate::error::{Error, Fault, Result};
use crate::filter::{self, Codec, MAX_FILTER_DEPTH};
use crate::format::{tar, zip, ContainerReader, Format};
use crate::source::{ByteSource, FileSource, MemorySource, Tracked};

/// One contiguous piece of an entry's payload, tagged with its logical
/// offset. Gaps between blocks are implicitly zero-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Configuration for opening an archive. `None` fields mean auto-detect,
/// mirroring the `format_name='all'`/`filter_name='all'` convention.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub format: Option<Format>,
    pub filters: Option<Vec<Codec>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Between entries.
    Idle,
    /// An entry is open and its payload may be read.
    InEntry,
    /// The end-of-archive marker was seen.
    Eof,
    /// A fatal condition was hit; it re-raises on every call.
    Faulted(Fault),
}

/// A read session over one archive.
///
/// The session owns its byte source exclusively and is confined to a single
/// thread. Dropping it releases the source; [`ArchiveReader::close`] exists
/// for callers that want the release to be explicit.
pub struct ArchiveReader<'a> {
    container: Box<dyn ContainerReader + 'a>,
    chain: Vec<Codec>,
    state: ReaderState,
    bytes_read: Rc<Cell<u64>>,
}

/// Read until `len` bytes or EOF; shorter is fine, the container decides
/// whether that is an error.
fn fill_head(input: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut head = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = input.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(head)
}

/// Classify an I/O error surfaced through the read path. Decode failures
/// from an active filter chain arrive as `InvalidData`; anything running
/// out of bytes mid-structure is a truncation.
fn classify_io(error: io::Error, chain_active: bool, offset: u64) -> Error {
    match error.kind() {
        io::ErrorKind::UnexpectedEof => Error::Truncated,
        io::ErrorKind::InvalidData if chain_active => Error::Filter {
            offset,
            source: error,
        },
        _ => Error::Io(error),
    }
}

impl ArchiveReader<'static> {
    /// Open an archive file by path with format and filters auto-detected.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<ArchiveReader<'static>> {
        Self::open_path_with(path, ReadOptions::default())
    }

    pub fn open_path_with<P: AsRef<Path>>(
        path: P,
        options: ReadOptions,
    ) -> Result<ArchiveReader<'static>> {
        let source = FileSource::open(path)?;
        ArchiveReader::open_source(Box::new(source), options)
    }

    /// Open an archive read from a raw file descriptor the caller owns.
    /// The descriptor is treated as forward-only and is not closed.
    #[cfg(unix)]
    pub fn open_fd(fd: std::os::unix::io::RawFd) -> Result<ArchiveReader<'static>> {
        Self::open_fd_with(fd, ReadOptions::default())
    }

    #[cfg(unix)]
    pub fn open_fd_with(
        fd: std::os::unix::io::RawFd,
        options: ReadOptions,
    ) -> Result<ArchiveReader<'static>> {
        ArchiveReader::open_source(Box::new(crate::source::FdSource::new(fd)), options)
    }
}

impl<'a> ArchiveReader<'a> {
    /// Open an archive held in memory.
    pub fn open_bytes(data: &'a [u8]) -> Result<ArchiveReader<'a>> {
        Self::open_bytes_with(data, ReadOptions::default())
    }

    pub fn open_bytes_with(data: &'a [u8], options: ReadOptions) -> Result<ArchiveReader<'a>> {
        Self::open_source(Box::new(MemorySource::new(data)), options)
    }

    /// Open an archive over any [`ByteSource`], including caller-supplied
    /// callback backends.
    pub fn open_source(
        source: Box<dyn ByteSource + 'a>,
        options: ReadOptions,
    ) -> Result<ArchiveReader<'a>> {
        let bytes_read = Rc::new(Cell::new(0u64));
        let mut tracked = Tracked::new(source, Rc::clone(&bytes_read));

        // A pinned zip never layers filters: the codec needs random access
        // to the raw stream.
        if options.format == Some(Format::Zip) {
            if !options.filters.as_deref().unwrap_or_default().is_empty() {
                return Err(Error::NotSeekable);
            }
            let container = zip::ZipReader::new(tracked)?;
            return Ok(Self::assemble(Box::new(container), Vec::new(), bytes_read));
        }

        let mut head =
            fill_head(&mut tracked, tar::BLOCK_LEN).map_err(|e| classify_io(e, false, 0))?;

        // Zip is recognized on the raw bytes before any filter wrapping so
        // the source can be rewound for the central directory.
        let wants_zip = options.format.is_none();
        if wants_zip
            && options.filters.as_deref().unwrap_or_default().is_empty()
            && Format::sniff(&head) == Some(Format::Zip)
        {
            tracked.seek(SeekFrom::Start(0))?;
            tracked.reset_count();
            let container = zip::ZipReader::new(tracked)?;
            return Ok(Self::assemble(Box::new(container), Vec::new(), bytes_read));
        }

        let mut chain: Vec<Codec> = Vec::new();
        let mut input: Box<dyn Read + 'a> = Box::new(io::Cursor::new(head.clone()).chain(tracked));

        match options.filters {
            Some(pinned) => {
                for codec in &pinned {
                    input = filter::decoder(*codec, input)?;
                }
                if !pinned.is_empty() {
                    head = fill_head(&mut input, tar::BLOCK_LEN)
                        .map_err(|e| classify_io(e, true, bytes_read.get()))?;
                    input = Box::new(io::Cursor::new(head.clone()).chain(input));
                }
                chain = pinned;
            }
            None => loop {
                match Format::sniff(&head) {
                    Some(Format::Zip) if options.format.is_none() => {
                        // Zip under a compression layer would need seeks
                        // through a forward-only decoder.
                        return Err(Error::NotSeekable);
                    }
                    Some(_) => break,
                    None => {}
                }
                let codec = match Codec::sniff(&head) {
                    Some(codec) if chain.len() < MAX_FILTER_DEPTH => codec,
                    _ => return Err(Error::UnknownFormat),
                };
                chain.push(codec);
                input = filter::decoder(codec, input)?;
                head = fill_head(&mut input, tar::BLOCK_LEN)
                    .map_err(|e| classify_io(e, true, bytes_read.get()))?;
                input = Box::new(io::Cursor::new(head.clone()).chain(input));
            },
        }

        match options.format {
            Some(format) if format.is_tar() => {}
            None => match Format::sniff(&head) {
                Some(f) if f.is_tar() => {}
                Some(Format::Zip) => return Err(Error::NotSeekable),
                _ => return Err(Error::UnknownFormat),
            },
            // Zip was handled above; tar formats are matched by the
            // guard arm, so only `Some(Format::Zip)` can reach here.
            Some(_) => unreachable!(),
        }

        tracing::debug!(filters = ?chain, "opened tar-family archive");
        let container = tar::TarReader::new(input);
        Ok(Self::assemble(Box::new(container), chain, bytes_read))
    }

    fn assemble(
        container: Box<dyn ContainerReader + 'a>,
        chain: Vec<Codec>,
        bytes_read: Rc<Cell<u64>>,
    ) -> ArchiveReader<'a> {
        ArchiveReader {
            container,
            chain,
            state: ReaderState::Idle,
            bytes_read,
        }
    }

    /// Advance to the next entry, skipping any unread payload of the
    /// current one. `Ok(None)` is the end-of-archive marker.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        match self.state {
            ReaderState::Faulted(fault) => return Err(fault.raise()),
            ReaderState::Eof => return Ok(None),
            _ => {}
        }
        match self.container.next_entry() {
            Ok(Some(entry)) => {
                self.state = ReaderState::InEntry;
                Ok(Some(entry))
            }
            Ok(None) => {
                self.state = ReaderState::Eof;
                Ok(None)
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    /// Produce the next payload block of the current entry. `Ok(None)`
    /// means the declared payload is exhausted.
    pub fn read_block(&mut self) -> Result<Option<DataBlock>> {
        match self.state {
            ReaderState::Faulted(fault) => return Err(fault.raise()),
            ReaderState::InEntry => {}
            _ => {
                return Err(Error::InvalidState {
                    state: "no entry open for reading",
                })
            }
        }
        match self.container.read_block() {
            Ok(Some(block)) => Ok(Some(block)),
            Ok(None) => {
                self.state = ReaderState::Idle;
                Ok(None)
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    /// Stream the remaining payload of the current entry into `dest`,
    /// returning the number of bytes written.
    pub fn read_payload<W: Write>(&mut self, dest: &mut W) -> Result<u64> {
        let mut total = 0;
        while let Some(block) = self.read_block()? {
            dest.write_all(&block.data)?;
            total += block.data.len() as u64;
        }
        Ok(total)
    }

    /// Raw bytes consumed from the source so far, before decompression.
    /// This is the progress-bar counter.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }

    /// The container variant observed on the wire.
    pub fn format(&self) -> Format {
        self.container.variant()
    }

    /// The detected or pinned filter chain, outermost first.
    pub fn filters(&self) -> &[Codec] {
        &self.chain
    }

    /// Release the underlying source. Dropping the reader does the same;
    /// this form surfaces nothing but exists so cleanup can be explicit.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    fn latch(&mut self, error: Error) -> Error {
        let error = match error {
            Error::Io(e) => classify_io(e, !self.chain.is_empty(), self.bytes_read.get()),
            other => other,
        };
        if let Some(fault) = Fault::of(&error) {
            self.state = ReaderState::Faulted(fault);
        }
        error
    }
}

impl std::fmt::Debug for ArchiveReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("format", &self.container.variant())
            .field("filters", &self.chain)
            .field("state", &self.state)
            .field("bytes_read", &self.bytes_read.get())
            .finish_non_exhaustive()
    }
}
