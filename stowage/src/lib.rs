//! Herein lies a streaming archive codec engine.
//!
//! Use [`ArchiveReader`] to pull entries and payload blocks out of tar
//! (ustar/pax) and zip containers, and [`ArchiveWriter`] to produce them,
//! with gzip/bzip2/xz/zstd/compress filter chains layered in between. All
//! I/O flows through the [`ByteSource`]/[`ByteSink`] boundary, so files,
//! memory buffers, raw descriptors and caller-defined callback streams are
//! interchangeable.
//!
//! ```no_run
//! use stowage::{ArchiveReader, ArchiveWriter, Entry, EntryType, Format};
//!
//! # fn main() -> stowage::Result<()> {
//! let mut buf = Vec::new();
//! let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[])?;
//! let mut entry = Entry::new("hello.txt", EntryType::Regular);
//! entry.set_size(5);
//! writer.add_entry(&entry)?;
//! writer.write_payload(b"hello")?;
//! writer.close()?;
//!
//! let mut reader = ArchiveReader::open_bytes(&buf)?;
//! while let Some(entry) = reader.next_entry()? {
//!     println!("{}", entry.path_lossy());
//! }
//! # Ok(())
//! # }
//! ```

mod entry;
mod error;
pub mod extract;
mod filter;
mod format;
mod read;
mod source;
mod write;

pub use entry::{Entry, EntryType, Timespec, XattrMap};
pub use error::{Error, Result};
pub use extract::{extract_all, ExtractError, ExtractOptions, ExtractStats};
pub use filter::{Codec, FilterConfig, ParseCodecError};
pub use format::{Format, ParseFormatError};
pub use read::{ArchiveReader, DataBlock, ReadOptions};
pub use source::{ByteSink, ByteSource, CallbackSink, CallbackSource, FileSink, FileSource, MemorySink, MemorySource};
#[cfg(unix)]
pub use source::{FdSink, FdSource};
pub use write::ArchiveWriter;
