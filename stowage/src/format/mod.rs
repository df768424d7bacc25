//! Container codecs: translation between wire headers and [`Entry`] values.

use std::fmt;
use std::str::FromStr;

use crate::entry::Entry;
use crate::error::Result;
use crate::read::DataBlock;

pub(crate) mod tar;
pub(crate) mod zip;

/// A container format the engine can read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// POSIX ustar: fixed octal fields, name/prefix split only.
    Ustar,
    /// ustar plus pax extended-header records (long names, large values,
    /// sub-second times, xattrs).
    Pax,
    /// Central-directory-indexed zip.
    Zip,
}

impl Format {
    pub const fn available_variants() -> &'static [&'static str] {
        &["ustar", "pax", "zip"]
    }

    pub const fn name(self) -> &'static str {
        match self {
            Format::Ustar => "ustar",
            Format::Pax => "pax",
            Format::Zip => "zip",
        }
    }

    /// True for the block-aligned sequential family.
    pub const fn is_tar(self) -> bool {
        matches!(self, Format::Ustar | Format::Pax)
    }

    /// Identify a container from decoded lookahead bytes.
    ///
    /// Tar detection wants the whole first block: the magic sits at offset
    /// 257, and pre-POSIX archives are only recognizable by their header
    /// checksum. A zero-filled block is an empty tar archive.
    pub(crate) fn sniff(head: &[u8]) -> Option<Format> {
        if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
            return Some(Format::Zip);
        }
        if head.len() >= tar::BLOCK_LEN {
            let block = &head[..tar::BLOCK_LEN];
            if &block[257..262] == b"ustar" {
                return Some(Format::Pax);
            }
            if block.iter().all(|b| *b == 0) {
                return Some(Format::Pax);
            }
            if tar::checksum_matches(block) {
                return Some(Format::Ustar);
            }
        }
        None
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct ParseFormatError(String);

impl std::error::Error for ParseFormatError {}

impl fmt::Display for ParseFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown format name: {}", self.0)
    }
}

impl FromStr for Format {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> std::result::Result<Format, ParseFormatError> {
        match s {
            "ustar" | "tar" => Ok(Format::Ustar),
            "pax" | "posix" => Ok(Format::Pax),
            "zip" => Ok(Format::Zip),
            _ => Err(ParseFormatError(s.to_string())),
        }
    }
}

/// Read side of a container codec. The engine layers state tracking and
/// error latching on top.
pub(crate) trait ContainerReader {
    /// Parse the next member header, skipping any unread payload first.
    /// `None` is the end-of-archive marker.
    fn next_entry(&mut self) -> Result<Option<Entry>>;

    /// Produce the next payload block of the current entry, or `None` once
    /// the declared size is exhausted.
    fn read_block(&mut self) -> Result<Option<DataBlock>>;

    /// The format variant actually observed on the wire.
    fn variant(&self) -> Format;
}

/// Write side of a container codec.
pub(crate) trait ContainerWriter {
    fn add_entry(&mut self, entry: &Entry) -> Result<()>;

    fn write_data(&mut self, buf: &[u8]) -> Result<()>;

    /// Close out the current member (padding, descriptors).
    fn finish_entry(&mut self) -> Result<()>;

    /// Write the end-of-archive marker / central directory and flush the
    /// filter stack down to the sink.
    fn finish(&mut self) -> Result<()>;
}
