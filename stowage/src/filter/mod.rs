//! Compression filter pipeline.
//!
//! Filters are transforms layered between the container codec and the raw
//! byte stream. On read they are [`Read`] adapters stacked outermost-first;
//! on write they are [`Write`] adapters with a cascading [`Encoder::finish`]
//! so trailers flush innermost-out when the session closes. The chain used
//! to decode must exactly invert the chain used to encode.

use std::fmt;
use std::io::{self, Read, SeekFrom, Write};
use std::str::FromStr;

use crate::error::{Error, Result};

#[cfg(feature = "bzip2")]
mod bzip2;
mod gzip;
mod lzw;
#[cfg(feature = "xz")]
mod xz;
#[cfg(feature = "zstd")]
mod zstd;

/// How many stacked filters auto-detection will peel before giving up.
pub(crate) const MAX_FILTER_DEPTH: usize = 4;

/// A compression codec usable in a filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    /// Legacy LZW `.Z` streams.
    Compress,
}

impl Codec {
    pub const fn available_variants() -> &'static [&'static str] {
        &["none", "gzip", "bzip2", "xz", "zstd", "compress"]
    }

    pub const fn name(self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Bzip2 => "bzip2",
            Codec::Xz => "xz",
            Codec::Zstd => "zstd",
            Codec::Compress => "compress",
        }
    }

    /// Identify the codec from stream magic bytes, if any matches.
    pub(crate) fn sniff(head: &[u8]) -> Option<Codec> {
        if head.starts_with(&[0x1f, 0x8b]) {
            Some(Codec::Gzip)
        } else if head.starts_with(&[0x1f, 0x9d]) {
            Some(Codec::Compress)
        } else if head.starts_with(b"BZh")
            && head.get(3).map_or(false, |d| (b'1'..=b'9').contains(d))
        {
            Some(Codec::Bzip2)
        } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(Codec::Xz)
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(Codec::Zstd)
        } else {
            None
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct ParseCodecError(String);

impl std::error::Error for ParseCodecError {}

impl fmt::Display for ParseCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown filter name: {}", self.0)
    }
}

impl FromStr for Codec {
    type Err = ParseCodecError;

    fn from_str(s: &str) -> std::result::Result<Codec, ParseCodecError> {
        match s {
            "gzip" | "gz" => Ok(Codec::Gzip),
            "bzip2" | "bz2" => Ok(Codec::Bzip2),
            "xz" | "lzma" => Ok(Codec::Xz),
            "zstd" | "zstandard" => Ok(Codec::Zstd),
            "compress" | "Z" => Ok(Codec::Compress),
            _ => Err(ParseCodecError(s.to_string())),
        }
    }
}

/// One element of a write-side filter chain: a codec plus its options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterConfig {
    pub codec: Codec,
    /// Compression level, codec-specific scale. `None` uses the codec's
    /// default.
    pub level: Option<u32>,
}

impl FilterConfig {
    pub fn new(codec: Codec) -> FilterConfig {
        FilterConfig { codec, level: None }
    }

    pub fn level(mut self, level: u32) -> FilterConfig {
        self.level = Some(level);
        self
    }
}

impl From<Codec> for FilterConfig {
    fn from(codec: Codec) -> FilterConfig {
        FilterConfig::new(codec)
    }
}

/// Write side of a filter layer (or the bare sink below the stack).
///
/// `finish` flushes this layer's trailer into the layer below and cascades
/// downward. Seek requests only succeed on the bare sink layer; any codec
/// layer in between makes the stack forward-only.
pub(crate) trait Encoder: Write {
    fn finish(&mut self) -> io::Result<()>;

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::NotSeekable)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }
}

/// Layer a single decoder over `inner`.
pub(crate) fn decoder<'a>(codec: Codec, inner: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
    match codec {
        Codec::Gzip => Ok(gzip::reader(inner)),
        #[cfg(feature = "bzip2")]
        Codec::Bzip2 => Ok(bzip2::reader(inner)),
        #[cfg(feature = "xz")]
        Codec::Xz => Ok(xz::reader(inner)),
        #[cfg(feature = "zstd")]
        Codec::Zstd => Ok(zstd::reader(inner)?),
        Codec::Compress => Ok(Box::new(lzw::LzwDecoder::new(inner))),
        #[allow(unreachable_patterns)]
        missing => Err(Error::unsupported(format!(
            "filter {missing} (compiled out)"
        ))),
    }
}

/// Layer a single encoder over `inner`.
pub(crate) fn encoder<'a>(
    config: FilterConfig,
    inner: Box<dyn Encoder + 'a>,
) -> Result<Box<dyn Encoder + 'a>> {
    match config.codec {
        Codec::Gzip => Ok(gzip::writer(inner, config.level)),
        #[cfg(feature = "bzip2")]
        Codec::Bzip2 => Ok(bzip2::writer(inner, config.level)),
        #[cfg(feature = "xz")]
        Codec::Xz => Ok(xz::writer(inner, config.level)),
        #[cfg(feature = "zstd")]
        Codec::Zstd => Ok(zstd::writer(inner, config.level)?),
        Codec::Compress => Ok(Box::new(lzw::LzwEncoder::new(inner))),
        #[allow(unreachable_patterns)]
        missing => Err(Error::unsupported(format!(
            "filter {missing} (compiled out)"
        ))),
    }
}

/// Build a full decode stack. The chain is outermost-first, so the first
/// codec is applied to the raw bytes.
pub(crate) fn decode_stack<'a>(
    chain: &[Codec],
    mut inner: Box<dyn Read + 'a>,
) -> Result<Box<dyn Read + 'a>> {
    for codec in chain {
        inner = decoder(*codec, inner)?;
    }
    Ok(inner)
}

/// Build a full encode stack over the bare sink layer. The chain is
/// outermost-first, matching the decode order; container bytes enter the
/// innermost codec and leave the outermost one.
pub(crate) fn encode_stack<'a>(
    chain: &[FilterConfig],
    mut inner: Box<dyn Encoder + 'a>,
) -> Result<Box<dyn Encoder + 'a>> {
    for config in chain {
        inner = encoder(*config, inner)?;
    }
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_magics() {
        assert_eq!(Codec::sniff(&[0x1f, 0x8b, 0x08]), Some(Codec::Gzip));
        assert_eq!(Codec::sniff(&[0x1f, 0x9d, 0x90]), Some(Codec::Compress));
        assert_eq!(Codec::sniff(b"BZh9\x31\x41"), Some(Codec::Bzip2));
        assert_eq!(
            Codec::sniff(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]),
            Some(Codec::Xz)
        );
        assert_eq!(Codec::sniff(&[0x28, 0xb5, 0x2f, 0xfd]), Some(Codec::Zstd));
        assert_eq!(Codec::sniff(b"BZx"), None);
        assert_eq!(Codec::sniff(b"ustar"), None);
        assert_eq!(Codec::sniff(&[]), None);
    }

    #[test]
    fn codec_names_parse_back() {
        for name in ["gzip", "bzip2", "xz", "zstd", "compress"] {
            let codec: Codec = name.parse().unwrap();
            assert_eq!(codec.name(), name);
        }
        assert!("brotli".parse::<Codec>().is_err());
    }

    struct Shared<'v>(&'v mut Vec<u8>);

    impl Write for Shared<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Encoder for Shared<'_> {
        fn finish(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn roundtrip_chain(chain: &[Codec], data: &[u8]) -> Vec<u8> {
        let configs: Vec<FilterConfig> = chain.iter().map(|c| (*c).into()).collect();
        let mut encoded = Vec::new();
        {
            let mut stack = encode_stack(&configs, Box::new(Shared(&mut encoded))).unwrap();
            stack.write_all(data).unwrap();
            stack.finish().unwrap();
        }

        let mut decoded = Vec::new();
        decode_stack(chain, Box::new(io::Cursor::new(encoded)))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    #[test]
    fn single_layer_roundtrip() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for codec in [Codec::Gzip, Codec::Compress] {
            assert_eq!(roundtrip_chain(&[codec], &data), data, "codec {codec}");
        }
        #[cfg(feature = "bzip2")]
        assert_eq!(roundtrip_chain(&[Codec::Bzip2], &data), data);
        #[cfg(feature = "xz")]
        assert_eq!(roundtrip_chain(&[Codec::Xz], &data), data);
        #[cfg(feature = "zstd")]
        assert_eq!(roundtrip_chain(&[Codec::Zstd], &data), data);
    }

    #[test]
    fn stacked_layers_invert_in_order() {
        let data = b"stacked filter chains must be symmetric".repeat(64);
        #[cfg(feature = "zstd")]
        assert_eq!(roundtrip_chain(&[Codec::Zstd, Codec::Gzip], &data), data);
        assert_eq!(
            roundtrip_chain(&[Codec::Gzip, Codec::Compress], &data),
            data
        );
    }
}
