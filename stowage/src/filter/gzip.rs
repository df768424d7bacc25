//! Gzip filter backed by flate2.

use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::Encoder;

pub(crate) fn reader<'a>(inner: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
    // Multi-member aware: concatenated gzip streams decode as one.
    Box::new(MultiGzDecoder::new(inner))
}

pub(crate) fn writer<'a>(inner: Box<dyn Encoder + 'a>, level: Option<u32>) -> Box<dyn Encoder + 'a> {
    let level = level.map(Compression::new).unwrap_or_default();
    Box::new(GzipWriter {
        inner: GzEncoder::new(inner, level),
    })
}

struct GzipWriter<'a> {
    inner: GzEncoder<Box<dyn Encoder + 'a>>,
}

impl Write for GzipWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Encoder for GzipWriter<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.inner.try_finish()?;
        self.inner.get_mut().finish()
    }
}
