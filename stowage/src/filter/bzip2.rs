//! Bzip2 filter backed by the bzip2 crate.

use std::io::{self, Read, Write};

use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use super::Encoder;

pub(crate) fn reader<'a>(inner: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
    Box::new(MultiBzDecoder::new(inner))
}

pub(crate) fn writer<'a>(inner: Box<dyn Encoder + 'a>, level: Option<u32>) -> Box<dyn Encoder + 'a> {
    let level = level.map(Compression::new).unwrap_or_default();
    Box::new(Bzip2Writer {
        inner: BzEncoder::new(inner, level),
    })
}

struct Bzip2Writer<'a> {
    inner: BzEncoder<Box<dyn Encoder + 'a>>,
}

impl Write for Bzip2Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Encoder for Bzip2Writer<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.inner.try_finish()?;
        self.inner.get_mut().finish()
    }
}
