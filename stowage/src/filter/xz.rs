//! XZ/LZMA filter backed by xz2.

use std::io::{self, Read, Write};

use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use super::Encoder;

const DEFAULT_LEVEL: u32 = 6;

pub(crate) fn reader<'a>(inner: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
    Box::new(XzDecoder::new_multi_decoder(inner))
}

pub(crate) fn writer<'a>(inner: Box<dyn Encoder + 'a>, level: Option<u32>) -> Box<dyn Encoder + 'a> {
    Box::new(XzWriter {
        inner: XzEncoder::new(inner, level.unwrap_or(DEFAULT_LEVEL)),
    })
}

struct XzWriter<'a> {
    inner: XzEncoder<Box<dyn Encoder + 'a>>,
}

impl Write for XzWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Encoder for XzWriter<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.inner.try_finish()?;
        self.inner.get_mut().finish()
    }
}
