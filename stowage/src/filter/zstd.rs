//! Zstandard filter backed by the zstd crate.

use std::io::{self, Read, Write};

use crate::error::Result;

use super::Encoder;

pub(crate) fn reader<'a>(inner: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
    Ok(Box::new(zstd::stream::read::Decoder::new(inner)?))
}

pub(crate) fn writer<'a>(
    inner: Box<dyn Encoder + 'a>,
    level: Option<u32>,
) -> Result<Box<dyn Encoder + 'a>> {
    // Level 0 selects zstd's own default.
    let level = level.map(|l| l as i32).unwrap_or(0);
    Ok(Box::new(ZstdWriter {
        inner: zstd::stream::write::Encoder::new(inner, level)?,
    }))
}

struct ZstdWriter<'a> {
    inner: zstd::stream::write::Encoder<'static, Box<dyn Encoder + 'a>>,
}

impl Write for ZstdWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Encoder for ZstdWriter<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.inner.do_finish()?;
        self.inner.get_mut().finish()
    }
}
