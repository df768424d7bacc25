//! LZW filter for legacy `.Z` (compress) streams.
//!
//! No maintained crate covers this format, so both directions are
//! implemented here. The wire format is the ncompress one: a three byte
//! header (magic, then max code width and block-mode flag), followed by
//! LSB-first variable-width codes. Code width changes and clear codes only
//! take effect on a boundary of eight codes, so the stream position is
//! padded up to a multiple of `width * 8` bits at every change; positions
//! count from the end of the header.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use super::Encoder;

const MAGIC: [u8; 2] = [0x1f, 0x9d];
const BIT_MASK: u8 = 0x1f;
const BLOCK_MODE: u8 = 0x80;

const INIT_BITS: u32 = 9;
const MAX_BITS: u32 = 16;
const CLEAR: u32 = 256;
const FIRST: u32 = 257;

fn corrupt(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn max_code(n_bits: u32, maxbits: u32) -> u32 {
    if n_bits == maxbits {
        1 << maxbits
    } else {
        (1 << n_bits) - 1
    }
}

// ----------------------------------------------------------------------
// Decoder
// ----------------------------------------------------------------------

struct DecodeState {
    maxbits: u32,
    block_mode: bool,
    n_bits: u32,
    maxcode: u32,
    maxmax: u32,
    free_ent: u32,
    prefix: Vec<u16>,
    suffix: Vec<u8>,
    oldcode: Option<u32>,
    finchar: u8,
    /// Bits consumed since the end of the header.
    posbits: u64,
    bitbuf: u64,
    bitcnt: u32,
}

pub(crate) struct LzwDecoder<R> {
    inner: R,
    state: Option<DecodeState>,
    pending: Vec<u8>,
    pending_pos: usize,
    done: bool,
}

impl<R: Read> LzwDecoder<R> {
    pub(crate) fn new(inner: R) -> LzwDecoder<R> {
        LzwDecoder {
            inner,
            state: None,
            pending: Vec::new(),
            pending_pos: 0,
            done: false,
        }
    }

    fn read_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; 3];
        self.inner.read_exact(&mut header)?;
        if header[..2] != MAGIC {
            return Err(corrupt("bad compress magic"));
        }
        let maxbits = u32::from(header[2] & BIT_MASK);
        if !(INIT_BITS..=MAX_BITS).contains(&maxbits) {
            return Err(corrupt("unsupported compress code width"));
        }
        let block_mode = header[2] & BLOCK_MODE != 0;
        let maxmax = 1u32 << maxbits;
        self.state = Some(DecodeState {
            maxbits,
            block_mode,
            n_bits: INIT_BITS,
            maxcode: max_code(INIT_BITS, maxbits),
            maxmax,
            free_ent: if block_mode { FIRST } else { FIRST - 1 },
            prefix: vec![0; maxmax as usize],
            suffix: (0..=255).cycle().take(maxmax as usize).collect(),
            oldcode: None,
            finchar: 0,
            posbits: 0,
            bitbuf: 0,
            bitcnt: 0,
        });
        Ok(())
    }

    /// Pull the next `n` bits, LSB-first. `None` means the stream ended
    /// before a whole code was available (trailing padding).
    fn next_code(&mut self) -> io::Result<Option<u32>> {
        let state = self.state.as_mut().unwrap();
        while state.bitcnt < state.n_bits {
            let mut byte = [0u8; 1];
            match self.inner.read(&mut byte)? {
                0 => return Ok(None),
                _ => {
                    state.bitbuf |= u64::from(byte[0]) << state.bitcnt;
                    state.bitcnt += 8;
                }
            }
        }
        let code = (state.bitbuf & ((1 << state.n_bits) - 1)) as u32;
        state.bitbuf >>= state.n_bits;
        state.bitcnt -= state.n_bits;
        state.posbits += u64::from(state.n_bits);
        Ok(Some(code))
    }

    /// Advance to the next group boundary after a width change or clear.
    /// Returns false if the stream ended inside the padding.
    fn skip_to_boundary(&mut self) -> io::Result<bool> {
        let mut pad = {
            let state = self.state.as_ref().unwrap();
            let group = u64::from(state.n_bits) * 8;
            (group - state.posbits % group) % group
        };
        while pad > 0 {
            let state = self.state.as_mut().unwrap();
            if state.bitcnt == 0 {
                let mut byte = [0u8; 1];
                if self.inner.read(&mut byte)? == 0 {
                    return Ok(false);
                }
                state.bitbuf = u64::from(byte[0]);
                state.bitcnt = 8;
            }
            let take = pad.min(u64::from(state.bitcnt));
            state.bitbuf >>= take;
            state.bitcnt -= take as u32;
            state.posbits += take;
            pad -= take;
        }
        Ok(true)
    }

    fn decode_more(&mut self) -> io::Result<()> {
        if self.state.is_none() {
            self.read_header()?;
        }

        self.pending.clear();
        self.pending_pos = 0;

        // Decode a batch of codes so small caller buffers do not thrash.
        while self.pending.len() < 8 * 1024 {
            let needs_grow = {
                let state = self.state.as_ref().unwrap();
                state.free_ent > state.maxcode
            };
            if needs_grow {
                let more = self.skip_to_boundary()?;
                let state = self.state.as_mut().unwrap();
                state.n_bits += 1;
                state.maxcode = max_code(state.n_bits, state.maxbits);
                if !more {
                    self.done = true;
                    return Ok(());
                }
                continue;
            }

            let code = match self.next_code()? {
                Some(code) => code,
                None => {
                    self.done = true;
                    return Ok(());
                }
            };

            let is_clear = {
                let state = self.state.as_ref().unwrap();
                state.block_mode && code == CLEAR
            };
            if is_clear {
                self.state.as_mut().unwrap().free_ent = FIRST - 1;
                let more = self.skip_to_boundary()?;
                let state = self.state.as_mut().unwrap();
                state.n_bits = INIT_BITS;
                state.maxcode = max_code(INIT_BITS, state.maxbits);
                if !more {
                    self.done = true;
                    return Ok(());
                }
                continue;
            }

            let state = self.state.as_mut().unwrap();

            let oldcode = match state.oldcode {
                None => {
                    if code > 255 {
                        return Err(corrupt("first LZW code is not a literal"));
                    }
                    state.finchar = code as u8;
                    state.oldcode = Some(code);
                    self.pending.push(code as u8);
                    continue;
                }
                Some(old) => old,
            };

            let incode = code;
            let mut code = code;
            let start = self.pending.len();

            if code >= state.free_ent {
                if code > state.free_ent {
                    return Err(corrupt("LZW code out of range"));
                }
                // KwKwK: the code being defined by this very step.
                self.pending.push(state.finchar);
                code = oldcode;
            }

            while code >= 256 {
                if self.pending.len() - start > state.maxmax as usize {
                    return Err(corrupt("LZW prefix chain loops"));
                }
                self.pending.push(state.suffix[code as usize]);
                code = u32::from(state.prefix[code as usize]);
            }
            state.finchar = code as u8;
            self.pending.push(state.finchar);
            self.pending[start..].reverse();

            if state.free_ent < state.maxmax {
                state.prefix[state.free_ent as usize] = oldcode as u16;
                state.suffix[state.free_ent as usize] = state.finchar;
                state.free_ent += 1;
            }
            state.oldcode = Some(incode);
        }
        Ok(())
    }
}

impl<R: Read> Read for LzwDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending_pos >= self.pending.len() {
            if self.done {
                return Ok(0);
            }
            self.decode_more()?;
        }
        let n = (self.pending.len() - self.pending_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        Ok(n)
    }
}

// ----------------------------------------------------------------------
// Encoder
// ----------------------------------------------------------------------

pub(crate) struct LzwEncoder<W: Write> {
    inner: W,
    table: HashMap<(u32, u8), u32>,
    ent: Option<u32>,
    n_bits: u32,
    maxcode: u32,
    maxmax: u32,
    free_ent: u32,
    posbits: u64,
    bitbuf: u64,
    bitcnt: u32,
    header_written: bool,
    finished: bool,
}

impl<W: Write> LzwEncoder<W> {
    pub(crate) fn new(inner: W) -> LzwEncoder<W> {
        LzwEncoder {
            inner,
            table: HashMap::new(),
            ent: None,
            n_bits: INIT_BITS,
            maxcode: max_code(INIT_BITS, MAX_BITS),
            maxmax: 1 << MAX_BITS,
            free_ent: FIRST,
            posbits: 0,
            bitbuf: 0,
            bitcnt: 0,
            header_written: false,
            finished: false,
        }
    }

    fn write_header(&mut self) -> io::Result<()> {
        self.inner
            .write_all(&[MAGIC[0], MAGIC[1], MAX_BITS as u8 | BLOCK_MODE])?;
        self.header_written = true;
        Ok(())
    }

    fn put_bits(&mut self, value: u32, count: u32) -> io::Result<()> {
        self.bitbuf |= u64::from(value) << self.bitcnt;
        self.bitcnt += count;
        self.posbits += u64::from(count);
        while self.bitcnt >= 8 {
            self.inner.write_all(&[(self.bitbuf & 0xff) as u8])?;
            self.bitbuf >>= 8;
            self.bitcnt -= 8;
        }
        Ok(())
    }

    /// Emit one code, then grow the width at the group boundary if the
    /// decoder will. The check runs against `free_ent` before the caller's
    /// table insertion, mirroring the decoder exactly.
    fn emit(&mut self, code: u32) -> io::Result<()> {
        self.put_bits(code, self.n_bits)?;
        if self.free_ent > self.maxcode && self.n_bits < MAX_BITS {
            let group = u64::from(self.n_bits) * 8;
            let pad = (group - self.posbits % group) % group;
            if pad > 0 {
                self.put_bits(0, pad as u32)?;
            }
            self.n_bits += 1;
            self.maxcode = max_code(self.n_bits, MAX_BITS);
        }
        Ok(())
    }

    fn finish_stream(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.header_written {
            self.write_header()?;
        }
        if let Some(ent) = self.ent.take() {
            self.emit(ent)?;
        }
        if self.bitcnt > 0 {
            self.inner.write_all(&[(self.bitbuf & 0xff) as u8])?;
            self.bitbuf = 0;
            self.bitcnt = 0;
        }
        self.finished = true;
        self.inner.flush()
    }
}

impl<W: Write> Write for LzwEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.header_written {
            self.write_header()?;
        }
        for &c in buf {
            let ent = match self.ent {
                None => {
                    self.ent = Some(u32::from(c));
                    continue;
                }
                Some(ent) => ent,
            };
            if let Some(&code) = self.table.get(&(ent, c)) {
                self.ent = Some(code);
                continue;
            }
            self.emit(ent)?;
            if self.free_ent < self.maxmax {
                self.table.insert((ent, c), self.free_ent);
                self.free_ent += 1;
            }
            self.ent = Some(u32::from(c));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Codes cannot be flushed mid-symbol; only the trailer flush in
        // `finish` drains the bit buffer.
        self.inner.flush()
    }
}

impl<W: Encoder> Encoder for LzwEncoder<W> {
    fn finish(&mut self) -> io::Result<()> {
        self.finish_stream()?;
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        {
            let mut enc = LzwEncoder::new(&mut encoded);
            enc.write_all(data).unwrap();
            enc.finish_stream().unwrap();
        }
        let mut decoded = Vec::new();
        LzwDecoder::new(&encoded[..])
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    #[test]
    fn empty_stream() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn single_byte() {
        assert_eq!(roundtrip(b"x"), b"x");
    }

    #[test]
    fn short_ascii() {
        let data = b"TOBEORNOTTOBEORTOBEORNOT";
        assert_eq!(roundtrip(data), data);
    }

    #[test]
    fn repetitive_data_crosses_width_boundaries() {
        // Enough distinct pairs to push the code width from 9 well past 12
        // bits, exercising the group padding at each change.
        let mut data = Vec::new();
        for i in 0u32..40_000 {
            data.push((i % 253) as u8);
            data.push((i / 7 % 251) as u8);
        }
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn incompressible_data() {
        // A de Bruijn-ish walk that defeats the dictionary.
        let data: Vec<u8> = (0..70_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn kwkwk_sequence() {
        // aaaa... is the classic KwKwK pattern.
        let data = vec![b'a'; 1024];
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut out = Vec::new();
        let err = LzwDecoder::new(&b"\x1f\x8b\x10"[..])
            .read_to_end(&mut out)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_header_is_eof() {
        let mut out = Vec::new();
        let err = LzwDecoder::new(&b"\x1f"[..]).read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
