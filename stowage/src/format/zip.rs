//! Directory-indexed zip codec.
//!
//! Reading is driven by the trailing central directory and therefore needs
//! a seekable raw source. Writing works on any sink: a seekable sink gets
//! size and CRC fields backfilled into each local header, a forward-only
//! sink gets streaming mode (general-purpose flag bit 3 plus a post-payload
//! data descriptor). The central directory always carries final values, so
//! both flavors read back identically.

use std::io::{self, Cursor, Read, SeekFrom};

use byteorder::{LittleEndian as LE, ReadBytesExt};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::entry::{Entry, EntryType, Timespec};
use crate::error::{Error, Result};
use crate::filter::Encoder;
use crate::read::DataBlock;
use crate::source::Tracked;

use super::{ContainerReader, ContainerWriter, Format};

const LOCAL_SIG: u32 = 0x0403_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const DESCRIPTOR_SIG: u32 = 0x0807_4b50;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const FLAG_DESCRIPTOR: u16 = 0x0008;
const FLAG_UTF8: u16 = 0x0800;

const VERSION_NEEDED: u16 = 20;
const MADE_BY_UNIX: u16 = (3 << 8) | 20;

const EXTRA_TIMESTAMP: u16 = 0x5455;
const EXTRA_UNIX_IDS: u16 = 0x7875;

const EOCD_LEN: u64 = 22;
const LOCAL_LEN: usize = 30;
const CENTRAL_LEN: usize = 46;

const READ_CHUNK: usize = 64 * 1024;
const DEFLATE_OUT: usize = 32 * 1024;

/// DOS directory attribute bit, kept for other zip tools.
const DOS_DIR: u32 = 0x10;

fn header_err(field: &'static str) -> Error {
    Error::Header { field }
}

// ----------------------------------------------------------------------
// DOS timestamps (2-second resolution, local-time semantics ignored)
// ----------------------------------------------------------------------

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = i64::from(if m > 2 { m - 3 } else { m + 9 });
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn unix_to_dos(secs: i64) -> (u16, u16) {
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    let y = y.clamp(1980, 2107);
    let (h, min, s) = (rem / 3600, rem % 3600 / 60, rem % 60);
    let time = ((h as u16) << 11) | ((min as u16) << 5) | (s as u16 / 2);
    let date = (((y - 1980) as u16) << 9) | ((m as u16) << 5) | d as u16;
    (time, date)
}

fn dos_to_unix(time: u16, date: u16) -> i64 {
    let y = i64::from(date >> 9) + 1980;
    let m = u32::from((date >> 5) & 0x0f).max(1);
    let d = u32::from(date & 0x1f).max(1);
    let h = i64::from(time >> 11);
    let min = i64::from((time >> 5) & 0x3f);
    let s = i64::from((time & 0x1f) * 2);
    days_from_civil(y, m, d) * 86_400 + h * 3600 + min * 60 + s
}

// ----------------------------------------------------------------------
// Extra fields
// ----------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct ExtraFields {
    mtime: Option<Timespec>,
    atime: Option<Timespec>,
    uid: Option<u64>,
    gid: Option<u64>,
}

// Little-endian field helpers for building header buffers; writes into a
// Vec cannot fail, so these stay Result-free.
fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn parse_extra(extra: &[u8]) -> ExtraFields {
    let mut fields = ExtraFields::default();
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            break;
        }
        let body = &rest[4..4 + len];
        rest = &rest[4 + len..];
        match id {
            EXTRA_TIMESTAMP if !body.is_empty() => {
                let flags = body[0];
                let mut times = &body[1..];
                let mut next = || -> Option<i64> {
                    times.read_i32::<LE>().ok().map(i64::from)
                };
                if flags & 1 != 0 {
                    fields.mtime = next().map(|s| Timespec::new(s, 0));
                }
                if flags & 2 != 0 {
                    fields.atime = next().map(|s| Timespec::new(s, 0));
                }
            }
            EXTRA_UNIX_IDS if body.len() >= 3 && body[0] == 1 => {
                let mut cursor = &body[1..];
                let mut read_sized = || -> Option<u64> {
                    let size = *cursor.first()? as usize;
                    if size > 8 || cursor.len() < 1 + size {
                        return None;
                    }
                    let mut value: u64 = 0;
                    for (i, b) in cursor[1..1 + size].iter().enumerate() {
                        value |= u64::from(*b) << (8 * i);
                    }
                    cursor = &cursor[1 + size..];
                    Some(value)
                };
                fields.uid = read_sized();
                fields.gid = read_sized();
            }
            _ => {}
        }
    }
    fields
}

fn encode_extra_local(entry: &Entry) -> Vec<u8> {
    let mut out = Vec::new();
    if entry.mtime().is_some() || entry.atime().is_some() {
        let mut body = Vec::new();
        let mut flags = 0u8;
        if entry.mtime().is_some() {
            flags |= 1;
        }
        if entry.atime().is_some() {
            flags |= 2;
        }
        body.push(flags);
        if let Some(t) = entry.mtime() {
            put_i32(&mut body, t.secs.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
        }
        if let Some(t) = entry.atime() {
            put_i32(&mut body, t.secs.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
        }
        put_u16(&mut out, EXTRA_TIMESTAMP);
        put_u16(&mut out, body.len() as u16);
        out.extend_from_slice(&body);
    }
    if entry.uid() != 0 || entry.gid() != 0 {
        let uid = (entry.uid() as u32).to_le_bytes();
        let gid = (entry.gid() as u32).to_le_bytes();
        put_u16(&mut out, EXTRA_UNIX_IDS);
        put_u16(&mut out, 11);
        out.push(1);
        out.push(4);
        out.extend_from_slice(&uid);
        out.push(4);
        out.extend_from_slice(&gid);
    }
    out
}

fn encode_extra_central(entry: &Entry) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(t) = entry.mtime() {
        put_u16(&mut out, EXTRA_TIMESTAMP);
        put_u16(&mut out, 5);
        out.push(if entry.atime().is_some() { 3 } else { 1 });
        put_i32(&mut out, t.secs.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
    }
    if entry.uid() != 0 || entry.gid() != 0 {
        let uid = (entry.uid() as u32).to_le_bytes();
        let gid = (entry.gid() as u32).to_le_bytes();
        put_u16(&mut out, EXTRA_UNIX_IDS);
        put_u16(&mut out, 11);
        out.push(1);
        out.push(4);
        out.extend_from_slice(&uid);
        out.push(4);
        out.extend_from_slice(&gid);
    }
    out
}

// ----------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CdRecord {
    name: Vec<u8>,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    crc: u32,
    comp_size: u64,
    uncomp_size: u64,
    local_offset: u64,
    made_by: u16,
    external_attrs: u32,
    extra: ExtraFields,
}

struct ZipPayload {
    method: u16,
    comp_remaining: u64,
    uncomp_remaining: u64,
    out_offset: u64,
    crc: crc32fast::Hasher,
    expected_crc: u32,
    inflater: Option<Decompress>,
    in_buf: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    done: bool,
}

pub(crate) struct ZipReader<'a> {
    src: Tracked<'a>,
    records: Vec<CdRecord>,
    next_index: usize,
    current: Option<ZipPayload>,
}

impl<'a> ZipReader<'a> {
    pub(crate) fn new(mut src: Tracked<'a>) -> Result<ZipReader<'a>> {
        if !src.is_seekable() {
            return Err(Error::NotSeekable);
        }
        let records = Self::read_central_directory(&mut src)?;
        tracing::debug!(entries = records.len(), "parsed zip central directory");
        Ok(ZipReader {
            src,
            records,
            next_index: 0,
            current: None,
        })
    }

    fn read_exact(src: &mut Tracked<'_>, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = src.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Truncated);
            }
            filled += n;
        }
        Ok(())
    }

    fn read_central_directory(src: &mut Tracked<'a>) -> Result<Vec<CdRecord>> {
        let file_len = src.seek(SeekFrom::End(0))?;
        if file_len < EOCD_LEN {
            return Err(Error::Truncated);
        }
        let scan_len = file_len.min(EOCD_LEN + 65_535);
        src.seek(SeekFrom::End(-(scan_len as i64)))?;
        let mut tail = vec![0u8; scan_len as usize];
        Self::read_exact(src, &mut tail)?;

        let eocd_pos = (0..=tail.len() - EOCD_LEN as usize)
            .rev()
            .find(|&i| {
                tail[i..i + 4] == EOCD_SIG.to_le_bytes()
                    && u16::from_le_bytes([tail[i + 20], tail[i + 21]]) as usize
                        == tail.len() - i - EOCD_LEN as usize
            })
            .ok_or(Error::Truncated)?;

        let mut eocd = &tail[eocd_pos + 4..];
        let _disk = eocd.read_u16::<LE>()?;
        let _cd_disk = eocd.read_u16::<LE>()?;
        let _disk_entries = eocd.read_u16::<LE>()?;
        let total_entries = eocd.read_u16::<LE>()?;
        let cd_size = eocd.read_u32::<LE>()?;
        let cd_offset = eocd.read_u32::<LE>()?;
        if cd_offset == u32::MAX || total_entries == u16::MAX {
            return Err(Error::unsupported("zip64 archives"));
        }

        src.seek(SeekFrom::Start(u64::from(cd_offset)))?;
        let mut cd = vec![0u8; cd_size as usize];
        Self::read_exact(src, &mut cd)?;

        let mut records = Vec::with_capacity(usize::from(total_entries));
        let mut cursor = Cursor::new(cd.as_slice());
        for _ in 0..total_entries {
            if cursor.read_u32::<LE>()? != CENTRAL_SIG {
                return Err(header_err("central directory signature"));
            }
            let made_by = cursor.read_u16::<LE>()?;
            let _version_needed = cursor.read_u16::<LE>()?;
            let _flags = cursor.read_u16::<LE>()?;
            let method = cursor.read_u16::<LE>()?;
            let dos_time = cursor.read_u16::<LE>()?;
            let dos_date = cursor.read_u16::<LE>()?;
            let crc = cursor.read_u32::<LE>()?;
            let comp_size = cursor.read_u32::<LE>()?;
            let uncomp_size = cursor.read_u32::<LE>()?;
            let name_len = cursor.read_u16::<LE>()? as usize;
            let extra_len = cursor.read_u16::<LE>()? as usize;
            let comment_len = cursor.read_u16::<LE>()? as usize;
            let _disk_start = cursor.read_u16::<LE>()?;
            let _internal_attrs = cursor.read_u16::<LE>()?;
            let external_attrs = cursor.read_u32::<LE>()?;
            let local_offset = cursor.read_u32::<LE>()?;
            if comp_size == u32::MAX || uncomp_size == u32::MAX || local_offset == u32::MAX {
                return Err(Error::unsupported("zip64 entries"));
            }

            let mut name = vec![0u8; name_len];
            cursor.read_exact(&mut name)?;
            let mut extra = vec![0u8; extra_len];
            cursor.read_exact(&mut extra)?;
            let mut comment = vec![0u8; comment_len];
            cursor.read_exact(&mut comment)?;

            records.push(CdRecord {
                name,
                method,
                dos_time,
                dos_date,
                crc,
                comp_size: u64::from(comp_size),
                uncomp_size: u64::from(uncomp_size),
                local_offset: u64::from(local_offset),
                made_by,
                external_attrs,
                extra: parse_extra(&extra),
            });
        }
        Ok(records)
    }

    fn entry_from_record(rec: &CdRecord) -> Entry {
        let trailing_slash = rec.name.last() == Some(&b'/');
        let unix_mode = rec.external_attrs >> 16;
        let entry_type = if rec.made_by >> 8 == 3 && unix_mode != 0 {
            EntryType::from_mode(unix_mode).unwrap_or(if trailing_slash {
                EntryType::Directory
            } else {
                EntryType::Regular
            })
        } else if trailing_slash {
            EntryType::Directory
        } else {
            EntryType::Regular
        };

        let mut entry = Entry::new(rec.name.clone(), entry_type);
        if rec.made_by >> 8 == 3 && unix_mode != 0 {
            entry.set_mode(unix_mode & 0o7_777);
        }
        if entry_type == EntryType::Regular {
            entry.set_size(rec.uncomp_size);
        }
        let mtime = rec
            .extra
            .mtime
            .unwrap_or_else(|| Timespec::new(dos_to_unix(rec.dos_time, rec.dos_date), 0));
        entry.set_mtime(Some(mtime));
        entry.set_atime(rec.extra.atime);
        if let Some(uid) = rec.extra.uid {
            entry.set_uid(uid);
        }
        if let Some(gid) = rec.extra.gid {
            entry.set_gid(gid);
        }
        entry
    }

    /// Position the source at the start of the payload for `rec`.
    fn seek_to_payload(&mut self, index: usize) -> Result<()> {
        let offset = self.records[index].local_offset;
        self.src.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; LOCAL_LEN];
        Self::read_exact(&mut self.src, &mut header)?;
        let mut fixed = &header[..];
        if fixed.read_u32::<LE>()? != LOCAL_SIG {
            return Err(header_err("local header signature"));
        }
        let name_len = u64::from(u16::from_le_bytes([header[26], header[27]]));
        let extra_len = u64::from(u16::from_le_bytes([header[28], header[29]]));
        // Lengths in the local header may differ from the central copy;
        // trust the local lengths for positioning only.
        self.src
            .seek(SeekFrom::Start(offset + LOCAL_LEN as u64 + name_len + extra_len))?;
        Ok(())
    }

    fn new_payload(rec: &CdRecord) -> Result<ZipPayload> {
        let inflater = match rec.method {
            METHOD_STORED => None,
            METHOD_DEFLATE => Some(Decompress::new(false)),
            other => {
                return Err(Error::unsupported(format!("zip compression method {other}")));
            }
        };
        Ok(ZipPayload {
            method: rec.method,
            comp_remaining: rec.comp_size,
            uncomp_remaining: rec.uncomp_size,
            out_offset: 0,
            crc: crc32fast::Hasher::new(),
            expected_crc: rec.crc,
            inflater,
            in_buf: vec![0u8; READ_CHUNK],
            in_pos: 0,
            in_len: 0,
            done: false,
        })
    }

    /// Read the whole (small) payload of a symlink entry as its target.
    fn read_link_target(&mut self, index: usize) -> Result<Vec<u8>> {
        const LINK_LIMIT: u64 = 64 * 1024;
        if self.records[index].uncomp_size > LINK_LIMIT {
            return Err(header_err("symlink target length"));
        }
        self.seek_to_payload(index)?;
        self.current = Some(Self::new_payload(&self.records[index])?);
        let mut target = Vec::new();
        while let Some(block) = self.next_block()? {
            target.extend_from_slice(&block.data);
        }
        self.current = None;
        Ok(target)
    }

    fn next_block(&mut self) -> Result<Option<DataBlock>> {
        let raw_pos = self.src.position();
        let payload = match &mut self.current {
            Some(p) => p,
            None => {
                return Err(Error::InvalidState {
                    state: "no entry open for reading",
                })
            }
        };
        if payload.done {
            return Ok(None);
        }

        match payload.method {
            METHOD_STORED => {
                if payload.comp_remaining == 0 {
                    payload.done = true;
                    let crc = payload.crc.clone().finalize();
                    if crc != payload.expected_crc {
                        return Err(Error::Filter {
                            offset: raw_pos,
                            source: io::Error::new(
                                io::ErrorKind::InvalidData,
                                "crc-32 mismatch",
                            ),
                        });
                    }
                    return Ok(None);
                }
                let want = payload.comp_remaining.min(READ_CHUNK as u64) as usize;
                let mut data = vec![0u8; want];
                {
                    let mut filled = 0;
                    while filled < want {
                        let n = self.src.read(&mut data[filled..])?;
                        if n == 0 {
                            return Err(Error::Truncated);
                        }
                        filled += n;
                    }
                }
                let payload = self.current.as_mut().unwrap();
                payload.crc.update(&data);
                let offset = payload.out_offset;
                payload.comp_remaining -= want as u64;
                payload.out_offset += want as u64;
                Ok(Some(DataBlock { offset, data }))
            }
            METHOD_DEFLATE => {
                let mut out = vec![0u8; READ_CHUNK];
                loop {
                    // Refill the compressed-input window when drained.
                    let need_fill = {
                        let p = self.current.as_ref().unwrap();
                        p.in_pos == p.in_len && p.comp_remaining > 0
                    };
                    if need_fill {
                        let want = {
                            let p = self.current.as_ref().unwrap();
                            p.comp_remaining.min(READ_CHUNK as u64) as usize
                        };
                        let mut chunk = vec![0u8; want];
                        let mut filled = 0;
                        while filled < want {
                            let n = self.src.read(&mut chunk[filled..])?;
                            if n == 0 {
                                return Err(Error::Truncated);
                            }
                            filled += n;
                        }
                        let p = self.current.as_mut().unwrap();
                        p.in_buf[..want].copy_from_slice(&chunk);
                        p.in_pos = 0;
                        p.in_len = want;
                        p.comp_remaining -= want as u64;
                    }

                    let raw_pos = self.src.position();
                    let p = self.current.as_mut().unwrap();
                    let inflater = p.inflater.as_mut().unwrap();
                    let before_in = inflater.total_in();
                    let before_out = inflater.total_out();
                    let input = &p.in_buf[p.in_pos..p.in_len];
                    let flush = if p.comp_remaining == 0 && input.is_empty() {
                        FlushDecompress::Finish
                    } else {
                        FlushDecompress::None
                    };
                    let status = inflater.decompress(input, &mut out, flush).map_err(|e| {
                        Error::Filter {
                            offset: raw_pos,
                            source: io::Error::new(io::ErrorKind::InvalidData, e),
                        }
                    })?;
                    let consumed = (inflater.total_in() - before_in) as usize;
                    let produced = (inflater.total_out() - before_out) as usize;
                    p.in_pos += consumed;

                    if produced > 0 {
                        p.crc.update(&out[..produced]);
                        let offset = p.out_offset;
                        p.out_offset += produced as u64;
                        p.uncomp_remaining = p.uncomp_remaining.saturating_sub(produced as u64);
                        out.truncate(produced);
                        return Ok(Some(DataBlock { offset, data: out }));
                    }

                    if status == Status::StreamEnd {
                        p.done = true;
                        if p.uncomp_remaining != 0 {
                            return Err(header_err("uncompressed size"));
                        }
                        let crc = p.crc.clone().finalize();
                        if crc != p.expected_crc {
                            return Err(Error::Filter {
                                offset: raw_pos,
                                source: io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "crc-32 mismatch",
                                ),
                            });
                        }
                        return Ok(None);
                    }

                    if p.in_pos == p.in_len && p.comp_remaining == 0 && consumed == 0 {
                        // Inflate wants more input but the declared
                        // compressed size is exhausted.
                        return Err(Error::Truncated);
                    }
                }
            }
            _ => unreachable!("unsupported methods are rejected at open"),
        }
    }
}

impl ContainerReader for ZipReader<'_> {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.current = None;
        let index = self.next_index;
        if index >= self.records.len() {
            return Ok(None);
        }
        self.next_index += 1;

        let mut entry = Self::entry_from_record(&self.records[index]);
        if entry.is_symlink() {
            let target = self.read_link_target(index)?;
            if target.is_empty() {
                return Err(header_err("symlink target"));
            }
            entry.set_link_target(target);
            entry.set_size(0);
            // Leave an exhausted payload so read_block reports end cleanly.
            let mut payload = Self::new_payload(&self.records[index])?;
            payload.done = true;
            self.current = Some(payload);
        } else if entry.is_regular() {
            self.seek_to_payload(index)?;
            self.current = Some(Self::new_payload(&self.records[index])?);
        } else {
            let mut payload = Self::new_payload(&self.records[index])?;
            payload.done = true;
            self.current = Some(payload);
        }
        Ok(Some(entry))
    }

    fn read_block(&mut self) -> Result<Option<DataBlock>> {
        self.next_block()
    }

    fn variant(&self) -> Format {
        Format::Zip
    }
}

// ----------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------

struct CdPending {
    name: Vec<u8>,
    method: u16,
    flags: u16,
    dos_time: u16,
    dos_date: u16,
    crc: u32,
    comp_size: u64,
    uncomp_size: u64,
    local_offset: u64,
    external_attrs: u32,
    extra_central: Vec<u8>,
}

struct WriteState {
    cd_index: usize,
    local_offset: u64,
    streaming: bool,
    crc: crc32fast::Hasher,
    uncomp: u64,
    comp: u64,
    deflater: Option<Compress>,
}

pub(crate) struct ZipWriter<'a> {
    out: Box<dyn Encoder + 'a>,
    seekable: bool,
    pos: u64,
    cd: Vec<CdPending>,
    current: Option<WriteState>,
    finished: bool,
}

impl<'a> ZipWriter<'a> {
    pub(crate) fn new(out: Box<dyn Encoder + 'a>) -> ZipWriter<'a> {
        let seekable = out.is_seekable();
        ZipWriter {
            out,
            seekable,
            pos: 0,
            cd: Vec::new(),
            current: None,
            finished: false,
        }
    }

    fn put(&mut self, buf: &[u8]) -> Result<()> {
        self.out.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn external_attrs(entry: &Entry) -> u32 {
        let type_bits = entry.entry_type().to_mode();
        let mode = entry.mode() | type_bits;
        let mut attrs = mode << 16;
        if entry.is_directory() {
            attrs |= DOS_DIR;
        }
        attrs
    }

    /// Flush the current entry's deflate stream to completion.
    fn drain_deflater(&mut self) -> Result<()> {
        let mut out_buf = vec![0u8; DEFLATE_OUT];
        loop {
            let state = self.current.as_mut().unwrap();
            let deflater = match &mut state.deflater {
                Some(d) => d,
                None => return Ok(()),
            };
            let before_out = deflater.total_out();
            let status = deflater
                .compress(&[], &mut out_buf, FlushCompress::Finish)
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            let produced = (deflater.total_out() - before_out) as usize;
            if produced > 0 {
                let state = self.current.as_mut().unwrap();
                state.comp += produced as u64;
                self.put(&out_buf[..produced])?;
            }
            if status == Status::StreamEnd {
                return Ok(());
            }
        }
    }
}

impl ContainerWriter for ZipWriter<'_> {
    fn add_entry(&mut self, entry: &Entry) -> Result<()> {
        match entry.entry_type() {
            EntryType::Regular | EntryType::Directory | EntryType::Symlink => {}
            other => {
                return Err(Error::unsupported(format!("{other:?} entries in zip")));
            }
        }

        let mut name = entry.path().to_vec();
        if entry.is_directory() {
            name.push(b'/');
        }
        if name.len() > u16::MAX as usize {
            return Err(Error::unsupported("zip member name beyond 64 KiB"));
        }

        let method = if entry.is_regular() && entry.size() != Some(0) {
            METHOD_DEFLATE
        } else {
            METHOD_STORED
        };
        let streaming = !self.seekable;
        let mut flags = 0u16;
        if streaming {
            flags |= FLAG_DESCRIPTOR;
        }
        if std::str::from_utf8(&name).is_ok() {
            flags |= FLAG_UTF8;
        }

        let mtime = entry.mtime().unwrap_or_default();
        let (dos_time, dos_date) = unix_to_dos(mtime.secs);
        let extra_local = encode_extra_local(entry);
        let local_offset = self.pos;

        let mut header = Vec::with_capacity(LOCAL_LEN + name.len() + extra_local.len());
        put_u32(&mut header, LOCAL_SIG);
        put_u16(&mut header, VERSION_NEEDED);
        put_u16(&mut header, flags);
        put_u16(&mut header, method);
        put_u16(&mut header, dos_time);
        put_u16(&mut header, dos_date);
        put_u32(&mut header, 0); // crc, backfilled or in descriptor
        put_u32(&mut header, 0); // compressed size
        put_u32(&mut header, 0); // uncompressed size
        put_u16(&mut header, name.len() as u16);
        put_u16(&mut header, extra_local.len() as u16);
        header.extend_from_slice(&name);
        header.extend_from_slice(&extra_local);
        self.put(&header)?;

        self.cd.push(CdPending {
            name,
            method,
            flags,
            dos_time,
            dos_date,
            crc: 0,
            comp_size: 0,
            uncomp_size: 0,
            local_offset,
            external_attrs: Self::external_attrs(entry),
            extra_central: encode_extra_central(entry),
        });

        self.current = Some(WriteState {
            cd_index: self.cd.len() - 1,
            local_offset,
            streaming,
            crc: crc32fast::Hasher::new(),
            uncomp: 0,
            comp: 0,
            deflater: (method == METHOD_DEFLATE).then(|| Compress::new(Compression::default(), false)),
        });

        // Symlink targets travel as the member payload.
        if let Some(target) = entry.link_target().filter(|_| entry.is_symlink()) {
            let target = target.to_vec();
            self.write_data(&target)?;
        }
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> Result<()> {
        let state = self.current.as_mut().ok_or(Error::InvalidState {
            state: "no entry open for writing",
        })?;
        state.crc.update(buf);
        state.uncomp += buf.len() as u64;

        if state.deflater.is_none() {
            state.comp += buf.len() as u64;
            self.put(buf)?;
            return Ok(());
        }

        let mut out_buf = vec![0u8; DEFLATE_OUT];
        let mut in_pos = 0;
        while in_pos < buf.len() {
            let state = self.current.as_mut().unwrap();
            let deflater = state.deflater.as_mut().unwrap();
            let before_in = deflater.total_in();
            let before_out = deflater.total_out();
            deflater
                .compress(&buf[in_pos..], &mut out_buf, FlushCompress::None)
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            let consumed = (deflater.total_in() - before_in) as usize;
            let produced = (deflater.total_out() - before_out) as usize;
            in_pos += consumed;
            if produced > 0 {
                let state = self.current.as_mut().unwrap();
                state.comp += produced as u64;
                self.put(&out_buf[..produced])?;
            }
        }
        Ok(())
    }

    fn finish_entry(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }
        self.drain_deflater()?;

        let state = self.current.take().unwrap();
        let crc = state.crc.finalize();
        if state.comp > u64::from(u32::MAX) || state.uncomp > u64::from(u32::MAX) {
            return Err(Error::unsupported("zip64 payload sizes"));
        }

        let cd = &mut self.cd[state.cd_index];
        cd.crc = crc;
        cd.comp_size = state.comp;
        cd.uncomp_size = state.uncomp;

        if state.streaming {
            let mut descriptor = Vec::with_capacity(16);
            put_u32(&mut descriptor, DESCRIPTOR_SIG);
            put_u32(&mut descriptor, crc);
            put_u32(&mut descriptor, state.comp as u32);
            put_u32(&mut descriptor, state.uncomp as u32);
            self.put(&descriptor)?;
        } else {
            // Backfill crc and sizes into the local header.
            let mut patch = Vec::with_capacity(12);
            put_u32(&mut patch, crc);
            put_u32(&mut patch, state.comp as u32);
            put_u32(&mut patch, state.uncomp as u32);
            self.out.seek(SeekFrom::Start(state.local_offset + 14))?;
            self.out.write_all(&patch)?;
            self.out.seek(SeekFrom::Start(self.pos))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let cd_offset = self.pos;
        if self.cd.len() > usize::from(u16::MAX - 1) {
            return Err(Error::unsupported("zip64 entry counts"));
        }
        let entries = std::mem::take(&mut self.cd);
        for rec in &entries {
            let mut header =
                Vec::with_capacity(CENTRAL_LEN + rec.name.len() + rec.extra_central.len());
            put_u32(&mut header, CENTRAL_SIG);
            put_u16(&mut header, MADE_BY_UNIX);
            put_u16(&mut header, VERSION_NEEDED);
            put_u16(&mut header, rec.flags);
            put_u16(&mut header, rec.method);
            put_u16(&mut header, rec.dos_time);
            put_u16(&mut header, rec.dos_date);
            put_u32(&mut header, rec.crc);
            put_u32(&mut header, rec.comp_size as u32);
            put_u32(&mut header, rec.uncomp_size as u32);
            put_u16(&mut header, rec.name.len() as u16);
            put_u16(&mut header, rec.extra_central.len() as u16);
            put_u16(&mut header, 0); // comment
            put_u16(&mut header, 0); // disk number
            put_u16(&mut header, 0); // internal attrs
            put_u32(&mut header, rec.external_attrs);
            put_u32(&mut header, rec.local_offset as u32);
            header.extend_from_slice(&rec.name);
            header.extend_from_slice(&rec.extra_central);
            self.put(&header)?;
        }
        let cd_size = self.pos - cd_offset;
        if cd_size > u64::from(u32::MAX) || cd_offset > u64::from(u32::MAX) {
            return Err(Error::unsupported("zip64 central directory"));
        }

        let mut eocd = Vec::with_capacity(EOCD_LEN as usize);
        put_u32(&mut eocd, EOCD_SIG);
        put_u16(&mut eocd, 0); // this disk
        put_u16(&mut eocd, 0); // cd disk
        put_u16(&mut eocd, entries.len() as u16);
        put_u16(&mut eocd, entries.len() as u16);
        put_u32(&mut eocd, cd_size as u32);
        put_u32(&mut eocd, cd_offset as u32);
        put_u16(&mut eocd, 0); // comment length
        self.put(&eocd)?;

        self.out.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_time_round_trip() {
        // 2024-05-06 12:34:56 UTC
        let secs = 1_714_998_896;
        let (time, date) = unix_to_dos(secs);
        let back = dos_to_unix(time, date);
        // DOS time has 2-second resolution.
        assert!((secs - back).abs() <= 2, "{secs} vs {back}");
    }

    #[test]
    fn dos_time_clamps_before_epoch() {
        let (time, date) = unix_to_dos(0);
        assert_eq!(date >> 9, 0); // clamped to 1980
        let _ = time;
    }

    #[test]
    fn extra_timestamp_round_trip() {
        let mut entry = Entry::new("f", EntryType::Regular);
        entry.set_mtime(Some(Timespec::new(1_700_000_000, 0)));
        entry.set_atime(Some(Timespec::new(1_700_000_100, 0)));
        entry.set_uid(1000);
        entry.set_gid(100);

        let fields = parse_extra(&encode_extra_local(&entry));
        assert_eq!(fields.mtime, Some(Timespec::new(1_700_000_000, 0)));
        assert_eq!(fields.atime, Some(Timespec::new(1_700_000_100, 0)));
        assert_eq!(fields.uid, Some(1000));
        assert_eq!(fields.gid, Some(100));
    }

    #[test]
    fn extra_parser_skips_unknown_ids() {
        let mut extra = Vec::new();
        put_u16(&mut extra, 0xcafe);
        put_u16(&mut extra, 4);
        extra.extend_from_slice(&[1, 2, 3, 4]);
        let fields = parse_extra(&extra);
        assert!(fields.mtime.is_none());
        assert!(fields.uid.is_none());
    }

    #[test]
    fn external_attrs_carry_unix_mode() {
        let mut entry = Entry::new("x", EntryType::Regular);
        entry.set_mode(0o640);
        let attrs = ZipWriter::external_attrs(&entry);
        assert_eq!(attrs >> 16, 0o100_640);

        let dir = Entry::new("d", EntryType::Directory);
        let attrs = ZipWriter::external_attrs(&dir);
        assert_eq!(attrs & DOS_DIR, DOS_DIR);
        assert_eq!(EntryType::from_mode(attrs >> 16), Some(EntryType::Directory));
    }
}
