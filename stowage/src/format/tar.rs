//! Block-aligned sequential tar codec: POSIX ustar plus pax extended
//! headers, with read-side support for GNU long-name records and base-256
//! numeric fields.

use std::io::Read;

use crate::entry::{Entry, EntryType, Timespec};
use crate::error::{Error, Result};
use crate::filter::Encoder;
use crate::read::DataBlock;

use super::{ContainerReader, ContainerWriter, Format};

pub(crate) const BLOCK_LEN: usize = 512;
const READ_CHUNK: usize = 64 * 1024;

/// Sanity cap for pax extended-header payloads.
const PAX_PAYLOAD_LIMIT: u64 = 8 * 1024 * 1024;

const REGTYPE: u8 = b'0';
const AREGTYPE: u8 = 0;
const LNKTYPE: u8 = b'1';
const SYMTYPE: u8 = b'2';
const CHRTYPE: u8 = b'3';
const BLKTYPE: u8 = b'4';
const DIRTYPE: u8 = b'5';
const FIFOTYPE: u8 = b'6';
const CONTTYPE: u8 = b'7';
const XHDTYPE: u8 = b'x';
const XGLTYPE: u8 = b'g';
const GNU_LONGNAME: u8 = b'L';
const GNU_LONGLINK: u8 = b'K';

// Field ranges within a header block.
const NAME: std::ops::Range<usize> = 0..100;
const MODE: std::ops::Range<usize> = 100..108;
const UID: std::ops::Range<usize> = 108..116;
const GID: std::ops::Range<usize> = 116..124;
const SIZE: std::ops::Range<usize> = 124..136;
const MTIME: std::ops::Range<usize> = 136..148;
const CHKSUM: std::ops::Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const LINKNAME: std::ops::Range<usize> = 157..257;
const MAGIC: std::ops::Range<usize> = 257..263;
const VERSION: std::ops::Range<usize> = 263..265;
const UNAME: std::ops::Range<usize> = 265..297;
const GNAME: std::ops::Range<usize> = 297..329;
const DEVMAJOR: std::ops::Range<usize> = 329..337;
const DEVMINOR: std::ops::Range<usize> = 337..345;
const PREFIX: std::ops::Range<usize> = 345..500;

const OCTAL_SIZE_MAX: u64 = 0o77_777_777_777;
const OCTAL_ID_MAX: u64 = 0o7_777_777;

// ----------------------------------------------------------------------
// Numeric fields
// ----------------------------------------------------------------------

fn header_err(field: &'static str) -> Error {
    Error::Header { field }
}

/// Parse a numeric header field: octal-in-ASCII, or GNU base-256 when the
/// top bit of the first byte is set.
pub(crate) fn parse_numeric(field: &[u8], name: &'static str) -> Result<u64> {
    if field.is_empty() {
        return Ok(0);
    }
    if field[0] & 0x80 != 0 {
        let mut value = u64::from(field[0] & 0x7f);
        for &b in &field[1..] {
            value = value
                .checked_mul(256)
                .map(|v| v | u64::from(b))
                .ok_or_else(|| header_err(name))?;
        }
        return Ok(value);
    }

    let mut value: u64 = 0;
    let mut seen = false;
    for &b in field {
        match b {
            b' ' if !seen => continue,
            b'0'..=b'7' => {
                seen = true;
                value = value
                    .checked_mul(8)
                    .map(|v| v + u64::from(b - b'0'))
                    .ok_or_else(|| header_err(name))?;
            }
            b' ' | 0 => break,
            _ => return Err(header_err(name)),
        }
    }
    Ok(value)
}

/// Render `value` as zero-padded octal with a trailing NUL. Returns false
/// when the value does not fit the field.
fn format_octal(field: &mut [u8], value: u64) -> bool {
    let digits = field.len() - 1;
    let mut shifted = value;
    let mut width = 0;
    while shifted > 0 {
        shifted >>= 3;
        width += 1;
    }
    if width > digits {
        return false;
    }
    field[digits] = 0;
    let mut v = value;
    for slot in field[..digits].iter_mut().rev() {
        *slot = b'0' + (v & 7) as u8;
        v >>= 3;
    }
    true
}

fn unsigned_sum(block: &[u8]) -> u64 {
    let mut sum: u64 = 0;
    for (i, &b) in block.iter().enumerate() {
        sum += if CHKSUM.contains(&i) {
            u64::from(b' ')
        } else {
            u64::from(b)
        };
    }
    sum
}

fn signed_sum(block: &[u8]) -> i64 {
    let mut sum: i64 = 0;
    for (i, &b) in block.iter().enumerate() {
        sum += if CHKSUM.contains(&i) {
            i64::from(b' ')
        } else {
            i64::from(b as i8)
        };
    }
    sum
}

/// Validate a header checksum, accepting both the standard unsigned sum and
/// the signed sum some historic implementations wrote.
pub(crate) fn checksum_matches(block: &[u8]) -> bool {
    let stored = match parse_numeric(&block[CHKSUM], "chksum") {
        Ok(v) => v,
        Err(_) => return false,
    };
    stored == unsigned_sum(block) || stored as i64 == signed_sum(block)
}

fn trim_field(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    &field[..end]
}

// ----------------------------------------------------------------------
// Pax records
// ----------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct PaxOverrides {
    path: Option<Vec<u8>>,
    linkpath: Option<Vec<u8>>,
    size: Option<u64>,
    uid: Option<u64>,
    gid: Option<u64>,
    uname: Option<String>,
    gname: Option<String>,
    atime: Option<Timespec>,
    mtime: Option<Timespec>,
    ctime: Option<Timespec>,
    birthtime: Option<Timespec>,
    xattrs: Vec<(String, Vec<u8>)>,
}

/// Parse a decimal `seconds[.fraction]` pax time value.
fn parse_pax_time(value: &[u8]) -> Result<Timespec> {
    let text = std::str::from_utf8(value).map_err(|_| header_err("pax time"))?;
    let (sec_part, frac_part) = match text.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (text, None),
    };
    let secs: i64 = sec_part.parse().map_err(|_| header_err("pax time"))?;
    let nanos = match frac_part {
        None => 0,
        Some(frac) => {
            let mut digits: String = frac.chars().take(9).collect();
            if !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(header_err("pax time"));
            }
            while digits.len() < 9 {
                digits.push('0');
            }
            digits.parse::<u32>().map_err(|_| header_err("pax time"))?
        }
    };
    Ok(Timespec::new(secs, nanos))
}

fn parse_pax_records(data: &[u8], over: &mut PaxOverrides) -> Result<()> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| header_err("pax record"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| header_err("pax record"))?;
        if len <= space + 1 || len > rest.len() {
            return Err(header_err("pax record"));
        }
        let record = &rest[space + 1..len];
        rest = &rest[len..];

        let record = record
            .strip_suffix(b"\n")
            .ok_or_else(|| header_err("pax record"))?;
        let eq = record
            .iter()
            .position(|b| *b == b'=')
            .ok_or_else(|| header_err("pax record"))?;
        let key =
            std::str::from_utf8(&record[..eq]).map_err(|_| header_err("pax record"))?;
        let value = &record[eq + 1..];
        if value.is_empty() {
            // An empty value deletes the override; nothing was set yet, so
            // there is nothing to do.
            continue;
        }

        let as_u64 = |name| {
            std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| header_err(name))
        };
        let as_string = || String::from_utf8_lossy(value).into_owned();

        match key {
            "path" => over.path = Some(value.to_vec()),
            "linkpath" => over.linkpath = Some(value.to_vec()),
            "size" => over.size = Some(as_u64("pax size")?),
            "uid" => over.uid = Some(as_u64("pax uid")?),
            "gid" => over.gid = Some(as_u64("pax gid")?),
            "uname" => over.uname = Some(as_string()),
            "gname" => over.gname = Some(as_string()),
            "atime" => over.atime = Some(parse_pax_time(value)?),
            "mtime" => over.mtime = Some(parse_pax_time(value)?),
            "ctime" => over.ctime = Some(parse_pax_time(value)?),
            "LIBARCHIVE.creationtime" => over.birthtime = Some(parse_pax_time(value)?),
            _ => {
                if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
                    over.xattrs.push((name.to_string(), value.to_vec()));
                }
                // Unknown keywords are ignored.
            }
        }
    }
    Ok(())
}

/// Serialize one `LEN key=value\n` record; the length counts itself.
fn encode_pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let payload_len = key.len() + value.len() + 3; // space, '=', '\n'
    let mut total = payload_len + 1;
    while total.to_string().len() + payload_len != total {
        total = total.to_string().len() + payload_len;
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(total.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
    out.push(b'\n');
    debug_assert_eq!(out.len(), total);
    out
}

// ----------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------

struct Payload {
    remaining: u64,
    padding: u64,
    offset: u64,
}

pub(crate) struct TarReader<'a> {
    input: Box<dyn Read + 'a>,
    payload: Option<Payload>,
    globals: PaxOverrides,
    saw_pax: bool,
    done: bool,
}

impl<'a> TarReader<'a> {
    pub(crate) fn new(input: Box<dyn Read + 'a>) -> TarReader<'a> {
        TarReader {
            input,
            payload: None,
            globals: PaxOverrides::default(),
            saw_pax: false,
            done: false,
        }
    }

    /// Read until `buf` is full or the stream ends; returns bytes read.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.input.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn drain_payload(&mut self) -> Result<()> {
        if let Some(payload) = self.payload.take() {
            let mut scratch = [0u8; 8 * 1024];
            let mut left = payload.remaining + payload.padding;
            while left > 0 {
                let want = left.min(scratch.len() as u64) as usize;
                let n = self.input.read(&mut scratch[..want])?;
                if n == 0 {
                    return Err(Error::Truncated);
                }
                left -= n as u64;
            }
        }
        Ok(())
    }

    /// Read a small auxiliary payload (pax records, GNU long names),
    /// including its block padding.
    fn read_aux_payload(&mut self, size: u64, field: &'static str) -> Result<Vec<u8>> {
        if size > PAX_PAYLOAD_LIMIT {
            return Err(header_err(field));
        }
        let padded = size.div_ceil(BLOCK_LEN as u64) * BLOCK_LEN as u64;
        let mut data = vec![0u8; padded as usize];
        if self.read_full(&mut data)? != data.len() {
            return Err(Error::Truncated);
        }
        data.truncate(size as usize);
        Ok(data)
    }

    fn build_entry(
        &mut self,
        block: &[u8],
        pending: PaxOverrides,
        longname: Option<Vec<u8>>,
        longlink: Option<Vec<u8>>,
    ) -> Result<(Entry, u64)> {
        let typeflag = block[TYPEFLAG];
        let ustar = &block[MAGIC][..5] == b"ustar";

        let mut name = trim_field(&block[NAME]).to_vec();
        if ustar {
            let prefix = trim_field(&block[PREFIX]);
            if !prefix.is_empty() {
                let mut full = prefix.to_vec();
                full.push(b'/');
                full.extend_from_slice(&name);
                name = full;
            }
        }
        let trailing_slash = name.last() == Some(&b'/');

        let entry_type = match typeflag {
            REGTYPE | AREGTYPE | CONTTYPE => {
                if trailing_slash {
                    EntryType::Directory
                } else {
                    EntryType::Regular
                }
            }
            LNKTYPE => EntryType::Hardlink,
            SYMTYPE => EntryType::Symlink,
            CHRTYPE => EntryType::CharDevice,
            BLKTYPE => EntryType::BlockDevice,
            DIRTYPE => EntryType::Directory,
            FIFOTYPE => EntryType::Fifo,
            // Unknown flags are treated as regular files per POSIX, so
            // their payloads stay in sync.
            _ => EntryType::Regular,
        };

        let size = parse_numeric(&block[SIZE], "size")?;
        let mode = parse_numeric(&block[MODE], "mode")? as u32;
        let uid = parse_numeric(&block[UID], "uid")?;
        let gid = parse_numeric(&block[GID], "gid")?;
        let mtime = parse_numeric(&block[MTIME], "mtime")? as i64;

        let mut entry = Entry::new(name, entry_type);
        entry.set_mode(mode);
        entry.set_uid(uid);
        entry.set_gid(gid);
        entry.set_mtime(Some(Timespec::new(mtime, 0)));

        if ustar {
            let uname = trim_field(&block[UNAME]);
            if !uname.is_empty() {
                entry.set_uname(String::from_utf8_lossy(uname).into_owned());
            }
            let gname = trim_field(&block[GNAME]);
            if !gname.is_empty() {
                entry.set_gname(String::from_utf8_lossy(gname).into_owned());
            }
            if matches!(entry_type, EntryType::CharDevice | EntryType::BlockDevice) {
                entry.set_device(
                    parse_numeric(&block[DEVMAJOR], "devmajor")? as u32,
                    parse_numeric(&block[DEVMINOR], "devminor")? as u32,
                );
            }
        }

        if entry_type.is_link() {
            let linkname = trim_field(&block[LINKNAME]);
            if !linkname.is_empty() {
                entry.set_link_target(linkname.to_vec());
            }
        }

        // GNU long records beat the header, pax records beat both; globals
        // sit underneath per-entry records.
        if let Some(longname) = longname {
            entry.set_path(longname);
        }
        if let Some(longlink) = longlink {
            entry.set_link_target(longlink);
        }

        let mut size = size;
        for over in [&self.globals, &pending] {
            if let Some(path) = &over.path {
                entry.set_path(path.clone());
            }
            if let Some(target) = &over.linkpath {
                entry.set_link_target(target.clone());
            }
            if let Some(v) = over.size {
                size = v;
            }
            if let Some(v) = over.uid {
                entry.set_uid(v);
            }
            if let Some(v) = over.gid {
                entry.set_gid(v);
            }
            if let Some(v) = &over.uname {
                entry.set_uname(v.clone());
            }
            if let Some(v) = &over.gname {
                entry.set_gname(v.clone());
            }
            if let Some(v) = over.atime {
                entry.set_atime(Some(v));
            }
            if let Some(v) = over.mtime {
                entry.set_mtime(Some(v));
            }
            if let Some(v) = over.ctime {
                entry.set_ctime(Some(v));
            }
            if let Some(v) = over.birthtime {
                entry.set_birthtime(Some(v));
            }
            for (name, value) in &over.xattrs {
                entry.set_xattr(name.clone(), value.clone());
            }
        }

        if entry_type.is_link() && entry.link_target().is_none() {
            return Err(header_err("linkname"));
        }

        // Only regular members carry payload bytes on the wire.
        let payload_len = if entry.is_regular() { size } else { 0 };
        if entry.is_regular() {
            entry.set_size(size);
        } else {
            entry.set_size(0);
        }

        Ok((entry, payload_len))
    }
}

impl ContainerReader for TarReader<'_> {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        self.drain_payload()?;

        let mut pending = PaxOverrides::default();
        let mut longname: Option<Vec<u8>> = None;
        let mut longlink: Option<Vec<u8>> = None;
        let mut block = [0u8; BLOCK_LEN];

        loop {
            let n = self.read_full(&mut block)?;
            if n == 0 {
                // EOF without an end marker. Tolerated only at the very
                // start of an entry with no auxiliary records pending.
                return Err(Error::Truncated);
            }
            if n < BLOCK_LEN {
                return Err(Error::Truncated);
            }

            if block.iter().all(|b| *b == 0) {
                // First zero block: end of archive once a second zero block
                // or EOF follows.
                let n = self.read_full(&mut block)?;
                if n == 0 || (n == BLOCK_LEN && block.iter().all(|b| *b == 0)) {
                    self.done = true;
                    return Ok(None);
                }
                if n < BLOCK_LEN {
                    return Err(Error::Truncated);
                }
                // A lone zero block inside the stream; fall through and
                // parse what follows as a header.
            }

            if !checksum_matches(&block) {
                return Err(header_err("chksum"));
            }

            match block[TYPEFLAG] {
                XHDTYPE => {
                    self.saw_pax = true;
                    let size = parse_numeric(&block[SIZE], "size")?;
                    let data = self.read_aux_payload(size, "pax header")?;
                    parse_pax_records(&data, &mut pending)?;
                }
                XGLTYPE => {
                    self.saw_pax = true;
                    let size = parse_numeric(&block[SIZE], "size")?;
                    let data = self.read_aux_payload(size, "pax global header")?;
                    parse_pax_records(&data, &mut self.globals)?;
                }
                GNU_LONGNAME => {
                    let size = parse_numeric(&block[SIZE], "size")?;
                    let mut data = self.read_aux_payload(size, "long name")?;
                    while data.last() == Some(&0) {
                        data.pop();
                    }
                    longname = Some(data);
                }
                GNU_LONGLINK => {
                    let size = parse_numeric(&block[SIZE], "size")?;
                    let mut data = self.read_aux_payload(size, "long link")?;
                    while data.last() == Some(&0) {
                        data.pop();
                    }
                    longlink = Some(data);
                }
                _ => {
                    let (entry, payload_len) =
                        self.build_entry(&block, pending, longname, longlink)?;
                    let padding =
                        payload_len.div_ceil(BLOCK_LEN as u64) * BLOCK_LEN as u64 - payload_len;
                    self.payload = Some(Payload {
                        remaining: payload_len,
                        padding,
                        offset: 0,
                    });
                    return Ok(Some(entry));
                }
            }
        }
    }

    fn read_block(&mut self) -> Result<Option<DataBlock>> {
        let payload = match &mut self.payload {
            Some(p) => p,
            None => {
                return Err(Error::InvalidState {
                    state: "no entry open for reading",
                })
            }
        };
        if payload.remaining == 0 {
            // Drain the block padding before reporting end of payload.
            self.drain_payload()?;
            return Ok(None);
        }

        let want = payload.remaining.min(READ_CHUNK as u64) as usize;
        let mut data = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.input.read(&mut data[filled..])?;
            if n == 0 {
                return Err(Error::Truncated);
            }
            filled += n;
        }
        let offset = payload.offset;
        payload.remaining -= want as u64;
        payload.offset += want as u64;
        Ok(Some(DataBlock { offset, data }))
    }

    fn variant(&self) -> Format {
        if self.saw_pax {
            Format::Pax
        } else {
            Format::Ustar
        }
    }
}

// ----------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------

pub(crate) struct TarWriter<'a> {
    out: Box<dyn Encoder + 'a>,
    variant: Format,
    written: u64,
    pax_seq: u64,
    finished: bool,
}

impl<'a> TarWriter<'a> {
    pub(crate) fn new(out: Box<dyn Encoder + 'a>, variant: Format) -> TarWriter<'a> {
        debug_assert!(variant.is_tar());
        TarWriter {
            out,
            variant,
            written: 0,
            pax_seq: 0,
            finished: false,
        }
    }

    fn typeflag(entry: &Entry) -> Result<u8> {
        Ok(match entry.entry_type() {
            EntryType::Regular => REGTYPE,
            EntryType::Hardlink => LNKTYPE,
            EntryType::Symlink => SYMTYPE,
            EntryType::CharDevice => CHRTYPE,
            EntryType::BlockDevice => BLKTYPE,
            EntryType::Directory => DIRTYPE,
            EntryType::Fifo => FIFOTYPE,
            EntryType::Socket => {
                return Err(Error::unsupported("socket entries in tar"));
            }
        })
    }

    /// Split a full member name into (prefix, name) per the ustar rules.
    fn split_name(name: &[u8]) -> Option<(&[u8], &[u8])> {
        if name.len() <= NAME.len() {
            return Some((b"", name));
        }
        if name.len() > NAME.len() + PREFIX.len() + 1 {
            return None;
        }
        // Find a separator leaving a name part of at most 100 bytes and a
        // prefix of at most 155.
        for (i, b) in name.iter().enumerate().rev() {
            if *b == b'/'
                && name.len() - i - 1 > 0
                && name.len() - i - 1 <= NAME.len()
                && i <= PREFIX.len()
            {
                return Some((&name[..i], &name[i + 1..]));
            }
        }
        None
    }

    fn collect_pax_records(entry: &Entry, wire_name: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut records: Vec<(String, Vec<u8>)> = Vec::new();
        if Self::split_name(wire_name).is_none() {
            records.push(("path".into(), wire_name.to_vec()));
        }
        if let Some(target) = entry.link_target() {
            if target.len() > LINKNAME.len() {
                records.push(("linkpath".into(), target.to_vec()));
            }
        }
        if entry.size().unwrap_or(0) > OCTAL_SIZE_MAX {
            records.push((
                "size".into(),
                entry.size().unwrap_or(0).to_string().into_bytes(),
            ));
        }
        if entry.uid() > OCTAL_ID_MAX {
            records.push(("uid".into(), entry.uid().to_string().into_bytes()));
        }
        if entry.gid() > OCTAL_ID_MAX {
            records.push(("gid".into(), entry.gid().to_string().into_bytes()));
        }
        if let Some(uname) = entry.uname() {
            if uname.len() >= UNAME.len() {
                records.push(("uname".into(), uname.as_bytes().to_vec()));
            }
        }
        if let Some(gname) = entry.gname() {
            if gname.len() >= GNAME.len() {
                records.push(("gname".into(), gname.as_bytes().to_vec()));
            }
        }
        if let Some(mtime) = entry.mtime() {
            if mtime.nanos != 0 || mtime.secs < 0 {
                records.push(("mtime".into(), mtime.to_string().into_bytes()));
            }
        }
        if let Some(atime) = entry.atime() {
            records.push(("atime".into(), atime.to_string().into_bytes()));
        }
        if let Some(ctime) = entry.ctime() {
            records.push(("ctime".into(), ctime.to_string().into_bytes()));
        }
        if let Some(birthtime) = entry.birthtime() {
            records.push((
                "LIBARCHIVE.creationtime".into(),
                birthtime.to_string().into_bytes(),
            ));
        }
        for (name, value) in entry.xattrs() {
            records.push((format!("SCHILY.xattr.{name}"), value.clone()));
        }
        records
    }

    fn fill_header(
        block: &mut [u8; BLOCK_LEN],
        name: &[u8],
        mode: u32,
        uid: u64,
        gid: u64,
        size: u64,
        mtime: i64,
        typeflag: u8,
        linkname: &[u8],
        uname: Option<&str>,
        gname: Option<&str>,
        dev: Option<(u32, u32)>,
    ) -> Result<()> {
        block[NAME][..name.len()].copy_from_slice(name);
        if !format_octal(&mut block[MODE], u64::from(mode)) {
            return Err(Error::unsupported("mode bits beyond octal field"));
        }
        if !format_octal(&mut block[UID], uid.min(OCTAL_ID_MAX)) {
            return Err(Error::unsupported("uid beyond octal field"));
        }
        if !format_octal(&mut block[GID], gid.min(OCTAL_ID_MAX)) {
            return Err(Error::unsupported("gid beyond octal field"));
        }
        format_octal(&mut block[SIZE], size.min(OCTAL_SIZE_MAX));
        format_octal(&mut block[MTIME], mtime.max(0) as u64 & OCTAL_SIZE_MAX);
        block[TYPEFLAG] = typeflag;
        block[LINKNAME][..linkname.len()].copy_from_slice(linkname);
        block[MAGIC].copy_from_slice(b"ustar\0");
        block[VERSION].copy_from_slice(b"00");
        if let Some(uname) = uname {
            let n = uname.len().min(UNAME.len() - 1);
            block[UNAME][..n].copy_from_slice(&uname.as_bytes()[..n]);
        }
        if let Some(gname) = gname {
            let n = gname.len().min(GNAME.len() - 1);
            block[GNAME][..n].copy_from_slice(&gname.as_bytes()[..n]);
        }
        if let Some((major, minor)) = dev {
            format_octal(&mut block[DEVMAJOR], u64::from(major));
            format_octal(&mut block[DEVMINOR], u64::from(minor));
        }

        let mut chksum = [0u8; 8];
        // Six octal digits, NUL, space: the historic layout.
        let sum = {
            block[CHKSUM].copy_from_slice(b"        ");
            unsigned_sum(block)
        };
        format_octal(&mut chksum[..7], sum);
        chksum[7] = b' ';
        block[CHKSUM].copy_from_slice(&chksum);
        Ok(())
    }

    fn write_pax_header(&mut self, path: &[u8], records: &[(String, Vec<u8>)]) -> Result<()> {
        let mut payload = Vec::new();
        for (key, value) in records {
            payload.extend_from_slice(&encode_pax_record(key, value));
        }

        // "PaxHeaders.N/<path>", truncated to the name field.
        let mut name = format!("PaxHeaders.{}/", self.pax_seq).into_bytes();
        self.pax_seq += 1;
        name.extend_from_slice(path);
        name.truncate(NAME.len());

        let mut block = [0u8; BLOCK_LEN];
        Self::fill_header(
            &mut block,
            &name,
            0o644,
            0,
            0,
            payload.len() as u64,
            0,
            XHDTYPE,
            b"",
            None,
            None,
            None,
        )?;
        self.out.write_all(&block)?;

        let padded = payload.len().div_ceil(BLOCK_LEN) * BLOCK_LEN;
        payload.resize(padded, 0);
        self.out.write_all(&payload)?;
        Ok(())
    }
}

impl ContainerWriter for TarWriter<'_> {
    fn add_entry(&mut self, entry: &Entry) -> Result<()> {
        let typeflag = Self::typeflag(entry)?;
        let size = match entry.entry_type() {
            EntryType::Regular => entry
                .size()
                .ok_or_else(|| Error::unsupported("unknown-size payload in tar"))?,
            _ => 0,
        };

        // Directories carry a trailing slash on the wire.
        let mut wire_name = entry.path().to_vec();
        if entry.is_directory() {
            wire_name.push(b'/');
        }

        let records = match self.variant {
            Format::Pax => Self::collect_pax_records(entry, &wire_name),
            _ => Vec::new(),
        };

        if self.variant == Format::Ustar {
            // Strict ustar: anything that would need a pax record is
            // either dropped (sub-second times, xattrs) or refused.
            if Self::split_name(&wire_name).is_none() {
                return Err(Error::unsupported("path too long for ustar"));
            }
            if entry.link_target().map_or(0, <[u8]>::len) > LINKNAME.len() {
                return Err(Error::unsupported("link target too long for ustar"));
            }
            if size > OCTAL_SIZE_MAX {
                return Err(Error::unsupported("payload beyond 8 GiB in ustar"));
            }
            if entry.uid() > OCTAL_ID_MAX || entry.gid() > OCTAL_ID_MAX {
                return Err(Error::unsupported("uid/gid beyond octal field in ustar"));
            }
        } else if !records.is_empty() {
            self.write_pax_header(entry.path(), &records)?;
        }

        let (prefix, name) = Self::split_name(&wire_name).unwrap_or_else(|| {
            // A pax path record carries the real name; the header field is
            // best-effort.
            (b"".as_slice(), &wire_name[..NAME.len()])
        });

        // A long target is carried by a pax record; the header field gets a
        // truncated best-effort copy.
        let linkname = entry.link_target().unwrap_or(b"");
        let linkname = &linkname[..linkname.len().min(LINKNAME.len())];

        let mut block = [0u8; BLOCK_LEN];
        block[PREFIX][..prefix.len()].copy_from_slice(prefix);
        Self::fill_header(
            &mut block,
            name,
            entry.mode(),
            entry.uid(),
            entry.gid(),
            size,
            entry.mtime().map(|t| t.secs).unwrap_or(0),
            typeflag,
            linkname,
            entry.uname(),
            entry.gname(),
            entry
                .is_device()
                .then_some((entry.dev_major(), entry.dev_minor())),
        )?;
        self.out.write_all(&block)?;
        self.written = 0;
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> Result<()> {
        self.out.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn finish_entry(&mut self) -> Result<()> {
        let pad = (BLOCK_LEN as u64 - self.written % BLOCK_LEN as u64) % BLOCK_LEN as u64;
        if pad > 0 {
            self.out.write_all(&vec![0u8; pad as usize])?;
        }
        self.written = 0;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.out.write_all(&[0u8; 2 * BLOCK_LEN])?;
        self.out.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octal_parse_plain() {
        assert_eq!(parse_numeric(b"0000644\0", "mode").unwrap(), 0o644);
        assert_eq!(parse_numeric(b"   644 \0", "mode").unwrap(), 0o644);
        assert_eq!(parse_numeric(b"\0\0\0\0", "mode").unwrap(), 0);
        assert!(parse_numeric(b"00q0644\0", "mode").is_err());
    }

    #[test]
    fn octal_parse_base256() {
        // 0x80 marker, then big-endian bytes.
        let field = [0x80, 0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 1];
        assert_eq!(parse_numeric(&field, "size").unwrap(), 0x2_00_01);
    }

    #[test]
    fn octal_format_round_trips() {
        let mut field = [0u8; 12];
        assert!(format_octal(&mut field, 0o77_777_777_777));
        assert_eq!(parse_numeric(&field, "size").unwrap(), 0o77_777_777_777);
        assert!(!format_octal(&mut field, u64::MAX));
    }

    #[test]
    fn pax_record_encode_parse() {
        let record = encode_pax_record("path", b"a/very/long/path");
        assert_eq!(record[record.len() - 1], b'\n');

        let mut over = PaxOverrides::default();
        parse_pax_records(&record, &mut over).unwrap();
        assert_eq!(over.path.as_deref(), Some(b"a/very/long/path".as_slice()));
    }

    #[test]
    fn pax_record_length_counts_itself() {
        // 1 + "=" + "\n" + " " + key(1) = 5 payload bytes; total "6 a=b\n".
        let record = encode_pax_record("a", b"b");
        assert_eq!(record, b"6 a=b\n");
    }

    #[test]
    fn pax_time_parse() {
        assert_eq!(
            parse_pax_time(b"1700000000.25").unwrap(),
            Timespec::new(1_700_000_000, 250_000_000)
        );
        assert_eq!(parse_pax_time(b"-12").unwrap(), Timespec::new(-12, 0));
        assert!(parse_pax_time(b"not-a-time").is_err());
    }

    #[test]
    fn name_split() {
        assert_eq!(
            TarWriter::split_name(b"short/name"),
            Some((b"".as_slice(), b"short/name".as_slice()))
        );
        let long = [b"p".repeat(60), b"n".repeat(90)].join(&b'/');
        let (prefix, name) = TarWriter::split_name(&long).unwrap();
        assert_eq!(prefix.len(), 60);
        assert_eq!(name.len(), 90);

        // No separator in range: not splittable.
        assert!(TarWriter::split_name(&b"x".repeat(120)).is_none());
    }

    #[test]
    fn header_checksum_survives_roundtrip() {
        let mut block = [0u8; BLOCK_LEN];
        TarWriter::fill_header(
            &mut block,
            b"file.txt",
            0o644,
            1000,
            1000,
            42,
            1_700_000_000,
            REGTYPE,
            b"",
            Some("user"),
            Some("group"),
            None,
        )
        .unwrap();
        assert!(checksum_matches(&block));
        assert_eq!(parse_numeric(&block[SIZE], "size").unwrap(), 42);
        assert_eq!(trim_field(&block[NAME]), b"file.txt");

        // Any flipped byte must break the checksum.
        block[0] ^= 0xff;
        assert!(!checksum_matches(&block));
    }
}
