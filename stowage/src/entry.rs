//! In-memory representation of one archive member.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// File type of an archive member, mirroring the `S_IFMT` classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl EntryType {
    /// Map `S_IFMT` bits to an entry type. Hardlinks have no mode-bit
    /// representation; they only arise from container typeflags.
    pub fn from_mode(mode: u32) -> Option<EntryType> {
        match mode & 0o170_000 {
            0o100_000 => Some(EntryType::Regular),
            0o040_000 => Some(EntryType::Directory),
            0o120_000 => Some(EntryType::Symlink),
            0o010_000 => Some(EntryType::Fifo),
            0o020_000 => Some(EntryType::CharDevice),
            0o060_000 => Some(EntryType::BlockDevice),
            0o140_000 => Some(EntryType::Socket),
            _ => None,
        }
    }

    /// The `S_IFMT` bits for this type. Hardlinks report the regular-file
    /// bits, matching how containers store them.
    pub const fn to_mode(self) -> u32 {
        match self {
            EntryType::Regular | EntryType::Hardlink => 0o100_000,
            EntryType::Directory => 0o040_000,
            EntryType::Symlink => 0o120_000,
            EntryType::Fifo => 0o010_000,
            EntryType::CharDevice => 0o020_000,
            EntryType::BlockDevice => 0o060_000,
            EntryType::Socket => 0o140_000,
        }
    }

    pub const fn is_link(self) -> bool {
        matches!(self, EntryType::Symlink | EntryType::Hardlink)
    }
}

/// Seconds-and-nanoseconds timestamp, as stored by pax records and the
/// extraction layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub const fn new(secs: i64, nanos: u32) -> Timespec {
        Timespec { secs, nanos }
    }

    /// Whole seconds only, dropping sub-second precision.
    pub const fn truncated(self) -> Timespec {
        Timespec {
            secs: self.secs,
            nanos: 0,
        }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos == 0 {
            write!(f, "{}", self.secs)
        } else {
            write!(f, "{}.{:09}", self.secs, self.nanos)
        }
    }
}

/// Extended attribute map. Insertion order is irrelevant, so a sorted map
/// keeps serialization deterministic.
pub type XattrMap = BTreeMap<String, Vec<u8>>;

/// Metadata record for one archive member.
///
/// Constructed by the container codec during read, or by the caller during
/// write. The path is an archive-relative byte string; it is stored without
/// a trailing separator regardless of type (directory-ness lives in
/// [`EntryType`], and formats that mark directories with a trailing `/` add
/// it back on serialization).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    path: Vec<u8>,
    entry_type: EntryType,
    size: Option<u64>,
    mode: u32,
    uid: u64,
    gid: u64,
    uname: Option<String>,
    gname: Option<String>,
    atime: Option<Timespec>,
    mtime: Option<Timespec>,
    ctime: Option<Timespec>,
    birthtime: Option<Timespec>,
    link_target: Option<Vec<u8>>,
    dev_major: u32,
    dev_minor: u32,
    xattrs: XattrMap,
}

impl Entry {
    pub fn new(path: impl Into<Vec<u8>>, entry_type: EntryType) -> Entry {
        let mut entry = Entry {
            path: Vec::new(),
            entry_type,
            size: if entry_type == EntryType::Regular {
                None
            } else {
                Some(0)
            },
            mode: match entry_type {
                EntryType::Directory => 0o755,
                _ => 0o644,
            },
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            atime: None,
            mtime: None,
            ctime: None,
            birthtime: None,
            link_target: None,
            dev_major: 0,
            dev_minor: 0,
            xattrs: XattrMap::new(),
        };
        entry.set_path(path);
        entry
    }

    #[inline(always)]
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// The path as UTF-8, with invalid sequences replaced. Display use only.
    pub fn path_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }

    pub fn set_path(&mut self, path: impl Into<Vec<u8>>) {
        let mut path = path.into();
        while path.last() == Some(&b'/') {
            path.pop();
        }
        self.path = path;
    }

    #[inline(always)]
    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn set_entry_type(&mut self, entry_type: EntryType) {
        self.entry_type = entry_type;
        if entry_type == EntryType::Directory {
            self.size = Some(0);
        }
    }

    /// Declared payload size. `None` means unknown; only formats with a
    /// streaming mode accept unknown sizes on write.
    #[inline(always)]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = Some(size);
    }

    /// Marks the payload size unknown (zip streaming mode only).
    pub fn unset_size(&mut self) {
        self.size = None;
    }

    #[inline(always)]
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode & 0o7_777;
    }

    #[inline(always)]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    #[inline(always)]
    pub fn gid(&self) -> u64 {
        self.gid
    }

    pub fn set_uid(&mut self, uid: u64) {
        self.uid = uid;
    }

    pub fn set_gid(&mut self, gid: u64) {
        self.gid = gid;
    }

    #[inline(always)]
    pub fn uname(&self) -> Option<&str> {
        self.uname.as_deref()
    }

    #[inline(always)]
    pub fn gname(&self) -> Option<&str> {
        self.gname.as_deref()
    }

    pub fn set_uname(&mut self, uname: impl Into<String>) {
        self.uname = Some(uname.into());
    }

    pub fn set_gname(&mut self, gname: impl Into<String>) {
        self.gname = Some(gname.into());
    }

    #[inline(always)]
    pub fn atime(&self) -> Option<Timespec> {
        self.atime
    }

    #[inline(always)]
    pub fn mtime(&self) -> Option<Timespec> {
        self.mtime
    }

    #[inline(always)]
    pub fn ctime(&self) -> Option<Timespec> {
        self.ctime
    }

    #[inline(always)]
    pub fn birthtime(&self) -> Option<Timespec> {
        self.birthtime
    }

    pub fn set_atime(&mut self, t: Option<Timespec>) {
        self.atime = t;
    }

    pub fn set_mtime(&mut self, t: Option<Timespec>) {
        self.mtime = t;
    }

    pub fn set_ctime(&mut self, t: Option<Timespec>) {
        self.ctime = t;
    }

    pub fn set_birthtime(&mut self, t: Option<Timespec>) {
        self.birthtime = t;
    }

    /// Symlink or hardlink target.
    #[inline(always)]
    pub fn link_target(&self) -> Option<&[u8]> {
        self.link_target.as_deref()
    }

    pub fn set_link_target(&mut self, target: impl Into<Vec<u8>>) {
        self.link_target = Some(target.into());
    }

    #[inline(always)]
    pub fn dev_major(&self) -> u32 {
        self.dev_major
    }

    #[inline(always)]
    pub fn dev_minor(&self) -> u32 {
        self.dev_minor
    }

    pub fn set_device(&mut self, major: u32, minor: u32) {
        self.dev_major = major;
        self.dev_minor = minor;
    }

    #[inline(always)]
    pub fn xattrs(&self) -> &XattrMap {
        &self.xattrs
    }

    pub fn set_xattr(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.xattrs.insert(name.into(), value.into());
    }

    #[inline(always)]
    pub fn is_regular(&self) -> bool {
        self.entry_type == EntryType::Regular
    }

    #[inline(always)]
    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    #[inline(always)]
    pub fn is_symlink(&self) -> bool {
        self.entry_type == EntryType::Symlink
    }

    #[inline(always)]
    pub fn is_hardlink(&self) -> bool {
        self.entry_type == EntryType::Hardlink
    }

    #[inline(always)]
    pub fn is_fifo(&self) -> bool {
        self.entry_type == EntryType::Fifo
    }

    #[inline(always)]
    pub fn is_socket(&self) -> bool {
        self.entry_type == EntryType::Socket
    }

    /// True for character devices, block devices, fifos and sockets.
    #[inline(always)]
    pub fn is_device(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::CharDevice | EntryType::BlockDevice | EntryType::Fifo | EntryType::Socket
        )
    }

    /// Checks the invariants the writer engine relies on. Violations are
    /// caller bugs, reported as `InvalidState`.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::InvalidState {
                state: "entry has an empty path",
            });
        }
        if self.entry_type.is_link() && self.link_target.as_deref().map_or(true, <[u8]>::is_empty) {
            return Err(Error::InvalidState {
                state: "link entry has no target",
            });
        }
        if self.entry_type == EntryType::Directory && self.size != Some(0) {
            return Err(Error::InvalidState {
                state: "directory entry with non-zero size",
            });
        }
        Ok(())
    }
}
