//! Extraction convenience layer: materializes a read session onto the
//! file system.
//!
//! This sits outside the codec core and consumes its public contract. The
//! unsafe behaviors are gated: `..` components, absolute paths and
//! symlinks pointing out of the extraction root are all rejected unless
//! the caller opts out.

use std::collections::HashSet;
use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::entry::{Entry, EntryType, Timespec};
use crate::error::Error;
use crate::read::ArchiveReader;

/// Security and restore toggles for extraction. The default is the safe
/// configuration: every escape hatch off, permissions and times restored,
/// ownership left alone.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Allow `..` components in member paths.
    pub allow_dotdot: bool,
    /// Allow absolute member paths.
    pub allow_absolute: bool,
    /// Allow symlinks whose target resolves outside the extraction root.
    pub allow_escaping_symlinks: bool,
    /// Apply permission bits to extracted files and directories.
    pub restore_permissions: bool,
    /// Apply modify/access times to extracted files.
    pub restore_times: bool,
    /// Apply uid/gid (usually needs privileges; failures are ignored).
    pub restore_ownership: bool,
}

impl Default for ExtractOptions {
    fn default() -> ExtractOptions {
        ExtractOptions {
            allow_dotdot: false,
            allow_absolute: false,
            allow_escaping_symlinks: false,
            restore_permissions: true,
            restore_times: true,
            restore_ownership: false,
        }
    }
}

/// Counters reported back from an extraction run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    /// Entries the platform or options could not materialize.
    pub skipped: u64,
    pub bytes_written: u64,
}

pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("member path `{path}` is not safe to extract")]
    InsecurePath { path: String },

    #[error("symlink `{path}` points outside the extraction root")]
    EscapingSymlink { path: String },

    #[error("hardlink target `{target}` not present in the archive")]
    MissingHardlinkTarget { target: String },

    #[error("cannot create `{}`", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Archive(#[from] Error),
}

fn path_to_native(bytes: &[u8]) -> PathBuf {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Validate a member path against the security gates and rebuild it as a
/// join-safe path.
fn sanitize(bytes: &[u8], options: &ExtractOptions) -> ExtractResult<PathBuf> {
    let raw = path_to_native(bytes);
    let insecure = || ExtractError::InsecurePath {
        path: String::from_utf8_lossy(bytes).into_owned(),
    };

    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !options.allow_dotdot {
                    return Err(insecure());
                }
                out.push("..");
            }
            Component::RootDir | Component::Prefix(_) => {
                if !options.allow_absolute {
                    return Err(insecure());
                }
                out.push(component.as_os_str());
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(insecure());
    }
    Ok(out)
}

/// Lexical check whether a symlink at `link` (relative to the root) with
/// the given target can resolve outside the root.
fn link_escapes(link: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return true;
    }
    let mut depth: i64 = link
        .parent()
        .map(|p| {
            p.components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count() as i64
        })
        .unwrap_or(0);
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}

fn system_time(ts: Timespec) -> SystemTime {
    if ts.secs >= 0 {
        UNIX_EPOCH + Duration::new(ts.secs as u64, ts.nanos)
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.secs.unsigned_abs())
    }
}

fn apply_metadata(path: &Path, entry: &Entry, options: &ExtractOptions) {
    #[cfg(unix)]
    if options.restore_permissions {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(entry.mode()));
    }
    if options.restore_times {
        let mut times = FileTimes::new();
        let mut any = false;
        if let Some(mtime) = entry.mtime() {
            times = times.set_modified(system_time(mtime));
            any = true;
        }
        if let Some(atime) = entry.atime() {
            times = times.set_accessed(system_time(atime));
            any = true;
        }
        if any {
            if let Ok(file) = File::options().write(true).open(path) {
                let _ = file.set_times(times);
            }
        }
    }
    #[cfg(unix)]
    if options.restore_ownership {
        let _ = std::os::unix::fs::chown(
            path,
            Some(entry.uid() as u32),
            Some(entry.gid() as u32),
        );
    }
}

fn create_parents(path: &Path) -> ExtractResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ExtractError::Create {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Extract every remaining entry of `reader` under `dest`.
///
/// Hardlinks whose target has not been materialized yet are parked in a
/// pending table keyed by target path and resolved after the full scan, so
/// archive ordering does not matter.
pub fn extract_all<P: AsRef<Path>>(
    reader: &mut ArchiveReader<'_>,
    dest: P,
    options: &ExtractOptions,
) -> ExtractResult<ExtractStats> {
    let dest = dest.as_ref();
    fs::create_dir_all(dest).map_err(|source| ExtractError::Create {
        path: dest.to_path_buf(),
        source,
    })?;

    let mut stats = ExtractStats::default();
    let mut pending_links: Vec<(PathBuf, PathBuf, String)> = Vec::new();
    let mut extracted: HashSet<PathBuf> = HashSet::new();

    while let Some(entry) = reader.next_entry()? {
        let rel = sanitize(entry.path(), options)?;
        let out_path = dest.join(&rel);

        match entry.entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out_path).map_err(|source| ExtractError::Create {
                    path: out_path.clone(),
                    source,
                })?;
                apply_metadata(&out_path, &entry, options);
                stats.dirs += 1;
            }
            EntryType::Regular => {
                create_parents(&out_path)?;
                let mut file =
                    File::create(&out_path).map_err(|source| ExtractError::Create {
                        path: out_path.clone(),
                        source,
                    })?;
                stats.bytes_written += reader.read_payload(&mut file).map_err(|e| match e {
                    Error::Io(source) => ExtractError::Create {
                        path: out_path.clone(),
                        source,
                    },
                    other => ExtractError::Archive(other),
                })?;
                drop(file);
                apply_metadata(&out_path, &entry, options);
                stats.files += 1;
            }
            EntryType::Symlink => {
                let target_bytes = entry.link_target().unwrap_or_default();
                let target = path_to_native(target_bytes);
                if !options.allow_escaping_symlinks && link_escapes(&rel, &target) {
                    return Err(ExtractError::EscapingSymlink {
                        path: entry.path_lossy().into_owned(),
                    });
                }
                create_parents(&out_path)?;
                #[cfg(unix)]
                {
                    let _ = fs::remove_file(&out_path);
                    std::os::unix::fs::symlink(&target, &out_path).map_err(|source| {
                        ExtractError::Create {
                            path: out_path.clone(),
                            source,
                        }
                    })?;
                    stats.symlinks += 1;
                }
                #[cfg(not(unix))]
                {
                    stats.skipped += 1;
                }
            }
            EntryType::Hardlink => {
                let target_bytes = entry.link_target().unwrap_or_default();
                let target_rel = sanitize(target_bytes, options)?;
                let target_abs = dest.join(&target_rel);
                create_parents(&out_path)?;
                if extracted.contains(&target_rel) {
                    fs::hard_link(&target_abs, &out_path).map_err(|source| {
                        ExtractError::Create {
                            path: out_path.clone(),
                            source,
                        }
                    })?;
                    stats.hardlinks += 1;
                } else {
                    // Target not seen yet; resolve after the scan.
                    pending_links.push((
                        target_abs,
                        out_path.clone(),
                        String::from_utf8_lossy(target_bytes).into_owned(),
                    ));
                }
            }
            EntryType::Fifo => {
                #[cfg(unix)]
                {
                    create_parents(&out_path)?;
                    use std::os::unix::ffi::OsStrExt;
                    let c_path =
                        std::ffi::CString::new(out_path.as_os_str().as_bytes().to_vec())
                            .map_err(|_| ExtractError::InsecurePath {
                                path: entry.path_lossy().into_owned(),
                            })?;
                    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), entry.mode() as libc::mode_t) };
                    if rc == 0 {
                        stats.files += 1;
                    } else {
                        tracing::debug!(path = %out_path.display(), "mkfifo failed, skipping");
                        stats.skipped += 1;
                    }
                }
                #[cfg(not(unix))]
                {
                    stats.skipped += 1;
                }
            }
            EntryType::CharDevice | EntryType::BlockDevice | EntryType::Socket => {
                // Device and socket nodes need privileges the caller most
                // likely does not have.
                tracing::debug!(path = %entry.path_lossy().as_ref(), "skipping special entry");
                stats.skipped += 1;
            }
        }
        extracted.insert(rel);
    }

    for (target_abs, link_path, target_name) in pending_links {
        match fs::hard_link(&target_abs, &link_path) {
            Ok(()) => stats.hardlinks += 1,
            Err(_) => {
                return Err(ExtractError::MissingHardlinkTarget {
                    target: target_name,
                });
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotdot_rejected_by_default() {
        let options = ExtractOptions::default();
        assert!(matches!(
            sanitize(b"../escape", &options),
            Err(ExtractError::InsecurePath { .. })
        ));
    }

    #[test]
    fn dotdot_allowed_when_opted_out() {
        let options = ExtractOptions {
            allow_dotdot: true,
            ..ExtractOptions::default()
        };
        assert_eq!(sanitize(b"../escape", &options).unwrap(), Path::new("../escape"));
    }

    #[test]
    fn absolute_rejected_by_default() {
        let options = ExtractOptions::default();
        assert!(matches!(
            sanitize(b"/etc/passwd", &options),
            Err(ExtractError::InsecurePath { .. })
        ));
    }

    #[test]
    fn curdir_components_are_dropped() {
        let options = ExtractOptions::default();
        assert_eq!(
            sanitize(b"./a/./b", &options).unwrap(),
            Path::new("a/b")
        );
    }

    #[test]
    fn link_escape_detection() {
        assert!(link_escapes(Path::new("a/link"), Path::new("../../out")));
        assert!(link_escapes(Path::new("link"), Path::new("/abs")));
        assert!(!link_escapes(Path::new("a/link"), Path::new("../sibling")));
        assert!(!link_escapes(Path::new("a/b/link"), Path::new("../../peer")));
        assert!(link_escapes(Path::new("link"), Path::new("..")));
    }

    #[test]
    fn pre_epoch_times_do_not_panic() {
        let t = system_time(Timespec::new(-1000, 0));
        assert!(t < UNIX_EPOCH);
    }
}
