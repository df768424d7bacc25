use std::fs::File;
use std::io::Read;
use std::path::Path;

use stowage::{ArchiveWriter, Entry, EntryType, FilterConfig, Timespec};
use walkdir::WalkDir;

use crate::cli::CreateArgs;
use crate::error::{Error, Result};

const COPY_CHUNK: usize = 64 * 1024;

fn entry_path(path: &Path) -> Vec<u8> {
    // Archive members are always relative: strip any leading `/` or `./`.
    let mut out = Vec::new();
    for component in path.components() {
        if let std::path::Component::Normal(part) = component {
            if !out.is_empty() {
                out.push(b'/');
            }
            #[cfg(unix)]
            {
                use std::os::unix::ffi::OsStrExt;
                out.extend_from_slice(part.as_bytes());
            }
            #[cfg(not(unix))]
            {
                out.extend_from_slice(part.to_string_lossy().as_bytes());
            }
        }
    }
    out
}

fn entry_from_metadata(path: &Path, meta: &std::fs::Metadata) -> Result<Entry> {
    let entry_type = if meta.is_dir() {
        EntryType::Directory
    } else if meta.file_type().is_symlink() {
        EntryType::Symlink
    } else {
        EntryType::Regular
    };

    let mut entry = Entry::new(entry_path(path), entry_type);
    if entry_type == EntryType::Regular {
        entry.set_size(meta.len());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        entry.set_mode(meta.mode() & 0o7_777);
        entry.set_uid(meta.uid().into());
        entry.set_gid(meta.gid().into());
        entry.set_mtime(Some(Timespec::new(meta.mtime(), meta.mtime_nsec() as u32)));
    }
    #[cfg(not(unix))]
    {
        if let Ok(modified) = meta.modified() {
            if let Ok(d) = modified.duration_since(std::time::UNIX_EPOCH) {
                entry.set_mtime(Some(Timespec::new(d.as_secs() as i64, d.subsec_nanos())));
            }
        }
    }

    if entry_type == EntryType::Symlink {
        let target = std::fs::read_link(path).map_err(|source| Error::ProcessFile {
            path: path.to_path_buf(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            entry.set_link_target(target.as_os_str().as_bytes().to_vec());
        }
        #[cfg(not(unix))]
        {
            entry.set_link_target(target.to_string_lossy().as_bytes().to_vec());
        }
    }

    Ok(entry)
}

fn add_file(writer: &mut ArchiveWriter<'_>, path: &Path, entry: &Entry) -> Result<()> {
    writer.add_entry(entry).map_err(|source| Error::AddFile {
        path: path.to_path_buf(),
        source,
    })?;
    if !entry.is_regular() {
        return Ok(());
    }

    let mut file = File::open(path).map_err(|source| Error::ProcessFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut chunk = vec![0u8; COPY_CHUNK];
    loop {
        let n = file.read(&mut chunk).map_err(|source| Error::ProcessFile {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        writer
            .write_payload(&chunk[..n])
            .map_err(|source| Error::AddFile {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

pub fn run(args: CreateArgs, verbose: bool) -> Result<()> {
    let archive = std::fs::canonicalize(&args.archive).unwrap_or_else(|_| args.archive.clone());
    if args
        .paths
        .iter()
        .any(|p| std::fs::canonicalize(p).map_or(false, |p| p == archive))
    {
        return Err(Error::SelfArchive);
    }

    let filters: Vec<FilterConfig> = args.filters.iter().map(|c| (*c).into()).collect();
    let mut writer = ArchiveWriter::create_path(&args.archive, args.format, &filters).map_err(
        |source| Error::CreateArchive {
            path: args.archive.clone(),
            source,
        },
    )?;

    for root in &args.paths {
        for item in WalkDir::new(root).sort_by_file_name() {
            let item = item.map_err(|e| Error::ProcessFile {
                path: root.clone(),
                source: e.into(),
            })?;
            let meta = std::fs::symlink_metadata(item.path()).map_err(|source| {
                Error::ProcessFile {
                    path: item.path().to_path_buf(),
                    source,
                }
            })?;
            let entry = entry_from_metadata(item.path(), &meta)?;
            if entry.path().is_empty() {
                continue;
            }
            if verbose {
                println!("{}", entry.path_lossy());
            }
            add_file(&mut writer, item.path(), &entry)?;
        }
    }

    writer.close().map_err(|source| Error::FinishArchive {
        path: args.archive.clone(),
        source,
    })
}
