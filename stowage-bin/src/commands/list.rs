use chrono::{TimeZone, Utc};
use humansize::{format_size, BINARY};
use stowage::{ArchiveReader, EntryType};

use crate::cli::ListArgs;
use crate::error::{Error, Result};

fn mode_string(entry_type: EntryType, mode: u32) -> String {
    let kind = match entry_type {
        EntryType::Regular => '-',
        EntryType::Directory => 'd',
        EntryType::Symlink => 'l',
        EntryType::Hardlink => 'h',
        EntryType::Fifo => 'p',
        EntryType::CharDevice => 'c',
        EntryType::BlockDevice => 'b',
        EntryType::Socket => 's',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = mode >> shift;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

fn time_string(secs: Option<i64>) -> String {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}

pub fn run(args: ListArgs, _verbose: bool) -> Result<()> {
    let mut reader =
        ArchiveReader::open_path(&args.archive).map_err(|source| Error::OpenArchive {
            path: args.archive.clone(),
            source,
        })?;

    println!("Mode        Size      Modified          Path");
    println!("----------  --------  ----------------  ----------------");
    loop {
        let entry = match reader.next_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(source) => {
                return Err(Error::ReadArchive {
                    path: args.archive.clone(),
                    source,
                })
            }
        };
        let size = match entry.entry_type() {
            EntryType::Directory => "-".into(),
            _ => format_size(entry.size().unwrap_or(0), BINARY),
        };
        let mut path = entry.path_lossy().into_owned();
        if entry.is_directory() {
            path.push('/');
        }
        if let Some(target) = entry.link_target() {
            path.push_str(" -> ");
            path.push_str(&String::from_utf8_lossy(target));
        }
        println!(
            "{:10}  {:>8}  {:16}  {}",
            mode_string(entry.entry_type(), entry.mode()),
            size,
            time_string(entry.mtime().map(|t| t.secs)),
            path,
        );
    }

    Ok(())
}
