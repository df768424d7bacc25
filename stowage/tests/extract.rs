//! Extraction layer behavior against a real file system.

use stowage::{
    extract_all, ArchiveReader, ArchiveWriter, Entry, EntryType, ExtractError, ExtractOptions,
    Format, Timespec,
};
use tempfile::TempDir;

fn archive_with(members: &[(Entry, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    for (entry, payload) in members {
        writer.add_entry(entry).unwrap();
        writer.write_payload(payload).unwrap();
    }
    writer.close().unwrap();
    buf
}

fn file_entry(path: &str, content: &[u8], mode: u32) -> Entry {
    let mut entry = Entry::new(path, EntryType::Regular);
    entry.set_size(content.len() as u64);
    entry.set_mode(mode);
    entry.set_mtime(Some(Timespec::new(1_700_000_000, 0)));
    entry
}

#[test]
fn extracts_tree_with_metadata() {
    let dir = Entry::new("tree", EntryType::Directory);
    let file = file_entry("tree/a.txt", b"contents", 0o640);
    let buf = archive_with(&[(dir, Vec::new()), (file, b"contents".to_vec())]);

    let tmp = TempDir::new().unwrap();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let stats = extract_all(&mut reader, tmp.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(stats.dirs, 1);
    assert_eq!(stats.files, 1);
    assert_eq!(stats.bytes_written, 8);

    let extracted = tmp.path().join("tree/a.txt");
    assert_eq!(std::fs::read(&extracted).unwrap(), b"contents");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&extracted).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    let mtime = std::fs::metadata(&extracted)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    assert_eq!(mtime, 1_700_000_000);
}

#[test]
fn dotdot_path_rejected_by_default_accepted_on_opt_out() {
    let escape = file_entry("../escape", b"out", 0o644);
    let buf = archive_with(&[(escape, b"out".to_vec())]);

    let tmp = TempDir::new().unwrap();
    let inner = tmp.path().join("inner");

    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let err = extract_all(&mut reader, &inner, &ExtractOptions::default()).unwrap_err();
    assert!(matches!(err, ExtractError::InsecurePath { .. }), "{err:?}");

    // Explicitly disabling the gate lets the entry out (into the outer
    // temp dir, still inside the test sandbox).
    let options = ExtractOptions {
        allow_dotdot: true,
        ..ExtractOptions::default()
    };
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    extract_all(&mut reader, &inner, &options).unwrap();
    assert_eq!(std::fs::read(tmp.path().join("escape")).unwrap(), b"out");
}

#[test]
fn absolute_path_rejected_by_default() {
    let mut abs = Entry::new("placeholder", EntryType::Regular);
    abs.set_path(b"/abs/target".to_vec());
    abs.set_size(0);
    let buf = archive_with(&[(abs, Vec::new())]);

    let tmp = TempDir::new().unwrap();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let err = extract_all(&mut reader, tmp.path(), &ExtractOptions::default()).unwrap_err();
    assert!(matches!(err, ExtractError::InsecurePath { .. }));
}

#[cfg(unix)]
#[test]
fn escaping_symlink_rejected_by_default() {
    let mut link = Entry::new("sneaky", EntryType::Symlink);
    link.set_link_target("../../outside");
    let buf = archive_with(&[(link, Vec::new())]);

    let tmp = TempDir::new().unwrap();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let err = extract_all(&mut reader, tmp.path(), &ExtractOptions::default()).unwrap_err();
    assert!(matches!(err, ExtractError::EscapingSymlink { .. }));

    let options = ExtractOptions {
        allow_escaping_symlinks: true,
        ..ExtractOptions::default()
    };
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let stats = extract_all(&mut reader, tmp.path(), &options).unwrap();
    assert_eq!(stats.symlinks, 1);
}

#[cfg(unix)]
#[test]
fn inside_symlink_extracts() {
    let target = file_entry("real.txt", b"data", 0o644);
    let mut link = Entry::new("alias", EntryType::Symlink);
    link.set_link_target("real.txt");
    let buf = archive_with(&[(target, b"data".to_vec()), (link, Vec::new())]);

    let tmp = TempDir::new().unwrap();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let stats = extract_all(&mut reader, tmp.path(), &ExtractOptions::default()).unwrap();
    assert_eq!(stats.symlinks, 1);
    assert_eq!(std::fs::read(tmp.path().join("alias")).unwrap(), b"data");
}

#[test]
fn hardlink_resolves_even_when_link_precedes_target() {
    // The link arrives before its target; the pending table resolves it
    // after the scan.
    let mut link = Entry::new("early-link", EntryType::Hardlink);
    link.set_link_target("late-target");
    let target = file_entry("late-target", b"shared bytes", 0o644);
    let buf = archive_with(&[(link, Vec::new()), (target, b"shared bytes".to_vec())]);

    let tmp = TempDir::new().unwrap();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let stats = extract_all(&mut reader, tmp.path(), &ExtractOptions::default()).unwrap();
    assert_eq!(stats.hardlinks, 1);
    assert_eq!(
        std::fs::read(tmp.path().join("early-link")).unwrap(),
        b"shared bytes"
    );
}

#[test]
fn hardlink_to_missing_target_errors() {
    let mut link = Entry::new("dangling", EntryType::Hardlink);
    link.set_link_target("never-written");
    let buf = archive_with(&[(link, Vec::new())]);

    let tmp = TempDir::new().unwrap();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let err = extract_all(&mut reader, tmp.path(), &ExtractOptions::default()).unwrap_err();
    assert!(matches!(err, ExtractError::MissingHardlinkTarget { .. }));
}

#[test]
fn zip_archive_extracts_too() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Zip, &[]).unwrap();
    let dir = Entry::new("z", EntryType::Directory);
    writer.add_entry(&dir).unwrap();
    let file = file_entry("z/inner.txt", b"zipped", 0o600);
    writer.add_entry(&file).unwrap();
    writer.write_payload(b"zipped").unwrap();
    writer.close().unwrap();

    let tmp = TempDir::new().unwrap();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let stats = extract_all(&mut reader, tmp.path(), &ExtractOptions::default()).unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(
        std::fs::read(tmp.path().join("z/inner.txt")).unwrap(),
        b"zipped"
    );
}
