//! Write-then-read round-trips across formats and filter chains.

use stowage::{
    ArchiveReader, ArchiveWriter, CallbackSink, Codec, Entry, EntryType, FilterConfig, Format,
    Timespec,
};

fn file_entry(path: &str, content: &[u8]) -> Entry {
    let mut entry = Entry::new(path, EntryType::Regular);
    entry.set_size(content.len() as u64);
    entry.set_mtime(Some(Timespec::new(1_700_000_000, 0)));
    entry
}

fn write_archive(format: Format, filters: &[Codec], members: &[(Entry, Vec<u8>)]) -> Vec<u8> {
    let configs: Vec<FilterConfig> = filters.iter().map(|c| (*c).into()).collect();
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, format, &configs).unwrap();
    for (entry, payload) in members {
        writer.add_entry(entry).unwrap();
        writer.write_payload(payload).unwrap();
    }
    writer.close().unwrap();
    buf
}

fn read_archive(buf: &[u8]) -> Vec<(Entry, Vec<u8>)> {
    let mut reader = ArchiveReader::open_bytes(buf).unwrap();
    let mut out = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        let mut payload = Vec::new();
        reader.read_payload(&mut payload).unwrap();
        out.push((entry, payload));
    }
    out
}

#[test]
fn pax_round_trip_basic() {
    let mut dir = Entry::new("data", EntryType::Directory);
    dir.set_mode(0o755);
    dir.set_mtime(Some(Timespec::new(1_700_000_000, 0)));
    let file = file_entry("data/greeting.txt", b"hello stowage");
    let mut link = Entry::new("data/link", EntryType::Symlink);
    link.set_link_target("greeting.txt");
    link.set_mtime(Some(Timespec::new(1_700_000_000, 0)));

    let buf = write_archive(
        Format::Pax,
        &[],
        &[
            (dir, Vec::new()),
            (file, b"hello stowage".to_vec()),
            (link, Vec::new()),
        ],
    );
    let members = read_archive(&buf);
    assert_eq!(members.len(), 3);

    assert_eq!(members[0].0.path(), b"data");
    assert!(members[0].0.is_directory());
    assert_eq!(members[0].0.size(), Some(0));

    assert_eq!(members[1].0.path(), b"data/greeting.txt");
    assert_eq!(members[1].0.size(), Some(13));
    assert_eq!(members[1].1, b"hello stowage");

    assert!(members[2].0.is_symlink());
    assert_eq!(members[2].0.link_target(), Some(b"greeting.txt".as_slice()));
}

#[test]
fn zip_end_to_end_two_members() {
    let dir = Entry::new("d/", EntryType::Directory);
    let file = file_entry("d/f.txt", b"hi");
    let buf = write_archive(Format::Zip, &[], &[(dir, Vec::new()), (file, b"hi".to_vec())]);

    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    assert_eq!(reader.format(), Format::Zip);

    let first = reader.next_entry().unwrap().unwrap();
    assert_eq!(first.path(), b"d");
    assert!(first.is_directory());

    let second = reader.next_entry().unwrap().unwrap();
    assert_eq!(second.path(), b"d/f.txt");
    assert!(second.is_regular());
    assert_eq!(second.size(), Some(2));
    let mut payload = Vec::new();
    reader.read_payload(&mut payload).unwrap();
    assert_eq!(payload, b"hi");

    assert!(reader.next_entry().unwrap().is_none());
}

#[test]
fn every_filter_round_trips_over_pax() {
    let content: Vec<u8> = (0..20_000u32).map(|i| (i % 200) as u8).collect();
    let mut chains: Vec<Vec<Codec>> = vec![
        vec![],
        vec![Codec::Gzip],
        vec![Codec::Compress],
    ];
    #[cfg(feature = "bzip2")]
    chains.push(vec![Codec::Bzip2]);
    #[cfg(feature = "xz")]
    chains.push(vec![Codec::Xz]);
    #[cfg(feature = "zstd")]
    chains.push(vec![Codec::Zstd]);
    #[cfg(feature = "zstd")]
    chains.push(vec![Codec::Zstd, Codec::Gzip]);

    for chain in chains {
        let buf = write_archive(
            Format::Pax,
            &chain,
            &[(file_entry("blob.bin", &content), content.clone())],
        );
        let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
        assert_eq!(reader.filters(), chain.as_slice(), "chain {chain:?}");
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.size(), Some(content.len() as u64));
        let mut payload = Vec::new();
        reader.read_payload(&mut payload).unwrap();
        assert_eq!(payload, content, "chain {chain:?}");
        assert!(reader.next_entry().unwrap().is_none());
    }
}

#[test]
fn pax_preserves_long_paths_and_fine_timestamps() {
    let long_path = format!("{}/{}", "deep/".repeat(30) + "dir", "f".repeat(120));
    let mut entry = file_entry(&long_path, b"x");
    entry.set_mtime(Some(Timespec::new(1_700_000_000, 123_456_789)));
    entry.set_atime(Some(Timespec::new(1_650_000_000, 500_000_000)));
    entry.set_ctime(Some(Timespec::new(1_600_000_000, 0)));
    entry.set_uid(3_000_000_000); // beyond the octal field
    entry.set_uname("someuser");
    entry.set_xattr("user.comment", b"pax keeps this".to_vec());

    let buf = write_archive(Format::Pax, &[], &[(entry, b"x".to_vec())]);
    let members = read_archive(&buf);
    assert_eq!(members.len(), 1);
    let back = &members[0].0;

    assert_eq!(back.path(), long_path.as_bytes());
    assert_eq!(back.mtime(), Some(Timespec::new(1_700_000_000, 123_456_789)));
    assert_eq!(back.atime(), Some(Timespec::new(1_650_000_000, 500_000_000)));
    assert_eq!(back.ctime(), Some(Timespec::new(1_600_000_000, 0)));
    assert_eq!(back.uid(), 3_000_000_000);
    assert_eq!(back.uname(), Some("someuser"));
    assert_eq!(
        back.xattrs().get("user.comment").map(Vec::as_slice),
        Some(b"pax keeps this".as_slice())
    );
    assert_eq!(members[0].1, b"x");
}

#[test]
fn ustar_drops_subsecond_precision() {
    let mut entry = file_entry("plain.txt", b"y");
    entry.set_mtime(Some(Timespec::new(1_700_000_000, 999_999_999)));

    let buf = write_archive(Format::Ustar, &[], &[(entry, b"y".to_vec())]);
    let members = read_archive(&buf);
    assert_eq!(
        members[0].0.mtime(),
        Some(Timespec::new(1_700_000_000, 0))
    );
}

#[test]
fn ustar_refuses_unsplittable_long_path() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Ustar, &[]).unwrap();
    let entry = file_entry(&"x".repeat(150), b"");
    assert!(matches!(
        writer.add_entry(&entry),
        Err(stowage::Error::Unsupported { .. })
    ));
}

#[test]
fn ustar_splits_long_name_across_prefix() {
    let path = format!("{}/{}", "p".repeat(120), "leaf.txt");
    let buf = write_archive(Format::Ustar, &[], &[(file_entry(&path, b"z"), b"z".to_vec())]);
    let members = read_archive(&buf);
    assert_eq!(members[0].0.path(), path.as_bytes());
}

#[test]
fn tar_hardlink_round_trip() {
    let target = file_entry("original.txt", b"shared");
    let mut link = Entry::new("copy.txt", EntryType::Hardlink);
    link.set_link_target("original.txt");
    link.set_mtime(Some(Timespec::new(1_700_000_000, 0)));

    let buf = write_archive(
        Format::Pax,
        &[],
        &[(target, b"shared".to_vec()), (link, Vec::new())],
    );
    let members = read_archive(&buf);
    assert!(members[1].0.is_hardlink());
    assert_eq!(members[1].0.link_target(), Some(b"original.txt".as_slice()));
    assert_eq!(members[1].0.size(), Some(0));
}

#[test]
fn unset_atime_stays_unset() {
    let entry = file_entry("file", b"q");
    let buf = write_archive(Format::Pax, &[], &[(entry, b"q".to_vec())]);
    let members = read_archive(&buf);
    assert!(members[0].0.atime().is_none());
    assert!(members[0].0.ctime().is_none());
}

#[test]
fn zip_streaming_mode_over_forward_only_sink() {
    let mut out: Vec<u8> = Vec::new();
    {
        let sink = CallbackSink::new(|buf: &[u8]| {
            out.extend_from_slice(buf);
            Ok(buf.len())
        });
        let mut writer =
            ArchiveWriter::create_sink(Box::new(sink), Format::Zip, &[]).unwrap();

        // Unknown-size payload is allowed in streaming mode.
        let mut entry = Entry::new("stream.bin", EntryType::Regular);
        entry.unset_size();
        entry.set_mtime(Some(Timespec::new(1_700_000_000, 0)));
        writer.add_entry(&entry).unwrap();
        writer.write_payload(b"abcdefghij").unwrap();
        writer.close().unwrap();
    }

    let members = read_archive(&out);
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].0.size(), Some(10));
    assert_eq!(members[0].1, b"abcdefghij");
}

#[test]
fn zip_symlink_round_trip() {
    let mut link = Entry::new("shortcut", EntryType::Symlink);
    link.set_link_target("target/file");
    link.set_mtime(Some(Timespec::new(1_700_000_000, 0)));
    link.set_mode(0o777);

    let buf = write_archive(Format::Zip, &[], &[(link, Vec::new())]);
    let members = read_archive(&buf);
    assert!(members[0].0.is_symlink());
    assert_eq!(members[0].0.link_target(), Some(b"target/file".as_slice()));
}

#[test]
fn zip_preserves_unix_mode_and_ids() {
    let mut entry = file_entry("tool.sh", b"#!/bin/sh\n");
    entry.set_mode(0o755);
    entry.set_uid(1000);
    entry.set_gid(100);

    let buf = write_archive(Format::Zip, &[], &[(entry, b"#!/bin/sh\n".to_vec())]);
    let members = read_archive(&buf);
    assert_eq!(members[0].0.mode(), 0o755);
    assert_eq!(members[0].0.uid(), 1000);
    assert_eq!(members[0].0.gid(), 100);
    assert_eq!(
        members[0].0.mtime(),
        Some(Timespec::new(1_700_000_000, 0))
    );
}

#[test]
fn empty_archive_round_trips() {
    for format in [Format::Pax, Format::Zip] {
        let buf = write_archive(format, &[], &[]);
        let members = read_archive(&buf);
        assert!(members.is_empty(), "format {format}");
    }
}

#[test]
fn progress_counters_advance() {
    let content = vec![7u8; 100_000];
    let buf = write_archive(
        Format::Pax,
        &[Codec::Gzip],
        &[(file_entry("big", &content), content.clone())],
    );
    // Compressed output is smaller than the payload.
    assert!((buf.len() as u64) < 100_000);

    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    let at_open = reader.bytes_read();
    reader.next_entry().unwrap().unwrap();
    let mut sink = std::io::sink();
    reader.read_payload(&mut sink).unwrap();
    assert!(reader.bytes_read() >= at_open);
    // The counter tracks compressed bytes, so it never exceeds the input.
    assert!(reader.bytes_read() <= buf.len() as u64);
}

#[test]
fn writer_drop_finalizes_archive() {
    let mut buf = Vec::new();
    {
        let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
        let entry = file_entry("f", b"ok");
        writer.add_entry(&entry).unwrap();
        writer.write_payload(b"ok").unwrap();
        // No explicit close: Drop must still write the end marker.
    }
    let members = read_archive(&buf);
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].1, b"ok");
}
