//! Truncation, corruption, size-mismatch and state-machine behavior.

use stowage::{
    ArchiveReader, ArchiveWriter, Codec, Entry, EntryType, Error, Format, Timespec,
};

fn sample_tar() -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    let mut entry = Entry::new("victim.txt", EntryType::Regular);
    entry.set_size(1500);
    entry.set_mtime(Some(Timespec::new(1_700_000_000, 0)));
    writer.add_entry(&entry).unwrap();
    writer.write_payload(&vec![b'v'; 1500]).unwrap();
    writer.close().unwrap();
    buf
}

fn drain(reader: &mut ArchiveReader<'_>) -> Result<(), Error> {
    while let Some(_entry) = reader.next_entry()? {
        let mut sink = std::io::sink();
        reader.read_payload(&mut sink)?;
    }
    Ok(())
}

#[test]
fn truncation_never_yields_short_entries() {
    let buf = sample_tar();
    // Cut inside the header, inside the payload, inside the padding and
    // inside the end-of-archive marker.
    for cut in [100, 512 + 700, 512 + 1500 + 10, buf.len() - 600] {
        let truncated = &buf[..cut];
        let result = ArchiveReader::open_bytes(truncated)
            .and_then(|mut reader| drain(&mut reader));
        match result {
            Err(Error::Truncated) | Err(Error::Header { .. }) | Err(Error::UnknownFormat) => {}
            other => panic!("cut at {cut}: expected truncation error, got {other:?}"),
        }
    }
}

#[test]
fn corrupt_checksum_is_a_header_error() {
    let mut buf = sample_tar();
    buf[150] ^= 0x55; // inside the chksum field of the first header
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    assert!(matches!(
        reader.next_entry(),
        Err(Error::Header { .. })
    ));
}

#[test]
fn faulted_reader_keeps_re_raising() {
    let buf = sample_tar();
    let cut = &buf[..512 + 700];
    let mut reader = ArchiveReader::open_bytes(cut).unwrap();
    reader.next_entry().unwrap().unwrap();

    let mut sink = std::io::sink();
    let first = reader.read_payload(&mut sink).unwrap_err();
    assert!(matches!(first, Error::Truncated), "{first:?}");

    // Every subsequent call re-surfaces the same terminal condition.
    for _ in 0..3 {
        assert!(matches!(reader.next_entry(), Err(Error::Truncated)));
        assert!(matches!(reader.read_block(), Err(Error::Truncated)));
    }
}

#[test]
fn corrupt_gzip_surfaces_filter_error_with_offset() {
    let mut buf = Vec::new();
    {
        let mut writer =
            ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[Codec::Gzip.into()]).unwrap();
        let mut entry = Entry::new("z", EntryType::Regular);
        entry.set_size(5000);
        writer.add_entry(&entry).unwrap();
        writer.write_payload(&vec![3u8; 5000]).unwrap();
        writer.close().unwrap();
    }
    // Flip a byte in the middle of the deflate stream.
    let mid = buf.len() / 2;
    buf[mid] ^= 0xff;

    let result = ArchiveReader::open_bytes(&buf).and_then(|mut r| drain(&mut r));
    match result {
        Err(Error::Filter { offset, .. }) => assert!(offset <= buf.len() as u64),
        // A flip this early can also break the gzip header itself.
        Err(Error::UnknownFormat) | Err(Error::Header { .. }) | Err(Error::Truncated) => {}
        other => panic!("expected filter failure, got {other:?}"),
    }
}

#[test]
fn corrupt_zip_payload_fails_crc_or_inflate() {
    // Incompressible payload so the deflate stream is comfortably larger
    // than the local header and the flipped byte lands inside it.
    let mut state = 1u32;
    let noise: Vec<u8> = (0..4096)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect();

    let mut buf = Vec::new();
    {
        let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Zip, &[]).unwrap();
        let mut entry = Entry::new("data.bin", EntryType::Regular);
        entry.set_size(4096);
        writer.add_entry(&entry).unwrap();
        writer.write_payload(&noise).unwrap();
        writer.close().unwrap();
    }
    // Local header is 30 bytes + name; byte 80 sits inside the payload.
    buf[80] ^= 0xff;

    let result = ArchiveReader::open_bytes(&buf).and_then(|mut r| drain(&mut r));
    assert!(
        matches!(result, Err(Error::Filter { .. }) | Err(Error::Header { .. })),
        "{result:?}"
    );
}

#[test]
fn overlong_payload_is_rejected_before_the_wire() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    let mut entry = Entry::new("tiny", EntryType::Regular);
    entry.set_size(4);
    writer.add_entry(&entry).unwrap();
    let err = writer.write_payload(b"toolong").unwrap_err();
    assert!(
        matches!(err, Error::SizeMismatch { declared: 4, actual: 7 }),
        "{err:?}"
    );
}

#[test]
fn short_payload_fails_at_close() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    let mut entry = Entry::new("short", EntryType::Regular);
    entry.set_size(10);
    writer.add_entry(&entry).unwrap();
    writer.write_payload(b"1234").unwrap();
    let err = writer.close().unwrap_err();
    assert!(
        matches!(err, Error::SizeMismatch { declared: 10, actual: 4 }),
        "{err:?}"
    );
}

#[test]
fn short_payload_fails_at_next_add_entry() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    let mut entry = Entry::new("first", EntryType::Regular);
    entry.set_size(10);
    writer.add_entry(&entry).unwrap();
    writer.write_payload(b"12").unwrap();

    let next = Entry::new("second", EntryType::Directory);
    assert!(matches!(
        writer.add_entry(&next),
        Err(Error::SizeMismatch { .. })
    ));
}

#[test]
fn payload_write_without_entry_is_invalid_state() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    assert!(matches!(
        writer.write_payload(b"x"),
        Err(Error::InvalidState { .. })
    ));
}

#[test]
fn read_block_without_entry_is_invalid_state() {
    let buf = sample_tar();
    let mut reader = ArchiveReader::open_bytes(&buf).unwrap();
    assert!(matches!(
        reader.read_block(),
        Err(Error::InvalidState { .. })
    ));

    // Distinct from data errors: the session stays usable.
    let entry = reader.next_entry().unwrap();
    assert!(entry.is_some());
}

#[test]
fn unknown_size_is_unsupported_in_tar() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    let mut entry = Entry::new("nosize", EntryType::Regular);
    entry.unset_size();
    assert!(matches!(
        writer.add_entry(&entry),
        Err(Error::Unsupported { .. })
    ));
}

#[test]
fn link_without_target_is_rejected() {
    let mut buf = Vec::new();
    let mut writer = ArchiveWriter::create_bytes(&mut buf, Format::Pax, &[]).unwrap();
    let entry = Entry::new("dangling", EntryType::Symlink);
    assert!(matches!(
        writer.add_entry(&entry),
        Err(Error::InvalidState { .. })
    ));
}

#[test]
fn tar_missing_end_marker_is_truncated() {
    let buf = sample_tar();
    // Strip the entire end-of-archive marker.
    let cut = &buf[..buf.len() - 1024];
    let mut reader = ArchiveReader::open_bytes(cut).unwrap();
    reader.next_entry().unwrap().unwrap();
    let mut sink = std::io::sink();
    reader.read_payload(&mut sink).unwrap();
    assert!(matches!(reader.next_entry(), Err(Error::Truncated)));
}
