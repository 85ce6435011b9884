//! Wire-level checks against hand-assembled archives.

use std::fs;

use tempfile::TempDir;

use renpak::pickle::Value;
use renpak::reader::RpaReader;
use renpak::writer::{write_archive, PackOptions, PendingFile};
use renpak::{codec, pickle, Header, Version};

#[test]
fn header_lines_per_family() {
    let dir = TempDir::new().unwrap();
    let files = vec![PendingFile::new("x", b"1234".to_vec())];

    let cases = [
        (Version::V2, "RPA-2.0 "),
        (Version::V3, "RPA-3.0 "),
        (Version::V3_2, "RPA-3.2 "),
        (Version::V4, "RPA-4.0 "),
    ];
    for (version, prefix) in cases {
        let out = dir.path().join(format!("{version:?}.rpa"));
        write_archive(&out, &files, &PackOptions { version, ..PackOptions::default() }).unwrap();
        let raw = fs::read(&out).unwrap();
        assert!(raw.starts_with(prefix.as_bytes()), "{version:?}");

        let nl = raw.iter().position(|&b| b == b'\n').unwrap();
        assert_eq!(nl + 1, Header::emitted_len(version), "{version:?}");
    }
}

#[test]
fn family_2_header_has_no_key_token() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("v2.rpa");
    let files = vec![PendingFile::new("x", b"1234".to_vec())];
    write_archive(&out, &files, &PackOptions { version: Version::V2, ..PackOptions::default() })
        .unwrap();

    let raw = fs::read(&out).unwrap();
    let nl = raw.iter().position(|&b| b == b'\n').unwrap();
    let line = std::str::from_utf8(&raw[..nl]).unwrap();
    assert_eq!(line.split_ascii_whitespace().count(), 2);
}

#[test]
fn default_key_is_applied_when_none_given() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("v3.rpa");
    let files = vec![PendingFile::new("x", b"1234".to_vec())];
    write_archive(&out, &files, &PackOptions { version: Version::V3, ..PackOptions::default() })
        .unwrap();

    let mut reader = RpaReader::open(&out).unwrap();
    assert_eq!(reader.header().unwrap().key, 0xDEAD_BEEF);
    assert_eq!(reader.read_member("x").unwrap(), b"1234");
}

/// A member whose index entry carries the 3-tuple prefix form; the
/// writer never emits it, but readers must honor it.
#[test]
fn prefix_bytes_are_prepended_on_read() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("prefixed.rpa");

    let header_len = Header::emitted_len(Version::V2) as u64;
    let payload = b"XY";
    let index_offset = header_len + payload.len() as u64;

    let root = Value::Dict(vec![(
        Value::Str("p".into()),
        Value::List(vec![Value::Tuple(vec![
            Value::Int(header_len as i64),
            Value::Int(payload.len() as i64),
            Value::Bytes(b"AB".to_vec()),
        ])]),
    )]);
    let index_data = codec::deflate(&pickle::dumps(&root, 2).unwrap()).unwrap();

    let mut raw = Header::new(Version::V2, index_offset, 0).emit();
    raw.extend_from_slice(payload);
    raw.extend_from_slice(&index_data);
    fs::write(&out, &raw).unwrap();

    let mut reader = RpaReader::open(&out).unwrap();
    assert_eq!(reader.read_member("p").unwrap(), b"ABXY");

    let entry = reader.entries().unwrap().remove(0);
    assert_eq!(entry.length, 2);
    assert_eq!(entry.prefix_len, 2);
}

/// Foreign archives store the index as a plain dict of tuples rather
/// than lists; both sequence spellings decode.
#[test]
fn tuple_valued_entries_accepted() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("tuples.rpa");

    let header_len = Header::emitted_len(Version::V2) as u64;
    let payload = b"hello";
    let root = Value::Dict(vec![(
        Value::Str("greeting".into()),
        Value::Tuple(vec![Value::Tuple(vec![
            Value::Int(header_len as i64),
            Value::Int(payload.len() as i64),
        ])]),
    )]);
    let index_data = codec::deflate(&pickle::dumps(&root, 2).unwrap()).unwrap();

    let mut raw = Header::new(Version::V2, header_len + payload.len() as u64, 0).emit();
    raw.extend_from_slice(payload);
    raw.extend_from_slice(&index_data);
    fs::write(&out, &raw).unwrap();

    let mut reader = RpaReader::open(&out).unwrap();
    assert_eq!(reader.read_member("greeting").unwrap(), b"hello");
}

#[test]
fn out_of_bounds_entry_is_rejected() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("oob.rpa");

    let header_len = Header::emitted_len(Version::V2) as u64;
    let root = Value::Dict(vec![(
        Value::Str("ghost".into()),
        Value::List(vec![Value::Tuple(vec![
            Value::Int(header_len as i64),
            Value::Int(0x10_0000),
        ])]),
    )]);
    let index_data = codec::deflate(&pickle::dumps(&root, 2).unwrap()).unwrap();

    let mut raw = Header::new(Version::V2, header_len, 0).emit();
    raw.extend_from_slice(&index_data);
    fs::write(&out, &raw).unwrap();

    let mut reader = RpaReader::open(&out).unwrap();
    assert!(matches!(
        reader.index(),
        Err(renpak::ArchiveError::BadIndex(_))
    ));
}

/// The first segment wins when an entry carries several.
#[test]
fn first_segment_is_authoritative() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("multi.rpa");

    let header_len = Header::emitted_len(Version::V2) as u64;
    let payload = b"firstsecond";
    let root = Value::Dict(vec![(
        Value::Str("m".into()),
        Value::List(vec![
            Value::Tuple(vec![Value::Int(header_len as i64), Value::Int(5)]),
            Value::Tuple(vec![Value::Int(header_len as i64 + 5), Value::Int(6)]),
        ]),
    )]);
    let index_data = codec::deflate(&pickle::dumps(&root, 2).unwrap()).unwrap();

    let mut raw = Header::new(Version::V2, header_len + payload.len() as u64, 0).emit();
    raw.extend_from_slice(payload);
    raw.extend_from_slice(&index_data);
    fs::write(&out, &raw).unwrap();

    let mut reader = RpaReader::open(&out).unwrap();
    assert_eq!(reader.read_member("m").unwrap(), b"first");
}

#[test]
fn raw_deflate_index_accepted() {
    use std::io::Write;

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("rawdeflate.rpa");

    let header_len = Header::emitted_len(Version::V2) as u64;
    let payload = b"data";
    let root = Value::Dict(vec![(
        Value::Str("d".into()),
        Value::List(vec![Value::Tuple(vec![
            Value::Int(header_len as i64),
            Value::Int(payload.len() as i64),
        ])]),
    )]);
    let pickled = pickle::dumps(&root, 2).unwrap();
    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(&pickled).unwrap();
    let index_data = enc.finish().unwrap();

    let mut raw = Header::new(Version::V2, header_len + payload.len() as u64, 0).emit();
    raw.extend_from_slice(payload);
    raw.extend_from_slice(&index_data);
    fs::write(&out, &raw).unwrap();

    let mut reader = RpaReader::open(&out).unwrap();
    assert_eq!(reader.read_member("d").unwrap(), b"data");
}
