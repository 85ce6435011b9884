//! Index codec: between the canonical member table and its on-disk
//! form (pickled, deflated, optionally XOR-masked).
//!
//! Reading tolerates a bounded run of junk bytes between the declared
//! index offset and the actual zlib stream; some repacking tools leave
//! padding there and the reference reader shrugs it off.

use log::debug;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::pickle::{self, PickleError, Value};

/// Upper bound on tolerated junk bytes before the compressed index.
pub const JUNK_SCAN_LIMIT: usize = 512;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index region is empty")]
    EmptyRegion,
    #[error("declared index offset {offset} is outside the archive (length {archive_len})")]
    OffsetOutOfFile { offset: u64, archive_len: u64 },
    #[error("no compressed index within {limit} bytes of the declared offset")]
    NoCompressedData { limit: usize },
    #[error(transparent)]
    Pickle(#[from] PickleError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("index root is not a mapping")]
    NotAMapping,
    #[error("index key is not a string")]
    NonStringKey,
    #[error("entry {path:?}: {problem}")]
    BadEntry { path: String, problem: String },
    #[error("entry {path:?}: range {offset}+{length} exceeds archive length {archive_len}")]
    OutOfBounds { path: String, offset: u64, length: u64, archive_len: u64 },
}

/// One member's byte range, after unmasking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u64,
    /// Short byte run logically prepended to the payload on read.
    /// Empty when absent; stored verbatim, never masked.
    pub prefix: Vec<u8>,
}

impl IndexEntry {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length, prefix: Vec::new() }
    }

    /// Total member size as a reader sees it.
    pub fn member_len(&self) -> u64 {
        self.prefix.len() as u64 + self.length
    }
}

/// The decoded member table, in pickle insertion order.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<(String, IndexEntry)>,
}

impl Index {
    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, e)| e)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every member's range must land inside the archive file.
    pub fn validate_bounds(&self, archive_len: u64) -> Result<(), IndexError> {
        for (path, entry) in &self.entries {
            let end = entry.offset.checked_add(entry.length);
            if end.is_none() || end.unwrap_or(u64::MAX) > archive_len {
                return Err(IndexError::OutOfBounds {
                    path: path.clone(),
                    offset: entry.offset,
                    length: entry.length,
                    archive_len,
                });
            }
        }
        Ok(())
    }
}

/// Decode a compressed index region into the member table.
///
/// `key` is the archive's XOR key; pass zero for unkeyed families (the
/// mask is then the identity).
pub fn decode_index(region: &[u8], key: u32) -> Result<Index, IndexError> {
    if region.is_empty() {
        return Err(IndexError::EmptyRegion);
    }

    let raw = inflate_with_recovery(region)?;
    let root = pickle::loads(&raw)?;
    from_pickle(root, key)
}

/// Inflate the region, scanning past up to [`JUNK_SCAN_LIMIT`] junk
/// bytes for the real zlib stream start.
fn inflate_with_recovery(region: &[u8]) -> Result<Vec<u8>, IndexError> {
    if let Ok(raw) = codec::inflate(region) {
        return Ok(raw);
    }

    let limit = JUNK_SCAN_LIMIT.min(region.len().saturating_sub(1));
    for skip in 1..=limit {
        // Cheap prefilter: every zlib stream opens with 0x78.
        if region[skip] != 0x78 {
            continue;
        }
        if let Ok(raw) = codec::inflate_zlib(&region[skip..]) {
            debug!("recovered index after {skip} junk bytes");
            return Ok(raw);
        }
    }

    Err(IndexError::NoCompressedData { limit: JUNK_SCAN_LIMIT })
}

fn from_pickle(root: Value, key: u32) -> Result<Index, IndexError> {
    let pairs = match root {
        Value::Dict(pairs) => pairs,
        _ => return Err(IndexError::NotAMapping),
    };

    let mask = u64::from(key);
    let mut entries = Vec::with_capacity(pairs.len());
    for (k, v) in pairs {
        let path = k.as_str().ok_or(IndexError::NonStringKey)?.to_owned();
        let bad = |problem: &str| IndexError::BadEntry {
            path: path.clone(),
            problem: problem.to_owned(),
        };

        let segments = v.as_sequence().ok_or_else(|| bad("value is not a sequence"))?;
        // The first segment is authoritative; multi-segment members do
        // not occur in archives this writer or the reference writer emit.
        let first = segments.first().ok_or_else(|| bad("segment list is empty"))?;
        let segment = first
            .as_tuple()
            .filter(|t| t.len() == 2 || t.len() == 3)
            .ok_or_else(|| bad("segment is not a 2- or 3-tuple"))?;

        let offset = segment[0]
            .as_u64()
            .ok_or_else(|| bad("segment offset is not an unsigned integer"))?;
        let length = segment[1]
            .as_u64()
            .ok_or_else(|| bad("segment length is not an unsigned integer"))?;
        let prefix = match segment.get(2) {
            Some(p) => p
                .to_byte_string()
                .ok_or_else(|| bad("segment prefix is not a byte string"))?,
            None => Vec::new(),
        };

        entries.push((
            path,
            IndexEntry {
                offset: offset ^ mask,
                length: length ^ mask,
                prefix,
            },
        ));
    }

    Ok(Index { entries })
}

/// Encode a member table into its on-disk form.
///
/// Always emits the 2-tuple segment shape; callers must have verified
/// that masked families carry only 32-bit offsets and lengths.
pub fn encode_index(
    entries: &[(String, IndexEntry)],
    key: u32,
    protocol: u8,
) -> Result<Vec<u8>, IndexError> {
    let mask = u64::from(key);
    let mut pairs = Vec::with_capacity(entries.len());
    for (path, entry) in entries {
        let offset = int_value(path, entry.offset ^ mask)?;
        let length = int_value(path, entry.length ^ mask)?;
        pairs.push((
            Value::Str(path.clone()),
            Value::List(vec![Value::Tuple(vec![offset, length])]),
        ));
    }

    let raw = pickle::dumps(&Value::Dict(pairs), protocol)?;
    Ok(codec::deflate(&raw)?)
}

fn int_value(path: &str, v: u64) -> Result<Value, IndexError> {
    let v = i64::try_from(v).map_err(|_| IndexError::BadEntry {
        path: path.to_owned(),
        problem: "offset or length exceeds the signed 64-bit range".to_owned(),
    })?;
    Ok(Value::Int(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(String, IndexEntry)> {
        vec![
            ("a.txt".to_owned(), IndexEntry::new(0x2A, 5)),
            ("b/c.bin".to_owned(), IndexEntry::new(0x4C, 3)),
        ]
    }

    #[test]
    fn roundtrip_unkeyed() {
        let packed = encode_index(&sample(), 0, 2).unwrap();
        let index = decode_index(&packed, 0).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a.txt"), Some(&IndexEntry::new(0x2A, 5)));
        assert_eq!(index.get("b/c.bin"), Some(&IndexEntry::new(0x4C, 3)));
        assert_eq!(index.paths().collect::<Vec<_>>(), vec!["a.txt", "b/c.bin"]);
    }

    #[test]
    fn roundtrip_keyed() {
        for key in [0x42u32, 0xDEAD_BEEF] {
            let packed = encode_index(&sample(), key, 2).unwrap();
            let index = decode_index(&packed, key).unwrap();
            assert_eq!(index.get("a.txt"), Some(&IndexEntry::new(0x2A, 5)), "key {key:#x}");
        }
    }

    #[test]
    fn stored_values_are_masked() {
        let entries = vec![("m".to_owned(), IndexEntry::new(0x0102_0304, 0x05))];
        let packed = encode_index(&entries, 0x42, 2).unwrap();

        let raw = crate::codec::inflate(&packed).unwrap();
        let root = crate::pickle::loads(&raw).unwrap();
        let segment = root.dict_get("m").unwrap().as_sequence().unwrap()[0]
            .as_tuple()
            .unwrap()
            .to_vec();
        assert_eq!(segment[0], Value::Int(0x0102_0346));
        assert_eq!(segment[1], Value::Int(0x47));

        let index = decode_index(&packed, 0x42).unwrap();
        assert_eq!(index.get("m"), Some(&IndexEntry::new(0x0102_0304, 0x05)));
    }

    #[test]
    fn mask_touches_low_32_bits_only() {
        // A foreign archive may carry offsets past 32 bits; the mask
        // must leave the high half alone.
        let stored = 0x0001_0000_0000_2A00u64;
        let key = 0xFFFF_FFFFu32;
        let entries = vec![("big".to_owned(), IndexEntry::new(stored, 4))];
        let packed = encode_index(&entries, 0, 2).unwrap();
        let index = decode_index(&packed, key).unwrap();
        let got = index.get("big").unwrap();
        assert_eq!(got.offset, stored ^ u64::from(key));
        assert_eq!(got.offset >> 32, stored >> 32);
    }

    #[test]
    fn junk_prefix_recovered() {
        let packed = encode_index(&sample(), 0, 2).unwrap();
        let mut region = vec![0xA5u8; 17];
        region.extend_from_slice(&packed);
        let index = decode_index(&region, 0).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn junk_at_exact_budget_recovered() {
        let packed = encode_index(&sample(), 0, 2).unwrap();
        let mut region = vec![0xA5u8; JUNK_SCAN_LIMIT];
        region.extend_from_slice(&packed);
        assert_eq!(decode_index(&region, 0).unwrap().len(), 2);
    }

    #[test]
    fn junk_past_budget_fails() {
        let packed = encode_index(&sample(), 0, 2).unwrap();
        let mut region = vec![0xA5u8; JUNK_SCAN_LIMIT + 1];
        region.extend_from_slice(&packed);
        assert!(matches!(
            decode_index(&region, 0),
            Err(IndexError::NoCompressedData { .. })
        ));
    }

    #[test]
    fn three_tuple_prefix_accepted() {
        // Hand-build a pickle with the 3-tuple form the writer never
        // emits: {"p": [(2, 3, b"AB")]}.
        let root = Value::Dict(vec![(
            Value::Str("p".into()),
            Value::List(vec![Value::Tuple(vec![
                Value::Int(2),
                Value::Int(3),
                Value::Bytes(b"AB".to_vec()),
            ])]),
        )]);
        let packed = crate::codec::deflate(&crate::pickle::dumps(&root, 4).unwrap()).unwrap();
        let index = decode_index(&packed, 0).unwrap();
        let entry = index.get("p").unwrap();
        assert_eq!(entry.prefix, b"AB");
        assert_eq!(entry.member_len(), 5);
    }

    #[test]
    fn latin1_string_prefix_accepted() {
        // Protocol-2 pickles from Python 2 spell the prefix as a str.
        let root = Value::Dict(vec![(
            Value::Str("p".into()),
            Value::List(vec![Value::Tuple(vec![
                Value::Int(2),
                Value::Int(3),
                Value::Bytes(vec![0xC3, 0x28]),
            ])]),
        )]);
        let packed = crate::codec::deflate(&crate::pickle::dumps(&root, 2).unwrap()).unwrap();
        let index = decode_index(&packed, 0).unwrap();
        assert_eq!(index.get("p").unwrap().prefix, vec![0xC3, 0x28]);
    }

    #[test]
    fn bad_shapes_rejected() {
        let cases = [
            Value::List(vec![]),
            Value::Dict(vec![(Value::Int(1), Value::List(vec![]))]),
            Value::Dict(vec![(Value::Str("x".into()), Value::List(vec![]))]),
            Value::Dict(vec![(
                Value::Str("x".into()),
                Value::List(vec![Value::Tuple(vec![Value::Int(1)])]),
            )]),
            Value::Dict(vec![(
                Value::Str("x".into()),
                Value::List(vec![Value::Tuple(vec![
                    Value::Str("not an int".into()),
                    Value::Int(1),
                ])]),
            )]),
        ];
        for root in cases {
            let packed =
                crate::codec::deflate(&crate::pickle::dumps(&root, 4).unwrap()).unwrap();
            assert!(decode_index(&packed, 0).is_err(), "{root:?}");
        }
    }

    #[test]
    fn bounds_validation() {
        let packed = encode_index(&sample(), 0, 2).unwrap();
        let index = decode_index(&packed, 0).unwrap();
        assert!(index.validate_bounds(0x100).is_ok());
        assert!(matches!(
            index.validate_bounds(0x2B),
            Err(IndexError::OutOfBounds { .. })
        ));
    }
}
