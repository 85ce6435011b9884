//! Archive header codec.
//!
//! The header is one newline-terminated text line at byte 0.  Its first
//! whitespace-delimited token names the family; later tokens carry the
//! hex-encoded index offset (families ≥ 2) and XOR key (families ≥ 3).
//! Family-1 archives have no header at all and keep their index in a
//! sidecar file.

use thiserror::Error;

/// Headers never exceed this many bytes; parsing stops at the first
/// newline or here, whichever comes first.
pub const MAX_HEADER_SCAN: usize = 50;

/// Factory-default XOR key for the keyed families.
pub const DEFAULT_KEY: u32 = 0xDEAD_BEEF;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("unknown archive family {0:?}")]
    UnknownFamily(String),
    #[error("family {family} requires an index offset token")]
    MissingOffset { family: &'static str },
    #[error("family {family} requires a key token")]
    MissingKey { family: &'static str },
    #[error("bad hex in {what} token: {token:?}")]
    BadHex { what: &'static str, token: String },
    #[error("header line is not newline-terminated")]
    Unterminated,
}

/// A header-compatibility family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// `RPA-1.0` (also spelled `RPA-1`): no header line, sidecar index.
    V1,
    /// `RPA-2.0`: embedded index, no key.
    V2,
    /// `RPA-3.0`: embedded index, XOR-masked offsets and lengths.
    V3,
    /// `RPA-3.2`: tag differs from 3.0, byte layout identical.
    V3_2,
    /// `RPA-4.0`: 3.x layout, newer pickle protocol by default.
    V4,
}

impl Version {
    pub fn tag(self) -> &'static str {
        match self {
            Version::V1 => "RPA-1.0",
            Version::V2 => "RPA-2.0",
            Version::V3 => "RPA-3.0",
            Version::V3_2 => "RPA-3.2",
            Version::V4 => "RPA-4.0",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Version> {
        match tag {
            "RPA-1.0" | "RPA-1" => Some(Version::V1),
            "RPA-2.0" => Some(Version::V2),
            "RPA-3.0" => Some(Version::V3),
            "RPA-3.2" => Some(Version::V3_2),
            "RPA-4.0" => Some(Version::V4),
            _ => None,
        }
    }

    /// Whether segment offsets and lengths are XOR-masked in the index.
    pub fn has_key(self) -> bool {
        matches!(self, Version::V3 | Version::V3_2 | Version::V4)
    }

    /// Whether the index lives inside the archive (false: sidecar file).
    pub fn embeds_index(self) -> bool {
        !matches!(self, Version::V1)
    }

    /// Whether marker padding may be written before payloads.
    pub fn allows_marker(self) -> bool {
        self.has_key()
    }

    pub fn default_key(self) -> Option<u32> {
        self.has_key().then_some(DEFAULT_KEY)
    }

    pub fn default_pickle_protocol(self) -> u8 {
        match self {
            Version::V4 => 4,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub version: Version,
    /// Byte offset of the compressed index; zero for family-1.
    pub offset: u64,
    /// XOR key; zero for families without one.
    pub key: u32,
    /// The header line exactly as read, without the newline.  Empty for
    /// headerless archives.
    pub raw_line: String,
}

impl Header {
    pub fn new(version: Version, offset: u64, key: u32) -> Self {
        Self { version, offset, key, raw_line: String::new() }
    }

    /// Parse a header from the start of an archive buffer.
    ///
    /// A first token that does not begin with `RPA-` (or an archive too
    /// short to hold one) falls back to family-1 with a zero offset:
    /// attempting sidecar resolution is cheaper than erroring out on the
    /// legacy headerless archives.
    pub fn parse(data: &[u8]) -> Result<Header, HeaderError> {
        let scan = &data[..data.len().min(MAX_HEADER_SCAN)];
        let line = match scan.iter().position(|&b| b == b'\n') {
            Some(nl) => &scan[..nl],
            None if scan.starts_with(b"RPA-") => return Err(HeaderError::Unterminated),
            None => {
                log::debug!("no header line found, assuming a family-1 sidecar archive");
                return Ok(Header::new(Version::V1, 0, 0));
            }
        };

        let line = String::from_utf8_lossy(line).into_owned();
        let mut tokens = line.split_ascii_whitespace();

        let tag = match tokens.next() {
            Some(t) if t.starts_with("RPA-") => t,
            _ => {
                log::debug!("first token is not an RPA tag, assuming a family-1 sidecar archive");
                return Ok(Header::new(Version::V1, 0, 0));
            }
        };

        let version = Version::from_tag(tag)
            .ok_or_else(|| HeaderError::UnknownFamily(tag.to_owned()))?;

        let mut header = Header { version, offset: 0, key: 0, raw_line: line.clone() };
        if !version.embeds_index() {
            return Ok(header);
        }

        let offset_tok = tokens
            .next()
            .ok_or(HeaderError::MissingOffset { family: version.tag() })?;
        header.offset = u64::from_str_radix(offset_tok, 16).map_err(|_| HeaderError::BadHex {
            what: "offset",
            token: offset_tok.to_owned(),
        })?;

        if version.has_key() {
            let key_tok = tokens
                .next()
                .ok_or(HeaderError::MissingKey { family: version.tag() })?;
            header.key = u32::from_str_radix(key_tok, 16).map_err(|_| HeaderError::BadHex {
                what: "key",
                token: key_tok.to_owned(),
            })?;
        }

        Ok(header)
    }

    /// Render the header line, newline included.  Family-1 renders
    /// nothing; those archives are payload-only.
    ///
    /// The hex widths are fixed, so the emitted length depends only on
    /// the family; the writer relies on this to reserve a placeholder it
    /// can patch once the index offset is known.
    pub fn emit(&self) -> Vec<u8> {
        match self.version {
            Version::V1 => Vec::new(),
            Version::V2 => format!("{} {:016X}\n", self.version.tag(), self.offset).into_bytes(),
            Version::V3 | Version::V3_2 | Version::V4 => format!(
                "{} {:016X} {:08X}\n",
                self.version.tag(),
                self.offset,
                self.key
            )
            .into_bytes(),
        }
    }

    /// Byte length of [`Header::emit`] for a family, independent of the
    /// offset and key values.
    pub fn emitted_len(version: Version) -> usize {
        match version {
            Version::V1 => 0,
            Version::V2 => "RPA-2.0 ".len() + 16 + 1,
            Version::V3 | Version::V3_2 | Version::V4 => "RPA-3.0 ".len() + 16 + 1 + 8 + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_family_3() {
        let h = Header::parse(b"RPA-3.0 000000000000002A DEADBEEF\npayload").unwrap();
        assert_eq!(h.version, Version::V3);
        assert_eq!(h.offset, 0x2A);
        assert_eq!(h.key, 0xDEAD_BEEF);
        assert_eq!(h.raw_line, "RPA-3.0 000000000000002A DEADBEEF");
    }

    #[test]
    fn parse_family_2_without_key() {
        let h = Header::parse(b"RPA-2.0 0000000000000100\n").unwrap();
        assert_eq!(h.version, Version::V2);
        assert_eq!(h.offset, 0x100);
        assert_eq!(h.key, 0);
    }

    #[test]
    fn whitespace_runs_between_tokens() {
        let h = Header::parse(b"RPA-3.0   000000000000002A\t\tDEADBEEF\n").unwrap();
        assert_eq!(h.offset, 0x2A);
        assert_eq!(h.key, 0xDEAD_BEEF);
    }

    #[test]
    fn legacy_v1_spellings() {
        assert_eq!(Header::parse(b"RPA-1\n").unwrap().version, Version::V1);
        assert_eq!(Header::parse(b"RPA-1.0\n").unwrap().version, Version::V1);
    }

    #[test]
    fn non_rpa_line_falls_back_to_v1() {
        let h = Header::parse(b"GIF89a and other leading junk\n").unwrap();
        assert_eq!(h.version, Version::V1);
        assert_eq!(h.offset, 0);
    }

    #[test]
    fn headerless_buffer_falls_back_to_v1() {
        let h = Header::parse(&[0u8; 8]).unwrap();
        assert_eq!(h.version, Version::V1);
    }

    #[test]
    fn missing_offset_fails() {
        assert!(matches!(
            Header::parse(b"RPA-3.0\n"),
            Err(HeaderError::MissingOffset { .. })
        ));
    }

    #[test]
    fn non_hex_offset_fails() {
        assert!(matches!(
            Header::parse(b"RPA-2.0 00000000000000ZZ\n"),
            Err(HeaderError::BadHex { what: "offset", .. })
        ));
    }

    #[test]
    fn unknown_family_fails() {
        assert!(matches!(
            Header::parse(b"RPA-9.9 0000000000000000\n"),
            Err(HeaderError::UnknownFamily(_))
        ));
    }

    #[test]
    fn emit_width_matches_reserved_width() {
        for version in [Version::V2, Version::V3, Version::V3_2, Version::V4] {
            for offset in [0u64, 0x2A, u64::MAX] {
                let h = Header::new(version, offset, 0xDEAD_BEEF);
                assert_eq!(h.emit().len(), Header::emitted_len(version), "{version:?}");
            }
        }
        assert!(Header::new(Version::V1, 0, 0).emit().is_empty());
    }

    #[test]
    fn emit_family_3_shape() {
        let h = Header::new(Version::V3, 0x2A, 0x42);
        assert_eq!(h.emit(), b"RPA-3.0 000000000000002A 00000042\n");
    }
}
