//! Archive writer: one-shot layout and atomic emission.
//!
//! ```no_run
//! use renpak::writer::{pack_dir, PackOptions};
//!
//! let opts = PackOptions::default();
//! let summary = pack_dir("game/".as_ref(), "out.rpa".as_ref(), &opts)?;
//! println!("packed {} members", summary.members);
//! # Ok::<(), renpak::ArchiveError>(())
//! ```
//!
//! The layout is computed in a single pass: a fixed-width header
//! placeholder, then each payload (optionally preceded by marker
//! padding), then the compressed index.  The header is patched in once
//! the index offset is known, the patch width is verified, and the
//! finished buffer is written through a temp file and renamed into
//! place.  Nothing touches the destination until every check has passed.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::header::{Header, Version};
use crate::index::{encode_index, IndexEntry};
use crate::io::{atomic_write, read_file, sidecar_path};

/// Marker padding written before each payload when enabled.  The bytes
/// are part of the archive but never referenced by the index.
pub const MARKER: &[u8; 17] = b"Made with Ren'Py.";

// ── Options ──────────────────────────────────────────────────────────────────

/// Configuration for [`write_archive`] and [`pack_dir`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Target family; controls XOR masking, sidecar vs embedded index,
    /// and the default key and pickle protocol.
    pub version: Version,
    /// Override the family's default XOR key.  Refused for families
    /// without one.
    pub key: Option<u32>,
    /// Override the family's default pickle protocol (2 or 4).
    pub pickle_protocol: Option<u8>,
    /// Write marker padding before each payload (families ≥ 3 only).
    pub marker: bool,
    /// Include directory entries whose name begins with `.`.
    pub include_hidden: bool,
    /// Overwrite an existing output file.
    pub force: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            version: Version::V3,
            key: None,
            pickle_protocol: None,
            marker: false,
            include_hidden: false,
            force: false,
        }
    }
}

/// One input file queued for packing.
#[derive(Debug, Clone)]
pub struct PendingFile {
    /// Logical member path, forward-slash separated.
    pub path: String,
    pub data: Vec<u8>,
}

impl PendingFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self { path: path.into(), data: data.into() }
    }
}

/// What a pack run produced.
#[derive(Debug, Clone, Copy)]
pub struct PackSummary {
    pub members: usize,
    pub payload_bytes: u64,
    pub index_bytes: u64,
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Write an archive from in-memory members, in input order.
pub fn write_archive(output: &Path, files: &[PendingFile], opts: &PackOptions) -> Result<PackSummary> {
    if files.is_empty() {
        return Err(ArchiveError::EmptyInput);
    }

    let version = opts.version;
    if opts.key.is_some() && !version.has_key() {
        return Err(ArchiveError::Unsupported(format!(
            "family {} does not use an XOR key",
            version.tag()
        )));
    }
    if opts.marker && !version.allows_marker() {
        return Err(ArchiveError::Unsupported(format!(
            "family {} does not allow marker padding",
            version.tag()
        )));
    }

    let protocol = opts.pickle_protocol.unwrap_or(version.default_pickle_protocol());
    let key = opts.key.or(version.default_key()).unwrap_or(0);

    reject_colliding_paths(files)?;

    if output.exists() && !opts.force {
        return Err(ArchiveError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists (use force to overwrite)", output.display()),
        )));
    }

    // Single-pass layout into one buffer: placeholder, payloads, index.
    let header_len = Header::emitted_len(version);
    let mut out = vec![0u8; header_len];
    let mut entries: Vec<(String, IndexEntry)> = Vec::with_capacity(files.len());
    let mut payload_bytes = 0u64;

    for file in files {
        if opts.marker {
            out.extend_from_slice(MARKER);
        }
        let offset = out.len() as u64;
        out.extend_from_slice(&file.data);
        payload_bytes += file.data.len() as u64;
        entries.push((file.path.clone(), IndexEntry::new(offset, file.data.len() as u64)));
    }

    let index_offset = out.len() as u64;

    // Masked families store offsets and lengths as 32-bit quantities.
    // The mask saturates rather than truncates: refuse oversized layouts
    // before anything reaches disk.
    if version.has_key() {
        for (path, entry) in &entries {
            if entry.offset > u64::from(u32::MAX) || entry.length > u64::from(u32::MAX) {
                return Err(ArchiveError::LayoutMismatch(format!(
                    "member {path:?} needs offsets past 32 bits, which family {} cannot store",
                    version.tag()
                )));
            }
        }
    }

    let index_data = encode_index(&entries, key, protocol)?;
    let index_bytes = index_data.len() as u64;
    out.extend_from_slice(&index_data);

    // Patch the placeholder now that the index offset is known.
    let line = Header::new(version, index_offset, key).emit();
    if line.len() != header_len {
        return Err(ArchiveError::LayoutMismatch(format!(
            "header takes {} bytes but {} were reserved",
            line.len(),
            header_len
        )));
    }
    out[..header_len].copy_from_slice(&line);

    if version.embeds_index() {
        atomic_write(output, &out)?;
    } else {
        // Family-1: payloads only in the archive, index in the sidecar.
        let payload_end = index_offset as usize;
        atomic_write(output, &out[..payload_end])?;
        atomic_write(&sidecar_path(output), &index_data)?;
    }

    Ok(PackSummary { members: files.len(), payload_bytes, index_bytes })
}

/// Package a directory (or a single file) into an archive.
///
/// Directory members are collected recursively, hidden entries are
/// filtered unless requested, and logical paths are the input-relative
/// paths with forward slashes, sorted by path bytes.
pub fn pack_dir(input: &Path, output: &Path, opts: &PackOptions) -> Result<PackSummary> {
    let mut collected: Vec<(String, PathBuf)> = Vec::new();

    if input.is_file() {
        let logical = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ArchiveError::Io(io::Error::new(io::ErrorKind::InvalidInput, "input has no file name"))
            })?;
        collected.push((logical, input.to_owned()));
    } else {
        for entry in WalkDir::new(input).follow_links(false) {
            let entry = entry.map_err(walkdir_io)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(input) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if !opts.include_hidden && has_hidden_component(rel) {
                continue;
            }
            let logical = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if logical.is_empty() {
                continue;
            }
            collected.push((logical, entry.path().to_owned()));
        }
    }

    collected.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    if collected.is_empty() {
        return Err(ArchiveError::EmptyInput);
    }

    let mut files = Vec::with_capacity(collected.len());
    for (logical, physical) in collected {
        files.push(PendingFile { path: logical, data: read_file(&physical)? });
    }

    write_archive(output, &files, opts)
}

fn has_hidden_component(rel: &Path) -> bool {
    rel.components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

fn walkdir_io(e: walkdir::Error) -> ArchiveError {
    let msg = e.to_string();
    ArchiveError::Io(
        e.into_io_error()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg)),
    )
}

/// Archives are case-sensitive, but the output should survive a
/// case-insensitive filesystem; colliding inputs are refused outright.
fn reject_colliding_paths(files: &[PendingFile]) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::with_capacity(files.len());
    for file in files {
        let folded = file.path.to_lowercase();
        if let Some(previous) = seen.insert(folded, file.path.as_str()) {
            let problem = if previous == file.path {
                format!("duplicate logical path {:?}", file.path)
            } else {
                format!(
                    "paths {:?} and {:?} collide on case-insensitive filesystems",
                    previous, file.path
                )
            };
            return Err(ArchiveError::LayoutMismatch(problem));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(path: &str) -> PendingFile {
        PendingFile::new(path, b"data".to_vec())
    }

    #[test]
    fn key_refused_for_unkeyed_family() {
        let opts = PackOptions {
            version: Version::V2,
            key: Some(0x42),
            ..PackOptions::default()
        };
        let err = write_archive(Path::new("/nonexistent/out.rpa"), &[member("a")], &opts);
        assert!(matches!(err, Err(ArchiveError::Unsupported(_))));
    }

    #[test]
    fn marker_refused_below_family_3() {
        for version in [Version::V1, Version::V2] {
            let opts = PackOptions { version, marker: true, ..PackOptions::default() };
            let err = write_archive(Path::new("/nonexistent/out.rpa"), &[member("a")], &opts);
            assert!(matches!(err, Err(ArchiveError::Unsupported(_))), "{version:?}");
        }
    }

    #[test]
    fn empty_input_refused() {
        let err = write_archive(Path::new("/nonexistent/out.rpa"), &[], &PackOptions::default());
        assert!(matches!(err, Err(ArchiveError::EmptyInput)));
    }

    #[test]
    fn duplicate_paths_refused() {
        let files = [member("a.txt"), member("a.txt")];
        let err = write_archive(Path::new("/nonexistent/out.rpa"), &files, &PackOptions::default());
        assert!(matches!(err, Err(ArchiveError::LayoutMismatch(_))));
    }

    #[test]
    fn case_collisions_refused() {
        let files = [member("Readme.TXT"), member("readme.txt")];
        let err = write_archive(Path::new("/nonexistent/out.rpa"), &files, &PackOptions::default());
        assert!(matches!(err, Err(ArchiveError::LayoutMismatch(_))));
    }

    #[test]
    fn hidden_components_detected() {
        assert!(has_hidden_component(Path::new(".git/config")));
        assert!(has_hidden_component(Path::new("a/.hidden")));
        assert!(!has_hidden_component(Path::new("a/visible.txt")));
    }
}
