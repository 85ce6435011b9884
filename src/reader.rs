//! Archive reader: random-access member reads and bulk extraction.
//!
//! ```no_run
//! use renpak::reader::RpaReader;
//!
//! let mut ar = RpaReader::open("game/archive.rpa")?;
//! for path in ar.list_paths()? {
//!     println!("{path}");
//! }
//! let data = ar.read_member("script.rpyc")?;
//! # Ok::<(), renpak::ArchiveError>(())
//! ```
//!
//! The whole archive is buffered in memory; the header and index are
//! parsed on first use and memoised, and are never mutated afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{ArchiveError, DecompileError, Result};
use crate::header::Header;
use crate::index::{self, Index, IndexError};
use crate::io::{read_file, sidecar_path};

/// External decompiler collaborator: a pure `bytes → bytes` function.
pub type DecompileFn = dyn Fn(&[u8]) -> std::result::Result<Vec<u8>, DecompileError>;

// ── Progress ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Decompile,
    Complete,
}

impl Stage {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Decompile => "decompile",
            Stage::Complete => "complete",
        }
    }
}

/// One progress event.  Stages arrive in declaration order; `current`
/// only grows within a stage and `total` is fixed at stage entry.  The
/// callback is one-way; it cannot steer or cancel the operation.
#[derive(Debug, Clone)]
pub struct Progress {
    pub stage: Stage,
    pub current: u64,
    pub total: u64,
    pub message: String,
}

/// Aggregate counts returned by [`RpaReader::extract_all`].
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: usize,
    /// One [`ArchiveError::UnsafePath`] per member refused by path
    /// hardening; those members are skipped, never written.
    pub refused: Vec<ArchiveError>,
    pub decompiled: usize,
    /// Per-member decompiler failures; these never abort the run.
    pub decompile_failed: usize,
}

impl ExtractReport {
    /// Number of members refused by path hardening.
    pub fn skipped_unsafe(&self) -> usize {
        self.refused.len()
    }
}

/// Lightweight descriptor for inspectors and listings.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub prefix_len: usize,
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct RpaReader {
    path: PathBuf,
    data: Vec<u8>,
    header: Option<Header>,
    index: Option<Index>,
}

impl RpaReader {
    /// Open an archive, buffering it whole.  Header and index are not
    /// touched until first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let data = read_file(&path)?;
        Ok(Self { path, data, header: None, index: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive file length in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parse the header (memoised).
    pub fn header(&mut self) -> Result<Header> {
        if self.header.is_none() {
            self.header = Some(Header::parse(&self.data)?);
        }
        match &self.header {
            Some(h) => Ok(h.clone()),
            None => unreachable!("header memoised above"),
        }
    }

    /// Decode the index (memoised).  For family-1 the sidecar file is
    /// read here; a missing sidecar surfaces as the I/O error it is.
    pub fn index(&mut self) -> Result<&Index> {
        if self.index.is_none() {
            let header = self.header()?;

            let region: Vec<u8> = if header.version.embeds_index() {
                let archive_len = self.data.len() as u64;
                if header.offset >= archive_len {
                    return Err(IndexError::OffsetOutOfFile {
                        offset: header.offset,
                        archive_len,
                    }
                    .into());
                }
                self.data[header.offset as usize..].to_vec()
            } else {
                read_file(&sidecar_path(&self.path))?
            };

            let idx = index::decode_index(&region, header.key)?;
            idx.validate_bounds(self.data.len() as u64)?;
            self.index = Some(idx);
        }
        match &self.index {
            Some(idx) => Ok(idx),
            None => unreachable!("index memoised above"),
        }
    }

    /// Member paths in pickle insertion order.
    pub fn list_paths(&mut self) -> Result<Vec<String>> {
        Ok(self.index()?.paths().map(str::to_owned).collect())
    }

    /// Entry descriptors in pickle insertion order.
    pub fn entries(&mut self) -> Result<Vec<EntryInfo>> {
        Ok(self
            .index()?
            .iter()
            .map(|(path, e)| EntryInfo {
                path: path.to_owned(),
                offset: e.offset,
                length: e.length,
                prefix_len: e.prefix.len(),
            })
            .collect())
    }

    /// Descriptor for a single member.
    pub fn entry(&mut self, path: &str) -> Result<EntryInfo> {
        let entry = self
            .index()?
            .get(path)
            .ok_or_else(|| ArchiveError::NotFound(path.to_owned()))?;
        Ok(EntryInfo {
            path: path.to_owned(),
            offset: entry.offset,
            length: entry.length,
            prefix_len: entry.prefix.len(),
        })
    }

    /// Read one member: optional prefix bytes, then the payload range.
    pub fn read_member(&mut self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .index()?
            .get(path)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(path.to_owned()))?;

        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        let mut out = Vec::with_capacity(entry.member_len() as usize);
        out.extend_from_slice(&entry.prefix);
        out.extend_from_slice(&self.data[start..end]);
        Ok(out)
    }

    /// Extract one member to an explicit destination path, creating
    /// parent directories as needed.  Returns whether a file was written.
    pub fn extract_one(&mut self, path: &str, dest: &Path) -> Result<bool> {
        let data = self.read_member(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, data)?;
        Ok(true)
    }

    /// Extract every member under `dest_dir`.
    ///
    /// Unsafe logical paths are never written; each one is skipped and
    /// surfaced as an [`ArchiveError::UnsafePath`] on the report.  When a
    /// decompiler is supplied, extracted `.rpyc` members get a sibling
    /// `.rpy` in a second stage; decompiler failures are counted per
    /// member and do not abort the run.  I/O errors abort immediately.
    pub fn extract_all(
        &mut self,
        dest_dir: &Path,
        decompile: Option<&DecompileFn>,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<ExtractReport> {
        let paths = self.list_paths()?;
        let mut report = ExtractReport::default();
        let mut written: Vec<(String, PathBuf)> = Vec::new();

        let total = paths.len() as u64;
        on_progress(Progress {
            stage: Stage::Extract,
            current: 0,
            total,
            message: String::new(),
        });

        for (i, path) in paths.iter().enumerate() {
            match sanitize_member_path(path) {
                Some(rel) => {
                    let target = dest_dir.join(rel);
                    let data = self.read_member(path)?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, data)?;
                    report.extracted += 1;
                    written.push((path.clone(), target));
                }
                None => {
                    warn!("refusing unsafe member path {path:?}");
                    report.refused.push(ArchiveError::UnsafePath(path.clone()));
                }
            }
            on_progress(Progress {
                stage: Stage::Extract,
                current: (i + 1) as u64,
                total,
                message: path.clone(),
            });
        }

        if let Some(decompile) = decompile {
            let scripts: Vec<(String, PathBuf)> = written
                .into_iter()
                .filter(|(path, _)| path.ends_with(".rpyc"))
                .collect();

            let total = scripts.len() as u64;
            on_progress(Progress {
                stage: Stage::Decompile,
                current: 0,
                total,
                message: String::new(),
            });

            for (i, (path, target)) in scripts.iter().enumerate() {
                let bytes = self.read_member(path)?;
                match decompile(&bytes) {
                    Ok(source) => {
                        fs::write(target.with_extension("rpy"), source)?;
                        report.decompiled += 1;
                    }
                    Err(e) => {
                        warn!("decompile failed for {path}: {e}");
                        report.decompile_failed += 1;
                    }
                }
                on_progress(Progress {
                    stage: Stage::Decompile,
                    current: (i + 1) as u64,
                    total,
                    message: path.clone(),
                });
            }
        }

        on_progress(Progress {
            stage: Stage::Complete,
            current: 1,
            total: 1,
            message: format!("{} members extracted", report.extracted),
        });
        Ok(report)
    }
}

/// Map a logical member path to a relative filesystem path, or refuse it.
///
/// Absolute roots, `..` segments, and segments carrying separator or
/// drive characters for other platforms are all rejected, so extraction
/// can never escape the destination directory.
fn sanitize_member_path(logical: &str) -> Option<PathBuf> {
    if logical.is_empty() || logical.starts_with('/') {
        return None;
    }
    let mut out = PathBuf::new();
    for seg in logical.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg == ".." || seg.contains('\\') || seg.contains(':') || seg.contains('\0') {
            return None;
        }
        out.push(seg);
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sane_paths_pass() {
        assert_eq!(sanitize_member_path("a.txt"), Some(PathBuf::from("a.txt")));
        assert_eq!(
            sanitize_member_path("b/c/d.bin"),
            Some(PathBuf::from("b/c/d.bin"))
        );
        // Redundant separators and dot segments collapse.
        assert_eq!(
            sanitize_member_path("b//./c.bin"),
            Some(PathBuf::from("b/c.bin"))
        );
    }

    #[test]
    fn traversal_refused() {
        assert_eq!(sanitize_member_path("../etc/passwd"), None);
        assert_eq!(sanitize_member_path("a/../../b"), None);
        assert_eq!(sanitize_member_path("/etc/passwd"), None);
        assert_eq!(sanitize_member_path("a\\..\\b"), None);
        assert_eq!(sanitize_member_path("C:evil"), None);
        assert_eq!(sanitize_member_path(""), None);
        assert_eq!(sanitize_member_path("././"), None);
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Extract.as_str(), "extract");
        assert_eq!(Stage::Decompile.as_str(), "decompile");
        assert_eq!(Stage::Complete.as_str(), "complete");
    }
}
