//! Byte I/O surface.
//!
//! The codec layers above work on whole in-memory buffers; this module is
//! the only place that touches the filesystem.  Output files are written
//! to a temporary sibling first and renamed into place, so a failed write
//! never clobbers an existing archive.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Read an entire file into memory.
pub fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Write `data` to `path` atomically: temp file in the same directory,
/// fsync, then rename.  The rename is the commit point.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(d) => NamedTempFile::new_in(d)?,
        None => NamedTempFile::new_in(".")?,
    };
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Derive the sidecar index path for a family-1 archive: replace a
/// recognised `.rpa` suffix (case-insensitive) with `.rpi`, or append
/// `.rpi` when no such suffix is present.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let ext_is_rpa = archive
        .extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case("rpa"))
        .unwrap_or(false);

    if ext_is_rpa {
        archive.with_extension("rpi")
    } else {
        let mut s = archive.as_os_str().to_owned();
        s.push(".rpi");
        PathBuf::from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_replaces_rpa_suffix() {
        assert_eq!(sidecar_path(Path::new("game/archive.rpa")), PathBuf::from("game/archive.rpi"));
        assert_eq!(sidecar_path(Path::new("ARCHIVE.RPA")), PathBuf::from("ARCHIVE.rpi"));
    }

    #[test]
    fn sidecar_appends_when_no_suffix() {
        assert_eq!(sidecar_path(Path::new("data.bin")), PathBuf::from("data.bin.rpi"));
        assert_eq!(sidecar_path(Path::new("data")), PathBuf::from("data.rpi"));
    }
}
