//! Small filesystem helpers shared by the writer, manifest emitter and
//! coordinator. Kept deliberately tiny: this is not a general utility crate.

use anyhow::{bail, Error};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Write `data` to `path` via a temporary file plus atomic rename, so that a
/// reader never observes a partially written file.
///
/// The temporary file lives next to `path` (same directory, same filesystem)
/// so the final rename is atomic on POSIX filesystems.
pub fn atomic_write<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut tmp_path = path.to_owned();
    tmp_path.set_extension(format!("tmp_{}_{}", pid, nanos));

    let mut file = File::create(&tmp_path)
        .map_err(|err| anyhow::anyhow!("unable to create {:?} - {}", tmp_path, err))?;

    if let Err(err) = file.write_all(data) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("write failed for {:?} - {}", tmp_path, err);
    }

    if let Err(err) = file.sync_all() {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("fsync failed for {:?} - {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("atomic rename failed for {:?} - {}", path, err);
    }

    Ok(())
}

/// `true` if `dir` exists and contains no entries.
pub fn dir_is_empty<P: AsRef<Path>>(dir: P) -> Result<bool, Error> {
    let mut entries = std::fs::read_dir(dir.as_ref())
        .map_err(|err| anyhow::anyhow!("unable to read directory {:?} - {}", dir.as_ref(), err))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atomic_write_creates_final_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        atomic_write(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
        // no leftover temp files
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != path)
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn dir_is_empty_detects_contents() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dir_is_empty(dir.path()).unwrap());
        std::fs::write(dir.path().join("x"), b"x").unwrap();
        assert!(!dir_is_empty(dir.path()).unwrap());
    }
}
