//! Staged file writes.
//!
//! Final pipeline artifacts (Parquet files, DuckDB databases, cache blobs,
//! settings files) are produced under a hidden staging name in the
//! destination directory and only renamed into place once complete, so
//! readers never observe a partial file. `StagedWrite` owns the staging
//! path: dropping it without committing removes the staged file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

// Distinguishes staged files from concurrent writers in the same process;
// the random component covers writers in other processes.
static STAGE_SEQ: AtomicU32 = AtomicU32::new(0);

/// An in-progress write to `dest`, staged as a hidden sibling file.
#[derive(Debug)]
pub struct StagedWrite {
    staging: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedWrite {
    /// Start a staged write, creating the destination's parent directories.
    ///
    /// The staging file lives in the same directory as `dest` (renames must
    /// not cross filesystems) under the name `.wip-<seq><rand>-<filename>`.
    pub fn begin(dest: &Path) -> io::Result<Self> {
        let filename = dest
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no file name in {}", dest.display()),
                )
            })?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tag: u32 = rand::random();
        let staging = dest.with_file_name(format!(".wip-{:04x}{:08x}-{}", seq, tag, filename));
        Ok(Self {
            staging,
            dest: dest.to_path_buf(),
            committed: false,
        })
    }

    /// Path to write the staged content to.
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Rename the staged file over the destination.
    ///
    /// Returns false when another writer finished first on a platform where
    /// rename refuses to replace; the staged copy is discarded in that case,
    /// which is the right outcome for content-addressed files.
    pub fn commit(mut self) -> io::Result<bool> {
        self.committed = true;
        match fs::rename(&self.staging, &self.dest) {
            Ok(()) => Ok(true),
            Err(e) => {
                let lost_race = e.kind() == io::ErrorKind::AlreadyExists;
                let _ = fs::remove_file(&self.staging);
                if lost_race {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.staging);
        }
    }
}

/// Write content to a file through a staged sibling.
pub fn write_file(dest: &Path, content: &[u8]) -> io::Result<bool> {
    let staged = StagedWrite::begin(dest)?;
    fs::write(staged.staging_path(), content)?;
    staged.commit()
}

/// Serialize a value as pretty JSON and write it through a staged sibling.
pub fn write_json<T: serde::Serialize>(dest: &Path, value: &T) -> io::Result<bool> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');
    write_file(dest, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staging_name_is_a_hidden_sibling() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("cdx-00000.gz.parquet");

        let staged = StagedWrite::begin(&dest).unwrap();
        let staging = staged.staging_path().to_path_buf();

        assert_eq!(staging.parent(), dest.parent());
        let name = staging.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".wip-"));
        assert!(name.ends_with("-cdx-00000.gz.parquet"));

        // Two stages for the same destination never collide.
        let other = StagedWrite::begin(&dest).unwrap();
        assert_ne!(staging, other.staging_path());
    }

    #[test]
    fn test_abandoned_stage_is_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("range.bin");

        let staging = {
            let staged = StagedWrite::begin(&dest).unwrap();
            fs::write(staged.staging_path(), b"partial").unwrap();
            staged.staging_path().to_path_buf()
            // dropped without commit
        };
        assert!(!staging.exists(), "uncommitted staging file must not linger");
        assert!(!dest.exists());
    }

    #[test]
    fn test_write_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("range.bin");

        assert!(write_file(&dest, b"hello").unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"hello");

        // No staging files remain.
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str().unwrap_or("").starts_with(".wip-"))
            .collect();
        assert!(leftovers.is_empty(), "no staging files should remain");
    }

    #[test]
    fn test_write_file_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("warc_cache/deadbeef.bin");

        write_file(&dest, b"slice").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"slice");
    }

    #[test]
    fn test_write_replaces_existing_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("collinfo.json");

        fs::write(&dest, b"original").unwrap();
        write_file(&dest, b"new content").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new content");
    }

    #[test]
    fn test_write_json() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("settings.json");

        write_json(&dest, &serde_json::json!({"workers": 4})).unwrap();
        let text = fs::read_to_string(&dest).unwrap();
        assert!(text.contains("\"workers\": 4"));
        assert!(text.ends_with('\n'));
    }
}
