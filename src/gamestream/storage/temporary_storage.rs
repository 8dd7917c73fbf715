//! Append-only file storage for per-job handler state
//!
//! One file per runtime, owned exclusively by it. `overwrite` is atomic
//! against crashes: the replacement is written to a sibling temp file and
//! renamed over the original, so readers only ever observe the old or the
//! new content, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An append-only file handle with atomic replacement and tail truncation.
///
/// Callers choose retry policy; every I/O error propagates.
#[derive(Debug)]
pub struct TemporaryStorage {
    path: PathBuf,
    file: File,
}

impl TemporaryStorage {
    /// Opens (creating if absent) the file at `path`, along with any missing
    /// parent directories.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(TemporaryStorage { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `data` at end of file and flushes it.
    pub fn append(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(data.len())
    }

    /// Replaces the whole file content atomically: writes to a sibling temp
    /// file, syncs it, and renames it over the original.
    pub fn overwrite(&mut self, data: &[u8]) -> std::io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        // The old handle still points at the unlinked inode.
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(())
    }

    /// Reads the entire file from the start.
    pub fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Shrinks the file to exactly `len` bytes.
    pub fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()
    }

    pub fn size(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Removes the backing file. Consumes the handle.
    pub fn delete(self) -> std::io::Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)
    }
}
