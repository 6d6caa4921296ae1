//! Record store adapters.  `FileStore` stands in for the EEPROM on a Linux
//! host; an erased or missing image reads as all `0xFF`.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::ports::RecordStore;
use crate::schedule::{ERASED, RECORD_LEN};

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordStore for FileStore {
    fn read_record(&mut self) -> Result<[u8; RECORD_LEN]> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok([ERASED; RECORD_LEN]),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read store: {}", self.path.display()))
            }
        };

        let mut record = [ERASED; RECORD_LEN];
        for (dst, src) in record.iter_mut().zip(bytes.iter()) {
            *dst = *src;
        }
        Ok(record)
    }

    fn write_record(&mut self, record: &[u8; RECORD_LEN]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create store dir: {}", dir.display()))?;
            }
        }

        // Write-then-rename so a power cut never leaves a half-written record.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, record)
            .with_context(|| format!("failed to write store: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to commit store: {}", self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Clone)]
pub struct MemoryStore {
    pub record: std::sync::Arc<std::sync::Mutex<[u8; RECORD_LEN]>>,
}

#[cfg(test)]
impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_record([ERASED; RECORD_LEN])
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_record(record: [u8; RECORD_LEN]) -> Self {
        Self {
            record: std::sync::Arc::new(std::sync::Mutex::new(record)),
        }
    }

    pub fn get(&self) -> [u8; RECORD_LEN] {
        *self.record.lock().unwrap()
    }
}

#[cfg(test)]
impl RecordStore for MemoryStore {
    fn read_record(&mut self) -> Result<[u8; RECORD_LEN]> {
        Ok(self.get())
    }

    fn write_record(&mut self, record: &[u8; RECORD_LEN]) -> Result<()> {
        *self.record.lock().unwrap() = *record;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_erased() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("schedule.bin"));
        assert_eq!(store.read_record().unwrap(), [0xFF; RECORD_LEN]);
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("nested/schedule.bin"));
        store.write_record(&[0, 7, 0, 0, 12, 45]).unwrap();
        assert_eq!(store.read_record().unwrap(), [0, 7, 0, 0, 12, 45]);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn short_file_pads_with_erased_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.bin");
        fs::write(&path, [0x00, 6, 30]).unwrap();
        let mut store = FileStore::new(&path);
        assert_eq!(store.read_record().unwrap(), [0x00, 6, 30, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn erase_invalidates_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("schedule.bin"));
        store.write_record(&[0, 7, 0, 0, 12, 45]).unwrap();
        crate::schedule::erase_record(&mut store).unwrap();
        assert_eq!(store.read_record().unwrap()[0], 0xFF);
    }

    #[test]
    fn memory_store_clones_share_record() {
        let store = MemoryStore::default();
        let mut writer = store.clone();
        writer.write_record(&[0, 1, 2, 3, 6, 5]).unwrap();
        assert_eq!(store.get(), [0, 1, 2, 3, 6, 5]);
    }
}
