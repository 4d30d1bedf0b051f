//! Watermark checkpoint.
//!
//! Persists the last change version of every watched table so a later start
//! resumes reading where the previous run stopped. Only watermarks are
//! stored; queued changes are not.
//!
//! File layout:
//!
//! ```text
//! magic "TMW\0" | version u8 | len u32 LE | MessagePack payload | crc32 u32 LE
//! ```

use crate::error::{MirrorError, Result};
use crate::types::ChangeVersion;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the checkpoint file.
const CHECKPOINT_MAGIC: &[u8; 4] = b"TMW\0";

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u8 = 1;

/// Payloads beyond this size are treated as corruption.
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Table name to last processed change version.
pub type Watermarks = BTreeMap<String, ChangeVersion>;

/// Exclusive handle on a watermark checkpoint file.
pub struct WatermarkCheckpoint {
    path: PathBuf,
    /// Held for the lifetime of the handle.
    _lock_file: File,
}

impl WatermarkCheckpoint {
    /// Open (without reading) the checkpoint at `path`, taking an exclusive
    /// lock on a sibling `.lock` file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = File::create(with_suffix(&path, ".lock"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| MirrorError::Locked)?;

        Ok(Self {
            path,
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored watermarks. A missing file yields an empty map.
    pub fn load(&self) -> Result<Watermarks> {
        if !self.path.exists() {
            return Ok(Watermarks::new());
        }

        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(MirrorError::InvalidFormat("Invalid checkpoint magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(MirrorError::InvalidFormat(format!(
                "Unsupported checkpoint version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(MirrorError::Corruption("Checkpoint payload too large".into()));
        }

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(MirrorError::Corruption(format!(
                "Checkpoint checksum mismatch: expected {}, got {}",
                stored_checksum, computed_checksum
            )));
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }

    /// Replace the stored watermarks. Written to a temp file first and
    /// renamed over the old one.
    pub fn save(&self, watermarks: &Watermarks) -> Result<()> {
        let encoded = rmp_serde::to_vec(watermarks)?;
        let tmp_path = with_suffix(&self.path, ".tmp");

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(CHECKPOINT_MAGIC)?;
            file.write_all(&[CHECKPOINT_VERSION])?;
            file.write_all(&(encoded.len() as u32).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Watermarks {
        let mut marks = Watermarks::new();
        marks.insert("orders".to_string(), ChangeVersion(42));
        marks.insert("customers".to_string(), ChangeVersion(7));
        marks
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let checkpoint = WatermarkCheckpoint::open(dir.path().join("marks.bin")).unwrap();
        assert!(checkpoint.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("marks.bin");

        {
            let checkpoint = WatermarkCheckpoint::open(&path).unwrap();
            checkpoint.save(&sample()).unwrap();
        }

        let checkpoint = WatermarkCheckpoint::open(&path).unwrap();
        assert_eq!(checkpoint.load().unwrap(), sample());
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("marks.bin");

        let _first = WatermarkCheckpoint::open(&path).unwrap();
        assert!(matches!(
            WatermarkCheckpoint::open(&path),
            Err(MirrorError::Locked)
        ));
    }

    #[test]
    fn test_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("marks.bin");
        let checkpoint = WatermarkCheckpoint::open(&path).unwrap();
        checkpoint.save(&sample()).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let payload_byte = 4 + 1 + 4;
        bytes[payload_byte] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            checkpoint.load(),
            Err(MirrorError::Corruption(_))
        ));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("marks.bin");
        fs::write(&path, b"NOPE\x01").unwrap();

        let checkpoint = WatermarkCheckpoint::open(&path).unwrap();
        assert!(matches!(
            checkpoint.load(),
            Err(MirrorError::InvalidFormat(_))
        ));
    }
}
