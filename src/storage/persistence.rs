//! Snapshot file for the versioned store

use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

pub const FORMAT_VERSION: u32 = 1;

// ============================================================================
// Store Image
// ============================================================================

/// Encoded contents of one map; entries stay opaque until the map is opened with concrete types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapImage {
    pub id: u32,
    pub name: String,
    pub entries: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreImage {
    pub format: u32,
    pub version: u64,
    pub next_map_id: u32,
    pub created_at: u64,
    pub maps: Vec<MapImage>,
}

impl StoreImage {
    pub fn new(version: u64, next_map_id: u32, maps: Vec<MapImage>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { format: FORMAT_VERSION, version, next_map_id, created_at, maps }
    }
}

// ============================================================================
// Snapshot File
// ============================================================================

pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the image next to the target and atomically rename it into place
    pub fn save(&self, image: &StoreImage) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| DbError::IoError(format!("Failed to create store directory: {}", e)))?;

        let serialized = rmp_serde::to_vec(image)?;
        let temp = NamedTempFile::new_in(&dir)
            .map_err(|e| DbError::IoError(format!("Failed to create temp file: {}", e)))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            writer
                .write_all(&serialized)
                .map_err(|e| DbError::IoError(format!("Failed to write store image: {}", e)))?;
            writer
                .flush()
                .map_err(|e| DbError::IoError(format!("Failed to flush store image: {}", e)))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| DbError::IoError(format!("Failed to sync store image: {}", e)))?;
        temp.persist(&self.path)
            .map_err(|e| DbError::IoError(format!("Failed to rename store image: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreImage>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)
            .map_err(|e| DbError::IoError(format!("Failed to open store image: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| DbError::IoError(format!("Failed to read store image: {}", e)))?;
        let image: StoreImage = rmp_serde::from_slice(&data)?;
        if image.format != FORMAT_VERSION {
            return Err(DbError::Corruption(format!(
                "Unsupported store format {} (expected {})",
                image.format, FORMAT_VERSION
            )));
        }
        Ok(Some(image))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(temp_dir.path().join("store.mvdb"));
        assert!(file.load().unwrap().is_none());

        let maps = vec![MapImage { id: 3, name: "users".into(), entries: vec![1, 2, 3] }];
        file.save(&StoreImage::new(7, 4, maps)).unwrap();
        assert!(file.exists());

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.next_map_id, 4);
        assert_eq!(loaded.maps.len(), 1);
        assert_eq!(loaded.maps[0].name, "users");
        assert_eq!(loaded.maps[0].entries, vec![1, 2, 3]);
    }

    #[test]
    fn test_save_replaces_previous_image() {
        let temp_dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(temp_dir.path().join("nested").join("store.mvdb"));
        file.save(&StoreImage::new(1, 1, Vec::new())).unwrap();
        file.save(&StoreImage::new(2, 1, Vec::new())).unwrap();
        assert_eq!(file.load().unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_garbage_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.mvdb");
        fs::write(&path, b"not a store image").unwrap();
        assert!(SnapshotFile::new(&path).load().is_err());
    }
}
