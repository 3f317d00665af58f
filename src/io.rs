//! Storage I/O for container files

use crate::error::{Result, VdcError};
use bytes::Bytes;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Whole-object storage operations used by container files
pub trait IoManager: Send + Sync {
    /// Read the object at a path
    fn read(&self, path: &str) -> Result<Bytes>;

    /// Replace the object at a path, creating parent directories
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if a path exists
    fn exists(&self, path: &str) -> bool;

    /// Delete the object at a path
    fn remove(&self, path: &str) -> Result<()>;

    /// Resolve a path to its location on disk
    fn resolve(&self, path: &str) -> PathBuf;
}

/// File system I/O manager rooted at a base directory
#[derive(Debug, Clone)]
pub struct FileSystemIoManager {
    base_path: PathBuf,
}

impl FileSystemIoManager {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl IoManager for FileSystemIoManager {
    fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve(path);
        let data = fs::read(&full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VdcError::NotFound(full_path.display().to_string())
            } else {
                VdcError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.resolve(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write beside the target and rename so readers never see a partial file
        let mut tmp_path = full_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &full_path)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIoManager::new(temp_dir.path());

        let data = b"VDCF payload";
        io.write("a_data/data/u/u.0000.nc", data).unwrap();

        let read_data = io.read("a_data/data/u/u.0000.nc").unwrap();
        assert_eq!(&read_data[..], data);

        assert!(io.exists("a_data/data/u/u.0000.nc"));
        assert!(!io.exists("a_data/data/u/u.0001.nc"));
        assert!(!io.exists("a_data/data/u/u.0000.nc.tmp"));

        io.remove("a_data/data/u/u.0000.nc").unwrap();
        assert!(!io.exists("a_data/data/u/u.0000.nc"));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIoManager::new(temp_dir.path());
        assert!(matches!(io.read("nope.nc"), Err(VdcError::NotFound(_))));
    }
}
