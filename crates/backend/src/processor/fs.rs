use std::{io, path::Path, time::SystemTime};

/// The subset of file metadata processors care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
  pub len: u64,
  pub modified: SystemTime,
  pub is_file: bool,
}

/// Filesystem access used by [`super::FileProcessor`].
pub trait FileSystem: Send + Sync {
  fn metadata(&self, path: &Path) -> io::Result<FileMetadata>;
  fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
  fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
    let meta = std::fs::metadata(path)?;
    Ok(FileMetadata {
      len: meta.len(),
      modified: meta.modified()?,
      is_file: meta.is_file(),
    })
  }

  fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
    std::fs::read(path)
  }
}
