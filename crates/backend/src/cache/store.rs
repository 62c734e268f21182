//! On-disk arc persistence.
//!
//! One JSON file per arc, named by the SHA-256 of the key's canonical form.
//! A lock file guards the directory against a second process; failures to
//! write degrade the pipeline to in-memory caching rather than failing
//! requests.

use std::{
  fs::{self, OpenOptions},
  io::{self, Write},
  path::{Path, PathBuf},
  sync::atomic::{AtomicBool, Ordering},
};

use arcflow_core::{CacheErrorCode, DomainError, ErrorDomain, Headers};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::arc::{ArcKey, ArcResult, CacheArc, Content, ValidatorSet};

const LOCK_FILE: &str = ".arcflow.lock";

#[derive(Debug, thiserror::Error)]
pub enum CacheStoreError {
  #[error("Unable to create cache directory {path}: {source}")]
  CreatePath {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("Unable to serialize lock file contents: {0}")]
  SerializeLock(#[source] serde_json::Error),
  #[error("Unable to create lock file {path}: {source}")]
  CreateLockFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("Cache directory {path} is locked by another process")]
  LockUnavailable { path: PathBuf },
  #[error("Lock file {path} was left by process {pid}, which is no longer running")]
  LockInvalidated { path: PathBuf, pid: u32 },
  #[error("Unable to replace stale lock file {path}: {source}")]
  CannotCreateLock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("Unable to write cache file {path}: {reason}")]
  Write { path: PathBuf, reason: String },
}

impl CacheStoreError {
  pub fn error_code(&self) -> CacheErrorCode {
    match self {
      Self::CreatePath { .. } => CacheErrorCode::UnableToCreatePath,
      Self::SerializeLock(_) => CacheErrorCode::UnableToSerializeLockFile,
      Self::CreateLockFile { .. } => CacheErrorCode::UnableToCreateLockFile,
      Self::LockUnavailable { .. } => CacheErrorCode::LockUnavailable,
      Self::LockInvalidated { .. } => CacheErrorCode::LockInvalidated,
      Self::CannotCreateLock { .. } => CacheErrorCode::CannotCreateLock,
      Self::Write { .. } => CacheErrorCode::CacheFileUnableToWrite,
    }
  }
}

impl DomainError for CacheStoreError {
  fn domain(&self) -> ErrorDomain {
    ErrorDomain::Cache
  }

  fn code(&self) -> u32 {
    self.error_code().code()
  }

  fn suggestion(&self) -> Option<String> {
    Some(self.error_code().suggestion().to_string())
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
  pid: u32,
  created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredArc {
  key: String,
  headers: Headers,
  /// Hex-encoded body
  body: String,
  validators: ValidatorSet,
}

/// Directory-backed store for content arcs.
pub struct ArcStore {
  dir: PathBuf,
  lock_path: PathBuf,
  enabled: AtomicBool,
  /// Pid recorded in a stale lock this store replaced on open.
  reclaimed_from: Option<u32>,
}

impl ArcStore {
  /// Open (creating if needed) and lock `dir`.
  pub fn open(dir: &Path) -> Result<Self, CacheStoreError> {
    fs::create_dir_all(dir).map_err(|source| CacheStoreError::CreatePath {
      path: dir.to_path_buf(),
      source,
    })?;

    let lock_path = dir.join(LOCK_FILE);
    let info = LockInfo {
      pid: std::process::id(),
      created_at: Utc::now(),
    };
    let contents = serde_json::to_vec_pretty(&info).map_err(CacheStoreError::SerializeLock)?;

    let mut reclaimed_from = None;
    let mut file = match create_lock_file(&lock_path) {
      Ok(file) => file,
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
        let pid = stale_lock_pid(&lock_path).ok_or_else(|| CacheStoreError::LockUnavailable { path: dir.to_path_buf() })?;
        let stale = CacheStoreError::LockInvalidated {
          path: lock_path.clone(),
          pid,
        };
        warn!(code = stale.code(), err = %stale, "Reclaiming stale arc store lock");
        fs::remove_file(&lock_path).map_err(|source| CacheStoreError::CannotCreateLock {
          path: lock_path.clone(),
          source,
        })?;
        reclaimed_from = Some(pid);
        match create_lock_file(&lock_path) {
          Ok(file) => file,
          // Another process reclaimed it first
          Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(CacheStoreError::LockUnavailable { path: dir.to_path_buf() });
          }
          Err(source) => {
            return Err(CacheStoreError::CannotCreateLock {
              path: lock_path,
              source,
            });
          }
        }
      }
      Err(source) => {
        return Err(CacheStoreError::CreateLockFile {
          path: lock_path,
          source,
        });
      }
    };
    if let Err(source) = file.write_all(&contents) {
      let _ = fs::remove_file(&lock_path);
      return Err(CacheStoreError::CreateLockFile {
        path: lock_path,
        source,
      });
    }

    debug!(dir = %dir.display(), "Arc store opened");
    Ok(Self {
      dir: dir.to_path_buf(),
      lock_path,
      enabled: AtomicBool::new(true),
      reclaimed_from,
    })
  }

  /// Pid of the dead process whose lock was replaced when this store opened.
  pub fn reclaimed_from(&self) -> Option<u32> {
    self.reclaimed_from
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::Acquire)
  }

  /// Stop reading and writing; in-memory caching continues.
  pub fn disable(&self) {
    if self.enabled.swap(false, Ordering::AcqRel) {
      warn!(dir = %self.dir.display(), "Arc store disabled; caching in memory only");
    }
  }

  fn path_for(&self, key: &ArcKey) -> PathBuf {
    let digest = hex::encode(Sha256::digest(key.canonical().as_bytes()));
    self.dir.join(format!("{}.json", digest))
  }

  /// Persist a content arc. Returns `Ok(false)` for arcs that are not stored
  /// (non-content results, or a disabled store).
  pub fn save(&self, arc: &CacheArc) -> Result<bool, CacheStoreError> {
    let Some(content) = arc.content() else {
      return Ok(false);
    };
    if !self.is_enabled() {
      return Ok(false);
    }

    let path = self.path_for(arc.key());
    let write_err = |reason: String| CacheStoreError::Write {
      path: path.clone(),
      reason,
    };

    let stored = StoredArc {
      key: arc.key().canonical(),
      headers: content.headers().clone(),
      body: hex::encode(content.body()),
      validators: arc.validators().clone(),
    };
    let bytes = serde_json::to_vec(&stored).map_err(|e| write_err(e.to_string()))?;

    // Write-then-rename so readers never see a partial file
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).map_err(|e| write_err(e.to_string()))?;
    fs::rename(&tmp, &path).map_err(|e| {
      let _ = fs::remove_file(&tmp);
      write_err(e.to_string())
    })?;

    debug!(arc = %arc.id(), key = %arc.key(), bytes = bytes.len(), "Arc persisted");
    Ok(true)
  }

  /// Load a persisted arc for `key`. Missing, unreadable or mismatched files
  /// yield `None`; the caller revalidates whatever is returned.
  pub fn load(&self, key: &ArcKey) -> Option<CacheArc> {
    if !self.is_enabled() {
      return None;
    }
    let path = self.path_for(key);
    let bytes = match fs::read(&path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
      Err(e) => {
        debug!(path = %path.display(), err = %e, "Failed to read persisted arc");
        return None;
      }
    };

    let stored: StoredArc = match serde_json::from_slice(&bytes) {
      Ok(stored) => stored,
      Err(e) => {
        debug!(path = %path.display(), err = %e, "Discarding corrupt persisted arc");
        let _ = fs::remove_file(&path);
        return None;
      }
    };
    if stored.key != key.canonical() {
      debug!(path = %path.display(), "Persisted arc belongs to a different key");
      return None;
    }
    let body = hex::decode(&stored.body).ok()?;

    Some(CacheArc::new(
      key.clone(),
      ArcResult::Content(Content::new(stored.headers, body)),
      stored.validators,
    ))
  }

  /// Delete the persisted arc for `key`, if any.
  pub fn remove(&self, key: &ArcKey) -> bool {
    fs::remove_file(self.path_for(key)).is_ok()
  }
}

fn create_lock_file(path: &Path) -> io::Result<fs::File> {
  OpenOptions::new().write(true).create_new(true).open(path)
}

/// The pid in an existing lock file, if that process is gone.
///
/// An unreadable lock is treated as live; it may be mid-write by the process
/// that just created it.
fn stale_lock_pid(path: &Path) -> Option<u32> {
  let bytes = fs::read(path).ok()?;
  let info: LockInfo = serde_json::from_slice(&bytes).ok()?;
  if info.pid == std::process::id() || is_process_running(info.pid) {
    return None;
  }
  Some(info.pid)
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
  let Ok(pid) = libc::pid_t::try_from(pid) else {
    return false;
  };
  // kill(pid, 0) probes without signalling; EPERM still means it exists
  let result = unsafe { libc::kill(pid, 0) };
  result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
fn is_process_running(pid: u32) -> bool {
  use windows_sys::Win32::{
    Foundation::{CloseHandle, STILL_ACTIVE},
    System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION},
  };

  unsafe {
    let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
    if handle.is_null() {
      return false;
    }
    let mut exit_code = 0;
    let result = GetExitCodeProcess(handle, &mut exit_code);
    CloseHandle(handle);
    result != 0 && exit_code == STILL_ACTIVE as u32
  }
}

#[cfg(not(any(unix, windows)))]
fn is_process_running(_pid: u32) -> bool {
  true
}

impl Drop for ArcStore {
  fn drop(&mut self) {
    if let Err(e) = fs::remove_file(&self.lock_path) {
      debug!(path = %self.lock_path.display(), err = %e, "Failed to release arc store lock");
    }
  }
}
