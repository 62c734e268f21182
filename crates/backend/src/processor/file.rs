//! `file:` processor: local files served with synthesized HTTP-style headers.

use std::{
  io,
  path::Path,
  sync::Arc,
  time::SystemTime,
};

use arcflow_core::{Address, Headers};
use chrono::{DateTime, Utc};

use super::{FileMetadata, FileSystem, LocalFileSystem, Processor, ProcessorError};
use crate::arc::{Content, Probe, ProcessorId, ValidatorSet};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// Extension -> MIME type. Extensions are matched lowercased.
const MIME_TYPES: &[(&str, &str)] = &[
  ("txt", "text/plain"),
  ("text", "text/plain"),
  ("log", "text/plain"),
  ("md", "text/markdown"),
  ("html", "text/html"),
  ("htm", "text/html"),
  ("css", "text/css"),
  ("csv", "text/csv"),
  ("rtf", "text/rtf"),
  ("xml", "text/xml"),
  ("js", "text/javascript"),
  ("mjs", "text/javascript"),
  ("json", "application/json"),
  ("pdf", "application/pdf"),
  ("zip", "application/zip"),
  ("tar", "application/x-tar"),
  ("wasm", "application/wasm"),
  ("png", "image/png"),
  ("jpg", "image/jpeg"),
  ("jpeg", "image/jpeg"),
  ("gif", "image/gif"),
  ("webp", "image/webp"),
  ("svg", "image/svg+xml"),
  ("ico", "image/x-icon"),
  ("mp3", "audio/mpeg"),
  ("wav", "audio/wav"),
  ("mp4", "video/mp4"),
  ("woff", "font/woff"),
  ("woff2", "font/woff2"),
];

// Compressed wrappers: the inner extension decides the type.
const CONTENT_ENCODINGS: &[(&str, &str)] = &[("gz", "gzip"), ("br", "br"), ("z", "compress")];

/// MIME type for `path` by extension, `application/octet-stream` when unknown.
pub fn content_type_for_path(path: &Path) -> &'static str {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| ext.to_ascii_lowercase())
    .and_then(|ext| MIME_TYPES.iter().find(|(e, _)| *e == ext).map(|(_, t)| *t))
    .unwrap_or(DEFAULT_CONTENT_TYPE)
}

fn content_encoding_for_path(path: &Path) -> Option<&'static str> {
  let ext = path.extension()?.to_str()?.to_ascii_lowercase();
  CONTENT_ENCODINGS.iter().find(|(e, _)| *e == ext).map(|(_, enc)| *enc)
}

/// Format a timestamp as an HTTP date (`Tue, 15 Nov 1994 08:12:31 GMT`).
pub(crate) fn http_date(at: SystemTime) -> String {
  DateTime::<Utc>::from(at)
    .format("%a, %d %b %Y %H:%M:%S GMT")
    .to_string()
}

/// Headers for a file on the host filesystem.
pub fn headers_for_filename(path: &Path) -> Result<Headers, ProcessorError> {
  FileProcessor::new().headers_for_filename(path)
}

fn map_io_error(path: &Path, source: io::Error) -> ProcessorError {
  if source.kind() == io::ErrorKind::NotFound {
    ProcessorError::NotFound(path.display().to_string())
  } else {
    ProcessorError::Unreadable {
      path: path.display().to_string(),
      source,
    }
  }
}

/// Serves `file:` addresses.
#[derive(Clone)]
pub struct FileProcessor {
  fs: Arc<dyn FileSystem>,
}

impl FileProcessor {
  pub const ID: &'static str = "file";

  pub fn new() -> Self {
    Self::with_filesystem(Arc::new(LocalFileSystem))
  }

  pub fn with_filesystem(fs: Arc<dyn FileSystem>) -> Self {
    Self { fs }
  }

  /// Synthesize the headers a network fetch of `path` would carry:
  /// content type (from the extension), content length and last-modified.
  ///
  /// Reads metadata only, never the body. Nothing is cached or retried.
  pub fn headers_for_filename(&self, path: &Path) -> Result<Headers, ProcessorError> {
    let meta = self.file_metadata(path)?;
    Ok(headers_for_metadata(path, &meta))
  }

  fn file_metadata(&self, path: &Path) -> Result<FileMetadata, ProcessorError> {
    let meta = self.fs.metadata(path).map_err(|e| map_io_error(path, e))?;
    if !meta.is_file {
      return Err(ProcessorError::Unsupported(path.display().to_string()));
    }
    Ok(meta)
  }
}

fn headers_for_metadata(path: &Path, meta: &FileMetadata) -> Headers {
  let mut headers = Headers::new();
  match content_encoding_for_path(path) {
    Some(encoding) => {
      // notes.txt.gz is text/plain delivered gzip-encoded
      let inner = path.file_stem().map(Path::new).unwrap_or(path);
      headers.set(Headers::CONTENT_TYPE, content_type_for_path(inner));
      headers.set(Headers::CONTENT_ENCODING, encoding);
    }
    None => headers.set(Headers::CONTENT_TYPE, content_type_for_path(path)),
  }
  headers.set(Headers::CONTENT_LENGTH, meta.len.to_string());
  headers.set(Headers::LAST_MODIFIED, http_date(meta.modified));
  headers
}

impl Default for FileProcessor {
  fn default() -> Self {
    Self::new()
  }
}

impl Processor for FileProcessor {
  fn id(&self) -> ProcessorId {
    ProcessorId::new(Self::ID)
  }

  fn schemes(&self) -> &[&'static str] {
    &["file"]
  }

  fn transform(&self, address: &Address, _input: Option<&Content>) -> Result<Content, ProcessorError> {
    let path = address
      .to_file_path()
      .ok_or_else(|| ProcessorError::Unsupported(address.to_string()))?;
    // Stat before reading: a write landing in between leaves an older
    // mtime on newer bytes, which the next probe reports as modified.
    let meta = self.file_metadata(&path)?;
    let body = self.fs.read(&path).map_err(|e| map_io_error(&path, e))?;
    Ok(Content::new(headers_for_metadata(&path, &meta), body).with_source_modified(meta.modified))
  }

  fn current_validators(&self, address: &Address) -> Probe {
    let Some(path) = address.to_file_path() else {
      return Probe::Unknown;
    };
    match self.fs.metadata(&path) {
      Ok(meta) if meta.is_file => Probe::Current(
        ValidatorSet::new()
          .with_last_modified(meta.modified)
          .with_content_length(meta.len),
      ),
      Ok(_) => Probe::Missing,
      Err(e) if e.kind() == io::ErrorKind::NotFound => Probe::Missing,
      Err(_) => Probe::Unknown,
    }
  }
}
