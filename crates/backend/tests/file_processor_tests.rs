//! Integration tests for file header synthesis.

use std::fs;

use arcflow::{Headers, processor::headers_for_filename};
use filetime::FileTime;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[test]
fn test_headers_for_plain_text_file() {
  let dir = TempDir::new().expect("Failed to create temp dir");
  let path = dir.path().join("notes.txt");
  fs::write(&path, "a".repeat(42)).unwrap();
  filetime::set_file_mtime(&path, FileTime::from_unix_time(784_887_151, 0)).unwrap();

  let headers = headers_for_filename(&path).expect("headers");

  assert_eq!(headers.content_type(), Some("text/plain"));
  assert_eq!(headers.content_length(), Some(42));
  assert_eq!(headers.first(Headers::LAST_MODIFIED), Some("Tue, 15 Nov 1994 08:12:31 GMT"));
  assert_eq!(headers.first(Headers::CONTENT_ENCODING), None);
}

#[test]
fn test_headers_for_compressed_file() {
  let dir = TempDir::new().expect("Failed to create temp dir");
  let path = dir.path().join("data.json.gz");
  fs::write(&path, [0x1f, 0x8b, 0x08]).unwrap();

  let headers = headers_for_filename(&path).expect("headers");

  assert_eq!(headers.content_type(), Some("application/json"));
  assert_eq!(headers.first(Headers::CONTENT_ENCODING), Some("gzip"));
  assert_eq!(headers.content_length(), Some(3));
}

#[test]
fn test_headers_for_missing_and_directory() {
  let dir = TempDir::new().expect("Failed to create temp dir");

  assert!(headers_for_filename(&dir.path().join("absent.txt")).is_err());
  assert!(headers_for_filename(dir.path()).is_err());
}
