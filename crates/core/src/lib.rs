//! Core value types for the arcflow content pipeline.
//!
//! This crate holds the types that are shared by every layer of the pipeline
//! and carry no runtime machinery of their own:
//!
//! - [`Address`]: normalized resource identifier plus negotiation metadata
//! - [`Headers`]: case-insensitive multi-value header dictionary
//! - [`error`]: error domains and the structured [`ErrorReport`] shape
//! - [`config`]: TOML configuration with per-directory overrides

pub mod address;
pub mod config;
pub mod error;
pub mod headers;

pub use address::{Address, AddressError, Negotiation};
pub use config::Config;
pub use error::{CacheErrorCode, DomainError, ErrorDomain, ErrorReport};
pub use headers::Headers;
