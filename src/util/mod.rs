//! Shared helpers used across the sync engine.
//!
//! Currently this is URL validation for subscription sources: every feed URL
//! entering the database (CLI `add-feed`, OPML import) passes through
//! [`validate_url`] first.

mod url_validator;

pub use url_validator::{validate_url, UrlValidationError};
