//! Shared utilities: tuning constants and URL helpers.

pub mod constants;
pub mod url;

pub use self::url::{is_valid_url, normalize_url, url_origin};
