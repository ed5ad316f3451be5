//! # Shared User Types and Constants
//!
//! Identifiers and pagination rules shared by the server, the datastore
//! backends and any Rust client.
//!
//! ## Identifiers
//!
//! User ids are [`ULID`]s rendered as 26-character Crockford base32 strings.
//! They sort by creation time, which lets the datastores use the id as a
//! stable tie-breaker for the `created_at` ordering.
//!
//! ## Pagination
//!
//! [`Page::normalize`] applies the listing defaults: pages are 1-based and any
//! non-positive page or page size is replaced by a sane default.

use crate::Error;
use ferroid::{base32::Base32UlidExt, id::ULID};
use std::time::SystemTime;

/// Name of the collection (or table) holding user documents.
pub const COLLECTION: &str = "users";

/// Page size used when a listing asks for `page_size <= 0`.
pub const DEFAULT_PAGE_SIZE: i32 = 10;

/// Generates a fresh user id from the current wall clock.
#[must_use]
pub fn new_user_id() -> String {
    ULID::from_datetime(SystemTime::now()).encode().to_string()
}

/// Validates `raw` as a user id and returns its canonical (upper-case) form.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `raw` is not a 26-character
/// Crockford base32 ULID.
pub fn parse_user_id(raw: &str) -> crate::Result<String> {
    ULID::decode(raw)
        .map(|id| id.encode().to_string())
        .map_err(|_| Error::InvalidArgument {
            reason: format!("invalid user ID: {raw:?} is not a 26-character ULID"),
        })
}

/// A normalized page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number.
    pub page: i32,
    /// Number of users per page, always positive.
    pub page_size: i32,
}

impl Page {
    /// Applies the listing defaults to a raw `(page, page_size)` pair.
    #[must_use]
    pub const fn normalize(page: i32, page_size: i32) -> Self {
        Self {
            page: if page <= 0 { 1 } else { page },
            page_size: if page_size <= 0 {
                DEFAULT_PAGE_SIZE
            } else {
                page_size
            },
        }
    }

    /// Number of documents to skip before this page.
    #[must_use]
    pub const fn skip(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }

    /// Maximum number of documents on this page.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.page_size as u64
    }
}
