//! Offset pagination utilities.

use serde::{Deserialize, Serialize};

/// Default page size when the caller does not supply one.
pub const DEFAULT_LIMIT: i64 = 20;

/// Upper bound on the page size.
pub const MAX_LIMIT: i64 = 100;

/// Normalized limit/offset pair plus derived page numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub page: i64,
    pub total_pages: i64,
}

/// Clamp a requested limit into `1..=MAX_LIMIT`, falling back to the default.
pub fn normalize_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Negative offsets are treated as zero.
pub fn normalize_offset(offset: Option<i64>) -> i64 {
    offset.unwrap_or(0).max(0)
}

impl PageInfo {
    /// Build page info for a result set of `total` rows.
    ///
    /// `page` is 1-based and derived from the offset; `total_pages` is 0 when
    /// there are no rows.
    pub fn new(total: i64, limit: i64, offset: i64) -> Self {
        let limit = limit.max(1);
        let offset = offset.max(0);
        let total = total.max(0);
        Self {
            total,
            limit,
            offset,
            page: offset / limit + 1,
            total_pages: (total + limit - 1) / limit,
        }
    }
}
