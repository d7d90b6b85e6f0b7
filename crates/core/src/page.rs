//! Pagination for listing queries.

use serde::{Deserialize, Serialize};

/// Maximum page size a caller may request.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Pagination parameters (limit/offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of items to return.
    pub limit: u32,
    /// Offset into the filtered result (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0),
        }
    }

    /// Everything, up to the page size cap.
    pub fn all() -> Self {
        Self::new(Some(MAX_PAGE_SIZE), None)
    }
}

/// One page of a filtered listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of items matching the filter across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Slice an already filtered and ordered result set.
    pub fn slice(items: Vec<T>, pagination: Pagination) -> Self {
        let total = items.len();
        let start = (pagination.offset as usize).min(total);
        let end = start.saturating_add(pagination.limit as usize).min(total);
        let items: Vec<T> = items.into_iter().skip(start).take(end - start).collect();

        Self {
            items,
            total: total as u64,
            pagination,
            has_more: end < total,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            pagination: self.pagination,
            has_more: self.has_more,
        }
    }
}
