//! Pagination parameters for list endpoints
//!
//! Invalid input never produces an error: a page or page size that is
//! absent, zero, negative, or not a number falls back to its default.

use std::fmt;

/// Page used when the requested one is absent or invalid
pub const DEFAULT_PAGE: u32 = 1;
/// Page size used when the requested one is absent or invalid
pub const DEFAULT_PAGE_SIZE: u32 = 3;

/// A validated `(page, page_size)` pair, both at least 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pagination {
    page: u32,
    page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: if page == 0 { DEFAULT_PAGE } else { page },
            page_size: if page_size == 0 {
                DEFAULT_PAGE_SIZE
            } else {
                page_size
            },
        }
    }

    /// Build from signed integers, treating anything below 1 as absent
    pub fn from_signed(page: i64, page_size: i64) -> Self {
        Self {
            page: positive_or(Some(page), DEFAULT_PAGE),
            page_size: positive_or(Some(page_size), DEFAULT_PAGE_SIZE),
        }
    }

    /// Build from raw query-string values (`?page=2&limit=10`)
    pub fn from_query(page: Option<&str>, limit: Option<&str>) -> Self {
        let parse = |raw: Option<&str>| raw.and_then(|s| s.trim().parse::<i64>().ok());
        Self {
            page: positive_or(parse(page), DEFAULT_PAGE),
            page_size: positive_or(parse(limit), DEFAULT_PAGE_SIZE),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of rows to skip: `(page - 1) * page_size`
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    /// Maximum number of rows in the page
    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

impl fmt::Display for Pagination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.page_size)
    }
}

fn positive_or(value: Option<i64>, default: u32) -> u32 {
    value
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}
