//! Internal store parameters.
//!
//! Unlike the sidecar, these live *inside* the encrypted store (META table,
//! key `FS_PARAMS`) and are invisible until the right password is supplied.
//! The page size is fixed at database creation and never changes afterwards;
//! all page arithmetic in the data layer depends on it.

use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

pub const DEFAULT_PAGE_SIZE: i32 = 65536;
pub const MIN_PAGE_SIZE: i32 = 64;
pub const MAX_PAGE_SIZE: i32 = 1_024_000;

/// Parameters stored under META/`FS_PARAMS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsParams {
    pub version: u32,
    pub page_size: i32,
}

impl FsParams {
    pub fn new(page_size: i32) -> StoreResult<Self> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(StoreError::Params(format!(
                "page_size {page_size} outside {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
            )));
        }
        Ok(Self {
            version: FORMAT_VERSION,
            page_size,
        })
    }
}

impl Default for FsParams {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}
