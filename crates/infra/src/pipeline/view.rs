//! Read-side shapes returned by the orchestrator.

use serde::Serialize;

use orpheon_core::{AudioProcessingRecord, Stage};

pub const LIBRARY_PAGE_SIZE: usize = 10;

/// A record with its resolved stage (`None`: unknown, cache entry gone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioProcessingView {
    #[serde(flatten)]
    pub record: AudioProcessingRecord,
    pub stage: Option<Stage>,
}

impl AudioProcessingView {
    pub fn new(record: AudioProcessingRecord, cached: Option<Stage>) -> Self {
        let stage = record.resolve_stage(cached);
        Self { record, stage }
    }
}

/// One page of an owner's library, newest first. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryPage {
    pub items: Vec<AudioProcessingView>,
    pub page: usize,
    pub limit: usize,
    pub total_data: usize,
    pub total_page: usize,
}

impl LibraryPage {
    pub(crate) fn slice_bounds(page: usize, total: usize) -> (usize, usize) {
        let start = (page.saturating_sub(1) * LIBRARY_PAGE_SIZE).min(total);
        let end = (start + LIBRARY_PAGE_SIZE).min(total);
        (start, end)
    }

    pub(crate) fn total_pages(total: usize) -> usize {
        total.div_ceil(LIBRARY_PAGE_SIZE)
    }
}
