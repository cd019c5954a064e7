//! Paginated source contract plus the OpenFEC and fixture-backed sources.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use cfin_core::{IngestionCheckpoint, PageCursor};
use cfin_storage::FetchError;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

mod openfec;
mod transform;

pub use openfec::{
    IndexedPagination, LastIndexes, OpenFecSource, RawCommittee, RawReceipt, ScheduleAPage,
    DEFAULT_OPENFEC_BASE_URL,
};
pub use transform::{transform_receipt, DropReason, ReceiptDraft};

pub const CRATE_NAME: &str = "cfin-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("page fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("page body could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Fixture(#[from] anyhow::Error),
}

/// Everything a source needs to serve the page after the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub last_seen_date: Option<NaiveDate>,
    pub sort_null_only: bool,
    pub cycles: Vec<i32>,
    pub per_page: u32,
}

impl PageRequest {
    pub fn from_checkpoint(checkpoint: &IngestionCheckpoint, cycles: Vec<i32>, per_page: u32) -> Self {
        Self {
            cursor: checkpoint.cursor.clone(),
            last_seen_date: checkpoint.last_seen_date,
            sort_null_only: checkpoint.sort_null_only,
            cycles,
            per_page,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<RawReceipt>,
    pub next: PageCursor,
    /// Body as received, kept for the raw page archive.
    pub raw_body: Option<Vec<u8>>,
}

impl SourcePage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, SourceError>;
}

/// Serves Schedule A pages captured to disk, in file-name order.
///
/// A request resumes after the page whose `last_index` equals the request
/// cursor, so checkpoints behave exactly as they do against the live API.
/// Unknown cursors and cursors past the last page get an empty page. Pages
/// are served as captured; cycle filtering already happened at capture time.
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    pages: Vec<(ScheduleAPage, Vec<u8>)>,
}

impl FixturePageSource {
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let mut files = fs::read_dir(dir)
            .with_context(|| format!("reading fixture dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<PathBuf>>();
        files.sort();

        let mut pages = Vec::with_capacity(files.len());
        for path in files {
            let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let page: ScheduleAPage = serde_json::from_slice(&body)
                .with_context(|| format!("parsing {}", path.display()))?;
            pages.push((page, body));
        }
        debug!(dir = %dir.display(), pages = pages.len(), "loaded fixture pages");
        Ok(Self { pages })
    }

    pub fn from_pages(pages: Vec<ScheduleAPage>) -> Result<Self, SourceError> {
        let pages = pages
            .into_iter()
            .map(|page| serde_json::to_vec(&page).map(|body| (page, body)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pages })
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn position_after(&self, cursor: Option<&str>) -> Option<usize> {
        let Some(token) = cursor else {
            return Some(0);
        };
        self.pages
            .iter()
            .position(|(page, _)| page.pagination.last_index() == Some(token))
            .map(|idx| idx + 1)
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, SourceError> {
        let served = self
            .position_after(request.cursor.as_deref())
            .and_then(|idx| self.pages.get(idx));

        let Some((page, body)) = served else {
            return Ok(SourcePage {
                records: Vec::new(),
                next: PageCursor {
                    token: request.cursor.clone(),
                    last_seen_date: request.last_seen_date,
                    sort_null_only: request.sort_null_only,
                },
                raw_body: None,
            });
        };

        Ok(SourcePage {
            records: page.results.clone(),
            next: page.pagination.next_cursor(),
            raw_body: Some(body.clone()),
        })
    }
}
