use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfin_adapters::{transform_receipt, PageRequest, PageSource, RawReceipt, ReceiptDraft};
use cfin_storage::{retry_with_backoff, BackoffPolicy, CheckpointStore, PageArchive, RelationalStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::upsert::RelationalUpserter;
use crate::SyncConfig;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub per_page: u32,
    pub page_delay: Duration,
    pub write_policy: BackoffPolicy,
}

impl From<&SyncConfig> for IngestSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            per_page: config.page_size,
            page_delay: config.page_delay,
            write_policy: config.write_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionRunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub cycle: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Page fetches, the terminating empty page included.
    pub pages: usize,
    /// Rows durably written.
    pub records_processed: usize,
    pub records_dropped: usize,
    pub records_failed: usize,
    pub reached_end: bool,
}

pub struct IngestionOrchestrator {
    source: Arc<dyn PageSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    upserter: RelationalUpserter,
    archive: Option<PageArchive>,
    settings: IngestSettings,
}

impl IngestionOrchestrator {
    pub fn new(
        source: Arc<dyn PageSource>,
        relational: Arc<dyn RelationalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            source,
            checkpoints,
            upserter: RelationalUpserter::new(relational, settings.write_policy),
            archive: None,
            settings,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Pages through `source` from its checkpoint until an empty page or
    /// until `max_pages` fetches have been made.
    ///
    /// Any fetch failure aborts the run. So does a store outage, whether it
    /// hits the page write or the checkpoint save. The checkpoint only moves
    /// past a page once its rows are written or individually refused, so the
    /// next run resumes without skipping any records.
    pub async fn run(
        &self,
        source: &str,
        cycle: i32,
        max_pages: Option<usize>,
    ) -> Result<IngestionRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut checkpoint = self
            .checkpoints
            .load(source)
            .await
            .with_context(|| format!("loading checkpoint for {source}"))?;
        info!(
            %run_id,
            source,
            cycle,
            resume_from = checkpoint.cursor.as_deref().unwrap_or("<start>"),
            "ingestion run starting"
        );

        let mut summary = IngestionRunSummary {
            run_id,
            source: source.to_string(),
            cycle,
            started_at,
            finished_at: started_at,
            pages: 0,
            records_processed: 0,
            records_dropped: 0,
            records_failed: 0,
            reached_end: false,
        };

        loop {
            if max_pages.is_some_and(|limit| summary.pages >= limit) {
                info!(pages = summary.pages, "page budget spent");
                break;
            }

            let request = PageRequest::from_checkpoint(&checkpoint, vec![cycle], self.settings.per_page);
            let page_no = checkpoint.pages_completed + 1;
            let span = info_span!("ingest_page", source, page_no);

            let page = self
                .source
                .fetch_page(&request)
                .instrument(span.clone())
                .await
                .with_context(|| format!("fetching page {page_no} of {source}"))?;
            summary.pages += 1;

            if page.is_empty() {
                summary.reached_end = true;
                info!(parent: &span, "source returned an empty page; done");
                break;
            }

            if let (Some(archive), Some(body)) = (&self.archive, &page.raw_body) {
                match archive.store_page(Utc::now(), source, body).await {
                    Ok(stored) => debug!(
                        parent: &span,
                        path = %stored.relative_path.display(),
                        deduplicated = stored.deduplicated,
                        "archived raw page"
                    ),
                    Err(err) => warn!(parent: &span, error = %err, "raw page archive failed"),
                }
            }

            let drafts = self.transform_page(&page.records, cycle, &span);
            summary.records_dropped += page.records.len() - drafts.len();

            let outcome = self
                .upserter
                .write_drafts(&drafts)
                .instrument(span.clone())
                .await
                .with_context(|| {
                    format!("writing page {page_no} of {source}; checkpoint left at the previous page")
                })?;
            summary.records_processed += outcome.written;
            summary.records_failed += outcome.failed();

            let mut next = checkpoint.advanced(&page.next);
            next.updated_at = Some(Utc::now());
            let checkpoints = self.checkpoints.as_ref();
            let to_save = &next;
            retry_with_backoff(&self.settings.write_policy, "checkpoint save", move || {
                checkpoints.save(to_save)
            })
            .await
            .with_context(|| format!("saving checkpoint for {source} after page {page_no}"))?;
            checkpoint = next;

            info!(
                parent: &span,
                records = page.records.len(),
                written = outcome.written,
                failed = outcome.failed(),
                fell_back = outcome.fell_back,
                cursor = checkpoint.cursor.as_deref().unwrap_or_default(),
                "page committed"
            );

            if !self.settings.page_delay.is_zero() {
                tokio::time::sleep(self.settings.page_delay).await;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            pages = summary.pages,
            records = summary.records_processed,
            dropped = summary.records_dropped,
            failed = summary.records_failed,
            reached_end = summary.reached_end,
            "ingestion run finished"
        );
        Ok(summary)
    }

    fn transform_page(
        &self,
        records: &[RawReceipt],
        cycle: i32,
        span: &tracing::Span,
    ) -> Vec<ReceiptDraft> {
        records
            .iter()
            .filter_map(|raw| match transform_receipt(raw, cycle) {
                Ok(draft) => Some(draft),
                Err(reason) => {
                    debug!(parent: span, %reason, "dropping receipt");
                    None
                }
            })
            .collect()
    }
}
