use std::sync::Arc;

use cfin_adapters::ReceiptDraft;
use cfin_core::TransactionRecord;
use cfin_storage::{
    collapse_duplicate_ids, retry_with_backoff, BackoffPolicy, RelationalStore, StoreError,
};
use tracing::{debug, warn};

/// Result of writing one batch of transaction rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    pub failed: usize,
    pub fell_back: bool,
}

/// Result of writing one page of drafts, entity resolution included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DraftOutcome {
    pub written: usize,
    pub entity_failures: usize,
    pub write_failures: usize,
    pub fell_back: bool,
}

impl DraftOutcome {
    pub fn failed(&self) -> usize {
        self.entity_failures + self.write_failures
    }
}

/// Idempotent writer: bulk first, per-row with retries when the bulk path fails.
#[derive(Clone)]
pub struct RelationalUpserter {
    store: Arc<dyn RelationalStore>,
    policy: BackoffPolicy,
}

impl RelationalUpserter {
    pub fn new(store: Arc<dyn RelationalStore>, policy: BackoffPolicy) -> Self {
        Self { store, policy }
    }

    /// Upserts every entity the draft references (contributor, receiving,
    /// conduit) before the row that points at them.
    pub async fn resolve_entities(&self, draft: &ReceiptDraft) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        for entity in draft.entities() {
            retry_with_backoff(&self.policy, "entity upsert", move || store.upsert_entity(entity))
                .await?;
        }
        Ok(())
    }

    /// Resolves entities per draft, then writes the surviving rows as one batch.
    /// A draft whose entities are refused is skipped on its own.
    ///
    /// Returns an error as soon as the store stops answering: nothing after
    /// that point can be counted as written, so the page must not be committed.
    pub async fn write_drafts(&self, drafts: &[ReceiptDraft]) -> Result<DraftOutcome, StoreError> {
        let mut entity_failures = 0usize;
        let mut records = Vec::with_capacity(drafts.len());
        for draft in drafts {
            match self.resolve_entities(draft).await {
                Ok(()) => records.push(draft.record.clone()),
                Err(err) if err.is_connection() => return Err(err),
                Err(err) => {
                    entity_failures += 1;
                    warn!(
                        external_id = %draft.record.external_id,
                        error = %err,
                        "entity upsert refused; skipping receipt"
                    );
                }
            }
        }

        let outcome = self.write_batch(&records).await?;
        Ok(DraftOutcome {
            written: outcome.written,
            entity_failures,
            write_failures: outcome.failed,
            fell_back: outcome.fell_back,
        })
    }

    /// One bulk statement; on failure, per-row upserts with retries. Rows the
    /// store refuses are counted and skipped, a store outage is returned.
    pub async fn write_batch(&self, records: &[TransactionRecord]) -> Result<WriteOutcome, StoreError> {
        if records.is_empty() {
            return Ok(WriteOutcome::default());
        }

        match self.store.upsert_transactions(records).await {
            Ok(()) => {
                let written = collapse_duplicate_ids(records).len();
                debug!(written, "batch upsert committed");
                return Ok(WriteOutcome {
                    written,
                    failed: 0,
                    fell_back: false,
                });
            }
            Err(err) => {
                warn!(
                    rows = records.len(),
                    error = %err,
                    "batch upsert failed; falling back to per-row upserts"
                );
            }
        }

        let store = self.store.as_ref();
        let mut outcome = WriteOutcome {
            fell_back: true,
            ..WriteOutcome::default()
        };
        for record in collapse_duplicate_ids(records) {
            match retry_with_backoff(&self.policy, "receipt upsert", move || {
                store.upsert_transaction(record)
            })
            .await
            {
                Ok(()) => outcome.written += 1,
                Err(err) if err.is_connection() => return Err(err),
                Err(err) => {
                    outcome.failed += 1;
                    warn!(
                        external_id = %record.external_id,
                        error = %err,
                        "receipt upsert refused; skipping"
                    );
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfin_core::{Contributor, Entity};
    use cfin_storage::MemoryStore;
    use std::time::Duration;

    fn record(id: &str, amount: f64) -> TransactionRecord {
        TransactionRecord {
            external_id: id.to_string(),
            committee_id: Some("C1".into()),
            amount,
            transaction_date: None,
            cycle: 2024,
            contributor_id: None,
            is_individual: true,
            individual: Default::default(),
            conduit: Default::default(),
            filing: Default::default(),
            load_date: None,
        }
    }

    fn upserter(store: &Arc<MemoryStore>) -> RelationalUpserter {
        RelationalUpserter::new(store.clone(), BackoffPolicy::fixed(3, Duration::ZERO))
    }

    #[tokio::test]
    async fn bulk_path_counts_distinct_rows() {
        let store = Arc::new(MemoryStore::new());
        let outcome = upserter(&store)
            .write_batch(&[record("1", 1.0), record("2", 2.0), record("1", 3.0)])
            .await
            .expect("batch");
        assert_eq!(
            outcome,
            WriteOutcome {
                written: 2,
                failed: 0,
                fell_back: false
            }
        );
        assert_eq!(store.transaction("1").map(|r| r.amount), Some(3.0));
    }

    #[tokio::test]
    async fn rejected_row_is_isolated_by_the_fallback() {
        let store = Arc::new(MemoryStore::new());
        store.reject_external_id("2");
        let outcome = upserter(&store)
            .write_batch(&[record("1", 1.0), record("2", 2.0), record("3", 3.0)])
            .await
            .expect("fallback");
        assert_eq!(
            outcome,
            WriteOutcome {
                written: 2,
                failed: 1,
                fell_back: true
            }
        );
        assert_eq!(store.transaction_count(), 2);
        assert!(store.transaction("2").is_none());
    }

    #[tokio::test]
    async fn transient_entity_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let draft = ReceiptDraft {
            record: record("1", 5.0),
            receiving: Some(Entity::new("C1", "Committee One")),
            contributor: Contributor::Individual,
            conduit: None,
        };
        store.fail_next_writes(2);
        let outcome = upserter(&store).write_drafts(&[draft]).await.expect("write");
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.failed(), 0);
        assert!(store.entity("C1").is_some());
    }

    #[tokio::test]
    async fn refused_entity_skips_only_that_receipt() {
        let store = Arc::new(MemoryStore::new());
        let doomed = ReceiptDraft {
            record: record("1", 5.0),
            receiving: Some(Entity::new("C1", "Committee One")),
            contributor: Contributor::Individual,
            conduit: None,
        };
        let plain = ReceiptDraft {
            record: record("2", 7.0),
            receiving: None,
            contributor: Contributor::Individual,
            conduit: None,
        };
        store.reject_entity("C1");
        let outcome = upserter(&store)
            .write_drafts(&[doomed, plain])
            .await
            .expect("write");
        assert_eq!(outcome.entity_failures, 1);
        assert_eq!(outcome.written, 1);
        assert!(store.transaction("1").is_none());
        assert!(store.transaction("2").is_some());
    }

    #[tokio::test]
    async fn store_outage_during_fallback_is_returned() {
        let store = Arc::new(MemoryStore::new());
        // Bulk attempt plus every per-row attempt for the first record.
        store.fail_next_writes(4);
        let err = upserter(&store)
            .write_batch(&[record("1", 1.0), record("2", 2.0)])
            .await
            .expect_err("outage");
        assert!(err.is_connection());
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn store_outage_during_entity_resolution_is_returned() {
        let store = Arc::new(MemoryStore::new());
        let draft = ReceiptDraft {
            record: record("1", 5.0),
            receiving: Some(Entity::new("C1", "Committee One")),
            contributor: Contributor::Individual,
            conduit: None,
        };
        store.fail_next_writes(3);
        let err = upserter(&store)
            .write_drafts(&[draft])
            .await
            .expect_err("outage");
        assert!(err.is_connection());
        assert!(store.transaction("1").is_none());
    }
}
