//! Persistence contracts and backends for cfin, plus the HTTP fetch and raw
//! page archive utilities the ingestion side leans on.

use std::future::Future;

use async_trait::async_trait;
use cfin_core::{
    Candidate, CounterpartTotal, DocumentKey, Entity, IngestionCheckpoint, RollupKind,
    RollupSummary, SubjectTotal, TransactionRecord,
};
use thiserror::Error;
use tracing::warn;

mod archive;
mod http;
mod memory;
mod postgres;

pub use archive::{ArchivedPage, PageArchive};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RateLimitConfig, RequestRateLimiter, RetryDisposition,
};
pub use memory::{MemoryDocumentStore, MemoryStore};
pub use postgres::{PgDocumentStore, PgStore};

pub const CRATE_NAME: &str = "cfin-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected for {key}: {reason}")]
    Rejected { key: String, reason: String },
}

impl StoreError {
    /// True when the store itself could not be reached or stopped answering,
    /// as opposed to refusing one particular row. Callers must not skip past
    /// data on these.
    pub fn is_connection(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::Serialization(_) | StoreError::Rejected { .. } => false,
        }
    }
}

/// Normalized relational store: entities, transactions and the rollup queries over them.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError>;

    async fn upsert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError>;

    /// Insert-or-overwrite a single row keyed by `external_id`.
    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError>;

    /// Same semantics as [`RelationalStore::upsert_transaction`], applied to the
    /// whole slice atomically: either every row lands or none does.
    async fn upsert_transactions(&self, records: &[TransactionRecord]) -> Result<(), StoreError>;

    async fn subject_totals(
        &self,
        kind: RollupKind,
        cycle: i32,
    ) -> Result<Vec<SubjectTotal>, StoreError>;

    async fn top_counterparts(
        &self,
        kind: RollupKind,
        subject_id: &str,
        cycle: i32,
        limit: usize,
    ) -> Result<Vec<CounterpartTotal>, StoreError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns an empty checkpoint when the source has never been saved.
    async fn load(&self, source: &str) -> Result<IngestionCheckpoint, StoreError>;

    async fn save(&self, checkpoint: &IngestionCheckpoint) -> Result<(), StoreError>;
}

/// Read-optimized store holding one rollup document per `DocumentKey`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn replace(&self, summary: &RollupSummary) -> Result<(), StoreError>;

    async fn get(&self, key: &DocumentKey) -> Result<Option<RollupSummary>, StoreError>;
}

/// Runs `op` until it succeeds or `policy.max_retries` retries are spent,
/// sleeping `policy.delay_for_attempt` between attempts.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries => {
                warn!(what, attempt = attempt + 1, error = %err, "write attempt failed; retrying");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Keeps only the last occurrence of each `external_id`; every survivor sits
/// at the position of that last occurrence. Postgres refuses to touch one row
/// twice inside a single `INSERT .. ON CONFLICT DO UPDATE`.
pub fn collapse_duplicate_ids(records: &[TransactionRecord]) -> Vec<&TransactionRecord> {
    let mut seen = std::collections::HashSet::new();
    let mut kept = records
        .iter()
        .rev()
        .filter(|r| seen.insert(r.external_id.as_str()))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}
