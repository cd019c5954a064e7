use std::sync::Arc;

use anyhow::{Context, Result};
use cfin_core::{DocumentKey, RollupKind, RollupSummary};
use cfin_storage::{retry_with_backoff, BackoffPolicy, DocumentStore, RelationalStore, StoreError};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

/// Writes rollup documents, each one replacing whatever was stored under its key.
#[derive(Clone)]
pub struct DocumentUpserter {
    store: Arc<dyn DocumentStore>,
    policy: BackoffPolicy,
}

impl DocumentUpserter {
    pub fn new(store: Arc<dyn DocumentStore>, policy: BackoffPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn replace(&self, summary: &RollupSummary) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        retry_with_backoff(&self.policy, "document replace", move || store.replace(summary)).await
    }

    pub async fn get(
        &self,
        kind: RollupKind,
        subject_id: &str,
        cycle: i32,
    ) -> Result<Option<RollupSummary>, StoreError> {
        self.store
            .get(&DocumentKey {
                kind,
                subject_id: subject_id.to_string(),
                cycle,
            })
            .await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassOutcome {
    pub documents: usize,
    /// Subjects whose counterpart lookup failed and were written with an empty list.
    pub degraded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    pub cycle: i32,
    pub contributors: usize,
    pub candidates: usize,
    pub regions: usize,
    pub degraded_subjects: usize,
}

pub struct AggregationEngine {
    store: Arc<dyn RelationalStore>,
    documents: DocumentUpserter,
    top_n: usize,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn RelationalStore>, documents: DocumentUpserter, top_n: usize) -> Self {
        Self {
            store,
            documents,
            top_n,
        }
    }

    pub fn documents(&self) -> &DocumentUpserter {
        &self.documents
    }

    /// Recomputes every rollup variant for `cycle`, one pass after another.
    pub async fn aggregate(&self, cycle: i32) -> Result<AggregationSummary> {
        let mut summary = AggregationSummary {
            cycle,
            contributors: 0,
            candidates: 0,
            regions: 0,
            degraded_subjects: 0,
        };
        for kind in RollupKind::ALL {
            let pass = self.aggregate_kind(kind, cycle).await?;
            match kind {
                RollupKind::ByContributor => summary.contributors = pass.documents,
                RollupKind::ByCandidate => summary.candidates = pass.documents,
                RollupKind::ByRegion => summary.regions = pass.documents,
            }
            summary.degraded_subjects += pass.degraded;
        }
        info!(
            cycle,
            contributors = summary.contributors,
            candidates = summary.candidates,
            regions = summary.regions,
            degraded = summary.degraded_subjects,
            "aggregation finished"
        );
        Ok(summary)
    }

    /// One pass: subject totals, top counterparts per subject, document replace.
    ///
    /// A failed counterpart lookup degrades that subject to an empty leaderboard.
    /// Totals or document write failures abort the pass.
    pub async fn aggregate_kind(&self, kind: RollupKind, cycle: i32) -> Result<PassOutcome> {
        let span = info_span!("aggregate_pass", variant = %kind, cycle);
        self.run_pass(kind, cycle).instrument(span).await
    }

    async fn run_pass(&self, kind: RollupKind, cycle: i32) -> Result<PassOutcome> {
        let subjects = self
            .store
            .subject_totals(kind, cycle)
            .await
            .with_context(|| format!("loading {kind} totals for cycle {cycle}"))?;
        let recomputed_at = Utc::now();

        let mut outcome = PassOutcome::default();
        for subject in subjects.into_iter().filter(|s| s.transaction_count > 0) {
            let top = match self
                .store
                .top_counterparts(kind, &subject.subject_id, cycle, self.top_n)
                .await
            {
                Ok(top) => top,
                Err(err) => {
                    outcome.degraded += 1;
                    warn!(
                        subject_id = %subject.subject_id,
                        error = %err,
                        "counterpart lookup failed; writing empty leaderboard"
                    );
                    Vec::new()
                }
            };

            let document =
                RollupSummary::assemble(kind, cycle, subject, top, self.top_n, recomputed_at);
            self.documents
                .replace(&document)
                .await
                .with_context(|| format!("replacing {kind} document for {}", document.subject_id))?;
            outcome.documents += 1;
        }

        info!(documents = outcome.documents, degraded = outcome.degraded, "pass complete");
        Ok(outcome)
    }
}
