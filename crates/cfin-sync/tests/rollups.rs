use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfin_adapters::{FixturePageSource, IndexedPagination, LastIndexes, RawCommittee, RawReceipt, ScheduleAPage};
use cfin_core::{
    Candidate, CounterpartTotal, Entity, RollupKind, SubjectTotal, TransactionRecord,
    UNKNOWN_REGION,
};
use cfin_storage::{
    BackoffPolicy, MemoryDocumentStore, MemoryStore, RelationalStore, StoreError,
};
use cfin_sync::{
    maybe_build_scheduler, AggregationEngine, DocumentUpserter, IngestSettings,
    IngestionOrchestrator, SyncConfig,
};

fn policy() -> BackoffPolicy {
    BackoffPolicy::fixed(3, Duration::ZERO)
}

fn engine(store: Arc<dyn RelationalStore>, docs: &Arc<MemoryDocumentStore>, top_n: usize) -> AggregationEngine {
    AggregationEngine::new(store, DocumentUpserter::new(docs.clone(), policy()), top_n)
}

fn committee(id: &str, candidate: &str) -> RawCommittee {
    RawCommittee {
        committee_id: Some(id.to_string()),
        name: Some(format!("{candidate} FOR AMERICA")),
        candidate_ids: Some(vec![candidate.to_string()]),
        ..Default::default()
    }
}

fn pac_receipt(sub_id: &str, receiving: &RawCommittee, amount: f64) -> RawReceipt {
    RawReceipt {
        sub_id: Some(sub_id.to_string()),
        contribution_receipt_amount: Some(amount),
        two_year_transaction_period: Some(2024),
        committee_id: receiving.committee_id.clone(),
        committee: Some(receiving.clone()),
        is_individual: Some(false),
        contributor_name: Some("ACME PAC".into()),
        contributor: Some(RawCommittee {
            committee_id: Some("A".into()),
            name: Some("ACME PAC".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn ingest(store: &Arc<MemoryStore>, results: Vec<RawReceipt>) {
    let source = FixturePageSource::from_pages(vec![ScheduleAPage {
        results,
        pagination: IndexedPagination {
            last_indexes: Some(LastIndexes {
                last_index: Some("end".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
    }])
    .expect("fixture pages");
    let settings = IngestSettings {
        per_page: 100,
        page_delay: Duration::ZERO,
        write_policy: policy(),
    };
    // Fresh checkpoints each time so a replayed page is fetched again.
    IngestionOrchestrator::new(
        Arc::new(source),
        store.clone(),
        Arc::new(MemoryStore::new()),
        settings,
    )
    .run("schedule_a_2024", 2024, None)
    .await
    .expect("ingest");
}

fn ids(top: &[CounterpartTotal]) -> Vec<(&str, f64)> {
    top.iter().map(|c| (c.id.as_str(), c.total_amount)).collect()
}

#[tokio::test]
async fn contributor_leaderboard_ranks_linked_candidates() {
    let store = Arc::new(MemoryStore::new());
    let cx = committee("CX", "X");
    let cy = committee("CY", "Y");
    ingest(
        &store,
        vec![
            pac_receipt("1", &cy, 50.0),
            pac_receipt("2", &cx, 60.0),
            pac_receipt("3", &cx, 40.0),
        ],
    )
    .await;
    store
        .upsert_candidate(&Candidate {
            id: "X".into(),
            name: "CANDIDATE X".into(),
            party: Some("IND".into()),
            office: Some("S".into()),
        })
        .await
        .expect("candidate");

    let docs = Arc::new(MemoryDocumentStore::new());
    let engine = engine(store.clone(), &docs, 10);
    let summary = engine.aggregate(2024).await.expect("aggregate");
    assert_eq!(summary.contributors, 1);
    assert_eq!(summary.candidates, 2);
    assert_eq!(summary.regions, 0);
    assert_eq!(summary.degraded_subjects, 0);

    let doc = engine
        .documents()
        .get(RollupKind::ByContributor, "A", 2024)
        .await
        .expect("read")
        .expect("document");
    assert_eq!(doc.display_name, "ACME PAC");
    assert_eq!(doc.total_amount, 150.0);
    assert_eq!(doc.transaction_count, 3);
    assert_eq!(ids(&doc.top), vec![("X", 100.0), ("Y", 50.0)]);
    assert_eq!(doc.top[0].name, "CANDIDATE X");
    assert_eq!(doc.top[1].name, "Y");

    let candidate = engine
        .documents()
        .get(RollupKind::ByCandidate, "X", 2024)
        .await
        .expect("read")
        .expect("candidate document");
    assert_eq!(candidate.detail.as_deref(), Some("IND"));
    assert_eq!(ids(&candidate.top), vec![("A", 100.0)]);
}

#[tokio::test]
async fn recompute_replaces_the_whole_leaderboard() {
    let store = Arc::new(MemoryStore::new());
    let cx = committee("CX", "X");
    let cy = committee("CY", "Y");
    ingest(&store, vec![pac_receipt("1", &cx, 100.0), pac_receipt("2", &cy, 50.0)]).await;

    let docs = Arc::new(MemoryDocumentStore::new());
    let engine = engine(store.clone(), &docs, 10);
    engine
        .aggregate_kind(RollupKind::ByContributor, 2024)
        .await
        .expect("first pass");

    // The second receipt is amended to land on X's committee instead.
    ingest(&store, vec![pac_receipt("2", &cx, 50.0)]).await;
    engine
        .aggregate_kind(RollupKind::ByContributor, 2024)
        .await
        .expect("second pass");

    let doc = engine
        .documents()
        .get(RollupKind::ByContributor, "A", 2024)
        .await
        .expect("read")
        .expect("document");
    assert_eq!(ids(&doc.top), vec![("X", 150.0)]);
    assert_eq!(docs.len(), 1);
}

#[tokio::test]
async fn top_n_truncates_and_keeps_tie_order() {
    let store = Arc::new(MemoryStore::new());
    let committees = ["P", "Q", "R"].map(|c| committee(&format!("C{c}"), c));
    ingest(
        &store,
        committees
            .iter()
            .enumerate()
            .map(|(i, c)| pac_receipt(&i.to_string(), c, 25.0))
            .collect(),
    )
    .await;

    let docs = Arc::new(MemoryDocumentStore::new());
    engine(store.clone(), &docs, 2)
        .aggregate_kind(RollupKind::ByContributor, 2024)
        .await
        .expect("pass");
    let doc = &docs.all()[0];
    assert_eq!(ids(&doc.top), vec![("P", 25.0), ("Q", 25.0)]);
}

#[tokio::test]
async fn region_rollup_only_counts_individuals() {
    let store = Arc::new(MemoryStore::new());
    let cx = committee("CX", "X");
    let individual = |sub_id: &str, state: Option<&str>, amount: f64| RawReceipt {
        sub_id: Some(sub_id.to_string()),
        contribution_receipt_amount: Some(amount),
        two_year_transaction_period: Some(2024),
        committee_id: Some("CX".into()),
        committee: Some(cx.clone()),
        is_individual: Some(true),
        contributor_name: Some("DOE, JANE".into()),
        contributor_state: state.map(str::to_string),
        ..Default::default()
    };
    ingest(
        &store,
        vec![
            individual("1", Some("CA"), 30.0),
            individual("2", None, 70.0),
            pac_receipt("3", &cx, 1_000.0),
        ],
    )
    .await;

    let docs = Arc::new(MemoryDocumentStore::new());
    let engine = engine(store.clone(), &docs, 10);
    let outcome = engine
        .aggregate_kind(RollupKind::ByRegion, 2024)
        .await
        .expect("pass");
    assert_eq!(outcome.documents, 2);

    let unknown = engine
        .documents()
        .get(RollupKind::ByRegion, UNKNOWN_REGION, 2024)
        .await
        .expect("read")
        .expect("unknown bucket");
    assert_eq!(unknown.total_amount, 70.0);
    assert_eq!(ids(&unknown.top), vec![("X", 70.0)]);
}

#[tokio::test]
async fn document_replace_rides_out_transient_failures() {
    let store = Arc::new(MemoryStore::new());
    ingest(&store, vec![pac_receipt("1", &committee("CX", "X"), 10.0)]).await;

    let docs = Arc::new(MemoryDocumentStore::new());
    docs.fail_next_writes(2);
    let engine = engine(store.clone(), &docs, 10);
    engine
        .aggregate_kind(RollupKind::ByContributor, 2024)
        .await
        .expect("third attempt lands");
    assert_eq!(docs.len(), 1);
}

#[tokio::test]
async fn document_store_outage_aborts_the_pass() {
    let store = Arc::new(MemoryStore::new());
    ingest(&store, vec![pac_receipt("1", &committee("CX", "X"), 10.0)]).await;

    let docs = Arc::new(MemoryDocumentStore::new());
    docs.fail_next_writes(3);
    let err = engine(store.clone(), &docs, 10)
        .aggregate(2024)
        .await
        .expect_err("retries exhausted");
    assert!(format!("{err:#}").contains("replacing by_contributor document for A"));
    assert!(docs.is_empty());
}

/// Delegates to a `MemoryStore`, failing the queries a test asks it to.
struct FlakyQueries {
    inner: Arc<MemoryStore>,
    fail_totals: bool,
    fail_counterparts_for: Option<&'static str>,
}

#[async_trait]
impl RelationalStore for FlakyQueries {
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.inner.upsert_entity(entity).await
    }

    async fn upsert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError> {
        self.inner.upsert_candidate(candidate).await
    }

    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        self.inner.upsert_transaction(record).await
    }

    async fn upsert_transactions(&self, records: &[TransactionRecord]) -> Result<(), StoreError> {
        self.inner.upsert_transactions(records).await
    }

    async fn subject_totals(
        &self,
        kind: RollupKind,
        cycle: i32,
    ) -> Result<Vec<SubjectTotal>, StoreError> {
        if self.fail_totals {
            return Err(StoreError::Unavailable("totals query timed out".into()));
        }
        self.inner.subject_totals(kind, cycle).await
    }

    async fn top_counterparts(
        &self,
        kind: RollupKind,
        subject_id: &str,
        cycle: i32,
        limit: usize,
    ) -> Result<Vec<CounterpartTotal>, StoreError> {
        if self.fail_counterparts_for == Some(subject_id) {
            return Err(StoreError::Unavailable("counterpart query timed out".into()));
        }
        self.inner.top_counterparts(kind, subject_id, cycle, limit).await
    }
}

#[tokio::test]
async fn counterpart_failure_degrades_to_an_empty_leaderboard() {
    let store = Arc::new(MemoryStore::new());
    let cx = committee("CX", "X");
    ingest(&store, vec![pac_receipt("1", &cx, 10.0)]).await;

    let flaky = Arc::new(FlakyQueries {
        inner: store,
        fail_totals: false,
        fail_counterparts_for: Some("A"),
    });
    let docs = Arc::new(MemoryDocumentStore::new());
    let engine = engine(flaky, &docs, 10);
    let summary = engine.aggregate(2024).await.expect("aggregate");
    assert_eq!(summary.degraded_subjects, 1);

    let doc = engine
        .documents()
        .get(RollupKind::ByContributor, "A", 2024)
        .await
        .expect("read")
        .expect("document still written");
    assert!(doc.top.is_empty());
    assert_eq!(doc.total_amount, 10.0);
}

#[tokio::test]
async fn totals_failure_aborts_the_run() {
    let flaky = Arc::new(FlakyQueries {
        inner: Arc::new(MemoryStore::new()),
        fail_totals: true,
        fail_counterparts_for: None,
    });
    let docs = Arc::new(MemoryDocumentStore::new());
    let err = engine(flaky, &docs, 10)
        .aggregate(2024)
        .await
        .expect_err("fatal");
    assert!(format!("{err:#}").contains("by_contributor totals"));
    assert!(docs.is_empty());
}

#[tokio::test]
async fn scheduler_is_not_built_when_disabled() {
    let config = SyncConfig::from_lookup(|_| None);
    let docs = Arc::new(MemoryDocumentStore::new());
    let engine = Arc::new(engine(Arc::new(MemoryStore::new()), &docs, 10));
    let sched = maybe_build_scheduler(&config, engine).await.expect("build");
    assert!(sched.is_none());
}
