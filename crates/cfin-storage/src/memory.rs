//! In-process backends used by dry runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cfin_core::{
    Candidate, CounterpartTotal, DocumentKey, Entity, IngestionCheckpoint, RollupKind,
    RollupSummary, SubjectTotal, TransactionRecord, UNKNOWN_REGION,
};
use chrono::Utc;

use crate::{collapse_duplicate_ids, CheckpointStore, DocumentStore, RelationalStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    entities: HashMap<String, Entity>,
    candidates: HashMap<String, Candidate>,
    receipts: HashMap<String, (u64, TransactionRecord)>,
    next_seq: u64,
    checkpoints: HashMap<String, IngestionCheckpoint>,
    checkpoint_history: Vec<IngestionCheckpoint>,
    rejected_ids: HashSet<String>,
    rejected_entities: HashSet<String>,
    failing_writes: usize,
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn check_rejected(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        if self.rejected_ids.contains(&record.external_id) {
            return Err(StoreError::Rejected {
                key: record.external_id.clone(),
                reason: "row refused by store".into(),
            });
        }
        Ok(())
    }

    fn put_receipt(&mut self, record: &TransactionRecord) {
        // An overwrite keeps the original insertion sequence.
        let seq = match self.receipts.get(&record.external_id) {
            Some((seq, _)) => *seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.receipts
            .insert(record.external_id.clone(), (seq, record.clone()));
    }

    fn cycle_receipts(&self, cycle: i32) -> Vec<(u64, &TransactionRecord)> {
        let mut rows = self
            .receipts
            .values()
            .filter(|(_, r)| r.cycle == cycle)
            .map(|(seq, r)| (*seq, r))
            .collect::<Vec<_>>();
        rows.sort_by_key(|(seq, _)| *seq);
        rows
    }

    fn linked_candidates(&self, record: &TransactionRecord) -> &[String] {
        record
            .committee_id
            .as_ref()
            .and_then(|id| self.entities.get(id))
            .map(|c| c.candidate_ids.as_slice())
            .unwrap_or_default()
    }

    fn contributor_row(&self, id: &str) -> (String, Option<String>) {
        match self.entities.get(id) {
            Some(e) => (e.display_name().to_string(), e.state.clone()),
            None => (id.to_string(), None),
        }
    }

    fn candidate_row(&self, id: &str) -> (String, Option<String>) {
        match self.candidates.get(id) {
            Some(c) => (c.name.clone(), c.party.clone()),
            None => (id.to_string(), None),
        }
    }
}

fn region_of(record: &TransactionRecord) -> String {
    record
        .individual
        .state
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_REGION)
        .to_string()
}

/// Sums `(key, amount)` pairs, which must arrive in insertion order, and
/// sorts groups by total descending with first appearance breaking ties.
fn group_totals<I>(rows: I) -> Vec<(String, f64, i64)>
where
    I: IntoIterator<Item = (String, f64)>,
{
    let mut order = Vec::new();
    let mut totals: HashMap<String, (f64, i64)> = HashMap::new();
    for (key, amount) in rows {
        let entry = totals.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            (0.0, 0)
        });
        entry.0 += amount;
        entry.1 += 1;
    }

    let mut grouped = order
        .into_iter()
        .filter_map(|key| totals.remove(&key).map(|(sum, n)| (key, sum, n)))
        .collect::<Vec<_>>();
    grouped.sort_by(|a, b| b.1.total_cmp(&a.1));
    grouped
}

/// Relational and checkpoint store held in a mutex. Mirrors the Postgres
/// query semantics so pipeline tests exercise the same rollup rules.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every write touching `external_id` fails with [`StoreError::Rejected`],
    /// including any batch that contains it.
    pub fn reject_external_id(&self, external_id: impl Into<String>) {
        self.lock().rejected_ids.insert(external_id.into());
    }

    /// Upserts of committee `id` fail with [`StoreError::Rejected`].
    pub fn reject_entity(&self, id: impl Into<String>) {
        self.lock().rejected_entities.insert(id.into());
    }

    /// The next `count` write calls fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    pub fn transaction(&self, external_id: &str) -> Option<TransactionRecord> {
        self.lock()
            .receipts
            .get(external_id)
            .map(|(_, r)| r.clone())
    }

    /// All rows in insertion order.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        let state = self.lock();
        let mut rows = state.receipts.values().collect::<Vec<_>>();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().receipts.len()
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.lock().entities.get(id).cloned()
    }

    pub fn candidate(&self, id: &str) -> Option<Candidate> {
        self.lock().candidates.get(id).cloned()
    }

    /// Every checkpoint successfully saved, oldest first.
    pub fn saved_checkpoints(&self) -> Vec<IngestionCheckpoint> {
        self.lock().checkpoint_history.clone()
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.take_failure()?;
        if state.rejected_entities.contains(&entity.id) {
            return Err(StoreError::Rejected {
                key: entity.id.clone(),
                reason: "committee refused by store".into(),
            });
        }
        let mut merged = entity.clone();
        match state.entities.get(&entity.id) {
            Some(existing) => {
                merged.name = merged.name.or_else(|| existing.name.clone());
                merged.committee_type = merged
                    .committee_type
                    .or_else(|| existing.committee_type.clone());
                merged.designation = merged.designation.or_else(|| existing.designation.clone());
                merged.party = merged.party.or_else(|| existing.party.clone());
                merged.state = merged.state.or_else(|| existing.state.clone());
                if merged.candidate_ids.is_empty() {
                    merged.candidate_ids = existing.candidate_ids.clone();
                }
            }
            None => {
                merged.name.get_or_insert_with(|| entity.id.clone());
            }
        }
        state.entities.insert(merged.id.clone(), merged);
        Ok(())
    }

    async fn upsert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.take_failure()?;
        state
            .candidates
            .insert(candidate.id.clone(), candidate.clone());
        Ok(())
    }

    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.take_failure()?;
        state.check_rejected(record)?;
        state.put_receipt(record);
        Ok(())
    }

    async fn upsert_transactions(&self, records: &[TransactionRecord]) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.take_failure()?;
        let rows = collapse_duplicate_ids(records);
        for record in &rows {
            state.check_rejected(record)?;
        }
        for record in rows {
            state.put_receipt(record);
        }
        Ok(())
    }

    async fn subject_totals(
        &self,
        kind: RollupKind,
        cycle: i32,
    ) -> Result<Vec<SubjectTotal>, StoreError> {
        let state = self.lock();
        let receipts = state.cycle_receipts(cycle);

        let grouped = match kind {
            RollupKind::ByContributor => group_totals(
                receipts
                    .iter()
                    .filter_map(|(_, r)| r.contributor_id.clone().map(|id| (id, r.amount))),
            ),
            RollupKind::ByCandidate => group_totals(receipts.iter().flat_map(|(_, r)| {
                state
                    .linked_candidates(r)
                    .iter()
                    .map(|id| (id.clone(), r.amount))
                    .collect::<Vec<_>>()
            })),
            RollupKind::ByRegion => group_totals(
                receipts
                    .iter()
                    .filter(|(_, r)| r.is_individual)
                    .map(|(_, r)| (region_of(r), r.amount)),
            ),
        };

        Ok(grouped
            .into_iter()
            .map(|(subject_id, total_amount, transaction_count)| {
                let (display_name, detail) = match kind {
                    RollupKind::ByContributor => state.contributor_row(&subject_id),
                    RollupKind::ByCandidate => state.candidate_row(&subject_id),
                    RollupKind::ByRegion => (subject_id.clone(), None),
                };
                SubjectTotal {
                    subject_id,
                    display_name,
                    detail,
                    total_amount,
                    transaction_count,
                }
            })
            .collect())
    }

    async fn top_counterparts(
        &self,
        kind: RollupKind,
        subject_id: &str,
        cycle: i32,
        limit: usize,
    ) -> Result<Vec<CounterpartTotal>, StoreError> {
        let state = self.lock();
        let receipts = state.cycle_receipts(cycle);

        let candidates_of = |keep: &dyn Fn(&TransactionRecord) -> bool| {
            group_totals(
                receipts
                    .iter()
                    .filter(|(_, r)| keep(r))
                    .flat_map(|(_, r)| {
                        state
                            .linked_candidates(r)
                            .iter()
                            .map(|id| (id.clone(), r.amount))
                            .collect::<Vec<_>>()
                    }),
            )
        };

        let grouped = match kind {
            RollupKind::ByContributor => candidates_of(&|r: &TransactionRecord| {
                r.contributor_id.as_deref() == Some(subject_id)
            }),
            RollupKind::ByRegion => candidates_of(&|r: &TransactionRecord| {
                r.is_individual && region_of(r) == subject_id
            }),
            RollupKind::ByCandidate => group_totals(
                receipts
                    .iter()
                    .filter(|(_, r)| state.linked_candidates(r).iter().any(|c| c == subject_id))
                    .filter_map(|(_, r)| r.contributor_id.clone().map(|id| (id, r.amount))),
            ),
        };

        Ok(grouped
            .into_iter()
            .take(limit)
            .map(|(id, total_amount, transaction_count)| {
                let (name, detail) = match kind {
                    RollupKind::ByCandidate => state.contributor_row(&id),
                    RollupKind::ByContributor | RollupKind::ByRegion => state.candidate_row(&id),
                };
                CounterpartTotal {
                    id,
                    name,
                    detail,
                    total_amount,
                    transaction_count,
                }
            })
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, source: &str) -> Result<IngestionCheckpoint, StoreError> {
        Ok(self
            .lock()
            .checkpoints
            .get(source)
            .cloned()
            .unwrap_or_else(|| IngestionCheckpoint::empty(source)))
    }

    async fn save(&self, checkpoint: &IngestionCheckpoint) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.take_failure()?;
        let mut stored = checkpoint.clone();
        stored.updated_at = Some(checkpoint.updated_at.unwrap_or_else(Utc::now));
        state.checkpoint_history.push(stored.clone());
        state.checkpoints.insert(stored.source.clone(), stored);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<DocumentKey, RollupSummary>>,
    failing_writes: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocumentKey, RollupSummary>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` replaces fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of every stored document, ordered by variant, cycle then subject.
    pub fn all(&self) -> Vec<RollupSummary> {
        let mut docs = self.lock().values().cloned().collect::<Vec<_>>();
        docs.sort_by(|a, b| {
            (a.kind, a.cycle, &a.subject_id).cmp(&(b.kind, b.cycle, &b.subject_id))
        });
        docs
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn replace(&self, summary: &RollupSummary) -> Result<(), StoreError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected document write failure".into()));
        }
        self.lock().insert(summary.key(), summary.clone());
        Ok(())
    }

    async fn get(&self, key: &DocumentKey) -> Result<Option<RollupSummary>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfin_core::IndividualFields;

    fn receipt(id: &str, committee: &str, amount: f64) -> TransactionRecord {
        TransactionRecord {
            external_id: id.to_string(),
            committee_id: Some(committee.to_string()),
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

    fn from_org(id: &str, committee: &str, contributor: &str, amount: f64) -> TransactionRecord {
        TransactionRecord {
            contributor_id: Some(contributor.to_string()),
            is_individual: false,
            ..receipt(id, committee, amount)
        }
    }

    fn from_state(id: &str, committee: &str, state: Option<&str>, amount: f64) -> TransactionRecord {
        TransactionRecord {
            individual: IndividualFields {
                state: state.map(str::to_string),
                ..Default::default()
            },
            ..receipt(id, committee, amount)
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_and_keeps_one_row_per_id() {
        let store = MemoryStore::new();
        store
            .upsert_transaction(&receipt("1", "C1", 10.0))
            .await
            .expect("first");
        store
            .upsert_transactions(&[receipt("2", "C1", 5.0), receipt("1", "C1", 99.0)])
            .await
            .expect("batch");

        assert_eq!(store.transaction_count(), 2);
        assert_eq!(store.transaction("1").map(|r| r.amount), Some(99.0));
        let ids = store
            .transactions()
            .into_iter()
            .map(|r| r.external_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn rejected_row_rolls_back_the_whole_batch() {
        let store = MemoryStore::new();
        store.reject_external_id("bad");
        let err = store
            .upsert_transactions(&[receipt("ok", "C1", 1.0), receipt("bad", "C1", 2.0)])
            .await
            .expect_err("batch must fail");
        assert!(matches!(err, StoreError::Rejected { .. }));
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn entity_upsert_without_candidates_keeps_stored_links() {
        let store = MemoryStore::new();
        store
            .upsert_entity(&Entity::new("C1", "Friends of X").with_candidates(["P1"]))
            .await
            .expect("linked");
        store
            .upsert_entity(&Entity::new("C1", "Friends of X 2024"))
            .await
            .expect("renamed");

        let entity = store.entity("C1").expect("entity");
        assert_eq!(entity.name.as_deref(), Some("Friends of X 2024"));
        assert_eq!(entity.candidate_ids, vec!["P1".to_string()]);
    }

    #[tokio::test]
    async fn sparse_committee_upsert_keeps_stored_details() {
        let store = MemoryStore::new();
        let full = Entity {
            committee_type: Some("P".into()),
            party: Some("DEM".into()),
            ..Entity::new("CX", "FRIENDS OF X").with_candidates(["X"])
        };
        store.upsert_entity(&full).await.expect("seed");
        store
            .upsert_entity(&Entity {
                id: "CX".into(),
                state: Some("NY".into()),
                ..Entity::default()
            })
            .await
            .expect("sparse");

        let entity = store.entity("CX").expect("entity");
        assert_eq!(entity.name.as_deref(), Some("FRIENDS OF X"));
        assert_eq!(entity.party.as_deref(), Some("DEM"));
        assert_eq!(entity.committee_type.as_deref(), Some("P"));
        assert_eq!(entity.state.as_deref(), Some("NY"));
        assert_eq!(entity.candidate_ids, vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn unnamed_committee_is_stored_under_its_id() {
        let store = MemoryStore::new();
        store
            .upsert_entity(&Entity {
                id: "C9".into(),
                ..Entity::default()
            })
            .await
            .expect("insert");
        assert_eq!(store.entity("C9").and_then(|e| e.name).as_deref(), Some("C9"));
    }

    #[tokio::test]
    async fn contributor_rollup_follows_committee_candidate_links() {
        let store = MemoryStore::new();
        store
            .upsert_entity(&Entity::new("CX", "X for America").with_candidates(["X"]))
            .await
            .expect("cx");
        store
            .upsert_entity(&Entity::new("CY", "Y Victory").with_candidates(["Y"]))
            .await
            .expect("cy");
        store
            .upsert_entity(&Entity::new("A", "Acme PAC"))
            .await
            .expect("a");
        store
            .upsert_transactions(&[
                from_org("1", "CY", "A", 50.0),
                from_org("2", "CX", "A", 60.0),
                from_org("3", "CX", "A", 40.0),
            ])
            .await
            .expect("rows");

        let subjects = store
            .subject_totals(RollupKind::ByContributor, 2024)
            .await
            .expect("subjects");
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].display_name, "Acme PAC");
        assert_eq!(subjects[0].total_amount, 150.0);
        assert_eq!(subjects[0].transaction_count, 3);

        let top = store
            .top_counterparts(RollupKind::ByContributor, "A", 2024, 10)
            .await
            .expect("top");
        let view = top
            .iter()
            .map(|c| (c.id.as_str(), c.total_amount))
            .collect::<Vec<_>>();
        assert_eq!(view, vec![("X", 100.0), ("Y", 50.0)]);

        let donors = store
            .top_counterparts(RollupKind::ByCandidate, "X", 2024, 10)
            .await
            .expect("donors");
        assert_eq!(donors.len(), 1);
        assert_eq!(donors[0].name, "Acme PAC");
    }

    #[tokio::test]
    async fn region_rollup_buckets_blank_states_as_unknown() {
        let store = MemoryStore::new();
        store
            .upsert_transactions(&[
                from_state("1", "C1", Some("CA"), 20.0),
                from_state("2", "C1", Some("  "), 30.0),
                from_state("3", "C1", None, 5.0),
                from_org("4", "C1", "ORG", 500.0),
            ])
            .await
            .expect("rows");

        let regions = store
            .subject_totals(RollupKind::ByRegion, 2024)
            .await
            .expect("regions");
        let view = regions
            .iter()
            .map(|s| (s.subject_id.as_str(), s.total_amount, s.transaction_count))
            .collect::<Vec<_>>();
        assert_eq!(view, vec![(UNKNOWN_REGION, 35.0, 2), ("CA", 20.0, 1)]);
    }

    #[tokio::test]
    async fn equal_totals_keep_first_seen_order() {
        let store = MemoryStore::new();
        store
            .upsert_transactions(&[
                from_state("1", "C1", Some("WA"), 10.0),
                from_state("2", "C1", Some("OR"), 10.0),
            ])
            .await
            .expect("rows");
        let regions = store
            .subject_totals(RollupKind::ByRegion, 2024)
            .await
            .expect("regions");
        assert_eq!(regions[0].subject_id, "WA");
        assert_eq!(regions[1].subject_id, "OR");
    }

    #[tokio::test]
    async fn checkpoint_round_trip_records_history() {
        let store = MemoryStore::new();
        assert!(store.load("schedule_a_2024").await.expect("load").is_fresh());

        let mut checkpoint = IngestionCheckpoint::empty("schedule_a_2024");
        checkpoint.cursor = Some("42".into());
        store.save(&checkpoint).await.expect("save");

        let loaded = store.load("schedule_a_2024").await.expect("reload");
        assert_eq!(loaded.cursor.as_deref(), Some("42"));
        assert!(loaded.updated_at.is_some());
        assert_eq!(store.saved_checkpoints().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store
            .save(&IngestionCheckpoint::empty("s"))
            .await
            .is_err());
        assert!(store.save(&IngestionCheckpoint::empty("s")).await.is_ok());
    }
}
