//! Core domain model for campaign-finance ingestion and leaderboard rollups.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cfin-core";

/// Display key for individual receipts that carry no contributor state.
pub const UNKNOWN_REGION: &str = "Unknown";

/// Checkpoint source name for Schedule A receipts of one reporting cycle.
pub fn schedule_a_source(cycle: i32) -> String {
    format!("schedule_a_{cycle}")
}

/// Parses the date formats emitted by the source (`2024-01-15` or
/// `2024-01-15T00:00:00`, optionally with fractional seconds / offset).
pub fn parse_source_date(input: &str) -> Option<NaiveDate> {
    let trimmed = input.trim();
    let date_part = trimmed.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Cursor handed back by the source alongside each page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub token: Option<String>,
    pub last_seen_date: Option<NaiveDate>,
    pub sort_null_only: bool,
}

/// Resumable ingestion state, one per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCheckpoint {
    pub source: String,
    pub cursor: Option<String>,
    pub last_seen_date: Option<NaiveDate>,
    pub sort_null_only: bool,
    pub pages_completed: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl IngestionCheckpoint {
    pub fn empty(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            cursor: None,
            last_seen_date: None,
            sort_null_only: false,
            pages_completed: 0,
            updated_at: None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.cursor.is_none() && self.last_seen_date.is_none() && self.pages_completed == 0
    }

    /// Returns the checkpoint that follows one completed page.
    ///
    /// A blank token or a missing date keeps the previous value so the cursor
    /// never moves backwards to "start of data".
    pub fn advanced(&self, next: &PageCursor) -> Self {
        let cursor = match next.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Some(token.to_string()),
            _ => self.cursor.clone(),
        };
        Self {
            source: self.source.clone(),
            cursor,
            last_seen_date: next.last_seen_date.or(self.last_seen_date),
            sort_null_only: next.sort_null_only,
            pages_completed: self.pages_completed + 1,
            updated_at: self.updated_at,
        }
    }
}

/// Committee / organization row.
///
/// Optional fields are `None` when the source record did not carry them; an
/// upsert then keeps whatever the store already holds for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: Option<String>,
    pub committee_type: Option<String>,
    pub designation: Option<String>,
    pub party: Option<String>,
    pub state: Option<String>,
    pub candidate_ids: Vec<String>,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Stored name, or the id when none was ever supplied.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn with_candidates<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidate_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub party: Option<String>,
    pub office: Option<String>,
}

/// Who gave the money. Individuals stay inline on the transaction row; only
/// organizations become a referenced entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Contributor {
    Individual,
    Organization(Entity),
}

impl Contributor {
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Contributor::Individual => None,
            Contributor::Organization(entity) => Some(entity),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndividualFields {
    pub name: Option<String>,
    pub street_1: Option<String>,
    pub street_2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub employer: Option<String>,
    pub occupation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConduitFields {
    pub committee_id: Option<String>,
    pub name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub street_1: Option<String>,
    pub street_2: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilingMetadata {
    pub memo_code: Option<String>,
    pub memoed_subtotal: bool,
    pub file_number: Option<i64>,
    pub image_number: Option<String>,
    pub pdf_url: Option<String>,
    pub filing_form: Option<String>,
    pub election_type: Option<String>,
    pub schedule_type: Option<String>,
    pub line_number: Option<String>,
    pub receipt_type: Option<String>,
    pub report_type: Option<String>,
    pub report_year: Option<i32>,
}

/// Relational transaction row, unique by `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub external_id: String,
    pub committee_id: Option<String>,
    pub amount: f64,
    pub transaction_date: Option<NaiveDate>,
    pub cycle: i32,
    /// Set only for organizational contributors.
    pub contributor_id: Option<String>,
    pub is_individual: bool,
    pub individual: IndividualFields,
    pub conduit: ConduitFields,
    pub filing: FilingMetadata,
    pub load_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupKind {
    ByContributor,
    ByCandidate,
    ByRegion,
}

impl RollupKind {
    /// Pass order used by the aggregation engine.
    pub const ALL: [RollupKind; 3] = [
        RollupKind::ByContributor,
        RollupKind::ByCandidate,
        RollupKind::ByRegion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RollupKind::ByContributor => "by_contributor",
            RollupKind::ByCandidate => "by_candidate",
            RollupKind::ByRegion => "by_region",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "by_contributor" | "contributor" | "contributors" => Some(RollupKind::ByContributor),
            "by_candidate" | "candidate" | "candidates" => Some(RollupKind::ByCandidate),
            "by_region" | "region" | "regions" | "state" | "states" => Some(RollupKind::ByRegion),
            _ => None,
        }
    }
}

impl std::fmt::Display for RollupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a subject-level totals query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectTotal {
    pub subject_id: String,
    pub display_name: String,
    pub detail: Option<String>,
    pub total_amount: f64,
    pub transaction_count: i64,
}

/// Leaderboard entry: a counterpart entity and what flowed between it and the subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterpartTotal {
    pub id: String,
    pub name: String,
    pub detail: Option<String>,
    pub total_amount: f64,
    pub transaction_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub kind: RollupKind,
    pub subject_id: String,
    pub cycle: i32,
}

/// Precomputed leaderboard document, replaced wholesale per `DocumentKey`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupSummary {
    pub kind: RollupKind,
    pub subject_id: String,
    pub display_name: String,
    pub detail: Option<String>,
    pub total_amount: f64,
    pub transaction_count: i64,
    pub top: Vec<CounterpartTotal>,
    pub cycle: i32,
    pub recomputed_at: DateTime<Utc>,
}

impl RollupSummary {
    pub fn assemble(
        kind: RollupKind,
        cycle: i32,
        subject: SubjectTotal,
        counterparts: Vec<CounterpartTotal>,
        limit: usize,
        recomputed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            subject_id: subject.subject_id,
            display_name: subject.display_name,
            detail: subject.detail,
            total_amount: subject.total_amount,
            transaction_count: subject.transaction_count,
            top: rank_top_n(counterparts, limit),
            cycle,
            recomputed_at,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            kind: self.kind,
            subject_id: self.subject_id.clone(),
            cycle: self.cycle,
        }
    }
}

/// Orders by amount descending and keeps the first `n`. The sort is stable, so
/// equal amounts keep the order they arrived in.
pub fn rank_top_n(mut items: Vec<CounterpartTotal>, n: usize) -> Vec<CounterpartTotal> {
    items.sort_by(|a, b| b.total_amount.total_cmp(&a.total_amount));
    items.truncate(n);
    items
}
