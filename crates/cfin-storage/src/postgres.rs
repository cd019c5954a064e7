//! Postgres backends (sqlx) for the relational, checkpoint and document stores.

use async_trait::async_trait;
use cfin_core::{
    Candidate, CounterpartTotal, DocumentKey, Entity, IngestionCheckpoint, RollupKind,
    RollupSummary, SubjectTotal, TransactionRecord,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::{collapse_duplicate_ids, CheckpointStore, DocumentStore, RelationalStore, StoreError};

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");
const DOCUMENTS_SQL: &str = include_str!("../sql/documents.sql");

const RECEIPT_COLUMNS: [&str; 35] = [
    "external_id",
    "committee_id",
    "amount",
    "receipt_date",
    "cycle",
    "contributor_id",
    "is_individual",
    "contributor_name",
    "contributor_street_1",
    "contributor_street_2",
    "contributor_city",
    "contributor_state",
    "contributor_zip",
    "contributor_employer",
    "contributor_occupation",
    "conduit_committee_id",
    "conduit_committee_name",
    "conduit_committee_city",
    "conduit_committee_state",
    "conduit_committee_street_1",
    "conduit_committee_street_2",
    "conduit_committee_zip",
    "memo_code",
    "memoed_subtotal",
    "file_number",
    "image_number",
    "pdf_url",
    "filing_form",
    "election_type",
    "schedule_type",
    "line_number",
    "receipt_type",
    "report_type",
    "report_year",
    "load_date",
];

/// Postgres caps a statement at 65535 bind parameters.
const ROWS_PER_STATEMENT: usize = 65_535 / RECEIPT_COLUMNS.len();

const REGION_EXPR: &str = "COALESCE(NULLIF(BTRIM(r.contributor_state), ''), 'Unknown')";

async fn connect_pool(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("connect postgres: {e}")))
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[tracing::instrument(level = "debug", skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let store = Self::new(connect_pool(url, max_connections).await?);
        store.ping().await?;
        Ok(store)
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("postgres ping: {e}")))?;
        Ok(())
    }

    /// Creates tables and indexes that do not exist yet.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    fn receipts_upsert<'a>(rows: &[&'a TransactionRecord]) -> QueryBuilder<'a, Postgres> {
        let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new("INSERT INTO receipts (");
        qb.push(RECEIPT_COLUMNS.join(", "));
        qb.push(") ");
        qb.push_values(rows.iter().copied(), |mut b, r| {
            b.push_bind(r.external_id.as_str())
                .push_bind(r.committee_id.as_deref())
                .push_bind(r.amount)
                .push_bind(r.transaction_date)
                .push_bind(r.cycle)
                .push_bind(r.contributor_id.as_deref())
                .push_bind(r.is_individual)
                .push_bind(r.individual.name.as_deref())
                .push_bind(r.individual.street_1.as_deref())
                .push_bind(r.individual.street_2.as_deref())
                .push_bind(r.individual.city.as_deref())
                .push_bind(r.individual.state.as_deref())
                .push_bind(r.individual.zip.as_deref())
                .push_bind(r.individual.employer.as_deref())
                .push_bind(r.individual.occupation.as_deref())
                .push_bind(r.conduit.committee_id.as_deref())
                .push_bind(r.conduit.name.as_deref())
                .push_bind(r.conduit.city.as_deref())
                .push_bind(r.conduit.state.as_deref())
                .push_bind(r.conduit.street_1.as_deref())
                .push_bind(r.conduit.street_2.as_deref())
                .push_bind(r.conduit.zip.as_deref())
                .push_bind(r.filing.memo_code.as_deref())
                .push_bind(r.filing.memoed_subtotal)
                .push_bind(r.filing.file_number)
                .push_bind(r.filing.image_number.as_deref())
                .push_bind(r.filing.pdf_url.as_deref())
                .push_bind(r.filing.filing_form.as_deref())
                .push_bind(r.filing.election_type.as_deref())
                .push_bind(r.filing.schedule_type.as_deref())
                .push_bind(r.filing.line_number.as_deref())
                .push_bind(r.filing.receipt_type.as_deref())
                .push_bind(r.filing.report_type.as_deref())
                .push_bind(r.filing.report_year)
                .push_bind(r.load_date);
        });
        qb.push(" ON CONFLICT (external_id) DO UPDATE SET ");
        let assignments = RECEIPT_COLUMNS[1..]
            .iter()
            .map(|col| format!("{col} = EXCLUDED.{col}"))
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(assignments);
        qb.push(", updated_at = NOW()");
        qb
    }

    fn subject_from_row(row: &PgRow) -> Result<SubjectTotal, sqlx::Error> {
        Ok(SubjectTotal {
            subject_id: row.try_get("id")?,
            display_name: row.try_get("name")?,
            detail: row.try_get("detail")?,
            total_amount: row.try_get("total_amount")?,
            transaction_count: row.try_get("transaction_count")?,
        })
    }

    fn counterpart_from_row(row: &PgRow) -> Result<CounterpartTotal, sqlx::Error> {
        Ok(CounterpartTotal {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            detail: row.try_get("detail")?,
            total_amount: row.try_get("total_amount")?,
            transaction_count: row.try_get("transaction_count")?,
        })
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self, entity), fields(committee_id = %entity.id))]
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO committees (committee_id, name, committee_type, designation, party, state, candidate_ids)
            VALUES ($1, COALESCE($2, $1), $3, $4, $5, $6, $7)
            ON CONFLICT (committee_id) DO UPDATE
              SET name = COALESCE($2, committees.name),
                  committee_type = COALESCE(EXCLUDED.committee_type, committees.committee_type),
                  designation = COALESCE(EXCLUDED.designation, committees.designation),
                  party = COALESCE(EXCLUDED.party, committees.party),
                  state = COALESCE(EXCLUDED.state, committees.state),
                  candidate_ids = CASE
                      WHEN cardinality(EXCLUDED.candidate_ids) > 0 THEN EXCLUDED.candidate_ids
                      ELSE committees.candidate_ids
                  END
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.name)
        .bind(&entity.committee_type)
        .bind(&entity.designation)
        .bind(&entity.party)
        .bind(&entity.state)
        .bind(&entity.candidate_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, candidate), fields(candidate_id = %candidate.id))]
    async fn upsert_candidate(&self, candidate: &Candidate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO candidates (candidate_id, name, party, office)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (candidate_id) DO UPDATE
              SET name = EXCLUDED.name,
                  party = EXCLUDED.party,
                  office = EXCLUDED.office
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.name)
        .bind(&candidate.party)
        .bind(&candidate.office)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, record), fields(external_id = %record.external_id))]
    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        Self::receipts_upsert(&[record])
            .build()
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, records), fields(rows = records.len()))]
    async fn upsert_transactions(&self, records: &[TransactionRecord]) -> Result<(), StoreError> {
        let rows = collapse_duplicate_ids(records);
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            Self::receipts_upsert(chunk).build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn subject_totals(
        &self,
        kind: RollupKind,
        cycle: i32,
    ) -> Result<Vec<SubjectTotal>, StoreError> {
        let sql = match kind {
            RollupKind::ByContributor => r#"
                SELECT r.contributor_id AS id,
                       COALESCE(MAX(c.name), r.contributor_id) AS name,
                       MAX(c.state) AS detail,
                       SUM(r.amount) AS total_amount,
                       COUNT(*) AS transaction_count
                  FROM receipts r
                  LEFT JOIN committees c ON c.committee_id = r.contributor_id
                 WHERE r.cycle = $1
                   AND r.contributor_id IS NOT NULL
                 GROUP BY r.contributor_id
                 ORDER BY total_amount DESC, MIN(r.ingest_seq) ASC
            "#
            .to_string(),
            RollupKind::ByCandidate => r#"
                SELECT link.candidate_id AS id,
                       COALESCE(MAX(can.name), link.candidate_id) AS name,
                       MAX(can.party) AS detail,
                       SUM(r.amount) AS total_amount,
                       COUNT(*) AS transaction_count
                  FROM receipts r
                  JOIN committees com ON com.committee_id = r.committee_id
                 CROSS JOIN LATERAL unnest(com.candidate_ids) AS link(candidate_id)
                  LEFT JOIN candidates can ON can.candidate_id = link.candidate_id
                 WHERE r.cycle = $1
                 GROUP BY link.candidate_id
                 ORDER BY total_amount DESC, MIN(r.ingest_seq) ASC
            "#
            .to_string(),
            RollupKind::ByRegion => format!(
                r#"
                SELECT s.region AS id,
                       s.region AS name,
                       NULL::TEXT AS detail,
                       SUM(s.amount) AS total_amount,
                       COUNT(*) AS transaction_count
                  FROM (
                        SELECT {REGION_EXPR} AS region, r.amount, r.ingest_seq
                          FROM receipts r
                         WHERE r.cycle = $1
                           AND r.is_individual
                       ) s
                 GROUP BY s.region
                 ORDER BY total_amount DESC, MIN(s.ingest_seq) ASC
                "#
            ),
        };

        let rows = sqlx::query(&sql).bind(cycle).fetch_all(&self.pool).await?;
        rows.iter()
            .map(Self::subject_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn top_counterparts(
        &self,
        kind: RollupKind,
        subject_id: &str,
        cycle: i32,
        limit: usize,
    ) -> Result<Vec<CounterpartTotal>, StoreError> {
        let candidates_for = |filter: &str| {
            format!(
                r#"
                SELECT link.candidate_id AS id,
                       COALESCE(MAX(can.name), link.candidate_id) AS name,
                       MAX(can.party) AS detail,
                       SUM(r.amount) AS total_amount,
                       COUNT(*) AS transaction_count
                  FROM receipts r
                  JOIN committees com ON com.committee_id = r.committee_id
                 CROSS JOIN LATERAL unnest(com.candidate_ids) AS link(candidate_id)
                  LEFT JOIN candidates can ON can.candidate_id = link.candidate_id
                 WHERE {filter}
                   AND r.cycle = $2
                 GROUP BY link.candidate_id
                 ORDER BY total_amount DESC, MIN(r.ingest_seq) ASC
                 LIMIT $3
                "#
            )
        };

        let sql = match kind {
            RollupKind::ByContributor => candidates_for("r.contributor_id = $1"),
            RollupKind::ByRegion => {
                candidates_for(&format!("{REGION_EXPR} = $1 AND r.is_individual"))
            }
            RollupKind::ByCandidate => r#"
                SELECT r.contributor_id AS id,
                       COALESCE(MAX(c.name), r.contributor_id) AS name,
                       MAX(c.state) AS detail,
                       SUM(r.amount) AS total_amount,
                       COUNT(*) AS transaction_count
                  FROM receipts r
                  JOIN committees com ON com.committee_id = r.committee_id
                  LEFT JOIN committees c ON c.committee_id = r.contributor_id
                 WHERE $1 = ANY(com.candidate_ids)
                   AND r.cycle = $2
                   AND r.contributor_id IS NOT NULL
                 GROUP BY r.contributor_id
                 ORDER BY total_amount DESC, MIN(r.ingest_seq) ASC
                 LIMIT $3
            "#
            .to_string(),
        };

        let rows = sqlx::query(&sql)
            .bind(subject_id)
            .bind(cycle)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(Self::counterpart_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load(&self, source: &str) -> Result<IngestionCheckpoint, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT source, last_index, last_receipt_date, sort_null_only, pages_completed, updated_at
              FROM ingestion_state
             WHERE source = $1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(IngestionCheckpoint::empty(source));
        };

        let pages_completed: i64 = row.try_get("pages_completed")?;
        Ok(IngestionCheckpoint {
            source: row.try_get("source")?,
            cursor: row.try_get("last_index")?,
            last_seen_date: row.try_get::<Option<NaiveDate>, _>("last_receipt_date")?,
            sort_null_only: row.try_get("sort_null_only")?,
            pages_completed: u64::try_from(pages_completed).unwrap_or_default(),
            updated_at: Some(row.try_get::<DateTime<Utc>, _>("updated_at")?),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, checkpoint), fields(source = %checkpoint.source))]
    async fn save(&self, checkpoint: &IngestionCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_state (source, last_index, last_receipt_date, sort_null_only, pages_completed, updated_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
            ON CONFLICT (source) DO UPDATE
              SET last_index = EXCLUDED.last_index,
                  last_receipt_date = EXCLUDED.last_receipt_date,
                  sort_null_only = EXCLUDED.sort_null_only,
                  pages_completed = EXCLUDED.pages_completed,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.source)
        .bind(&checkpoint.cursor)
        .bind(checkpoint.last_seen_date)
        .bind(checkpoint.sort_null_only)
        .bind(i64::try_from(checkpoint.pages_completed).unwrap_or(i64::MAX))
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// JSONB document store, one row per `(variant, subject_id, cycle)`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    #[tracing::instrument(level = "debug", skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        Ok(Self::new(connect_pool(url, max_connections).await?))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(DOCUMENTS_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[tracing::instrument(
        level = "debug",
        skip(self, summary),
        fields(variant = %summary.kind, subject_id = %summary.subject_id, cycle = summary.cycle)
    )]
    async fn replace(&self, summary: &RollupSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rollup_documents (variant, subject_id, cycle, document, recomputed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (variant, subject_id, cycle) DO UPDATE
              SET document = EXCLUDED.document,
                  recomputed_at = EXCLUDED.recomputed_at
            "#,
        )
        .bind(summary.kind.as_str())
        .bind(&summary.subject_id)
        .bind(summary.cycle)
        .bind(Json(summary))
        .bind(summary.recomputed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &DocumentKey) -> Result<Option<RollupSummary>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document
              FROM rollup_documents
             WHERE variant = $1 AND subject_id = $2 AND cycle = $3
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.subject_id)
        .bind(key.cycle)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get::<Json<RollupSummary>, _>("document").map(|doc| doc.0))
            .transpose()
            .map_err(StoreError::from)
    }
}
