//! OpenFEC Schedule A wire types and the HTTP-backed page source.

use async_trait::async_trait;
use cfin_core::{parse_source_date, PageCursor};
use cfin_storage::HttpFetcher;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{PageRequest, PageSource, SourceError, SourcePage};

pub const DEFAULT_OPENFEC_BASE_URL: &str = "https://api.open.fec.gov/v1";

const SCHEDULE_A_PATH: &str = "schedules/schedule_a/";
const SCHEDULE_A_SORT: &str = "-contribution_receipt_date";

/// Accepts a JSON string or number; the API is inconsistent about ids.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i32<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::Number(n)) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::Number(n)) => n.as_i64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleAPage {
    pub results: Vec<RawReceipt>,
    pub pagination: IndexedPagination,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexedPagination {
    pub count: Option<i64>,
    pub per_page: Option<i64>,
    pub pages: Option<i64>,
    /// Null once the final page has been served.
    pub last_indexes: Option<LastIndexes>,
}

impl IndexedPagination {
    pub fn last_index(&self) -> Option<&str> {
        self.last_indexes
            .as_ref()
            .and_then(|idx| idx.last_index.as_deref())
    }

    pub fn next_cursor(&self) -> PageCursor {
        let Some(indexes) = &self.last_indexes else {
            return PageCursor::default();
        };
        PageCursor {
            token: indexes.last_index.clone(),
            last_seen_date: indexes
                .last_contribution_receipt_date
                .as_deref()
                .and_then(parse_source_date),
            sort_null_only: indexes.sort_null_only.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LastIndexes {
    #[serde(deserialize_with = "lenient_string")]
    pub last_index: Option<String>,
    pub last_contribution_receipt_date: Option<String>,
    pub sort_null_only: Option<bool>,
}

/// Nested committee object (`committee` for the recipient, `contributor` for
/// a contributing committee).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCommittee {
    pub committee_id: Option<String>,
    pub name: Option<String>,
    pub committee_type: Option<String>,
    pub designation: Option<String>,
    pub party: Option<String>,
    pub state: Option<String>,
    pub candidate_ids: Option<Vec<String>>,
}

/// One Schedule A receipt as returned by `/schedules/schedule_a/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawReceipt {
    #[serde(deserialize_with = "lenient_string")]
    pub sub_id: Option<String>,
    pub contribution_receipt_amount: Option<f64>,
    pub contribution_receipt_date: Option<String>,
    #[serde(deserialize_with = "lenient_i32")]
    pub two_year_transaction_period: Option<i32>,
    pub load_date: Option<String>,

    pub committee_id: Option<String>,
    pub committee: Option<RawCommittee>,

    pub is_individual: Option<bool>,
    pub entity_type: Option<String>,
    pub contributor_id: Option<String>,
    pub contributor: Option<RawCommittee>,
    pub contributor_name: Option<String>,
    pub contributor_street_1: Option<String>,
    pub contributor_street_2: Option<String>,
    pub contributor_city: Option<String>,
    pub contributor_state: Option<String>,
    pub contributor_zip: Option<String>,
    pub contributor_employer: Option<String>,
    pub contributor_occupation: Option<String>,

    pub conduit_committee_id: Option<String>,
    pub conduit_committee_name: Option<String>,
    pub conduit_committee_city: Option<String>,
    pub conduit_committee_state: Option<String>,
    #[serde(alias = "conduit_committee_street_1")]
    pub conduit_committee_street1: Option<String>,
    #[serde(alias = "conduit_committee_street_2")]
    pub conduit_committee_street2: Option<String>,
    pub conduit_committee_zip: Option<String>,

    pub memo_code: Option<String>,
    pub memoed_subtotal: Option<bool>,
    #[serde(deserialize_with = "lenient_i64")]
    pub file_number: Option<i64>,
    #[serde(deserialize_with = "lenient_string")]
    pub image_number: Option<String>,
    pub pdf_url: Option<String>,
    pub filing_form: Option<String>,
    pub election_type: Option<String>,
    pub schedule_type: Option<String>,
    pub line_number: Option<String>,
    pub receipt_type: Option<String>,
    pub report_type: Option<String>,
    #[serde(deserialize_with = "lenient_i32")]
    pub report_year: Option<i32>,
}

#[derive(Debug)]
pub struct OpenFecSource {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
}

impl OpenFecSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), SCHEDULE_A_PATH)
    }

    /// Query parameters for `request`; the cursor trio is sent only when resuming.
    pub fn query_for(&self, request: &PageRequest) -> Vec<(String, String)> {
        let mut query = vec![
            ("api_key".to_string(), self.api_key.clone()),
            ("per_page".to_string(), request.per_page.to_string()),
            ("sort".to_string(), SCHEDULE_A_SORT.to_string()),
        ];
        for cycle in &request.cycles {
            query.push(("two_year_transaction_period".to_string(), cycle.to_string()));
        }
        if let Some(cursor) = &request.cursor {
            query.push(("last_index".to_string(), cursor.clone()));
            if let Some(date) = request.last_seen_date {
                query.push((
                    "last_contribution_receipt_date".to_string(),
                    date.format("%Y-%m-%d").to_string(),
                ));
            }
            query.push(("sort_null_only".to_string(), request.sort_null_only.to_string()));
        }
        query
    }
}

#[async_trait]
impl PageSource for OpenFecSource {
    fn source_id(&self) -> &'static str {
        "openfec"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, SourceError> {
        let response = self
            .http
            .get(self.source_id(), &self.endpoint(), &self.query_for(request))
            .await?;
        let page: ScheduleAPage = serde_json::from_slice(&response.body)?;
        debug!(
            results = page.results.len(),
            last_index = page.pagination.last_index().unwrap_or_default(),
            "decoded schedule a page"
        );
        Ok(SourcePage {
            next: page.pagination.next_cursor(),
            records: page.results,
            raw_body: Some(response.body),
        })
    }
}
