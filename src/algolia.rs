//! Discovery through the search index that backs the discovery page.
//!
//! Unlike `GET /discoverable-guilds` this works with bot tokens, but the index
//! stops paginating after ~1000 hits per query. To see every guild the
//! listing is split into member-count buckets small enough to stay under
//! that cap, and each bucket is paged separately.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::collect::jittered;
use crate::http::{HttpError, REQUEST_TIMEOUT, USER_AGENT};
use crate::types::{GuildMap, GuildRecord, GuildSource};

pub const DEFAULT_INDEX: &str = "prod_discoverable_guilds";
pub const DEFAULT_HITS_PER_PAGE: u32 = 1000;

/// `(points, min, max)` for each stretch of the bucket edges. Dense where
/// most guilds are, sparse in the long tail.
const EDGE_SEGMENTS: [(u64, u64, u64); 3] = [
    (50, 0, 1_000),
    (200, 1_000, 10_000),
    (750, 10_000, 810_000),
];

// ---------------------------------------------------------------------------
// Member-count buckets
// ---------------------------------------------------------------------------

/// `length` evenly spaced integers from `min` to `max` inclusive.
pub fn create_range(length: u64, min: u64, max: u64) -> Vec<u64> {
    match length {
        0 => Vec::new(),
        1 => vec![min],
        _ => (0..length)
            .map(|i| min + i * (max - min) / (length - 1))
            .collect(),
    }
}

/// A half-open `[min, max)` member-count range; `max: None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberBucket {
    pub min: u64,
    pub max: Option<u64>,
}

impl MemberBucket {
    fn numeric_filters(&self) -> Vec<String> {
        let mut filters = vec![format!("approximate_member_count>={}", self.min)];
        if let Some(max) = self.max {
            filters.push(format!("approximate_member_count<{}", max));
        }
        filters
    }
}

/// The buckets that partition every possible member count.
pub fn member_buckets() -> Vec<MemberBucket> {
    let mut edges: Vec<u64> = EDGE_SEGMENTS
        .iter()
        .flat_map(|&(len, min, max)| create_range(len, min, max))
        .collect();
    edges.sort_unstable();
    edges.dedup();

    let mut buckets: Vec<MemberBucket> = edges
        .windows(2)
        .map(|w| MemberBucket {
            min: w[0],
            max: Some(w[1]),
        })
        .collect();
    if let Some(&last) = edges.last() {
        buckets.push(MemberBucket {
            min: last,
            max: None,
        });
    }
    buckets
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AlgoliaConfig {
    pub app_id: String,
    pub api_key: String,
    pub index: String,
    pub hits_per_page: u32,
}

#[derive(Debug, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub hits: Vec<Value>,
    #[serde(default)]
    pub page: u32,
    #[serde(rename = "nbPages", default)]
    pub nb_pages: u32,
    #[serde(rename = "nbHits", default)]
    pub nb_hits: u64,
}

#[derive(Clone)]
pub struct AlgoliaClient {
    client: reqwest::Client,
    base_url: String,
    config: AlgoliaConfig,
}

impl AlgoliaClient {
    pub fn new(config: AlgoliaConfig) -> Result<Self, HttpError> {
        Self::with_timeout(config, REQUEST_TIMEOUT)
    }

    /// Like [`AlgoliaClient::new`] with a custom per-request deadline.
    pub fn with_timeout(config: AlgoliaConfig, timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        let base_url = format!("https://{}-dsn.algolia.net", config.app_id.to_lowercase());
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// One page of hits within `bucket`.
    pub async fn search(&self, bucket: MemberBucket, page: u32) -> Result<SearchPage, HttpError> {
        let route = format!("/1/indexes/{}/query", self.config.index);
        let body = json!({
            "query": "",
            "hitsPerPage": self.config.hits_per_page,
            "page": page,
            "numericFilters": bucket.numeric_filters(),
        });

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, route))
            .header("X-Algolia-Application-Id", &self.config.app_id)
            .header("X-Algolia-API-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if status != StatusCode::OK {
            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
                route: format!("POST {}", route),
            });
        }
        HttpError::decode(&bytes)
    }

    /// Walk every bucket and every page within it.
    pub async fn collect_discoverable(&self, delay: Duration) -> Result<GuildMap, HttpError> {
        self.collect_buckets(&member_buckets(), delay).await
    }

    /// Page through each of `buckets` in order. Pages within a bucket are
    /// requested until `nbPages` is reached.
    pub(crate) async fn collect_buckets(
        &self,
        buckets: &[MemberBucket],
        delay: Duration,
    ) -> Result<GuildMap, HttpError> {
        let mut guilds = GuildMap::new();

        for (i, bucket) in buckets.iter().enumerate() {
            let mut page = 0;
            loop {
                if i > 0 || page > 0 {
                    tokio::time::sleep(jittered(delay)).await;
                }
                let result = self.search(*bucket, page).await?;
                debug!(
                    min = bucket.min,
                    max = ?bucket.max,
                    page,
                    hits = result.hits.len(),
                    "search page"
                );
                for hit in result.hits {
                    if let Some(record) = hit_to_record(hit) {
                        guilds.insert(record.id.clone(), record);
                    }
                }
                page += 1;
                if page >= result.nb_pages {
                    break;
                }
            }
        }

        info!(buckets = buckets.len(), guilds = guilds.len(), "search index walk finished");
        Ok(guilds)
    }
}

impl std::fmt::Debug for AlgoliaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgoliaClient")
            .field("base_url", &self.base_url)
            .field("index", &self.config.index)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Strip search-engine bookkeeping from a hit and decode it.
fn hit_to_record(mut hit: Value) -> Option<GuildRecord> {
    if let Some(obj) = hit.as_object_mut() {
        obj.retain(|key, _| key != "objectID" && !key.starts_with('_'));
    }
    match serde_json::from_value::<GuildRecord>(hit) {
        Ok(record) => Some(record.with_source(GuildSource::Algolia)),
        Err(e) => {
            warn!(error = %e, "skipping malformed search hit");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
