//! Rate-limit aware HTTP client for the Discord REST API.
//!
//! All outbound Discord calls go through [`DiscordHttpClient`] so that auth
//! headers, rate-limit back-off, and error handling live in one place. The
//! collector only needs three endpoints: the ready handshake, the discovery
//! listing, and invite lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const BASE_URL: &str = "https://discord.com/api/v9";
pub(crate) const USER_AGENT: &str = concat!("guild-stats/", env!("CARGO_PKG_VERSION"));

const MAX_RETRIES: u32 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// Global rate-limit: if set, no requests may be sent until this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// Returns how long we should wait before sending a request on `route_key`,
    /// or `None` if we can send immediately.
    fn delay_for(&self, route_key: &str) -> Option<Duration> {
        let now = Instant::now();
        if let Some(until) = self.global_until {
            if until > now {
                return Some(until - now);
            }
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;

        if state.remaining == 0 && state.resets_at > now {
            return Some(state.resets_at - now);
        }

        None
    }

    /// Update internal state from response headers.
    fn update(&mut self, route_key: &str, info: &RateLimitInfo) {
        let reset_after = info
            .reset_after
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(1));

        if info.is_global && info.reset_after.is_some() {
            self.global_until = Some(Instant::now() + reset_after);
        }

        if let Some(ref bucket) = info.bucket {
            self.route_buckets
                .insert(route_key.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: Instant::now() + reset_after,
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Parse rate-limit headers
// ---------------------------------------------------------------------------

fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    RateLimitInfo {
        remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
        bucket: header("x-ratelimit-bucket").map(str::to_string),
        is_global: header("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Non-success status from the remote API.
    #[error("API error {status} on {route}: {body}")]
    Api {
        status: u16,
        body: String,
        route: String,
    },
    /// Transport / network error.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Response body didn't match the expected shape.
    #[error("Serialisation error: {0}")]
    Serde(String),
}

impl HttpError {
    /// Decode a JSON body, keeping a prefix of the raw text for diagnostics.
    pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, HttpError> {
        serde_json::from_slice(bytes).map_err(|e| {
            let raw = String::from_utf8_lossy(bytes);
            let cut = raw
                .char_indices()
                .nth(200)
                .map(|(i, _)| i)
                .unwrap_or(raw.len());
            HttpError::Serde(format!("{}: {}", e, &raw[..cut]))
        })
    }
}

// ---------------------------------------------------------------------------
// Token kind
// ---------------------------------------------------------------------------

/// Whether the token belongs to a bot application or a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Bot,
    User,
}

impl TokenKind {
    /// The `Authorization` header value for `token`.
    pub fn authorization(self, token: &str) -> String {
        match self {
            TokenKind::Bot => format!("Bot {}", token),
            TokenKind::User => token.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// A thin, rate-limit–aware HTTP client for the Discord REST API.
///
/// Cheap to clone (internals are behind `Arc`).
#[derive(Clone)]
pub struct DiscordHttpClient {
    client: reqwest::Client,
    base_url: String,
    authorization: String,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    /// Create a new client for `token`.
    pub fn new(token: &str, kind: TokenKind) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: BASE_URL.to_string(),
            authorization: kind.authorization(token),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        })
    }

    /// Point the client at a different API root (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    // ------------------------------------------------------------------
    // Low-level: the single request method everything funnels through
    // ------------------------------------------------------------------

    /// Send a request to `{base_url}/{path}`.
    ///
    /// `route_key` is used for per-route rate-limit bucketing. It should be a
    /// template like `GET /invites/{code}`.
    ///
    /// Returns the raw response body as bytes on success.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, HttpError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        for attempt in 0..=MAX_RETRIES {
            self.wait_for_bucket(route_key).await;

            let resp = self
                .client
                .request(method.clone(), &url)
                .header(reqwest::header::AUTHORIZATION, &self.authorization)
                .query(query)
                .send()
                .await?;

            let status = resp.status();
            let rl_info = parse_rate_limit_headers(resp.headers());
            self.limiter.lock().await.update(route_key, &rl_info);

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RETRIES {
                let retry_after = rl_info.reset_after.unwrap_or(1.0);
                let delay = Duration::from_secs_f64(retry_after).min(MAX_BACKOFF);
                warn!(
                    route = route_key,
                    attempt,
                    retry_after_s = retry_after,
                    global = rl_info.is_global,
                    "rate-limited by Discord, backing off"
                );

                if rl_info.is_global {
                    self.limiter.lock().await.global_until = Some(Instant::now() + delay);
                }

                tokio::time::sleep(delay).await;
                continue;
            }

            let bytes = resp.bytes().await?;
            if status.is_success() {
                return Ok(bytes.to_vec());
            }

            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
                route: route_key.to_string(),
            });
        }

        Err(HttpError::Api {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            body: "rate-limited after max retries".to_string(),
            route: route_key.to_string(),
        })
    }

    /// Like [`request`](Self::request) but deserialises the response body as JSON.
    pub async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        query: &[(&str, String)],
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, route_key, query).await?;
        HttpError::decode(&bytes)
    }

    async fn wait_for_bucket(&self, route_key: &str) {
        let delay = self.limiter.lock().await.delay_for(route_key);
        if let Some(delay) = delay {
            let delay = delay.min(MAX_BACKOFF);
            debug!(
                route = route_key,
                delay_ms = delay.as_millis() as u64,
                "rate-limit pre-emptive backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// The account behind the token. Doubles as the ready handshake: a bad
    /// token fails here with a 401.
    pub async fn current_user(&self) -> Result<CurrentUser, HttpError> {
        self.request_json(Method::GET, "users/@me", "GET /users/@me", &[])
            .await
    }

    /// One page of the public discovery listing. User tokens only.
    pub async fn discoverable_guilds(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<DiscoverableGuildsPage, HttpError> {
        let query = [("offset", offset.to_string()), ("limit", limit.to_string())];
        self.request_json(
            Method::GET,
            "discoverable-guilds",
            "GET /discoverable-guilds",
            &query,
        )
        .await
    }

    /// Resolve an invite code, including approximate member/presence counts.
    pub async fn get_invite(&self, code: &str) -> Result<Invite, HttpError> {
        let path = format!("invites/{}", code);
        let query = [("with_counts", "true".to_string())];
        self.request_json(Method::GET, &path, "GET /invites/{code}", &query)
            .await
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use static_assertions::assert_impl_all;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    assert_impl_all!(DiscordHttpClient: Send, Sync, Clone);

    fn client(server: &MockServer, kind: TokenKind) -> DiscordHttpClient {
        DiscordHttpClient::new("secret", kind)
            .unwrap()
            .with_base_url(server.uri())
    }

    // -- RateLimiter -------------------------------------------------------

    #[test]
    fn limiter_unknown_route_sends_immediately() {
        let limiter = RateLimiter::default();
        assert!(limiter.delay_for("GET /users/@me").is_none());
    }

    #[test]
    fn limiter_exhausted_bucket_delays() {
        let mut limiter = RateLimiter::default();
        limiter.update(
            "GET /discoverable-guilds",
            &RateLimitInfo {
                remaining: Some(0),
                reset_after: Some(5.0),
                bucket: Some("abc".into()),
                is_global: false,
            },
        );
        let delay = limiter.delay_for("GET /discoverable-guilds").unwrap();
        assert!(delay > Duration::from_secs(4));
        assert!(limiter.delay_for("GET /users/@me").is_none());
    }

    #[test]
    fn limiter_global_applies_to_every_route() {
        let mut limiter = RateLimiter::default();
        limiter.update(
            "GET /invites/{code}",
            &RateLimitInfo {
                reset_after: Some(2.0),
                is_global: true,
                ..Default::default()
            },
        );
        assert!(limiter.delay_for("GET /users/@me").is_some());
    }

    #[test]
    fn limiter_bucket_with_budget_left_does_not_delay() {
        let mut limiter = RateLimiter::default();
        limiter.update(
            "GET /users/@me",
            &RateLimitInfo {
                remaining: Some(3),
                reset_after: Some(5.0),
                bucket: Some("me".into()),
                is_global: false,
            },
        );
        assert!(limiter.delay_for("GET /users/@me").is_none());
    }

    // -- TokenKind ---------------------------------------------------------

    #[test]
    fn authorization_prefixes_bot_tokens_only() {
        assert_eq!(TokenKind::Bot.authorization("t"), "Bot t");
        assert_eq!(TokenKind::User.authorization("t"), "t");
    }

    #[test]
    fn debug_redacts_token() {
        let http = DiscordHttpClient::new("very-secret", TokenKind::Bot).unwrap();
        let rendered = format!("{:?}", http);
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    // -- Endpoints ---------------------------------------------------------

    #[tokio::test]
    async fn current_user_sends_bot_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .and(header("authorization", "Bot secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "10",
                "username": "collector",
                "discriminator": "0",
                "bot": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let user = client(&server, TokenKind::Bot).current_user().await.unwrap();
        assert_eq!(user.id, "10");
        assert!(user.bot);
    }

    #[tokio::test]
    async fn discoverable_guilds_passes_offset_and_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/discoverable-guilds"))
            .and(query_param("offset", "96"))
            .and(query_param("limit", "48"))
            .and(header("authorization", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "guilds": [{ "id": "1", "name": "one", "approximate_member_count": 5 }],
                "total": 0
            })))
            .mount(&server)
            .await;

        let page = client(&server, TokenKind::User)
            .discoverable_guilds(96, 48)
            .await
            .unwrap();
        assert_eq!(page.guilds.len(), 1);
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn get_invite_requests_counts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invites/abc"))
            .and(query_param("with_counts", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "abc",
                "guild": { "id": "7", "name": "seven" },
                "approximate_member_count": 70,
                "approximate_presence_count": 7
            })))
            .mount(&server)
            .await;

        let invite = client(&server, TokenKind::Bot).get_invite("abc").await.unwrap();
        assert_eq!(invite.approximate_member_count, Some(70));
        assert_eq!(invite.guild.unwrap().id, "7");
    }

    #[tokio::test]
    async fn non_success_status_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invites/gone"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"message":"Unknown Invite"}"#),
            )
            .mount(&server)
            .await;

        let err = client(&server, TokenKind::Bot)
            .get_invite("gone")
            .await
            .unwrap_err();
        match err {
            HttpError::Api {
                status,
                body,
                route,
            } => {
                assert_eq!(status, 404);
                assert!(body.contains("Unknown Invite"));
                assert_eq!(route, "GET /invites/{code}");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_maps_to_serde_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server, TokenKind::Bot)
            .current_user()
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Serde(ref msg) if msg.contains("not json")));
    }

    #[tokio::test]
    async fn retries_after_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("x-ratelimit-reset-after", "0.01"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "10",
                "username": "collector"
            })))
            .mount(&server)
            .await;

        let user = client(&server, TokenKind::User).current_user().await.unwrap();
        assert_eq!(user.username, "collector");
        assert!(!user.bot);
    }
}
