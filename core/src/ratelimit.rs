use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::KvSettings;

/// Requests allowed per client per rolling day.
pub const DAILY_LIMIT: u64 = 50;

const KEY_PREFIX: &str = "berachat_ratelimit";

// Evaluated server-side so that read, weigh and increment happen atomically.
// KEYS: current bucket, previous bucket. ARGV: limit, now (ms), window (ms), increment.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local current_key  = KEYS[1]
local previous_key = KEYS[2]
local limit        = tonumber(ARGV[1])
local now          = tonumber(ARGV[2])
local window       = tonumber(ARGV[3])
local increment    = tonumber(ARGV[4])

local current = tonumber(redis.call("GET", current_key) or "0")
local previous = tonumber(redis.call("GET", previous_key) or "0")

local elapsed = (now % window) / window
previous = math.floor((1 - elapsed) * previous)
if previous + current >= limit then
  return -1
end

local updated = redis.call("INCRBY", current_key, increment)
if updated == increment then
  redis.call("PEXPIRE", current_key, window * 2 + 1000)
end
return limit - (updated + previous)
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub success: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix time in milliseconds when the current window ends.
    pub reset: u64,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rate limit backend returned HTTP {status}")]
    Upstream { status: StatusCode },

    #[error("rate limit backend error: {0}")]
    Backend(String),
}

/// Two fixed buckets, the previous one weighted by how much of it still
/// overlaps the trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    pub limit: u64,
    pub window_ms: u64,
}

impl SlidingWindow {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_ms: (window.as_millis() as u64).max(1),
        }
    }

    pub fn daily(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(24 * 60 * 60))
    }

    pub fn bucket(&self, now_ms: u64) -> u64 {
        now_ms / self.window_ms
    }

    pub fn reset_at(&self, now_ms: u64) -> u64 {
        (self.bucket(now_ms) + 1) * self.window_ms
    }

    /// How many of the previous bucket's hits still count at `now_ms`.
    pub fn weighted_previous(&self, previous: u64, now_ms: u64) -> u64 {
        let elapsed = (now_ms % self.window_ms) as f64 / self.window_ms as f64;
        ((1.0 - elapsed) * previous as f64).floor() as u64
    }

    fn bucket_keys(&self, key: &str, now_ms: u64) -> (String, String) {
        let bucket = self.bucket(now_ms);
        (
            format!("{key}:{bucket}"),
            format!("{key}:{}", bucket.saturating_sub(1)),
        )
    }
}

/// A counter that records one hit for `key` and reports what is left.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Remaining requests after this one, or a negative number when the hit
    /// was refused (and therefore not recorded).
    async fn consume(&self, window: &SlidingWindow, key: &str, now_ms: u64) -> Result<i64, RateLimitError>;
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    window: SlidingWindow,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, window: SlidingWindow) -> Self {
        Self { store, window }
    }

    pub async fn limit(&self, identifier: &str) -> Result<RateLimitDecision, RateLimitError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.limit_at(identifier, now_ms).await
    }

    pub async fn limit_at(&self, identifier: &str, now_ms: u64) -> Result<RateLimitDecision, RateLimitError> {
        let key = format!("{KEY_PREFIX}_{identifier}");
        let remaining = self.store.consume(&self.window, &key, now_ms).await?;

        Ok(RateLimitDecision {
            success: remaining >= 0,
            limit: self.window.limit,
            remaining: remaining.max(0) as u64,
            reset: self.window.reset_at(now_ms),
        })
    }
}

/// Upstash / Vercel KV over its REST interface.
pub struct UpstashStore {
    http: reqwest::Client,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct UpstashReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl UpstashStore {
    /// A backend slower than `settings.timeout` yields [`RateLimitError::Transport`].
    pub fn new(settings: &KvSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("failed to build rate limit client")?;

        Ok(Self {
            http,
            url: settings.url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        })
    }
}

#[async_trait]
impl RateLimitStore for UpstashStore {
    async fn consume(&self, window: &SlidingWindow, key: &str, now_ms: u64) -> Result<i64, RateLimitError> {
        let (current, previous) = window.bucket_keys(key, now_ms);
        let command = json!([
            "EVAL",
            SLIDING_WINDOW_SCRIPT,
            "2",
            current,
            previous,
            window.limit.to_string(),
            now_ms.to_string(),
            window.window_ms.to_string(),
            "1",
        ]);

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RateLimitError::Upstream { status });
        }

        let reply: UpstashReply = response.json().await?;
        if let Some(error) = reply.error {
            return Err(RateLimitError::Backend(error));
        }
        reply
            .result
            .as_ref()
            .and_then(Value::as_i64)
            .ok_or_else(|| RateLimitError::Backend(format!("unexpected reply: {:?}", reply.result)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Buckets {
    bucket: u64,
    current: u64,
    previous: u64,
}

/// In-process counterpart of [`UpstashStore`], for single-instance use and tests.
/// Keys idle for longer than a full window are dropped on the next hit.
#[derive(Default)]
pub struct MemoryStore {
    buckets: DashMap<String, Buckets>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn consume(&self, window: &SlidingWindow, key: &str, now_ms: u64) -> Result<i64, RateLimitError> {
        let bucket = window.bucket(now_ms);
        self.buckets.retain(|_, b| b.bucket + 1 >= bucket);

        let mut entry = self.buckets.entry(key.to_string()).or_insert(Buckets {
            bucket,
            current: 0,
            previous: 0,
        });

        if entry.bucket != bucket {
            entry.previous = if entry.bucket + 1 == bucket { entry.current } else { 0 };
            entry.current = 0;
            entry.bucket = bucket;
        }

        let previous = window.weighted_previous(entry.previous, now_ms);
        if previous + entry.current >= window.limit {
            return Ok(-1);
        }

        entry.current += 1;
        Ok(window.limit as i64 - (entry.current + previous) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::Value;
    use std::time::Instant;

    const DAY_MS: u64 = 86_400_000;

    fn kv(server: &Server, token: &str) -> KvSettings {
        KvSettings {
            url: server.url_str("/"),
            token: token.into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn limiter(limit: u64) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), SlidingWindow::daily(limit))
    }

    #[test]
    fn window_arithmetic() {
        let window = SlidingWindow::daily(DAILY_LIMIT);
        let now = 10 * DAY_MS + DAY_MS / 4;

        assert_eq!(window.window_ms, DAY_MS);
        assert_eq!(window.bucket(now), 10);
        assert_eq!(window.reset_at(now), 11 * DAY_MS);
        // A quarter into the day, three quarters of yesterday still count.
        assert_eq!(window.weighted_previous(40, now), 30);
        assert_eq!(window.weighted_previous(40, 10 * DAY_MS), 40);
        assert_eq!(
            window.bucket_keys("k", now),
            ("k:10".to_string(), "k:9".to_string())
        );
    }

    #[tokio::test]
    async fn allows_fifty_a_day_then_refuses() {
        let limiter = limiter(DAILY_LIMIT);
        let now = 3 * DAY_MS + 1_000;

        for expected_remaining in (0..DAILY_LIMIT).rev() {
            let decision = limiter.limit_at("1.2.3.4", now).await.unwrap();
            assert!(decision.success);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.limit_at("1.2.3.4", now).await.unwrap();
        assert_eq!(
            denied,
            RateLimitDecision {
                success: false,
                limit: 50,
                remaining: 0,
                reset: 4 * DAY_MS,
            }
        );

        // Other clients have their own counters.
        assert!(limiter.limit_at("5.6.7.8", now).await.unwrap().success);
    }

    #[tokio::test]
    async fn yesterday_fades_out_across_today() {
        let limiter = limiter(10);
        for _ in 0..10 {
            limiter.limit_at("ip", DAY_MS - 1).await.unwrap();
        }

        // Just after midnight nine of yesterday's ten still count: one more fits.
        let after_midnight = limiter.limit_at("ip", DAY_MS + 1).await.unwrap();
        assert!(after_midnight.success);
        assert_eq!(after_midnight.remaining, 0);
        assert!(!limiter.limit_at("ip", DAY_MS + 1).await.unwrap().success);

        // Halfway through only five of yesterday's count, so four more fit.
        let half = DAY_MS + DAY_MS / 2;
        let mut allowed = 0;
        while limiter.limit_at("ip", half).await.unwrap().success {
            allowed += 1;
        }
        assert_eq!(allowed, 4);

        // Two days later everything has expired.
        assert!(limiter.limit_at("ip", 3 * DAY_MS).await.unwrap().success);
    }

    #[tokio::test]
    async fn memory_store_forgets_idle_clients() {
        let store = MemoryStore::new();
        let window = SlidingWindow::daily(DAILY_LIMIT);

        store.consume(&window, "a", DAY_MS).await.unwrap();
        store.consume(&window, "b", 2 * DAY_MS).await.unwrap();
        assert_eq!(store.buckets.len(), 2);

        // "a" was last seen two windows ago and no longer affects anything.
        store.consume(&window, "b", 3 * DAY_MS).await.unwrap();
        assert_eq!(store.buckets.len(), 1);
        assert!(store.buckets.contains_key("b"));
    }

    #[tokio::test]
    async fn upstash_store_evaluates_the_script_remotely() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/"),
                request::headers(contains(("authorization", "Bearer kv-token"))),
                request::body(json_decoded(|cmd: &Value| {
                    cmd[0] == "EVAL"
                        && cmd[2] == "2"
                        && cmd[3] == "berachat_ratelimit_1.2.3.4:10"
                        && cmd[4] == "berachat_ratelimit_1.2.3.4:9"
                        && cmd[5] == "50"
                })),
            ])
            .times(2)
            .respond_with(httptest::cycle![
                json_encoded(json!({"result": 12})),
                json_encoded(json!({"result": -1})),
            ]),
        );

        let store = UpstashStore::new(&kv(&server, "kv-token")).unwrap();
        let limiter = RateLimiter::new(Arc::new(store), SlidingWindow::daily(DAILY_LIMIT));
        let now = 10 * DAY_MS + 5;

        let allowed = limiter.limit_at("1.2.3.4", now).await.unwrap();
        assert!(allowed.success);
        assert_eq!(allowed.remaining, 12);

        let denied = limiter.limit_at("1.2.3.4", now).await.unwrap();
        assert!(!denied.success);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset, 11 * DAY_MS);
    }

    #[tokio::test]
    async fn upstash_errors_surface() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/"))
                .times(2)
                .respond_with(httptest::cycle![
                    json_encoded(json!({"error": "WRONGPASS invalid password"})),
                    status_code(401),
                ]),
        );

        let store = UpstashStore::new(&kv(&server, "bad")).unwrap();

        let err = store.consume(&SlidingWindow::daily(50), "k", 0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Backend(msg) if msg.contains("WRONGPASS")));

        let err = store.consume(&SlidingWindow::daily(50), "k", 0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Upstream { status } if status == StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn slow_backend_times_out_instead_of_stalling() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/")).respond_with(delay_and_then(
                Duration::from_secs(5),
                json_encoded(json!({"result": 49})),
            )),
        );

        let store = UpstashStore::new(&KvSettings {
            timeout: Duration::from_millis(200),
            ..kv(&server, "kv-token")
        })
        .unwrap();
        let limiter = RateLimiter::new(Arc::new(store), SlidingWindow::daily(DAILY_LIMIT));

        let started = Instant::now();
        let err = limiter.limit("1.2.3.4").await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, RateLimitError::Transport(e) if e.is_timeout()));
    }
}
