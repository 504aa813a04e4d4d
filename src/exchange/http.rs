// =============================================================================
// Signed HTTP core — HMAC-SHA256 request signing, server-time sync, retries
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms; the signed
// timestamp is local time corrected by the server-time offset, which is
// refreshed at startup and whenever it is older than two minutes.
//
// All retry logic lives here. Callers pick a RetryPolicy and receive either a
// parsed JSON body or a classified ExchangeError; nothing downstream inspects
// HTTP statuses or exchange error codes.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::StatusCode;
use sha2::Sha256;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::rate_limit::RateLimitTracker;

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Re-sync the server-time offset when it is older than this.
const TIME_SYNC_MAX_AGE: Duration = Duration::from_secs(120);

/// Upper bound on concurrently in-flight requests (rate-limit backpressure
/// for the per-symbol fan-out).
const MAX_IN_FLIGHT: usize = 8;

/// Base request deadline; extended implicitly by retries.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP verb for [`SignedHttpClient::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// Backoff schedule applied to retryable failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    delays_secs: [u64; 3],
    attempts: usize,
}

impl RetryPolicy {
    /// Fast schedule for reads and idempotent order calls (1 s / 2 s / 4 s).
    pub fn standard() -> Self {
        Self { delays_secs: [1, 2, 4], attempts: 3 }
    }

    /// Slow schedule for protective stop-order placement (3 s / 5 s / 8 s).
    pub fn protective() -> Self {
        Self { delays_secs: [3, 5, 8], attempts: 3 }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self { delays_secs: [0, 0, 0], attempts: 0 }
    }

    fn delay(&self, attempt: usize) -> Duration {
        Duration::from_secs(self.delays_secs[attempt.min(self.delays_secs.len() - 1)])
    }
}

/// Shared signed-request client used by both adapter variants.
pub struct SignedHttpClient {
    api_key: String,
    secret: String,
    base_url: String,
    /// Path of the server-time endpoint for this API dialect.
    time_path: String,
    client: reqwest::Client,
    /// Server time minus local time, in milliseconds.
    time_offset_ms: AtomicI64,
    /// Wall-clock of the last successful time sync.
    last_time_sync: Mutex<Option<std::time::Instant>>,
    in_flight: Semaphore,
    pub rate: RateLimitTracker,
}

impl SignedHttpClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        time_path: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            time_path: time_path.into(),
            client,
            time_offset_ms: AtomicI64::new(0),
            last_time_sync: Mutex::new(None),
            in_flight: Semaphore::new(MAX_IN_FLIGHT),
            rate: RateLimitTracker::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Local UNIX milliseconds corrected by the known server offset.
    fn timestamp_ms(&self) -> i64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64;
        local + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Server-time synchronisation
    // -------------------------------------------------------------------------

    /// Fetch the exchange's server time and record the offset from local time.
    pub async fn sync_time(&self) -> ExchangeResult<()> {
        let url = format!("{}{}", self.base_url, self.time_path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(format!("time sync failed: {e}")))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(format!("time sync body: {e}")))?;

        let server_ms = body["serverTime"]
            .as_i64()
            .ok_or_else(|| ExchangeError::Malformed("serverTime missing".into()))?;

        let local_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64;

        let offset = server_ms - local_ms;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        *self.last_time_sync.lock() = Some(std::time::Instant::now());

        debug!(offset_ms = offset, "server time synchronised");
        Ok(())
    }

    async fn sync_time_if_stale(&self) {
        let stale = {
            let last = self.last_time_sync.lock();
            match *last {
                Some(at) => at.elapsed() > TIME_SYNC_MAX_AGE,
                None => true,
            }
        };
        if stale {
            if let Err(e) = self.sync_time().await {
                warn!(error = %e, "server time sync failed — continuing with old offset");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Request execution
    // -------------------------------------------------------------------------

    /// Execute a request and parse the JSON body.
    ///
    /// `params` is a pre-encoded query string without timestamp/signature.
    /// When `signed` is true, the signed query is rebuilt on every attempt so
    /// a retried request never carries a stale timestamp.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        policy: RetryPolicy,
    ) -> ExchangeResult<serde_json::Value> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("request semaphore closed");

        if signed {
            self.sync_time_if_stale().await;
        }

        let mut attempt: usize = 0;
        loop {
            match self.send_once(method, path, params, signed).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    // A clock-skew rejection gets one immediate resync+retry
                    // that does not consume a backoff attempt.
                    if matches!(e, ExchangeError::ClockSkew(_)) {
                        warn!(path, "clock skew reported — resynchronising server time");
                        let _ = self.sync_time().await;
                    }

                    if !e.is_retryable() || attempt >= policy.attempts {
                        return Err(e);
                    }

                    let delay = match &e {
                        ExchangeError::RateLimited { retry_after_secs: Some(s) } => {
                            Duration::from_secs(*s)
                        }
                        _ => policy.delay(attempt),
                    };

                    warn!(
                        path,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "request failed — retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> ExchangeResult<serde_json::Value> {
        let query = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };

        let resp = request
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(format!("{method:?} {path}: {e}")))?;

        let status = resp.status();
        self.rate.update_from_headers(resp.headers());
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(format!("{method:?} {path}: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        Err(classify_error(status, retry_after, &body, path))
    }

    /// The API key, exposed for Debug-safe diagnostics only (never the secret).
    pub fn api_key_fingerprint(&self) -> String {
        let k = &self.api_key;
        if k.len() <= 6 {
            "<short>".to_string()
        } else {
            format!("{}…", &k[..6])
        }
    }
}

impl std::fmt::Debug for SignedHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedHttpClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Error classification
// =============================================================================

/// Map an HTTP status + exchange error body into the engine's taxonomy.
fn classify_error(
    status: StatusCode,
    retry_after: Option<u64>,
    body: &serde_json::Value,
    path: &str,
) -> ExchangeError {
    let code = body["code"].as_i64().unwrap_or(0);
    let msg = body["msg"]
        .as_str()
        .map(|s| s.to_string())
        .unwrap_or_else(|| body.to_string());
    let detail = format!("{path}: [{code}] {msg}");

    // Exchange-specific error codes take precedence over the HTTP status.
    match code {
        -1021 => return ExchangeError::ClockSkew(detail),
        -1022 | -2014 | -2015 => return ExchangeError::Auth(detail),
        -2013 => return ExchangeError::NotFound(detail),
        -2018 | -2019 | -4028 => return ExchangeError::InsufficientFunds(detail),
        -1003 => return ExchangeError::RateLimited { retry_after_secs: retry_after },
        _ => {}
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => ExchangeError::RateLimited { retry_after_secs: retry_after },
        // 418 is the exchange's auto-ban escalation of 429.
        StatusCode::IM_A_TEAPOT => ExchangeError::RateLimited {
            retry_after_secs: retry_after.or(Some(60)),
        },
        StatusCode::NOT_FOUND => ExchangeError::NotFound(detail),
        StatusCode::BAD_REQUEST => ExchangeError::InvalidArgument(detail),
        s if s.is_server_error() => ExchangeError::Transport(detail),
        _ => ExchangeError::Transport(detail),
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub fn parse_str_f64(val: &serde_json::Value) -> ExchangeResult<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| ExchangeError::Malformed(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ExchangeError::Malformed(format!(
            "expected string or number, got: {val}"
        )))
    }
}

/// Lenient variant: missing or malformed values become `default`.
pub fn parse_str_f64_or(val: &serde_json::Value, default: f64) -> f64 {
    parse_str_f64(val).unwrap_or(default)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_auth_by_code() {
        let body = serde_json::json!({"code": -2014, "msg": "API-key format invalid."});
        let e = classify_error(StatusCode::BAD_REQUEST, None, &body, "/x");
        assert!(matches!(e, ExchangeError::Auth(_)));
    }

    #[test]
    fn classify_clock_skew() {
        let body = serde_json::json!({"code": -1021, "msg": "outside of the recvWindow"});
        let e = classify_error(StatusCode::BAD_REQUEST, None, &body, "/x");
        assert!(matches!(e, ExchangeError::ClockSkew(_)));
        assert!(e.is_retryable());
    }

    #[test]
    fn classify_rate_limit_prefers_header() {
        let body = serde_json::json!({"code": -1003, "msg": "Too many requests."});
        let e = classify_error(StatusCode::TOO_MANY_REQUESTS, Some(7), &body, "/x");
        match e {
            ExchangeError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, Some(7));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn classify_insufficient_funds() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient."});
        let e = classify_error(StatusCode::BAD_REQUEST, None, &body, "/x");
        assert!(matches!(e, ExchangeError::InsufficientFunds(_)));
    }

    #[test]
    fn classify_not_found_for_cancel() {
        let body = serde_json::json!({"code": -2013, "msg": "Order does not exist."});
        let e = classify_error(StatusCode::BAD_REQUEST, None, &body, "/x");
        assert!(matches!(e, ExchangeError::NotFound(_)));
    }

    #[test]
    fn classify_server_error_is_transport() {
        let body = serde_json::json!({});
        let e = classify_error(StatusCode::BAD_GATEWAY, None, &body, "/x");
        assert!(matches!(e, ExchangeError::Transport(_)));
        assert!(e.is_retryable());
    }

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert_eq!(parse_str_f64(&serde_json::json!("3000.5")).unwrap(), 3000.5);
        assert_eq!(parse_str_f64(&serde_json::json!(42.0)).unwrap(), 42.0);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
        assert_eq!(parse_str_f64_or(&serde_json::json!(null), 1.0), 1.0);
    }

    #[test]
    fn retry_policy_delays() {
        let p = RetryPolicy::protective();
        assert_eq!(p.delay(0), Duration::from_secs(3));
        assert_eq!(p.delay(1), Duration::from_secs(5));
        assert_eq!(p.delay(2), Duration::from_secs(8));
        // Clamped beyond the schedule.
        assert_eq!(p.delay(9), Duration::from_secs(8));
    }

    #[test]
    fn signing_is_deterministic() {
        let c = SignedHttpClient::new("key", "secret", "https://example", "/time");
        let a = c.sign("symbol=ETHUSDT&side=BUY");
        let b = c.sign("symbol=ETHUSDT&side=BUY");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA-256
        assert_ne!(a, c.sign("symbol=ETHUSDT&side=SELL"));
    }

    #[test]
    fn debug_redacts_credentials() {
        let c = SignedHttpClient::new("very-secret-key", "very-secret", "https://example", "/t");
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("very-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
