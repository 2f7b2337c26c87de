//! Timed check requests
//!
//! A check fetches the target URL through the real network path (the
//! worker pool is rewriting packets underneath) and records status,
//! bytes read, duration and effective speed. Failures are results,
//! not errors: the preset search scores them like any other outcome.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// How much of the body a check reads before calling it a success
const READ_LIMIT: usize = 64 * 1024;

/// Lifecycle of a check or a whole suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Created, not yet started
    Pending,
    /// In flight
    Running,
    /// Finished successfully
    Complete,
    /// Finished unsuccessfully
    Failed,
    /// Canceled by the operator
    Canceled,
}

/// Outcome of one timed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// URL or domain the check hit
    pub target: String,
    /// Outcome
    pub status: CheckStatus,
    /// Wall time of the request
    pub duration_ms: u64,
    /// Bytes read before the limit or EOF
    pub bytes_read: u64,
    /// Effective speed in bytes per second
    pub speed: f64,
    /// HTTP status code when a response arrived
    pub status_code: Option<u16>,
    /// Failure detail
    pub error: Option<String>,
}

impl CheckResult {
    /// A failed result with a reason
    pub fn failed(target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status: CheckStatus::Failed,
            duration_ms: 0,
            bytes_read: 0,
            speed: 0.0,
            status_code: None,
            error: Some(error.into()),
        }
    }

    /// Whether the check succeeded
    pub fn ok(&self) -> bool {
        self.status == CheckStatus::Complete
    }
}

/// HTTP check client with a bounded per-request timeout
pub struct Checker {
    client: reqwest::Client,
    timeout: Duration,
}

impl Checker {
    /// Build a checker. Certificate failures are tolerated: a DPI that
    /// injects content presents the wrong certificate, and that is
    /// still a signal worth timing.
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(4))
            .user_agent("Mozilla/5.0")
            .build()
            .map_err(|e| crate::error::Error::Probe {
                probe: "checker",
                message: e.to_string(),
            })?;
        Ok(Self { client, timeout })
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch a URL and time it
    pub async fn fetch(&self, url: &str) -> CheckResult {
        let start = Instant::now();
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(err) => {
                let mut result = CheckResult::failed(url, err.to_string());
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        let status_code = response.status().as_u16();
        let mut bytes_read = 0u64;
        let mut stream = response;
        loop {
            match stream.chunk().await {
                Ok(Some(chunk)) => {
                    bytes_read += chunk.len() as u64;
                    if bytes_read as usize >= READ_LIMIT {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    return CheckResult {
                        target: url.to_string(),
                        status: CheckStatus::Failed,
                        duration_ms: start.elapsed().as_millis() as u64,
                        bytes_read,
                        speed: 0.0,
                        status_code: Some(status_code),
                        error: Some(err.to_string()),
                    };
                }
            }
        }

        let duration = start.elapsed();
        let secs = duration.as_secs_f64().max(1e-6);
        CheckResult {
            target: url.to_string(),
            status: if (200..500).contains(&status_code) {
                CheckStatus::Complete
            } else {
                CheckStatus::Failed
            },
            duration_ms: duration.as_millis() as u64,
            bytes_read,
            speed: bytes_read as f64 / secs,
            status_code: Some(status_code),
            error: None,
        }
    }
}
