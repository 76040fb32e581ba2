//! Blocking HTTP client with the retry policy shared by provisioners and reporters.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::io::cancel;
use crate::io::config::HttpConfig;

/// Status codes worth retrying.
pub const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Exponential backoff: `factor * 2^(attempt - 2)` seconds, so factor 1
/// waits 0.5, 1, 2, 4 ... between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff_factor: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt as i32 - 2;
        Duration::from_secs_f64(self.backoff_factor * 2f64.powi(exponent))
    }
}

/// Response body and status, returned for every completed exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).context("parse response json")
    }

    /// Turn a non-2xx response into an error mentioning `what`.
    pub fn error_for_status(self, what: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(anyhow!("{what} failed with HTTP {}: {}", self.status, self.body.trim()))
    }
}

/// Request payload.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Bytes { content_type: String, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
    /// No overall deadline, only connect/read timeouts.
    download_agent: ureq::Agent,
    retry: RetryPolicy,
    headers: Vec<(String, String)>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        let download_agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.timeout_secs))
            .timeout_read(Duration::from_secs(config.timeout_secs * 6))
            .build();
        Self {
            agent,
            download_agent,
            retry: RetryPolicy {
                attempts: config.retries.max(1),
                backoff_factor: config.backoff_factor,
            },
            headers: Vec::new(),
        }
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    pub fn with_basic_auth(self, user: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{user}:{password}"));
        self.with_header("Authorization", format!("Basic {encoded}"))
    }

    pub fn get(&self, url: &str) -> Result<HttpResponse> {
        self.send("GET", url, &Body::Empty)
    }

    pub fn delete(&self, url: &str) -> Result<HttpResponse> {
        self.send("DELETE", url, &Body::Empty)
    }

    pub fn post_json<T: Serialize>(&self, url: &str, payload: &T) -> Result<HttpResponse> {
        let value = serde_json::to_value(payload).context("serialize request body")?;
        self.send("POST", url, &Body::Json(value))
    }

    pub fn post_bytes(&self, url: &str, content_type: &str, data: Vec<u8>) -> Result<HttpResponse> {
        self.send(
            "POST",
            url,
            &Body::Bytes {
                content_type: content_type.to_string(),
                data,
            },
        )
    }

    /// Send a request, retrying transport errors and [`RETRY_STATUSES`].
    ///
    /// Non-retryable statuses (and the last retryable one) are returned as
    /// responses so callers decide what a failure means.
    #[instrument(skip_all, fields(method = %method, url = %url))]
    pub fn send(&self, method: &str, url: &str, body: &Body) -> Result<HttpResponse> {
        match self.call(&self.agent, method, url, body)? {
            Ok(response) => {
                let status = response.status();
                let body = response.into_string().context("read response body")?;
                Ok(HttpResponse { status, body })
            }
            Err(failed) => Ok(failed),
        }
    }

    /// Stream `url` into `dest` (through a `.part` file).
    #[instrument(skip_all, fields(url = %url))]
    pub fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = match self.call(&self.download_agent, "GET", url, &Body::Empty)? {
            Ok(response) => response,
            Err(failed) => {
                return Err(anyhow!("download {url} failed with HTTP {}", failed.status));
            }
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let partial = dest.with_extension("part");
        let mut file = fs::File::create(&partial)
            .with_context(|| format!("create {}", partial.display()))?;
        std::io::copy(&mut response.into_reader(), &mut file)
            .with_context(|| format!("download {url}"))?;
        fs::rename(&partial, dest).with_context(|| format!("replace {}", dest.display()))?;
        Ok(())
    }

    fn call(
        &self,
        agent: &ureq::Agent,
        method: &str,
        url: &str,
        body: &Body,
    ) -> Result<std::result::Result<ureq::Response, HttpResponse>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel::check()?;
            debug!(attempt, "sending request");
            match self.send_once(agent, method, url, body) {
                Ok(response) => return Ok(Ok(response)),
                Err(ureq::Error::Status(status, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    if !RETRY_STATUSES.contains(&status) || attempt >= self.retry.attempts {
                        return Ok(Err(HttpResponse { status, body }));
                    }
                    warn!(status, attempt, "retryable http status");
                }
                Err(ureq::Error::Transport(transport)) => {
                    if attempt >= self.retry.attempts {
                        return Err(anyhow!("{method} {url}: {transport}"));
                    }
                    warn!(err = %transport, attempt, "http transport error");
                }
            }
            cancel::sleep(self.retry.delay_for_attempt(attempt))?;
        }
    }

    fn send_once(
        &self,
        agent: &ureq::Agent,
        method: &str,
        url: &str,
        body: &Body,
    ) -> std::result::Result<ureq::Response, ureq::Error> {
        let mut request = agent.request(method, url);
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }
        match body {
            Body::Empty => request.call(),
            Body::Json(value) => request.send_json(value.clone()),
            Body::Bytes { content_type, data } => {
                request.set("Content-Type", content_type).send_bytes(data)
            }
        }
    }
}

/// A `multipart/form-data` body holding a single file field.
pub fn multipart_file(field: &str, file_name: &str, content_type: &str, data: &[u8]) -> (String, Vec<u8>) {
    let boundary = format!("tmt-boundary-{}", chrono::Utc::now().timestamp_micros());
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_half_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn error_for_status_keeps_success() {
        let ok = HttpResponse {
            status: 201,
            body: "{}".to_string(),
        };
        assert!(ok.error_for_status("create").is_ok());

        let bad = HttpResponse {
            status: 404,
            body: "missing".to_string(),
        };
        let err = bad.error_for_status("lookup").expect_err("should fail");
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[test]
    fn multipart_wraps_file_payload() {
        let (content_type, body) = multipart_file("file", "launch.zip", "application/zip", b"PK");
        let boundary = content_type
            .split("boundary=")
            .nth(1)
            .expect("boundary");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("filename=\"launch.zip\""));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn unreachable_host_fails_after_retries() {
        let client = HttpClient::new(&HttpConfig {
            timeout_secs: 1,
            retries: 1,
            backoff_factor: 0.0,
        });
        let err = client.get("http://127.0.0.1:9/guests/").expect_err("should fail");
        assert!(err.to_string().contains("GET"));
    }
}
