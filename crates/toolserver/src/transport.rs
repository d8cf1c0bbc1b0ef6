//! HTTP JSON-RPC transport to the tool server.
//!
//! Each request is a POST of one JSON-RPC envelope. Transport failures are
//! retried with bounded exponential backoff and jitter; server-reported
//! RPC errors are not retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use od_domain::config::ToolServerConfig;
use od_domain::{Error, Result};

use crate::protocol::{RpcRequest, RpcResponse};

pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    max_retries: u32,
    retry_base: Duration,
}

impl HttpTransport {
    pub fn new(cfg: &ToolServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            endpoint: cfg.base_url.clone(),
            client,
            next_id: AtomicU64::new(1),
            max_retries: cfg.max_retries,
            retry_base: Duration::from_millis(cfg.retry_base_ms),
        })
    }

    /// Send one JSON-RPC request and return the parsed envelope.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RpcRequest::new(id, method, params);

        let mut attempt: u32 = 0;
        loop {
            match self.post_once(&envelope).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        method,
                        attempt,
                        delay_ms = backoff.as_millis() as u64,
                        error = %e,
                        "tool server transport error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, envelope: &RpcRequest) -> Result<RpcResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("tool server: {e}"))
                } else {
                    Error::Http(format!("tool server: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = format!("tool server HTTP {}: {}", status.as_u16(), text);
            // Overload and server faults back off; client faults surface.
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(Error::Http(message))
            } else {
                Err(Error::ToolServer(message))
            };
        }

        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|e| Error::ToolServer(format!("malformed JSON-RPC response: {e}")))?;
        Ok(body)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let raw = self.retry_base.as_millis() as u64 * factor;
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis(((raw as f64 * jitter) as u64).min(30_000))
    }
}
