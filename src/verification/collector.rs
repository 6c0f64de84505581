//! Concurrent dispatch of one task to many agents.
//!
//! Each endpoint gets its own tokio task wrapped in its own timeout, so a
//! hanging agent costs at most one timeout and never delays the others.
//! Results come back in arrival order. Nothing here fails: every
//! transport problem is folded into [`AgentResult::Failed`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::{AgentResult, FailedResult, FailureReason};
use crate::constants::{MAX_RESPONSE_BODY_BYTES, MAX_RESULT_PAYLOAD_BYTES};
use crate::TaskId;

/// Wire format of `GET {endpoint}/predict?taskId=<hex>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    /// Hex address the agent claims to be.
    pub agent_address: String,
    pub result: String,
    /// Hex Dilithium5 signature over [`crate::crypto::result_sign_data`].
    pub signature: String,
    /// Agent-reported completion time, ms since UNIX epoch.
    pub timestamp: u64,
}

/// A response as received, before any identity check.
#[derive(Clone, Debug)]
pub struct ClaimedResult {
    pub endpoint: String,
    pub arrival: usize,
    pub response: AgentResponse,
    /// Local receipt time, ms since UNIX epoch.
    pub received_at_ms: u64,
}

/// Errors from a single agent call.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("response body exceeds {0} bytes")]
    TooLarge(usize),
}

impl From<TransportError> for FailureReason {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Request(msg) => FailureReason::Transport(msg),
            TransportError::Status(code) => FailureReason::Status(code),
            TransportError::Decode(msg) => FailureReason::Malformed(msg),
            e @ TransportError::TooLarge(_) => FailureReason::Malformed(e.to_string()),
        }
    }
}

/// How the collector reaches an agent.
pub trait AgentTransport: Send + Sync + 'static {
    fn fetch(
        &self,
        endpoint: &str,
        task_id: &TaskId,
    ) -> impl Future<Output = Result<AgentResponse, TransportError>> + Send;
}

/// HTTP transport: `GET {endpoint}/predict?taskId=<hex>` returning JSON.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
        }
    }

    pub fn predict_url(endpoint: &str, task_id: &TaskId) -> String {
        format!(
            "{}/predict?taskId={}",
            endpoint.trim_end_matches('/'),
            task_id.to_hex()
        )
    }
}

impl AgentTransport for HttpTransport {
    async fn fetch(
        &self,
        endpoint: &str,
        task_id: &TaskId,
    ) -> Result<AgentResponse, TransportError> {
        let url = Self::predict_url(endpoint, task_id);
        let mut resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        if resp
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BODY_BYTES as u64)
        {
            return Err(TransportError::TooLarge(MAX_RESPONSE_BODY_BYTES));
        }

        // Content-Length may be absent or wrong; enforce the cap while reading.
        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?
        {
            if body.len() + chunk.len() > MAX_RESPONSE_BODY_BYTES {
                return Err(TransportError::TooLarge(MAX_RESPONSE_BODY_BYTES));
            }
            body.extend_from_slice(&chunk);
        }
        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Everything gathered in one dispatch round.
#[derive(Clone, Debug)]
pub struct Collection {
    pub task_id: TaskId,
    pub dispatch_started_at_ms: u64,
    /// In arrival order; `arrival` fields are `0..results.len()`.
    pub results: Vec<AgentResult<ClaimedResult>>,
}

type CallOutcome = (
    Result<Result<AgentResponse, TransportError>, tokio::time::error::Elapsed>,
    u64,
);

/// Dispatch `task_id` to every endpoint concurrently.
///
/// Dropping the returned future aborts all in-flight calls; nothing
/// collected so far survives.
pub async fn collect<T: AgentTransport>(
    transport: Arc<T>,
    task_id: TaskId,
    endpoints: &[String],
    per_call_timeout: Duration,
) -> Collection {
    let dispatch_started_at_ms = crate::now_ms();
    let mut calls: JoinSet<CallOutcome> = JoinSet::new();
    let mut endpoint_of = HashMap::with_capacity(endpoints.len());

    for endpoint in endpoints {
        let transport = transport.clone();
        let target = endpoint.clone();
        let handle = calls.spawn(async move {
            let outcome =
                tokio::time::timeout(per_call_timeout, transport.fetch(&target, &task_id)).await;
            (outcome, crate::now_ms())
        });
        endpoint_of.insert(handle.id(), endpoint.clone());
    }

    let mut results = Vec::with_capacity(endpoints.len());
    while let Some(joined) = calls.join_next_with_id().await {
        let arrival = results.len();
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, Ok(outcome)),
            Err(e) => (e.id(), Err(e.to_string())),
        };
        let endpoint = endpoint_of.remove(&id).unwrap_or_default();
        let failed = |reason: FailureReason| {
            tracing::debug!(endpoint = %endpoint, reason = %reason, "Agent call failed");
            AgentResult::Failed(FailedResult {
                endpoint: endpoint.clone(),
                arrival,
                reason,
                agent: None,
            })
        };
        let result = match outcome {
            Ok((Ok(Ok(response)), received_at_ms)) => {
                if response.result.len() > MAX_RESULT_PAYLOAD_BYTES {
                    failed(FailureReason::Malformed(format!(
                        "result payload of {} bytes exceeds limit",
                        response.result.len()
                    )))
                } else {
                    AgentResult::Ok(ClaimedResult {
                        endpoint: endpoint.clone(),
                        arrival,
                        response,
                        received_at_ms,
                    })
                }
            }
            Ok((Ok(Err(e)), _)) => failed(e.into()),
            Ok((Err(_elapsed), _)) => failed(FailureReason::Timeout),
            Err(msg) => failed(FailureReason::Aborted(msg)),
        };
        results.push(result);
    }

    tracing::debug!(
        task = %task_id,
        dispatched = endpoints.len(),
        responded = results.iter().filter(|r| r.is_ok()).count(),
        "Collection complete"
    );

    Collection {
        task_id,
        dispatch_started_at_ms,
        results,
    }
}
