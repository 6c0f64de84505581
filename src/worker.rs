//! Reference agent endpoint.
//!
//! Serves `GET /predict?taskId=<hex>` with a fixed answer signed by the
//! agent's key. Used by the `worker` CLI command and by end-to-end tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::crypto::{result_sign_data, MessageSigner};
use crate::verification::collector::AgentResponse;
use crate::TaskId;

/// Build the signed wire response for `payload`.
pub fn sign_response<M: MessageSigner + ?Sized>(
    signer: &M,
    task_id: &TaskId,
    payload: &str,
    timestamp: u64,
) -> AgentResponse {
    AgentResponse {
        agent_address: signer.address().to_hex(),
        result: payload.to_string(),
        signature: signer.sign(&result_sign_data(task_id, payload)).to_hex(),
        timestamp,
    }
}

#[derive(Clone)]
pub struct WorkerState {
    signer: Arc<dyn MessageSigner>,
    answer: String,
    delay: Duration,
}

impl WorkerState {
    pub fn new(signer: Arc<dyn MessageSigner>, answer: impl Into<String>, delay: Duration) -> Self {
        WorkerState {
            signer,
            answer: answer.into(),
            delay,
        }
    }
}

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/predict", get(predict))
        .with_state(state)
}

/// Start the worker server.
pub async fn serve(
    addr: SocketAddr,
    state: WorkerState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, agent = %state.signer.address().short(), "Worker listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Deserialize)]
struct PredictQuery {
    #[serde(rename = "taskId")]
    task_id: String,
}

async fn predict(
    State(state): State<WorkerState>,
    Query(query): Query<PredictQuery>,
) -> Json<AgentResponse> {
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    let task_id = TaskId::parse(&query.task_id);
    tracing::debug!(task = %task_id, "Answering prediction request");
    Json(sign_response(
        state.signer.as_ref(),
        &task_id,
        &state.answer,
        crate::now_ms(),
    ))
}
