//! JSON HTTP RPC API for the Verity node.
//!
//! Read access to the registry and escrow ledgers plus a manual trigger for
//! verification cycles.
//!
//! The RPC server has no authentication. By default it binds to localhost
//! only. Deployments exposed to a network must put an authentication layer
//! in front of the router, since `POST /tasks/{task_id}/verify` settles
//! escrows as the orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::CycleConfig;
use crate::crypto::keys::Address;
use crate::orchestrator::{CycleError, CycleSummary, Orchestrator};
use crate::registry::{AgentRecord, RegistryError};
use crate::settlement::{EscrowEntry, EscrowError};
use crate::store::KvStore;
use crate::verification::collector::AgentTransport;
use crate::TaskId;

/// Shared RPC state.
pub struct RpcState<T: AgentTransport, S: KvStore> {
    pub orchestrator: Arc<Orchestrator<T, S>>,
    pub cycle: Arc<CycleConfig>,
    pub shutdown: CancellationToken,
    pub started: Instant,
}

impl<T: AgentTransport, S: KvStore> Clone for RpcState<T, S> {
    fn clone(&self) -> Self {
        RpcState {
            orchestrator: self.orchestrator.clone(),
            cycle: self.cycle.clone(),
            shutdown: self.shutdown.clone(),
            started: self.started,
        }
    }
}

impl<T: AgentTransport, S: KvStore> RpcState<T, S> {
    pub fn new(
        orchestrator: Arc<Orchestrator<T, S>>,
        cycle: CycleConfig,
        shutdown: CancellationToken,
    ) -> Self {
        RpcState {
            orchestrator,
            cycle: Arc::new(cycle),
            shutdown,
            started: Instant::now(),
        }
    }
}

type RpcError = (StatusCode, String);

/// Build the RPC router.
pub fn router<T: AgentTransport, S: KvStore + 'static>(rpc_state: RpcState<T, S>) -> Router {
    Router::new()
        .route("/health", get(get_health::<T, S>))
        .route("/agents", get(get_agents::<T, S>))
        .route("/agents/{address}", get(get_agent::<T, S>))
        .route("/tasks/{task_id}", get(get_task::<T, S>))
        .route("/tasks/{task_id}/verify", post(verify_task::<T, S>))
        .route("/balances/{address}", get(get_balance::<T, S>))
        .with_state(rpc_state)
}

/// Start the RPC server.
pub async fn serve<T: AgentTransport, S: KvStore + 'static>(
    addr: SocketAddr,
    rpc_state: RpcState<T, S>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let shutdown = rpc_state.shutdown.clone();
    let app = router(rpc_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "RPC server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn internal<E: std::fmt::Display>(e: E) -> RpcError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn parse_address(hex: &str) -> Result<Address, RpcError> {
    Address::from_hex(hex).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "address must be 32 bytes hex".to_string(),
        )
    })
}

fn cycle_error_status(e: &CycleError) -> StatusCode {
    match e {
        CycleError::Escrow(EscrowError::UnknownTask(_)) => StatusCode::NOT_FOUND,
        CycleError::Escrow(EscrowError::AlreadySettled { .. }) => StatusCode::CONFLICT,
        CycleError::Escrow(EscrowError::Unauthorized(_))
        | CycleError::Registry(RegistryError::Unauthorized(_)) => StatusCode::FORBIDDEN,
        CycleError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── GET /health ──

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    orchestrator: Address,
    agent_count: usize,
    escrow_count: usize,
}

async fn get_health<T: AgentTransport, S: KvStore + 'static>(
    State(state): State<RpcState<T, S>>,
) -> Result<Json<HealthResponse>, RpcError> {
    let orch = &state.orchestrator;
    Ok(Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_seconds: state.started.elapsed().as_secs(),
        orchestrator: orch.identity(),
        agent_count: orch.registry().agent_count().map_err(internal)?,
        escrow_count: orch.escrow().escrow_count().map_err(internal)?,
    }))
}

// ── GET /agents, GET /agents/{address} ──

#[derive(Serialize)]
struct AgentResponse {
    address: Address,
    owner: Address,
    metadata_uri: String,
    metadata_version: u32,
    is_active: bool,
    reputation_score: u32,
    total_tasks: u64,
    successful_tasks: u64,
    sla_violation_count: u32,
    registered_at_ms: u64,
}

impl From<AgentRecord> for AgentResponse {
    fn from(r: AgentRecord) -> Self {
        AgentResponse {
            address: r.address,
            owner: r.owner,
            metadata_uri: r.metadata_uri,
            metadata_version: r.metadata_version,
            is_active: r.is_active,
            reputation_score: r.reputation_score,
            total_tasks: r.total_tasks,
            successful_tasks: r.successful_tasks,
            sla_violation_count: r.sla_violation_count,
            registered_at_ms: r.registered_at_ms,
        }
    }
}

async fn get_agents<T: AgentTransport, S: KvStore + 'static>(
    State(state): State<RpcState<T, S>>,
) -> Result<Json<Vec<AgentResponse>>, RpcError> {
    let agents = state
        .orchestrator
        .registry()
        .list_agents()
        .map_err(internal)?;
    Ok(Json(agents.into_iter().map(AgentResponse::from).collect()))
}

async fn get_agent<T: AgentTransport, S: KvStore + 'static>(
    State(state): State<RpcState<T, S>>,
    Path(address): Path<String>,
) -> Result<Json<AgentResponse>, RpcError> {
    let address = parse_address(&address)?;
    match state
        .orchestrator
        .registry()
        .get_agent(&address)
        .map_err(internal)?
    {
        Some(record) => Ok(Json(record.into())),
        None => Err((StatusCode::NOT_FOUND, "agent not registered".into())),
    }
}

// ── GET /tasks/{task_id}, POST /tasks/{task_id}/verify ──

async fn get_task<T: AgentTransport, S: KvStore + 'static>(
    State(state): State<RpcState<T, S>>,
    Path(task_id): Path<String>,
) -> Result<Json<EscrowEntry>, RpcError> {
    let task_id = TaskId::parse(&task_id);
    match state
        .orchestrator
        .escrow()
        .get_escrow(&task_id)
        .map_err(internal)?
    {
        Some(entry) => Ok(Json(entry)),
        None => Err((StatusCode::NOT_FOUND, format!("no escrow for task {}", task_id))),
    }
}

async fn verify_task<T: AgentTransport, S: KvStore + 'static>(
    State(state): State<RpcState<T, S>>,
    Path(task_id): Path<String>,
) -> Result<Json<CycleSummary>, RpcError> {
    let task_id = TaskId::parse(&task_id);
    tracing::info!(task = %task_id, "Manual verification triggered over RPC");
    state
        .orchestrator
        .run_verification_cycle(task_id, &state.cycle, &state.shutdown)
        .await
        .map(Json)
        .map_err(|e| (cycle_error_status(&e), e.to_string()))
}

// ── GET /balances/{address} ──

#[derive(Serialize)]
struct BalanceResponse {
    address: Address,
    /// Decimal string; balances are u128.
    balance: String,
}

async fn get_balance<T: AgentTransport, S: KvStore + 'static>(
    State(state): State<RpcState<T, S>>,
    Path(address): Path<String>,
) -> Result<Json<BalanceResponse>, RpcError> {
    let address = parse_address(&address)?;
    let balance = state
        .orchestrator
        .escrow()
        .balance_of(&address)
        .map_err(internal)?;
    Ok(Json(BalanceResponse {
        address,
        balance: balance.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode as HttpStatus};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::crypto::keys::SigningKeypair;
    use crate::registry::AgentRegistry;
    use crate::settlement::EscrowLedger;
    use crate::store::MemoryStore;
    use crate::verification::collector::{AgentResponse as WireResponse, TransportError};

    const ORCH: Address = Address([0xAA; 32]);
    const BUYER: Address = Address([0xB0; 32]);
    const SELLER: Address = Address([0x5E; 32]);

    /// Every agent is offline.
    struct Offline;

    impl AgentTransport for Offline {
        async fn fetch(&self, _endpoint: &str, _task_id: &TaskId) -> Result<WireResponse, TransportError> {
            Err(TransportError::Request("connection refused".into()))
        }
    }

    fn test_rpc_state() -> RpcState<Offline, MemoryStore> {
        let registry = Arc::new(AgentRegistry::new(Arc::new(MemoryStore::new()), ORCH));
        let escrow = Arc::new(EscrowLedger::new(Arc::new(MemoryStore::new()), ORCH));
        let orchestrator = Arc::new(Orchestrator::new(ORCH, Arc::new(Offline), registry, escrow));
        RpcState::new(orchestrator, CycleConfig::default(), CancellationToken::new())
    }

    async fn call(
        app: &axum::Router,
        method: &str,
        path: &str,
    ) -> (HttpStatus, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::String(
            String::from_utf8_lossy(&body).into_owned(),
        ));
        (status, json)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(test_rpc_state());
        let (status, json) = call(&app, "GET", "/health").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["agent_count"], 0);
        assert_eq!(json["orchestrator"], ORCH.to_hex());
    }

    #[tokio::test]
    async fn agents_are_listed_and_looked_up() {
        let state = test_rpc_state();
        let kp = SigningKeypair::generate();
        state
            .orchestrator
            .registry()
            .register_agent(kp.address(), kp.public.clone(), "http://agent-1")
            .unwrap();
        let app = router(state);

        let (status, json) = call(&app, "GET", "/agents").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["metadata_uri"], "http://agent-1");

        let (status, json) = call(&app, "GET", &format!("/agents/{}", kp.address().to_hex())).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["reputation_score"], crate::constants::INITIAL_REPUTATION);
        assert_eq!(json["is_active"], true);

        let (status, _) = call(&app, "GET", &format!("/agents/{}", hex::encode([1u8; 32]))).await;
        assert_eq!(status, HttpStatus::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/agents/nothex").await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);
    }

    #[tokio::test]
    async fn verify_refunds_when_no_agent_answers() {
        let state = test_rpc_state();
        let task = TaskId::parse("match-9");
        state
            .orchestrator
            .escrow()
            .lock_payment(BUYER, task, SELLER, 25)
            .unwrap();
        let app = router(state);

        let (status, json) = call(&app, "GET", "/tasks/match-9").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["status"], "locked");

        let (status, json) = call(&app, "POST", "/tasks/match-9/verify").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["outcome"], "refunded");
        assert_eq!(json["report"]["passed"], false);
        assert_eq!(json["report"]["failure"], "no_agents");

        let (status, _) = call(&app, "POST", &format!("/tasks/{}/verify", task.to_hex())).await;
        assert_eq!(status, HttpStatus::CONFLICT);

        let (status, json) = call(&app, "GET", &format!("/balances/{}", BUYER.to_hex())).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["balance"], "25");
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let app = router(test_rpc_state());
        let (status, _) = call(&app, "GET", "/tasks/nothing").await;
        assert_eq!(status, HttpStatus::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/tasks/nothing/verify").await;
        assert_eq!(status, HttpStatus::NOT_FOUND);
    }
}
