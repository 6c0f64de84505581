//! Verity node binary.
//!
//! Runs verification cycles against registered agents, settles escrows and
//! serves the JSON RPC API. Also provides key management, registration and
//! a reference agent for local testing.
//!
//! Usage:
//!   verity keygen --out agent.key
//!   verity register --key agent.key --endpoint http://127.0.0.1:8001
//!   verity lock --key buyer.key --task match-42 --seller <hex> --amount 100
//!   verity agent [<address>]
//!   verity run --task match-42
//!   verity serve                     # RPC + interval scheduler
//!   verity worker --key agent.key --listen 127.0.0.1:8001 --answer "2-1"

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use verity::config::VerityConfig;
use verity::crypto::keys::{load_keypair, load_or_generate_keypair, Address};
use verity::orchestrator::Orchestrator;
use verity::registry::AgentRegistry;
use verity::settlement::EscrowLedger;
use verity::store::{open_db, SledStore};
use verity::verification::collector::HttpTransport;
use verity::TaskId;

const ORCHESTRATOR_KEY_FILE: &str = "orchestrator.key";

/// Redundant-agent task verification and escrow settlement.
#[derive(Parser, Debug)]
#[command(name = "verity", version, about = "Verity task verification node")]
struct Cli {
    /// Data directory for persistent storage and keys.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to <data-dir>/verity.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a signing keypair and print its address.
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },

    /// Register an agent in the local registry.
    Register {
        /// Agent key file.
        #[arg(long)]
        key: PathBuf,
        /// Base URL serving `/predict`.
        #[arg(long)]
        endpoint: String,
    },

    /// Lock a payment in escrow for a task.
    Lock {
        /// Buyer key file.
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        task: String,
        /// Seller address (hex).
        #[arg(long)]
        seller: String,
        #[arg(long)]
        amount: u64,
    },

    /// Show one agent, or list all agents.
    Agent { address: Option<String> },

    /// Run one verification cycle.
    Run {
        /// Task id (hex or label); defaults to `cycle.task_id`.
        #[arg(long)]
        task: Option<String>,
        /// Agent endpoints (comma-separated); overrides the config.
        #[arg(long, value_delimiter = ',')]
        endpoints: Vec<String>,
        #[arg(long)]
        max_response_time_ms: Option<u64>,
        #[arg(long)]
        min_consensus_fraction: Option<f64>,
    },

    /// Serve the RPC API and run the configured schedule.
    Serve {
        #[arg(long)]
        rpc_addr: Option<SocketAddr>,
    },

    /// Run a reference agent answering `/predict` with a fixed result.
    Worker {
        #[arg(long)]
        key: PathBuf,
        #[arg(long, default_value = "127.0.0.1:8001")]
        listen: SocketAddr,
        #[arg(long)]
        answer: String,
        /// Artificial delay before answering.
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

type Node = Orchestrator<HttpTransport, SledStore>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match (&cli.config, &cli.data_dir) {
        (Some(path), _) => VerityConfig::load_from(path)?,
        (None, Some(dir)) => VerityConfig::load(dir)?,
        (None, None) => VerityConfig::load(Path::new(&VerityConfig::default().node.data_dir))?,
    };
    if let Some(dir) = &cli.data_dir {
        config.node.data_dir = dir.display().to_string();
    }

    match cli.command {
        Command::Keygen { out } => {
            let kp = load_or_generate_keypair(&out)?;
            println!("{}", kp.address());
            Ok(())
        }

        Command::Register { key, endpoint } => {
            let node = open_node(&config)?;
            let kp = load_keypair(&key)?;
            let record = node
                .registry()
                .register_agent(kp.address(), kp.public.clone(), &endpoint)?;
            println!("registered {} at {}", record.address, record.metadata_uri);
            Ok(())
        }

        Command::Lock {
            key,
            task,
            seller,
            amount,
        } => {
            let node = open_node(&config)?;
            let buyer = load_keypair(&key)?.address();
            let seller = Address::from_hex(&seller).ok_or("seller must be a 32-byte hex address")?;
            let task_id = TaskId::parse(&task);
            node.escrow().lock_payment(buyer, task_id, seller, amount)?;
            println!("locked {} for task {}", amount, task_id);
            Ok(())
        }

        Command::Agent { address } => {
            let node = open_node(&config)?;
            let records = match address {
                Some(hex) => {
                    let address = Address::from_hex(&hex).ok_or("address must be 32-byte hex")?;
                    vec![node
                        .registry()
                        .get_agent(&address)?
                        .ok_or("agent not registered")?]
                }
                None => node.registry().list_agents()?,
            };
            for r in records {
                println!(
                    "{} score={} tasks={}/{} sla_violations={} active={} uri={} v{}",
                    r.address,
                    r.reputation_score,
                    r.successful_tasks,
                    r.total_tasks,
                    r.sla_violation_count,
                    r.is_active,
                    r.metadata_uri,
                    r.metadata_version
                );
            }
            Ok(())
        }

        Command::Run {
            task,
            endpoints,
            max_response_time_ms,
            min_consensus_fraction,
        } => {
            if !endpoints.is_empty() {
                config.cycle.agent_endpoints = endpoints;
            }
            if let Some(ms) = max_response_time_ms {
                config.cycle.max_response_time_ms = ms;
            }
            if let Some(f) = min_consensus_fraction {
                config.cycle.min_consensus_fraction = f;
            }
            config.validate()?;

            let label = task
                .or_else(|| config.cycle.task_id.clone())
                .ok_or("no task given and cycle.task_id is not set")?;
            let node = open_node(&config)?;
            let cancel = shutdown_on_ctrl_c();
            let summary = node
                .run_verification_cycle(TaskId::parse(&label), &config.cycle, &cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!("{}", summary.outcome);
            Ok(())
        }

        Command::Serve { rpc_addr } => {
            config.validate()?;
            let rpc_addr = match rpc_addr {
                Some(addr) => addr,
                None => config.node.rpc_addr()?,
            };
            let node = Arc::new(open_node(&config)?);
            let shutdown = shutdown_on_ctrl_c();

            let scheduler = {
                let node = node.clone();
                let cycle = config.cycle.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { node.run_schedule(cycle, shutdown).await })
            };

            tracing::info!(orchestrator = %node.identity(), data = %config.node.data_dir, "Starting Verity node");
            let state = verity::rpc::RpcState::new(node, config.cycle.clone(), shutdown.clone());
            let served = verity::rpc::serve(rpc_addr, state).await;
            shutdown.cancel();
            if let Err(e) = scheduler.await {
                tracing::error!(error = %e, "Scheduler task failed");
            }
            served.map_err(|e| e.to_string())?;
            Ok(())
        }

        Command::Worker {
            key,
            listen,
            answer,
            delay_ms,
        } => {
            let kp = load_or_generate_keypair(&key)?;
            let state = verity::worker::WorkerState::new(
                Arc::new(kp),
                answer,
                Duration::from_millis(delay_ms),
            );
            verity::worker::serve(listen, state)
                .await
                .map_err(|e| e.to_string())?;
            Ok(())
        }
    }
}

/// Open both ledgers over one sled database and the orchestrator identity.
fn open_node(config: &VerityConfig) -> Result<Node, Box<dyn std::error::Error>> {
    let data_dir = PathBuf::from(&config.node.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let identity = load_or_generate_keypair(&data_dir.join(ORCHESTRATOR_KEY_FILE))?.address();

    let db = open_db(&data_dir.join("db"))?;
    let registry_store = Arc::new(SledStore::with_db(db.clone(), &config.cycle.registry_address)?);
    let escrow_store = Arc::new(SledStore::with_db(db, &config.cycle.escrow_address)?);

    Ok(Orchestrator::new(
        identity,
        Arc::new(HttpTransport::new()),
        Arc::new(AgentRegistry::new(registry_store, identity)),
        Arc::new(EscrowLedger::new(escrow_store, identity)),
    ))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            trigger.cancel();
        }
    });
    token
}
