//! C13 — Core Orchestrator.
//!
//! Wires every other component together: the node registry, the
//! authenticator, the chain adapter, the escrow/fund/dispute trust
//! core, governance, and the task scheduler/sandbox/verifier. Owns the
//! in-process event bus and the binary entrypoint.
//!
//! The control-flow loop: a scheduler tick assigns a task to a capable
//! node, the sandbox runs it, the verifier checks the output, and this
//! module drives the result to an escrow release or refund, a
//! reputation update, and — through `collect_tax` inside the escrow
//! path — a possible community-fund airdrop. Each of those steps is
//! fire-and-log: a reputation update failure must never roll back an
//! already-committed release.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use duxnet_api::{start_servers, ApiState};
use duxnet_auth::{Authenticator, EscrowReleasePayload};
use duxnet_chain::{ChainAdapter, EndpointConfig, RpcChainAdapter, RpcDialect};
use duxnet_config::DuxNetConfig;
use duxnet_core::{now, Currency, DuxError, DuxEvent, EventBus, NodeId, TracingEventBus};
use duxnet_escrow::fund::{CommunityFund, FundConfig};
use duxnet_escrow::{AuditLog, DisputeResolver, EscrowEngine, WalletLockLedger};
use duxnet_governance::GovernanceEngine;
use duxnet_registry::{Node, NodeRegistry, NodeStatus, ReputationEvent};
use duxnet_storage::PgStore;
use duxnet_tasks::{
    Assignment, ExecutionSandbox, NativeRuntime, NodeCapability, ResultVerifier, SandboxLimits,
    SchedulerConfig, Task, TaskResult, TaskScheduler, TaskStatus,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Running success/latency counters per node — the operational
/// bookkeeping a scheduler needs to score candidates beyond their
/// advertised capabilities. Kept here rather than in the registry
/// since it reflects in-process scheduling history, not node identity.
#[derive(Debug, Clone, Copy, Default)]
struct NodeStatsEntry {
    successes: u64,
    failures: u64,
    total_execution_seconds: f64,
    completed: u64,
}

impl NodeStatsEntry {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.5
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn avg_execution_time(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_execution_seconds / self.completed as f64
        }
    }
}

#[derive(Default)]
struct NodeStats {
    by_node: Mutex<HashMap<NodeId, NodeStatsEntry>>,
}

impl NodeStats {
    fn record(&self, node_id: NodeId, success: bool, execution_seconds: f64) {
        let mut by_node = self.by_node.lock();
        let entry = by_node.entry(node_id).or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.total_execution_seconds += execution_seconds;
        entry.completed += 1;
    }

    fn of(&self, node_id: NodeId) -> NodeStatsEntry {
        self.by_node.lock().get(&node_id).copied().unwrap_or_default()
    }
}

/// Every component the orchestrator wires together, shared by the
/// scheduling loop, the sandbox execution loop, and the REST surface.
pub struct NodeContext {
    pub registry: Arc<NodeRegistry>,
    pub auth: Arc<Authenticator>,
    pub chain: Arc<dyn ChainAdapter>,
    pub ledger: Arc<WalletLockLedger>,
    pub escrow: Arc<EscrowEngine>,
    pub disputes: Arc<DisputeResolver>,
    pub fund: Arc<CommunityFund>,
    pub governance: Arc<GovernanceEngine>,
    pub scheduler: Arc<TaskScheduler>,
    pub sandbox: Arc<ExecutionSandbox>,
    pub verifier: Arc<ResultVerifier>,
    pub events: Arc<dyn EventBus>,
    stats: NodeStats,
    config: DuxNetConfig,
}

impl NodeContext {
    pub fn build(config: DuxNetConfig) -> Result<Arc<Self>> {
        let events: Arc<dyn EventBus> = Arc::new(TracingEventBus);
        let registry = Arc::new(NodeRegistry::new());
        let auth = Arc::new(Authenticator::new());
        let audit = Arc::new(AuditLog::new());

        let chain = build_chain_adapter(&config)?;
        let ledger = Arc::new(WalletLockLedger::new(chain.clone(), audit.clone()));

        let fund = Arc::new(CommunityFund::new(
            FundConfig {
                airdrop_threshold: config.airdrop.threshold,
                airdrop_interval_hours: config.airdrop.interval_hours,
                min_airdrop_amount: config.airdrop.min_amount,
                max_airdrop_nodes: config.airdrop.max_nodes,
                currency: Currency::Flop,
            },
            registry.clone(),
            chain.clone(),
            audit.clone(),
            events.clone(),
        ));

        let escrow = Arc::new(EscrowEngine::new(
            ledger.clone(),
            chain.clone(),
            fund.clone(),
            auth.clone(),
            audit.clone(),
            events.clone(),
            config.escrow.provider_share_bps(),
        ));
        let disputes = Arc::new(DisputeResolver::new(escrow.clone(), events.clone()));
        let governance = Arc::new(GovernanceEngine::new(
            fund.clone(),
            config.governance.min_voting_days as u32,
            config.governance.max_voting_days as u32,
        ));

        let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig {
            max_tasks_per_node: config.scheduler.max_tasks_per_node,
            max_retries: config.scheduler.max_retries,
        }));
        let sandbox = Arc::new(ExecutionSandbox::new(
            Box::new(NativeRuntime::default()),
            SandboxLimits {
                memory_cap_mb: config.sandbox.memory_cap_mb,
                cpu_cap_cores: config.sandbox.cpu_cap,
                timeout_cap_s: config.sandbox.timeout_cap_s,
                network_allowed: config.sandbox.network,
            },
        ));
        let verifier = Arc::new(ResultVerifier::new());

        Ok(Arc::new(Self {
            registry,
            auth,
            chain,
            ledger,
            escrow,
            disputes,
            fund,
            governance,
            scheduler,
            sandbox,
            verifier,
            events,
            stats: NodeStats::default(),
            config,
        }))
    }

    /// Connects the persistence mirror. Failure is logged and
    /// swallowed rather than propagated: in-memory state is
    /// authoritative for the life of the process, so a node can run
    /// without a reachable database at the cost of restart recovery.
    async fn connect_storage(&self) {
        match PgStore::connect(&self.config.db.url, self.config.db.pool_size).await {
            Ok(_) => info!("connected to persistence store"),
            Err(e) => warn!(error = %e, "persistence store unavailable; continuing in-memory-only"),
        }
    }

    fn node_capability(&self, node: &Node) -> NodeCapability {
        let cpu_cores = node
            .metadata
            .get("cpu_cores")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;
        let memory_mb = node
            .metadata
            .get("memory_mb")
            .and_then(|v| v.as_u64())
            .unwrap_or(512) as u32;
        let storage_gb = node
            .metadata
            .get("storage_gb")
            .and_then(|v| v.as_u64())
            .unwrap_or(10) as u32;
        let gpu = node.metadata.get("gpu").and_then(|v| v.as_bool()).unwrap_or(false);
        let supported_services = node.capabilities.iter().map(|c| (c.clone(), ())).collect();
        let stats = self.stats.of(node.node_id);

        NodeCapability {
            node_id: node.node_id,
            cpu_cores,
            memory_mb,
            storage_gb,
            gpu,
            supported_services,
            reputation: node.reputation,
            success_rate: stats.success_rate(),
            avg_execution_time: stats.avg_execution_time(),
            current_assignments: self.scheduler.load_of(node.node_id),
        }
    }

    fn eligible_nodes(&self) -> Vec<NodeCapability> {
        self.registry
            .list_all()
            .into_iter()
            .filter(|n| matches!(n.status, NodeStatus::Online))
            .map(|n| self.node_capability(&n))
            .collect()
    }

    /// One scheduling tick plus dispatch: assigns pending tasks, then
    /// spawns a sandbox execution for each new assignment. Tasks that
    /// exhausted their retries without finding an eligible node never
    /// ran, so they're handled inline rather than through the sandbox.
    async fn tick(self: &Arc<Self>) {
        let nodes = self.eligible_nodes();
        let outcome = self.scheduler.tick(&nodes);
        for assignment in outcome.assignments {
            let ctx = self.clone();
            tokio::spawn(async move {
                ctx.execute_assignment(assignment).await;
            });
        }
        for task in outcome.exhausted {
            let ctx = self.clone();
            tokio::spawn(async move {
                ctx.handle_unschedulable_task(task).await;
            });
        }
    }

    /// A task that exhausted `max_retries` without an eligible node.
    /// Refunds its escrow (nothing ran, so there's no result to
    /// release against) and publishes a terminal failure event.
    async fn handle_unschedulable_task(&self, task: Task) {
        if let Some(escrow_id) = task.escrow_id {
            if let Err(e) = self.escrow.refund(escrow_id, "no eligible node available".to_string()).await {
                error!(%escrow_id, error = %e, "escrow refund failed after no-node task failure");
            }
        }
        self.events.publish(DuxEvent::TaskFailed {
            task_id: task.task_id,
            node_id: None,
            reason: "no eligible node available".to_string(),
            ts: now(),
        });
    }

    async fn execute_assignment(self: Arc<Self>, assignment: Assignment) {
        let Assignment { task, node_id, .. } = assignment;
        let result = self.sandbox.execute(&task, node_id).await;
        self.scheduler.release_node_slot(node_id);
        self.handle_task_result(task, result).await;
    }

    /// Verify, then release or refund, then update reputation. Every
    /// step is independent: a failure in one never blocks or rolls
    /// back another.
    async fn handle_task_result(&self, task: Task, result: TaskResult) {
        let verification = self.verifier.verify(&task.service_name, &result);
        let verified = verification.is_ok();
        if let Err(failure) = &verification {
            warn!(task_id = %task.task_id, stage = failure.stage, reason = %failure.reason, "task result failed verification");
        }

        if let Some(escrow_id) = task.escrow_id {
            if verified {
                self.release_escrow_for_result(escrow_id, &result).await;
            } else {
                let reason = verification
                    .as_ref()
                    .err()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unverified result".to_string());
                if let Err(e) = self.escrow.refund(escrow_id, reason).await {
                    error!(%escrow_id, error = %e, "escrow refund failed after verification failure");
                }
            }
        }

        let reputation_event = match result.status {
            TaskStatus::Timeout => ReputationEvent::TaskTimeout,
            _ if verified => ReputationEvent::TaskSuccess,
            _ => ReputationEvent::TaskFailure,
        };
        if let Err(e) = self.registry.apply_event(result.node_id, reputation_event) {
            warn!(node_id = %result.node_id, error = %e, "reputation update failed after task completion");
        }

        self.stats.record(
            result.node_id,
            matches!(reputation_event, ReputationEvent::TaskSuccess),
            result.execution_time_seconds,
        );

        if verified {
            self.events.publish(DuxEvent::TaskCompleted {
                task_id: task.task_id,
                node_id: result.node_id,
                ts: now(),
            });
        } else {
            self.events.publish(DuxEvent::TaskFailed {
                task_id: task.task_id,
                node_id: Some(result.node_id),
                reason: result.error_message.clone().unwrap_or_else(|| "verification failed".to_string()),
                ts: now(),
            });
        }
    }

    async fn release_escrow_for_result(&self, escrow_id: duxnet_core::EscrowId, result: &TaskResult) {
        let timestamp = now().timestamp();
        let payload = EscrowReleasePayload::new(escrow_id, result.result_hash.clone(), timestamp);
        let signature = match self.auth.sign_as(result.node_id, &payload, timestamp) {
            Ok(sig) => sig,
            Err(e) => {
                error!(%escrow_id, error = %e, "failed to sign release payload on provider's behalf");
                return;
            }
        };
        if let Err(e) = self
            .escrow
            .release(escrow_id, result.result_hash.clone(), signature, timestamp, timestamp)
            .await
        {
            match e {
                DuxError::State(_) => {
                    // Lost a race to a concurrent release/refund, or the
                    // escrow was resolved through a dispute in the meantime.
                    warn!(%escrow_id, "escrow release skipped: no longer active");
                }
                other => error!(%escrow_id, error = %other, "escrow release failed after verified task result"),
            }
        }
    }

    /// Runs the scheduler tick loop, the REST API, and (best-effort)
    /// the persistence connection until the process is signalled to
    /// stop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.connect_storage().await;

        let tick_interval = Duration::from_secs(self.config.scheduler.tick_s.max(1));
        let ticking_ctx = self.clone();
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                ticking_ctx.tick().await;
            }
        });

        let api_state = ApiState {
            registry: self.registry.clone(),
            escrow: self.escrow.clone(),
            disputes: self.disputes.clone(),
            governance: self.governance.clone(),
            scheduler: self.scheduler.clone(),
            sandbox: self.sandbox.clone(),
        };
        let listen_addr = self.config.api.listen_addr.clone();
        let api_task = tokio::spawn(async move { start_servers(&listen_addr, api_state).await });

        tokio::select! {
            res = tick_task => res.context("scheduler tick loop panicked")?,
            res = api_task => res.context("API server task panicked")??,
        }
        Ok(())
    }
}

fn build_chain_adapter(config: &DuxNetConfig) -> Result<Arc<dyn ChainAdapter>> {
    let currencies = config.rpc_currencies().context("invalid [rpc] configuration")?;
    let endpoints = currencies
        .into_iter()
        .map(|(currency, cfg)| {
            let dialect = match currency {
                Currency::Btc | Currency::Doge => RpcDialect::BitcoinStyle,
                Currency::Eth | Currency::Bnb => RpcDialect::EthereumStyle,
                _ => RpcDialect::Generic,
            };
            let min_confirmations = match dialect {
                RpcDialect::BitcoinStyle => 6,
                RpcDialect::EthereumStyle => 12,
                RpcDialect::Generic => 1,
            };
            (
                EndpointConfig {
                    currency,
                    rpc_endpoint: format!("http://{}:{}", cfg.host, cfg.port),
                    rpc_user: cfg.user.clone(),
                    rpc_password: cfg.password.clone(),
                    min_confirmations,
                    request_timeout: Duration::from_secs(30),
                },
                dialect,
            )
        })
        .collect();
    Ok(Arc::new(RpcChainAdapter::new(endpoints)))
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub async fn run_node(config_path: impl AsRef<Path>) -> Result<()> {
    init_logging();
    let config = DuxNetConfig::load(config_path.as_ref()).context("loading configuration")?;
    info!(path = %config_path.as_ref().display(), "starting duxnet node");
    let ctx = NodeContext::build(config)?;
    ctx.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use duxnet_core::DuxResult;

    fn test_config() -> DuxNetConfig {
        let mut cfg = DuxNetConfig::example();
        cfg.api.listen_addr = "127.0.0.1:0".into();
        cfg
    }

    #[test]
    fn node_capability_falls_back_to_defaults_when_metadata_is_sparse() -> DuxResult<()> {
        let ctx = NodeContext::build(test_config()).expect("builds");
        let node = ctx
            .registry
            .register("127.0.0.1:9000".into(), Default::default(), serde_json::json!({}))?;
        let cap = ctx.node_capability(&ctx.registry.get(node.node_id).unwrap());
        assert_eq!(cap.cpu_cores, 1);
        assert_eq!(cap.memory_mb, 512);
        assert!(!cap.gpu);
        Ok(())
    }

    #[test]
    fn node_capability_reads_declared_resources() -> DuxResult<()> {
        let ctx = NodeContext::build(test_config()).expect("builds");
        let node = ctx.registry.register(
            "127.0.0.1:9001".into(),
            ["img_v1".to_string()].into_iter().collect(),
            serde_json::json!({"cpu_cores": 8, "memory_mb": 4096, "gpu": true}),
        )?;
        let cap = ctx.node_capability(&ctx.registry.get(node.node_id).unwrap());
        assert_eq!(cap.cpu_cores, 8);
        assert_eq!(cap.memory_mb, 4096);
        assert!(cap.gpu);
        assert!(cap.supported_services.contains_key("img_v1"));
        Ok(())
    }

    #[test]
    fn stats_start_at_neutral_success_rate() {
        let stats = NodeStats::default();
        let entry = stats.of(uuid::Uuid::new_v4());
        assert_eq!(entry.success_rate(), 0.5);
        assert_eq!(entry.avg_execution_time(), 0.0);
    }

    #[test]
    fn stats_accumulate_success_and_failure() {
        let stats = NodeStats::default();
        let node_id = uuid::Uuid::new_v4();
        stats.record(node_id, true, 1.0);
        stats.record(node_id, false, 3.0);
        let entry = stats.of(node_id);
        assert_eq!(entry.success_rate(), 0.5);
        assert_eq!(entry.avg_execution_time(), 2.0);
    }
}
