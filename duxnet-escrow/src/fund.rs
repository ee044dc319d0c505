//! C8 — Community Fund.
//!
//! Depends only on the chain adapter and the registry's read API; per
//! §9 it never calls into escrow. Escrow reaches the fund through the
//! single `collect_tax` port.

use crate::{AuditLog, EscrowTxType};
use duxnet_chain::ChainAdapter;
use duxnet_core::{now, Currency, DuxError, DuxEvent, DuxResult, EscrowId, EventBus, Money, Timestamp};
use duxnet_registry::NodeRegistry;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct FundConfig {
    pub airdrop_threshold: Money,
    pub airdrop_interval_hours: i64,
    pub min_airdrop_amount: Money,
    pub max_airdrop_nodes: usize,
    pub currency: Currency,
}

#[derive(Debug, Clone)]
pub struct AirdropReport {
    pub total_amount: Money,
    pub wallet_count: usize,
    pub per_wallet: Money,
}

struct FundState {
    balance: Money,
    last_airdrop_at: Option<Timestamp>,
    last_airdrop_amount: Money,
    airdrop_in_progress: bool,
}

/// A single-writer actor over the fund balance (§5: "airdrop execution
/// is exclusive — only one airdrop round at a time across the entire
/// system"), enforced with one `Mutex` rather than an `RwLock` since
/// every operation here mutates.
pub struct CommunityFund {
    state: Mutex<FundState>,
    config: FundConfig,
    registry: Arc<NodeRegistry>,
    chain: Arc<dyn ChainAdapter>,
    audit: Arc<AuditLog>,
    events: Arc<dyn EventBus>,
}

impl CommunityFund {
    pub fn new(
        config: FundConfig,
        registry: Arc<NodeRegistry>,
        chain: Arc<dyn ChainAdapter>,
        audit: Arc<AuditLog>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            state: Mutex::new(FundState {
                balance: 0,
                last_airdrop_at: None,
                last_airdrop_amount: 0,
                airdrop_in_progress: false,
            }),
            config,
            registry,
            chain,
            audit,
            events,
        }
    }

    pub fn balance(&self) -> Money {
        self.state.lock().balance
    }

    pub fn last_airdrop_amount(&self) -> Money {
        self.state.lock().last_airdrop_amount
    }

    /// Credits `amount` from escrow's community leg, then evaluates
    /// airdrop eligibility. Returns the airdrop report if one ran.
    pub async fn collect_tax(&self, escrow_id: EscrowId, amount: Money) -> DuxResult<Option<AirdropReport>> {
        {
            let mut state = self.state.lock();
            state.balance += amount;
        }
        self.audit.record(
            escrow_id,
            EscrowTxType::CommunityFund,
            amount,
            self.config.currency,
            None,
            None,
            None,
            serde_json::json!({}),
        );
        info!(escrow_id = %escrow_id, amount, "community fund credited");

        if self.eligible_for_airdrop() {
            return Ok(self.run_airdrop().await?);
        }
        Ok(None)
    }

    fn eligible_for_airdrop(&self) -> bool {
        let state = self.state.lock();
        if state.airdrop_in_progress || state.balance < self.config.airdrop_threshold {
            return false;
        }
        match state.last_airdrop_at {
            None => true,
            Some(last) => {
                let elapsed = now().signed_duration_since(last);
                elapsed.num_hours() >= self.config.airdrop_interval_hours
            }
        }
    }

    /// Runs an airdrop round unconditionally, guarded only by the
    /// single-flight `airdrop_in_progress` flag — called automatically
    /// by `collect_tax` once eligible, and directly by governance to
    /// execute a manual-airdrop proposal outside the threshold/interval
    /// schedule.
    pub async fn run_airdrop(&self) -> DuxResult<Option<AirdropReport>> {
        {
            let mut state = self.state.lock();
            if state.airdrop_in_progress {
                return Ok(None);
            }
            state.airdrop_in_progress = true;
        }

        let result = self.run_airdrop_locked().await;

        self.state.lock().airdrop_in_progress = false;
        result
    }

    async fn run_airdrop_locked(&self) -> DuxResult<Option<AirdropReport>> {
        let balance = self.state.lock().balance;

        let mut nodes = self.registry.list_all();
        nodes.retain(|n| matches!(n.status, duxnet_registry::NodeStatus::Online | duxnet_registry::NodeStatus::Busy));
        nodes.sort_by_key(|n| (Reverse((n.reputation * 1000.0) as i64), n.node_id));
        nodes.truncate(self.config.max_airdrop_nodes);

        if nodes.is_empty() {
            return Ok(None);
        }

        let per_node = balance / nodes.len() as Money;
        if per_node < self.config.min_airdrop_amount {
            return Ok(None);
        }

        let mut transferred = 0u64;
        for node in &nodes {
            match self
                .chain
                .send(self.config.currency, &node.node_id.to_string(), per_node)
                .await
            {
                Ok(_) => transferred += per_node,
                Err(e) => warn!(node_id = %node.node_id, error = %e, "airdrop transfer failed"),
            }
        }

        let mut state = self.state.lock();
        state.balance -= transferred;
        state.last_airdrop_at = Some(now());
        state.last_airdrop_amount = transferred;
        drop(state);

        info!(total_amount = transferred, wallet_count = nodes.len(), per_node, "airdrop executed");
        self.events.publish(DuxEvent::FundAirdrop {
            total_amount: transferred,
            wallet_count: nodes.len(),
            per_wallet: per_node,
            ts: now(),
        });
        Ok(Some(AirdropReport {
            total_amount: transferred,
            wallet_count: nodes.len(),
            per_wallet: per_node,
        }))
    }

    /// Governance-driven manual withdrawal (executed by a passed
    /// `community_fund` proposal). Debits the fund only once the
    /// chain transfer to `destination` has gone through.
    pub async fn withdraw(&self, amount: Money, destination: &str) -> DuxResult<()> {
        {
            let state = self.state.lock();
            if amount > state.balance {
                return Err(DuxError::resource("withdrawal exceeds fund balance"));
            }
        }
        self.chain
            .send(self.config.currency, destination, amount)
            .await
            .map_err(|e| DuxError::external(format!("withdrawal transfer failed: {e}")))?;
        self.state.lock().balance -= amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duxnet_chain::{Balance, ChainError, TxReceipt, TxStatusReport};
    use duxnet_registry::NodeStatus;

    struct FakeChain;

    #[async_trait]
    impl ChainAdapter for FakeChain {
        async fn get_balance(&self, _currency: Currency) -> Result<Balance, ChainError> {
            unimplemented!()
        }
        async fn new_address(&self, _currency: Currency, _label: Option<&str>) -> Result<String, ChainError> {
            unimplemented!()
        }
        async fn send(&self, _currency: Currency, _to: &str, _amount: u64) -> Result<TxReceipt, ChainError> {
            Ok(TxReceipt { txid: "tx".into() })
        }
        async fn status(&self, _currency: Currency, _txid: &str) -> Result<TxStatusReport, ChainError> {
            unimplemented!()
        }
    }

    fn config() -> FundConfig {
        FundConfig {
            airdrop_threshold: 100,
            airdrop_interval_hours: 0,
            min_airdrop_amount: 1,
            max_airdrop_nodes: 10,
            currency: Currency::Flop,
        }
    }

    #[tokio::test]
    async fn airdrop_triggers_once_threshold_crossed() {
        let registry = Arc::new(NodeRegistry::new());
        for _ in 0..3 {
            let node = registry.register("addr".into(), Default::default(), serde_json::json!({})).unwrap();
            registry.set_status(node.node_id, NodeStatus::Online).unwrap();
        }
        let fund = CommunityFund::new(config(), registry, Arc::new(FakeChain), Arc::new(AuditLog::new()), Arc::new(duxnet_core::NullEventBus));

        assert!(fund.collect_tax(uuid::Uuid::new_v4(), 60).await.unwrap().is_none());
        let report = fund.collect_tax(uuid::Uuid::new_v4(), 45).await.unwrap().unwrap();
        assert_eq!(report.total_amount, 105);
        assert_eq!(report.per_wallet, 35);
        assert_eq!(fund.balance(), 0);
    }

    #[tokio::test]
    async fn airdrop_skipped_when_per_node_below_minimum() {
        let registry = Arc::new(NodeRegistry::new());
        for _ in 0..100 {
            let node = registry.register("addr".into(), Default::default(), serde_json::json!({})).unwrap();
            registry.set_status(node.node_id, NodeStatus::Online).unwrap();
        }
        let mut cfg = config();
        cfg.min_airdrop_amount = 1000;
        cfg.max_airdrop_nodes = 100;
        let fund = CommunityFund::new(cfg, registry, Arc::new(FakeChain), Arc::new(AuditLog::new()), Arc::new(duxnet_core::NullEventBus));
        assert!(fund.collect_tax(uuid::Uuid::new_v4(), 200).await.unwrap().is_none());
        assert_eq!(fund.balance(), 200);
    }
}
