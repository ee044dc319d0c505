//! C6 — Escrow State Machine.
//!
//! States: `pending -> active -> {released | refunded | disputed}`;
//! `disputed -> {resolved | refunded | released}`. Per escrow_id, all
//! transitions are totally ordered by a per-escrow `tokio::sync::Mutex`
//! (§5), so a concurrent release/refund race sees a non-`active`
//! status on the loser and fails with `State`.

use crate::fund::CommunityFund;
use crate::wallet_lock::WalletLockLedger;
use crate::{AuditLog, EscrowTxType};
use duxnet_auth::{Authenticator, EscrowReleasePayload};
use duxnet_chain::ChainAdapter;
use duxnet_core::{
    is_valid_result_hash, now, split_amount, Currency, DuxError, DuxEvent, DuxResult, EscrowId,
    EventBus, Money, NodeId, Timestamp, WalletId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;
use uuid::Uuid;

/// Fallback provider/community split when an `EscrowEngine` is built
/// without an explicit basis-point override (matches spec.md's default
/// `escrow.{provider_share=0.95, community_share=0.05}`).
pub const DEFAULT_PROVIDER_SHARE_BPS: u32 = 9_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    Pending,
    Active,
    Released,
    Refunded,
    Disputed,
    Resolved,
}

impl EscrowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Resolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub escrow_id: EscrowId,
    pub payer_wallet_id: WalletId,
    pub provider_wallet_id: WalletId,
    pub provider_node_id: NodeId,
    pub amount: Money,
    pub currency: Currency,
    pub status: EscrowStatus,
    pub service_name: String,
    pub task_id: Option<Uuid>,
    pub api_call_id: Option<Uuid>,
    pub provider_amount: Money,
    pub community_amount: Money,
    pub result_hash: Option<String>,
    pub provider_signature: Option<String>,
    pub dispute_id: Option<Uuid>,
    pub created_at: Timestamp,
    pub released_at: Option<Timestamp>,
    pub refunded_at: Option<Timestamp>,
    pub metadata: serde_json::Value,
}

struct EscrowEntry {
    escrow: RwLock<Escrow>,
    lock: AsyncMutex<()>,
}

/// Owns every `Escrow`, `EscrowTransaction`, and `Dispute` row (per the
/// ownership summary in §3). Reaches C1 through the ledger/chain
/// adapter, C2 through the authenticator, and C8 through the fund's
/// narrow `collect_tax` port — never any wider surface.
pub struct EscrowEngine {
    escrows: RwLock<HashMap<EscrowId, Arc<EscrowEntry>>>,
    ledger: Arc<WalletLockLedger>,
    chain: Arc<dyn ChainAdapter>,
    fund: Arc<CommunityFund>,
    auth: Arc<Authenticator>,
    audit: Arc<AuditLog>,
    events: Arc<dyn EventBus>,
    provider_share_bps: u32,
}

impl EscrowEngine {
    pub fn new(
        ledger: Arc<WalletLockLedger>,
        chain: Arc<dyn ChainAdapter>,
        fund: Arc<CommunityFund>,
        auth: Arc<Authenticator>,
        audit: Arc<AuditLog>,
        events: Arc<dyn EventBus>,
        provider_share_bps: u32,
    ) -> Self {
        Self {
            escrows: RwLock::new(HashMap::new()),
            ledger,
            chain,
            fund,
            auth,
            audit,
            events,
            provider_share_bps,
        }
    }

    fn entry(&self, escrow_id: EscrowId) -> DuxResult<Arc<EscrowEntry>> {
        self.escrows
            .read()
            .get(&escrow_id)
            .cloned()
            .ok_or_else(|| DuxError::validation("unknown escrow_id"))
    }

    pub fn get(&self, escrow_id: EscrowId) -> DuxResult<Escrow> {
        Ok(self.entry(escrow_id)?.escrow.read().clone())
    }

    /// Creates an escrow: validates, computes the exact 95/5 split,
    /// locks the payer's funds via C5, and only then persists the row.
    /// A failed lock leaves no row behind (§4.3).
    pub async fn create(
        &self,
        payer_wallet_id: WalletId,
        provider_wallet_id: WalletId,
        provider_node_id: NodeId,
        amount: Money,
        currency: Currency,
        service_name: String,
        task_id: Option<Uuid>,
    ) -> DuxResult<Escrow> {
        if amount == 0 {
            return Err(DuxError::validation("amount must be > 0"));
        }
        if payer_wallet_id == provider_wallet_id {
            return Err(DuxError::validation("payer and provider must differ"));
        }

        let escrow_id = Uuid::new_v4();
        self.ledger.lock(escrow_id, payer_wallet_id, amount).await?;

        let (provider_amount, community_amount) = split_amount(amount, self.provider_share_bps);
        let escrow = Escrow {
            escrow_id,
            payer_wallet_id,
            provider_wallet_id,
            provider_node_id,
            amount,
            currency,
            status: EscrowStatus::Active,
            service_name: service_name.clone(),
            task_id,
            api_call_id: None,
            provider_amount,
            community_amount,
            result_hash: None,
            provider_signature: None,
            dispute_id: None,
            created_at: now(),
            released_at: None,
            refunded_at: None,
            metadata: serde_json::json!({}),
        };

        self.escrows.write().insert(
            escrow_id,
            Arc::new(EscrowEntry {
                escrow: RwLock::new(escrow.clone()),
                lock: AsyncMutex::new(()),
            }),
        );

        self.audit.record(
            escrow_id,
            EscrowTxType::Create,
            amount,
            currency,
            Some(payer_wallet_id),
            Some(provider_wallet_id),
            None,
            serde_json::json!({"service_name": service_name}),
        );
        info!(%escrow_id, amount, %currency, "escrow created");
        self.events.publish(DuxEvent::EscrowCreated {
            escrow_id,
            amount,
            currency,
            service_name,
            ts: now(),
        });
        Ok(escrow)
    }

    fn mutate<F>(&self, escrow_id: EscrowId, f: F) -> DuxResult<Escrow>
    where
        F: FnOnce(&mut Escrow) -> DuxResult<()>,
    {
        let entry = self.entry(escrow_id)?;
        let mut escrow = entry.escrow.write();
        f(&mut escrow)?;
        Ok(escrow.clone())
    }

    /// Releases the escrow given a verified `result_hash` and the
    /// provider's HMAC signature over the canonical release payload.
    /// Idempotent: a duplicate release with the same `result_hash`
    /// returns success without re-transferring (§4.3).
    pub async fn release(
        &self,
        escrow_id: EscrowId,
        result_hash: String,
        provider_signature: String,
        timestamp: i64,
        now_ts: i64,
    ) -> DuxResult<Escrow> {
        let entry = self.entry(escrow_id)?;
        let _guard = entry.lock.lock().await;

        let current = self.get(escrow_id)?;
        if current.status == EscrowStatus::Released {
            if current.result_hash.as_deref() == Some(result_hash.as_str()) {
                return Ok(current);
            }
            return Err(DuxError::state("escrow already released with a different result"));
        }
        if current.status != EscrowStatus::Active {
            return Err(DuxError::state("escrow is not active"));
        }
        if !is_valid_result_hash(&result_hash) {
            return Err(DuxError::validation("malformed result_hash"));
        }

        let payload = EscrowReleasePayload::new(escrow_id, result_hash.clone(), timestamp);
        self.auth
            .verify(current.provider_node_id, &payload, timestamp, &provider_signature, now_ts)?;

        self.chain
            .send(
                current.currency,
                &self.ledger.get_wallet(current.provider_wallet_id)?.address,
                current.provider_amount,
            )
            .await
            .map_err(|e| DuxError::external(e.to_string()))?;
        self.audit.record(
            escrow_id,
            EscrowTxType::ReleaseProvider,
            current.provider_amount,
            current.currency,
            Some(current.payer_wallet_id),
            Some(current.provider_wallet_id),
            None,
            serde_json::json!({}),
        );

        self.fund.collect_tax(escrow_id, current.community_amount).await?;
        self.audit.record(
            escrow_id,
            EscrowTxType::ReleaseCommunity,
            current.community_amount,
            current.currency,
            Some(current.payer_wallet_id),
            None,
            None,
            serde_json::json!({}),
        );

        self.ledger.reduce_lock(escrow_id, current.amount)?;

        let released = self.mutate(escrow_id, |e| {
            e.status = EscrowStatus::Released;
            e.result_hash = Some(result_hash);
            e.provider_signature = Some(provider_signature);
            e.released_at = Some(now());
            Ok(())
        })?;
        self.events.publish(DuxEvent::EscrowReleased {
            escrow_id,
            provider_amount: current.provider_amount,
            community_amount: current.community_amount,
            currency: current.currency,
            ts: now(),
        });
        Ok(released)
    }

    /// Refunds the full amount to the payer. Valid from `active` or
    /// `disputed`.
    pub async fn refund(&self, escrow_id: EscrowId, reason: String) -> DuxResult<Escrow> {
        let entry = self.entry(escrow_id)?;
        let _guard = entry.lock.lock().await;

        let current = self.get(escrow_id)?;
        if !matches!(current.status, EscrowStatus::Active | EscrowStatus::Disputed) {
            return Err(DuxError::state("escrow cannot be refunded from its current state"));
        }

        self.chain
            .send(
                current.currency,
                &self.ledger.get_wallet(current.payer_wallet_id)?.address,
                current.amount,
            )
            .await
            .map_err(|e| DuxError::external(e.to_string()))?;
        self.ledger.unlock(escrow_id)?;
        self.audit.record(
            escrow_id,
            EscrowTxType::Refund,
            current.amount,
            current.currency,
            Some(current.payer_wallet_id),
            None,
            None,
            serde_json::json!({"reason": reason.clone()}),
        );

        let refunded = self.mutate(escrow_id, |e| {
            e.status = EscrowStatus::Refunded;
            e.refunded_at = Some(now());
            Ok(())
        })?;
        self.events.publish(DuxEvent::EscrowRefunded {
            escrow_id,
            amount: current.amount,
            currency: current.currency,
            reason,
            ts: now(),
        });
        Ok(refunded)
    }

    /// Transitions `active -> disputed`; called by the dispute resolver.
    pub(crate) fn mark_disputed(&self, escrow_id: EscrowId, dispute_id: Uuid) -> DuxResult<Escrow> {
        self.mutate(escrow_id, |e| {
            if !matches!(e.status, EscrowStatus::Active | EscrowStatus::Released) {
                return Err(DuxError::state("escrow cannot enter dispute from its current state"));
            }
            e.status = EscrowStatus::Disputed;
            e.dispute_id = Some(dispute_id);
            Ok(())
        })
    }

    pub(crate) fn mark_active(&self, escrow_id: EscrowId) -> DuxResult<Escrow> {
        self.mutate(escrow_id, |e| {
            e.status = EscrowStatus::Active;
            e.dispute_id = None;
            Ok(())
        })
    }

    /// Splits a disputed escrow's funds between payer and provider per
    /// a fixed refund amount (the remainder, minus the community
    /// share, goes to the provider), then marks the escrow resolved.
    pub async fn split_resolve(&self, escrow_id: EscrowId, refund_amount: Money) -> DuxResult<Escrow> {
        let entry = self.entry(escrow_id)?;
        let _guard = entry.lock.lock().await;
        let current = self.get(escrow_id)?;
        if current.status != EscrowStatus::Disputed {
            return Err(DuxError::state("escrow is not under dispute"));
        }
        if refund_amount > current.amount {
            return Err(DuxError::validation("refund_amount exceeds escrow amount"));
        }

        let provider_leg = current.amount - refund_amount;
        let (provider_amount, community_amount) = split_amount(provider_leg, self.provider_share_bps);

        if refund_amount > 0 {
            self.chain
                .send(
                    current.currency,
                    &self.ledger.get_wallet(current.payer_wallet_id)?.address,
                    refund_amount,
                )
                .await
                .map_err(|e| DuxError::external(e.to_string()))?;
            self.audit.record(
                escrow_id,
                EscrowTxType::Refund,
                refund_amount,
                current.currency,
                Some(current.payer_wallet_id),
                None,
                None,
                serde_json::json!({"dispute_split": true}),
            );
        }
        if provider_amount > 0 {
            self.chain
                .send(
                    current.currency,
                    &self.ledger.get_wallet(current.provider_wallet_id)?.address,
                    provider_amount,
                )
                .await
                .map_err(|e| DuxError::external(e.to_string()))?;
            self.audit.record(
                escrow_id,
                EscrowTxType::ReleaseProvider,
                provider_amount,
                current.currency,
                Some(current.payer_wallet_id),
                Some(current.provider_wallet_id),
                None,
                serde_json::json!({"dispute_split": true}),
            );
        }
        if community_amount > 0 {
            self.fund.collect_tax(escrow_id, community_amount).await?;
        }

        self.ledger.unlock(escrow_id)?;

        self.mutate(escrow_id, |e| {
            e.status = EscrowStatus::Resolved;
            e.dispute_id = None;
            Ok(())
        })
    }

    pub async fn release_to_resolved(
        &self,
        escrow_id: EscrowId,
        result_hash: String,
        provider_signature: String,
        timestamp: i64,
        now_ts: i64,
    ) -> DuxResult<Escrow> {
        let released = self.release(escrow_id, result_hash, provider_signature, timestamp, now_ts).await?;
        self.mutate(escrow_id, |e| {
            e.status = EscrowStatus::Resolved;
            e.dispute_id = None;
            Ok(())
        })?;
        Ok(released)
    }

    pub async fn refund_to_resolved(&self, escrow_id: EscrowId, reason: String) -> DuxResult<Escrow> {
        self.refund(escrow_id, reason).await?;
        self.mutate(escrow_id, |e| {
            e.status = EscrowStatus::Resolved;
            e.dispute_id = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duxnet_chain::{Balance, ChainError, TxReceipt, TxStatusReport};
    use duxnet_registry::NodeRegistry;

    struct FakeChain;

    #[async_trait]
    impl ChainAdapter for FakeChain {
        async fn get_balance(&self, _currency: Currency) -> Result<Balance, ChainError> {
            Ok(Balance {
                confirmed: 1_000_000,
                unconfirmed: 0,
            })
        }
        async fn new_address(&self, _currency: Currency, _label: Option<&str>) -> Result<String, ChainError> {
            Ok("addr".into())
        }
        async fn send(&self, _currency: Currency, _to: &str, _amount: u64) -> Result<TxReceipt, ChainError> {
            Ok(TxReceipt { txid: "tx".into() })
        }
        async fn status(&self, _currency: Currency, _txid: &str) -> Result<TxStatusReport, ChainError> {
            unimplemented!()
        }
    }

    fn harness() -> (EscrowEngine, Arc<WalletLockLedger>, Arc<Authenticator>) {
        let chain: Arc<dyn ChainAdapter> = Arc::new(FakeChain);
        let audit = Arc::new(AuditLog::new());
        let events: Arc<dyn duxnet_core::EventBus> = Arc::new(duxnet_core::NullEventBus);
        let ledger = Arc::new(WalletLockLedger::new(chain.clone(), audit.clone()));
        let registry = Arc::new(NodeRegistry::new());
        let fund = Arc::new(CommunityFund::new(
            crate::fund::FundConfig {
                airdrop_threshold: u64::MAX,
                airdrop_interval_hours: 9999,
                min_airdrop_amount: 1,
                max_airdrop_nodes: 1,
                currency: Currency::Flop,
            },
            registry,
            chain.clone(),
            audit.clone(),
            events.clone(),
        ));
        let auth = Arc::new(Authenticator::new());
        let engine = EscrowEngine::new(ledger.clone(), chain, fund, auth.clone(), audit, events, DEFAULT_PROVIDER_SHARE_BPS);
        (engine, ledger, auth)
    }

    #[tokio::test]
    async fn happy_path_release_splits_ninety_five_five() {
        let (engine, ledger, auth) = harness();
        let payer = ledger.register_wallet(Uuid::new_v4(), "payer".into(), "p-addr".into(), Currency::Flop);
        let provider_node = Uuid::new_v4();
        let provider = ledger.register_wallet(provider_node, "provider".into(), "pr-addr".into(), Currency::Flop);
        let secret = auth.issue(provider_node);

        let escrow = engine
            .create(payer.wallet_id, provider.wallet_id, provider_node, 100, Currency::Flop, "img_v1".into(), None)
            .await
            .unwrap();
        assert_eq!(escrow.provider_amount, 95);
        assert_eq!(escrow.community_amount, 5);

        let result_hash = "a".repeat(64);
        let payload = EscrowReleasePayload::new(escrow.escrow_id, result_hash.clone(), 1000);
        let sig = Authenticator::sign(&secret, &payload, 1000).unwrap();

        let released = engine.release(escrow.escrow_id, result_hash, sig, 1000, 1000).await.unwrap();
        assert_eq!(released.status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn refund_returns_full_amount() {
        let (engine, ledger, _auth) = harness();
        let payer = ledger.register_wallet(Uuid::new_v4(), "payer".into(), "p-addr".into(), Currency::Flop);
        let provider_node = Uuid::new_v4();
        let provider = ledger.register_wallet(provider_node, "provider".into(), "pr-addr".into(), Currency::Flop);

        let escrow = engine
            .create(payer.wallet_id, provider.wallet_id, provider_node, 20, Currency::Flop, "img_v1".into(), None)
            .await
            .unwrap();
        let refunded = engine.refund(escrow.escrow_id, "task failed".into()).await.unwrap();
        assert_eq!(refunded.status, EscrowStatus::Refunded);
    }

    #[tokio::test]
    async fn duplicate_release_with_same_hash_is_idempotent() {
        let (engine, ledger, auth) = harness();
        let payer = ledger.register_wallet(Uuid::new_v4(), "payer".into(), "p-addr".into(), Currency::Flop);
        let provider_node = Uuid::new_v4();
        let provider = ledger.register_wallet(provider_node, "provider".into(), "pr-addr".into(), Currency::Flop);
        let secret = auth.issue(provider_node);

        let escrow = engine
            .create(payer.wallet_id, provider.wallet_id, provider_node, 50, Currency::Flop, "img_v1".into(), None)
            .await
            .unwrap();
        let result_hash = "b".repeat(64);
        let payload = EscrowReleasePayload::new(escrow.escrow_id, result_hash.clone(), 1000);
        let sig = Authenticator::sign(&secret, &payload, 1000).unwrap();

        engine.release(escrow.escrow_id, result_hash.clone(), sig.clone(), 1000, 1000).await.unwrap();
        let second = engine.release(escrow.escrow_id, result_hash, sig, 1000, 1000).await.unwrap();
        assert_eq!(second.status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn payer_equals_provider_is_rejected() {
        let (engine, ledger, _auth) = harness();
        let wallet = ledger.register_wallet(Uuid::new_v4(), "w".into(), "addr".into(), Currency::Flop);
        let err = engine
            .create(wallet.wallet_id, wallet.wallet_id, Uuid::new_v4(), 10, Currency::Flop, "x".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DuxError::Validation(_)));
    }
}
