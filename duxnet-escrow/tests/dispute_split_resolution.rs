//! Cross-module scenario: a dispute resolved with a split verdict
//! drives the escrow through `EscrowEngine::split_resolve`, touching
//! the wallet-lock ledger, the escrow state machine, and the dispute
//! resolver together — the kind of flow a single crate's unit tests
//! can't exercise in isolation.

use std::sync::Arc;

use async_trait::async_trait;
use duxnet_chain::{Balance, ChainAdapter, ChainError, TxReceipt, TxStatusReport};
use duxnet_core::{Currency, DuxEvent, EventBus, NullEventBus};
use duxnet_escrow::dispute::Winner;
use duxnet_escrow::fund::{CommunityFund, FundConfig};
use duxnet_escrow::{
    AuditLog, DisputeResolver, DisputeStatus, EscrowEngine, EscrowStatus, WalletLockLedger,
    DEFAULT_PROVIDER_SHARE_BPS,
};
use duxnet_registry::NodeRegistry;
use parking_lot::Mutex;
use uuid::Uuid;

struct FakeChain;

#[async_trait]
impl ChainAdapter for FakeChain {
    async fn get_balance(&self, _currency: Currency) -> Result<Balance, ChainError> {
        Ok(Balance { confirmed: 1_000_000, unconfirmed: 0 })
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

/// Records every published event so the test can assert both the
/// dispute-opened and dispute-resolved topics fired exactly once.
#[derive(Default)]
struct RecordingBus {
    topics: Mutex<Vec<&'static str>>,
}

impl EventBus for RecordingBus {
    fn publish(&self, event: DuxEvent) {
        self.topics.lock().push(event.topic());
    }
}

#[tokio::test]
async fn split_verdict_partially_refunds_and_resolves_dispute() {
    let chain: Arc<dyn ChainAdapter> = Arc::new(FakeChain);
    let audit = Arc::new(AuditLog::new());
    let bus = Arc::new(RecordingBus::default());
    let events: Arc<dyn EventBus> = bus.clone();
    let ledger = Arc::new(WalletLockLedger::new(chain.clone(), audit.clone()));
    let registry = Arc::new(NodeRegistry::new());
    let fund = Arc::new(CommunityFund::new(
        FundConfig {
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
    let auth = Arc::new(duxnet_auth::Authenticator::new());
    let engine = Arc::new(EscrowEngine::new(
        ledger.clone(),
        chain,
        fund,
        auth,
        audit,
        events.clone(),
        DEFAULT_PROVIDER_SHARE_BPS,
    ));

    let provider_node = Uuid::new_v4();
    let payer = ledger.register_wallet(Uuid::new_v4(), "payer".into(), "p-addr".into(), Currency::Flop);
    let provider = ledger.register_wallet(provider_node, "provider".into(), "pr-addr".into(), Currency::Flop);

    let escrow = engine
        .create(payer.wallet_id, provider.wallet_id, provider_node, 100, Currency::Flop, "svc".into(), None)
        .await
        .unwrap();

    let resolver = DisputeResolver::new(engine.clone(), events);
    let dispute = resolver.create_dispute(escrow.escrow_id, payer.wallet_id, "partial failure".into(), None).unwrap();

    let resolved = resolver
        .resolve_dispute(dispute.dispute_id, "split 40/60".into(), Winner::Split { refund_amount: 40 }, None)
        .await
        .unwrap();

    assert_eq!(resolved.status, DisputeStatus::Resolved);
    assert_eq!(engine.get(escrow.escrow_id).unwrap().status, EscrowStatus::Resolved);

    let topics = bus.topics.lock();
    assert!(topics.contains(&"dispute.opened"));
    assert!(topics.contains(&"dispute.resolved"));
}
