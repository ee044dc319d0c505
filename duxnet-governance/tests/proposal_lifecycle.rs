//! Cross-module scenario: a `community_fund` proposal runs the full
//! create → activate → vote → finalize → execute lifecycle and
//! dispatches into `CommunityFund::withdraw` on execution — the path
//! that ties governance to the escrow crate's fund, not exercisable
//! from either crate's unit tests alone.

use std::sync::Arc;

use async_trait::async_trait;
use duxnet_chain::{Balance, ChainAdapter, ChainError, TxReceipt, TxStatusReport};
use duxnet_core::Currency;
use duxnet_escrow::fund::{CommunityFund, FundConfig};
use duxnet_escrow::AuditLog;
use duxnet_governance::{GovernanceEngine, ProposalCategory, ProposalStatus, VoteType};
use duxnet_registry::NodeRegistry;
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

#[tokio::test]
async fn passed_community_fund_proposal_withdraws_on_execute() {
    let registry = Arc::new(NodeRegistry::new());
    let chain: Arc<dyn ChainAdapter> = Arc::new(FakeChain);
    let audit = Arc::new(AuditLog::new());
    let events: Arc<dyn duxnet_core::EventBus> = Arc::new(duxnet_core::NullEventBus);
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
        events,
    ));
    fund.collect_tax(Uuid::new_v4(), 500).await.unwrap();

    // voting_period_days = 0 ends voting immediately, so finalize
    // doesn't need to wait on real wall-clock time in a test.
    let gov = GovernanceEngine::new(fund.clone(), 0, 30);

    let proposer = Uuid::new_v4();
    let proposal = gov
        .create_proposal(
            "Withdraw community reserve".into(),
            "Fund a security audit of the escrow contracts".into(),
            ProposalCategory::CommunityFund,
            proposer,
            10.0,
            0,
            Some(200),
            Some("treasury".into()),
            serde_json::json!({"action": "withdraw", "withdraw_amount": 200, "destination": "treasury-addr"}),
        )
        .unwrap();

    gov.activate(proposal.proposal_id).unwrap();
    gov.cast_vote(proposal.proposal_id, Uuid::new_v4(), VoteType::Yes, 20.0, None).unwrap();
    gov.cast_vote(proposal.proposal_id, Uuid::new_v4(), VoteType::No, 5.0, None).unwrap();

    let finalized = gov.finalize(proposal.proposal_id).unwrap();
    assert_eq!(finalized.status, ProposalStatus::Passed);

    let executed = gov.execute(proposal.proposal_id, proposer).await.unwrap();
    assert_eq!(executed.status, ProposalStatus::Executed);
    assert_eq!(fund.balance(), 300);
}

#[tokio::test]
async fn rejected_proposal_cannot_execute() {
    let registry = Arc::new(NodeRegistry::new());
    let chain: Arc<dyn ChainAdapter> = Arc::new(FakeChain);
    let audit = Arc::new(AuditLog::new());
    let events: Arc<dyn duxnet_core::EventBus> = Arc::new(duxnet_core::NullEventBus);
    let fund = Arc::new(CommunityFund::new(
        FundConfig {
            airdrop_threshold: u64::MAX,
            airdrop_interval_hours: 9999,
            min_airdrop_amount: 1,
            max_airdrop_nodes: 1,
            currency: Currency::Flop,
        },
        registry,
        chain,
        audit,
        events,
    ));
    let gov = GovernanceEngine::new(fund, 0, 30);

    let proposer = Uuid::new_v4();
    let proposal = gov
        .create_proposal(
            "Lower the escrow quorum".into(),
            "Reduce the quorum requirement for future votes".into(),
            ProposalCategory::Other,
            proposer,
            10.0,
            0,
            None,
            None,
            serde_json::json!({}),
        )
        .unwrap();
    gov.activate(proposal.proposal_id).unwrap();
    gov.cast_vote(proposal.proposal_id, Uuid::new_v4(), VoteType::No, 50.0, None).unwrap();
    let finalized = gov.finalize(proposal.proposal_id).unwrap();
    assert_eq!(finalized.status, ProposalStatus::Rejected);

    let err = gov.execute(proposal.proposal_id, proposer).await.unwrap_err();
    assert!(matches!(err, duxnet_core::DuxError::State(_)));
}
