//! C9 — Governance.
//!
//! Proposals, weighted voting, finalization, and execution hooks into
//! the escrow engine's community fund (§4.5). Mirrors the single
//! `RwLock<State>` actor shape `duxnet-governance` inherited from the
//! teacher's consensus engine, swapping stake-weighted block proposal
//! for proposal/vote bookkeeping.

use duxnet_core::{now, DuxError, DuxResult, ProposalId, Timestamp, VoteId, WalletId};
use duxnet_escrow::CommunityFund;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProposalCategory {
    CommunityFund,
    EscrowParams,
    Governance,
    FeatureRequest,
    BugFix,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Draft,
    Active,
    Passed,
    Rejected,
    Expired,
    Executed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteType {
    Yes,
    No,
    Abstain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub title: String,
    pub description: String,
    pub category: ProposalCategory,
    pub status: ProposalStatus,
    pub proposer_wallet_id: WalletId,
    pub required_quorum: f64,
    pub voting_period_days: u32,
    pub estimated_cost: Option<u64>,
    pub funding_source: Option<String>,
    pub execution_data: serde_json::Value,
    pub created_at: Timestamp,
    pub voting_started: Option<Timestamp>,
    pub voting_ends: Option<Timestamp>,
    pub executed_at: Option<Timestamp>,
    pub executor_wallet_id: Option<WalletId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub vote_id: VoteId,
    pub proposal_id: ProposalId,
    pub voter_wallet_id: WalletId,
    pub vote_type: VoteType,
    pub voting_power: f64,
    pub reason: Option<String>,
    pub created_at: Timestamp,
}

struct GovernanceState {
    proposals: HashMap<ProposalId, Proposal>,
    votes: HashMap<ProposalId, HashMap<WalletId, Vote>>,
}

pub struct GovernanceEngine {
    state: RwLock<GovernanceState>,
    fund: Arc<CommunityFund>,
    min_voting_days: u32,
    max_voting_days: u32,
}

impl GovernanceEngine {
    pub fn new(fund: Arc<CommunityFund>, min_voting_days: u32, max_voting_days: u32) -> Self {
        Self {
            state: RwLock::new(GovernanceState {
                proposals: HashMap::new(),
                votes: HashMap::new(),
            }),
            fund,
            min_voting_days,
            max_voting_days,
        }
    }

    pub fn create_proposal(
        &self,
        title: String,
        description: String,
        category: ProposalCategory,
        proposer_wallet_id: WalletId,
        required_quorum: f64,
        voting_period_days: u32,
        estimated_cost: Option<u64>,
        funding_source: Option<String>,
        execution_data: serde_json::Value,
    ) -> DuxResult<Proposal> {
        if title.chars().count() < 5 {
            return Err(DuxError::validation("title must be at least 5 characters"));
        }
        if description.chars().count() < 20 {
            return Err(DuxError::validation("description must be at least 20 characters"));
        }
        if required_quorum <= 0.0 {
            return Err(DuxError::validation("required_quorum must be positive"));
        }
        if voting_period_days < self.min_voting_days || voting_period_days > self.max_voting_days {
            return Err(DuxError::validation(format!(
                "voting_period_days must be within [{}, {}]",
                self.min_voting_days, self.max_voting_days
            )));
        }

        let proposal = Proposal {
            proposal_id: Uuid::new_v4(),
            title,
            description,
            category,
            status: ProposalStatus::Draft,
            proposer_wallet_id,
            required_quorum,
            voting_period_days,
            estimated_cost,
            funding_source,
            execution_data,
            created_at: now(),
            voting_started: None,
            voting_ends: None,
            executed_at: None,
            executor_wallet_id: None,
        };

        let mut state = self.state.write();
        state.proposals.insert(proposal.proposal_id, proposal.clone());
        Ok(proposal)
    }

    pub fn activate(&self, proposal_id: ProposalId) -> DuxResult<Proposal> {
        let mut state = self.state.write();
        let proposal = state
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| DuxError::validation("unknown proposal_id"))?;
        if proposal.status != ProposalStatus::Draft {
            return Err(DuxError::state("proposal is not in draft"));
        }
        let started = now();
        proposal.status = ProposalStatus::Active;
        proposal.voting_started = Some(started);
        proposal.voting_ends = Some(started + chrono::Duration::days(proposal.voting_period_days as i64));
        Ok(proposal.clone())
    }

    /// Casts or replaces a vote for `(proposal_id, voter_wallet_id)`.
    pub fn cast_vote(
        &self,
        proposal_id: ProposalId,
        voter_wallet_id: WalletId,
        vote_type: VoteType,
        voting_power: f64,
        reason: Option<String>,
    ) -> DuxResult<Vote> {
        if voting_power <= 0.0 {
            return Err(DuxError::validation("voting_power must be positive"));
        }
        let mut state = self.state.write();
        let proposal = state
            .proposals
            .get(&proposal_id)
            .ok_or_else(|| DuxError::validation("unknown proposal_id"))?;
        if proposal.status != ProposalStatus::Active {
            return Err(DuxError::state("proposal is not open for voting"));
        }

        let vote = Vote {
            vote_id: Uuid::new_v4(),
            proposal_id,
            voter_wallet_id,
            vote_type,
            voting_power,
            reason,
            created_at: now(),
        };
        state.votes.entry(proposal_id).or_default().insert(voter_wallet_id, vote.clone());
        Ok(vote)
    }

    fn tally(votes: &HashMap<WalletId, Vote>) -> (f64, f64, f64) {
        let mut yes = 0.0;
        let mut no = 0.0;
        let mut abstain = 0.0;
        for vote in votes.values() {
            match vote.vote_type {
                VoteType::Yes => yes += vote.voting_power,
                VoteType::No => no += vote.voting_power,
                VoteType::Abstain => abstain += vote.voting_power,
            }
        }
        (yes, no, abstain)
    }

    /// Finalizes a proposal whose voting period has ended: `passed` iff
    /// `yes > no` and `total >= required_quorum`; `rejected` if voting
    /// happened but didn't pass; `expired` if nobody voted.
    pub fn finalize(&self, proposal_id: ProposalId) -> DuxResult<Proposal> {
        let mut state = self.state.write();
        let votes = state.votes.get(&proposal_id).cloned().unwrap_or_default();
        let proposal = state
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| DuxError::validation("unknown proposal_id"))?;
        if proposal.status != ProposalStatus::Active {
            return Err(DuxError::state("proposal is not active"));
        }
        let voting_ends = proposal.voting_ends.ok_or_else(|| DuxError::internal("active proposal missing voting_ends"))?;
        if now() < voting_ends {
            return Err(DuxError::state("voting period has not ended"));
        }

        let (yes, no, abstain) = Self::tally(&votes);
        let total = yes + no + abstain;

        proposal.status = if votes.is_empty() {
            ProposalStatus::Expired
        } else if yes > no && total >= proposal.required_quorum {
            ProposalStatus::Passed
        } else {
            ProposalStatus::Rejected
        };
        info!(%proposal_id, yes, no, abstain, status = ?proposal.status, "proposal finalized");
        Ok(proposal.clone())
    }

    /// Executes a `passed` proposal exactly once, dispatching to the
    /// fund for `community_fund` categories: `execution_data.action`
    /// of `"airdrop"` runs a manual airdrop round outside the normal
    /// threshold/interval schedule, `"withdraw"` (the default, for
    /// proposals predating the `action` field) sends `withdraw_amount`
    /// to `destination`. Other categories are recorded as executed
    /// without a further side effect here (escrow-parameter changes
    /// are applied by the operator via `duxnet-config` reload).
    pub async fn execute(&self, proposal_id: ProposalId, executor_wallet_id: WalletId) -> DuxResult<Proposal> {
        let snapshot = {
            let state = self.state.read();
            let proposal = state
                .proposals
                .get(&proposal_id)
                .ok_or_else(|| DuxError::validation("unknown proposal_id"))?;
            if proposal.status != ProposalStatus::Passed {
                return Err(DuxError::state("only passed proposals can execute"));
            }
            proposal.clone()
        };

        if snapshot.category == ProposalCategory::CommunityFund {
            let action = snapshot.execution_data.get("action").and_then(|v| v.as_str()).unwrap_or("withdraw");
            match action {
                "airdrop" => {
                    self.fund.run_airdrop().await?;
                }
                _ => {
                    let amount = snapshot
                        .execution_data
                        .get("withdraw_amount")
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| DuxError::validation("withdraw action requires withdraw_amount"))?;
                    let destination = snapshot
                        .execution_data
                        .get("destination")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| DuxError::validation("withdraw action requires destination"))?;
                    self.fund.withdraw(amount, destination).await?;
                }
            }
        }

        let mut state = self.state.write();
        let proposal = state
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| DuxError::validation("unknown proposal_id"))?;
        proposal.status = ProposalStatus::Executed;
        proposal.executed_at = Some(now());
        proposal.executor_wallet_id = Some(executor_wallet_id);
        Ok(proposal.clone())
    }

    pub fn get(&self, proposal_id: ProposalId) -> DuxResult<Proposal> {
        self.state
            .read()
            .proposals
            .get(&proposal_id)
            .cloned()
            .ok_or_else(|| DuxError::validation("unknown proposal_id"))
    }

    pub fn votes_for(&self, proposal_id: ProposalId) -> Vec<Vote> {
        self.state
            .read()
            .votes
            .get(&proposal_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}
