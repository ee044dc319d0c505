//! C7 — Dispute Resolver.
//!
//! Opens, accumulates evidence for, and terminates disputes, driving
//! the escrow's terminal state but never touching its rows directly
//! (everything goes through [`EscrowEngine`]).

use crate::escrow::{EscrowEngine, EscrowStatus};
use duxnet_core::{now, DisputeId, DuxError, DuxEvent, DuxResult, EscrowId, EventBus, Money, Timestamp, WalletId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub dispute_id: DisputeId,
    pub escrow_id: EscrowId,
    pub status: DisputeStatus,
    pub reason: String,
    pub evidence: HashMap<WalletId, String>,
    pub initiator_wallet_id: WalletId,
    pub respondent_wallet_id: WalletId,
    pub resolution: Option<String>,
    pub created_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

pub enum Winner {
    Payer,
    Provider,
    Split { refund_amount: Money },
}

pub struct DisputeResolver {
    disputes: RwLock<HashMap<DisputeId, Dispute>>,
    escrow_engine: Arc<EscrowEngine>,
    events: Arc<dyn EventBus>,
}

impl DisputeResolver {
    pub fn new(escrow_engine: Arc<EscrowEngine>, events: Arc<dyn EventBus>) -> Self {
        Self {
            disputes: RwLock::new(HashMap::new()),
            escrow_engine,
            events,
        }
    }

    pub fn get(&self, dispute_id: DisputeId) -> DuxResult<Dispute> {
        self.disputes
            .read()
            .get(&dispute_id)
            .cloned()
            .ok_or_else(|| DuxError::validation("unknown dispute_id"))
    }

    /// Opens a dispute on an `active` or `released` escrow. The
    /// initiator must be the escrow's payer or provider; the
    /// respondent is derived as the other party.
    pub fn create_dispute(
        &self,
        escrow_id: EscrowId,
        initiator_wallet_id: WalletId,
        reason: String,
        evidence: Option<String>,
    ) -> DuxResult<Dispute> {
        let escrow = self.escrow_engine.get(escrow_id)?;
        if !matches!(escrow.status, EscrowStatus::Active | EscrowStatus::Released) {
            return Err(DuxError::state("escrow is not eligible for dispute"));
        }

        let respondent_wallet_id = if initiator_wallet_id == escrow.payer_wallet_id {
            escrow.provider_wallet_id
        } else if initiator_wallet_id == escrow.provider_wallet_id {
            escrow.payer_wallet_id
        } else {
            return Err(DuxError::validation("initiator is not a party to this escrow"));
        };

        let mut evidence_map = HashMap::new();
        if let Some(e) = evidence {
            evidence_map.insert(initiator_wallet_id, e);
        }

        let dispute = Dispute {
            dispute_id: Uuid::new_v4(),
            escrow_id,
            status: DisputeStatus::Open,
            reason,
            evidence: evidence_map,
            initiator_wallet_id,
            respondent_wallet_id,
            resolution: None,
            created_at: now(),
            resolved_at: None,
        };

        self.escrow_engine.mark_disputed(escrow_id, dispute.dispute_id)?;
        self.disputes.write().insert(dispute.dispute_id, dispute.clone());
        self.events.publish(DuxEvent::DisputeOpened {
            dispute_id: dispute.dispute_id,
            escrow_id,
            ts: now(),
        });
        Ok(dispute)
    }

    /// Appends (overwriting) one evidence slot per involved wallet.
    pub fn add_evidence(&self, dispute_id: DisputeId, wallet_id: WalletId, evidence: String) -> DuxResult<()> {
        let mut disputes = self.disputes.write();
        let dispute = disputes
            .get_mut(&dispute_id)
            .ok_or_else(|| DuxError::validation("unknown dispute_id"))?;
        if dispute.status != DisputeStatus::Open {
            return Err(DuxError::state("dispute is not open for evidence"));
        }
        let parties: HashSet<WalletId> = [dispute.initiator_wallet_id, dispute.respondent_wallet_id].into();
        if !parties.contains(&wallet_id) {
            return Err(DuxError::validation("wallet is not a party to this dispute"));
        }
        dispute.evidence.insert(wallet_id, evidence);
        Ok(())
    }

    /// Resolves the dispute, driving the escrow to its terminal state
    /// per the selected winner, and marks the dispute `resolved`.
    pub async fn resolve_dispute(
        &self,
        dispute_id: DisputeId,
        resolution: String,
        winner: Winner,
        release_args: Option<(String, String, i64, i64)>,
    ) -> DuxResult<Dispute> {
        let escrow_id = {
            let disputes = self.disputes.read();
            let dispute = disputes.get(&dispute_id).ok_or_else(|| DuxError::validation("unknown dispute_id"))?;
            if dispute.status != DisputeStatus::Open {
                return Err(DuxError::state("dispute already terminated"));
            }
            dispute.escrow_id
        };

        match winner {
            Winner::Payer => {
                self.escrow_engine.refund_to_resolved(escrow_id, "dispute resolved in favor of payer".into()).await?;
            }
            Winner::Provider => {
                let (result_hash, signature, timestamp, now_ts) = release_args
                    .ok_or_else(|| DuxError::validation("provider win requires a stored result_hash/signature"))?;
                self.escrow_engine
                    .release_to_resolved(escrow_id, result_hash, signature, timestamp, now_ts)
                    .await?;
            }
            Winner::Split { refund_amount } => {
                self.escrow_engine.split_resolve(escrow_id, refund_amount).await?;
            }
        }

        let resolved = {
            let mut disputes = self.disputes.write();
            let dispute = disputes.get_mut(&dispute_id).expect("checked above");
            dispute.status = DisputeStatus::Resolved;
            dispute.resolution = Some(resolution);
            dispute.resolved_at = Some(now());
            dispute.clone()
        };
        self.events.publish(DuxEvent::DisputeResolved {
            dispute_id,
            escrow_id,
            ts: now(),
        });
        Ok(resolved)
    }

    /// Returns the escrow to `active` without terminating the dispute's
    /// underlying conflict in the caller's favor.
    pub fn reject_dispute(&self, dispute_id: DisputeId) -> DuxResult<Dispute> {
        let mut disputes = self.disputes.write();
        let dispute = disputes.get_mut(&dispute_id).ok_or_else(|| DuxError::validation("unknown dispute_id"))?;
        if dispute.status != DisputeStatus::Open {
            return Err(DuxError::state("dispute already terminated"));
        }
        self.escrow_engine.mark_active(dispute.escrow_id)?;
        dispute.status = DisputeStatus::Rejected;
        dispute.resolved_at = Some(now());
        Ok(dispute.clone())
    }
}
