//! The trust core: C5 Wallet-Lock Ledger, C6 Escrow State Machine, C7
//! Dispute Resolver, C8 Community Fund.
//!
//! Per §9's cross-component cycle note, the fund depends only on the
//! chain adapter and the registry's read API and never calls into
//! escrow; escrow reaches the fund through the single narrow
//! `CommunityFund::collect_tax` port.

pub mod dispute;
pub mod escrow;
pub mod fund;
pub mod wallet_lock;

pub use dispute::{Dispute, DisputeResolver, DisputeStatus};
pub use escrow::{Escrow, EscrowEngine, EscrowStatus, DEFAULT_PROVIDER_SHARE_BPS};
pub use fund::CommunityFund;
pub use wallet_lock::{LockedFunds, LockStatus, Wallet, WalletLockLedger};

use duxnet_core::{Currency, EscrowId, Money, Timestamp, WalletId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowTxType {
    Create,
    ReleaseProvider,
    ReleaseCommunity,
    Refund,
    Lock,
    Unlock,
    CommunityFund,
    Transfer,
}

/// Append-only audit row (§3). Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub id: Uuid,
    pub escrow_id: EscrowId,
    pub tx_type: EscrowTxType,
    pub amount: Money,
    pub currency: Currency,
    pub from_wallet_id: Option<WalletId>,
    pub to_wallet_id: Option<WalletId>,
    pub txid: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}

/// Append-only log shared by the ledger and escrow engine. A plain
/// `RwLock<Vec<_>>` is sufficient: writers only ever push, readers only
/// ever scan, and ordering within one escrow_id is already serialized
/// by the engine's per-escrow lock (§5).
#[derive(Default)]
pub struct AuditLog {
    rows: RwLock<Vec<EscrowTransaction>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        escrow_id: EscrowId,
        tx_type: EscrowTxType,
        amount: Money,
        currency: Currency,
        from_wallet_id: Option<WalletId>,
        to_wallet_id: Option<WalletId>,
        txid: Option<String>,
        metadata: serde_json::Value,
    ) -> EscrowTransaction {
        let row = EscrowTransaction {
            id: Uuid::new_v4(),
            escrow_id,
            tx_type,
            amount,
            currency,
            from_wallet_id,
            to_wallet_id,
            txid,
            metadata,
            created_at: duxnet_core::now(),
        };
        self.rows.write().push(row.clone());
        row
    }

    pub fn for_escrow(&self, escrow_id: EscrowId) -> Vec<EscrowTransaction> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<EscrowTransaction> {
        self.rows.read().clone()
    }
}
