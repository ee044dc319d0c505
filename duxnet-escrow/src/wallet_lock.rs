//! C5 — Wallet-Lock Ledger.

use crate::{AuditLog, EscrowTxType};
use duxnet_chain::ChainAdapter;
use duxnet_core::{now, Currency, DuxError, DuxResult, EscrowId, Money, NodeId, Timestamp, WalletId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: WalletId,
    pub node_id: NodeId,
    pub wallet_name: String,
    pub address: String,
    pub currency: Currency,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedFunds {
    pub escrow_id: EscrowId,
    pub wallet_id: WalletId,
    pub amount: Money,
    pub status: LockStatus,
    pub locked_at: Timestamp,
    pub unlocked_at: Option<Timestamp>,
    pub txid: Option<String>,
}

struct LedgerState {
    wallets: HashMap<WalletId, Wallet>,
    locks: HashMap<EscrowId, LockedFunds>,
}

/// Owns the only process-wide view of locked balances (§5). Every
/// mutation writes through to the shared [`AuditLog`].
pub struct WalletLockLedger {
    state: RwLock<LedgerState>,
    chain: Arc<dyn ChainAdapter>,
    audit: Arc<AuditLog>,
}

impl WalletLockLedger {
    pub fn new(chain: Arc<dyn ChainAdapter>, audit: Arc<AuditLog>) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                wallets: HashMap::new(),
                locks: HashMap::new(),
            }),
            chain,
            audit,
        }
    }

    pub fn register_wallet(
        &self,
        node_id: NodeId,
        wallet_name: String,
        address: String,
        currency: Currency,
    ) -> Wallet {
        let wallet = Wallet {
            wallet_id: Uuid::new_v4(),
            node_id,
            wallet_name,
            address,
            currency,
            active: true,
        };
        self.state.write().wallets.insert(wallet.wallet_id, wallet.clone());
        wallet
    }

    pub fn get_wallet(&self, wallet_id: WalletId) -> DuxResult<Wallet> {
        self.state
            .read()
            .wallets
            .get(&wallet_id)
            .cloned()
            .ok_or_else(|| DuxError::validation("unknown wallet_id"))
    }

    fn locked_total(state: &LedgerState, wallet_id: WalletId) -> Money {
        state
            .locks
            .values()
            .filter(|l| l.wallet_id == wallet_id && l.status == LockStatus::Locked)
            .map(|l| l.amount)
            .sum()
    }

    /// Locks `amount` of `currency` from `wallet_id` against
    /// `escrow_id`. Fails with `Resource` if the confirmed chain
    /// balance minus funds already locked is insufficient.
    pub async fn lock(&self, escrow_id: EscrowId, wallet_id: WalletId, amount: Money) -> DuxResult<()> {
        let wallet = self.get_wallet(wallet_id)?;
        let balance = self
            .chain
            .get_balance(wallet.currency)
            .await
            .map_err(|e| DuxError::external(e.to_string()))?;

        {
            let state = self.state.read();
            let already_locked = Self::locked_total(&state, wallet_id);
            if balance.confirmed < already_locked + amount {
                return Err(DuxError::resource("insufficient funds to lock"));
            }
        }

        let lock = LockedFunds {
            escrow_id,
            wallet_id,
            amount,
            status: LockStatus::Locked,
            locked_at: now(),
            unlocked_at: None,
            txid: None,
        };
        self.state.write().locks.insert(escrow_id, lock);
        self.audit.record(
            escrow_id,
            EscrowTxType::Lock,
            amount,
            wallet.currency,
            Some(wallet_id),
            None,
            None,
            serde_json::json!({}),
        );
        Ok(())
    }

    /// Releases the entire lock for `escrow_id` without transferring
    /// funds (used on refund, where C1 performs the transfer itself).
    pub fn unlock(&self, escrow_id: EscrowId) -> DuxResult<()> {
        let mut state = self.state.write();
        let lock = state
            .locks
            .get_mut(&escrow_id)
            .ok_or_else(|| DuxError::state("no active lock for escrow"))?;
        if lock.status == LockStatus::Unlocked {
            return Ok(());
        }
        lock.status = LockStatus::Unlocked;
        lock.unlocked_at = Some(now());
        let (amount, wallet_id) = (lock.amount, lock.wallet_id);
        let currency = state
            .wallets
            .get(&wallet_id)
            .map(|w| w.currency)
            .unwrap_or(Currency::Flop);
        drop(state);
        self.audit.record(
            escrow_id,
            EscrowTxType::Unlock,
            amount,
            currency,
            Some(wallet_id),
            None,
            None,
            serde_json::json!({}),
        );
        Ok(())
    }

    /// Reduces the lock by `amount` as funds leave escrow; removes the
    /// lock entirely once it reaches zero.
    pub fn reduce_lock(&self, escrow_id: EscrowId, amount: Money) -> DuxResult<()> {
        let mut state = self.state.write();
        let lock = state
            .locks
            .get_mut(&escrow_id)
            .ok_or_else(|| DuxError::state("no active lock for escrow"))?;
        if lock.amount < amount {
            return Err(DuxError::internal("lock underflow"));
        }
        lock.amount -= amount;
        if lock.amount == 0 {
            lock.status = LockStatus::Unlocked;
            lock.unlocked_at = Some(now());
        }
        Ok(())
    }

    pub fn locked_funds(&self, escrow_id: EscrowId) -> Option<LockedFunds> {
        self.state.read().locks.get(&escrow_id).cloned()
    }

    /// Transfers `amount` directly between two wallets via C1,
    /// independent of any escrow lock. Used for operator-initiated
    /// transfers and governance-driven fund withdrawals.
    pub async fn transfer_between_wallets(
        &self,
        from: WalletId,
        to: WalletId,
        amount: Money,
    ) -> DuxResult<String> {
        let from_wallet = self.get_wallet(from)?;
        let to_wallet = self.get_wallet(to)?;
        if from_wallet.currency != to_wallet.currency {
            return Err(DuxError::validation("currency mismatch between wallets"));
        }
        let receipt = self
            .chain
            .send(from_wallet.currency, &to_wallet.address, amount)
            .await
            .map_err(|e| DuxError::external(e.to_string()))?;
        self.audit.record(
            Uuid::nil(),
            EscrowTxType::Transfer,
            amount,
            from_wallet.currency,
            Some(from),
            Some(to),
            Some(receipt.txid.clone()),
            serde_json::json!({}),
        );
        Ok(receipt.txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duxnet_chain::{Balance, ChainError, TxReceipt, TxStatusReport};

    struct FakeChain {
        balance: Money,
    }

    #[async_trait]
    impl ChainAdapter for FakeChain {
        async fn get_balance(&self, _currency: Currency) -> Result<Balance, ChainError> {
            Ok(Balance {
                confirmed: self.balance,
                unconfirmed: 0,
            })
        }
        async fn new_address(&self, _currency: Currency, _label: Option<&str>) -> Result<String, ChainError> {
            Ok("addr".into())
        }
        async fn send(&self, _currency: Currency, _to: &str, _amount: u64) -> Result<TxReceipt, ChainError> {
            Ok(TxReceipt { txid: "tx1".into() })
        }
        async fn status(&self, _currency: Currency, _txid: &str) -> Result<TxStatusReport, ChainError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn lock_rejects_insufficient_balance() {
        let ledger = WalletLockLedger::new(Arc::new(FakeChain { balance: 10 }), Arc::new(AuditLog::new()));
        let wallet = ledger.register_wallet(Uuid::new_v4(), "w1".into(), "addr".into(), Currency::Flop);
        let err = ledger.lock(Uuid::new_v4(), wallet.wallet_id, 100).await.unwrap_err();
        assert!(matches!(err, DuxError::Resource(_)));
    }

    #[tokio::test]
    async fn lock_then_reduce_to_zero_unlocks() {
        let ledger = WalletLockLedger::new(Arc::new(FakeChain { balance: 100 }), Arc::new(AuditLog::new()));
        let wallet = ledger.register_wallet(Uuid::new_v4(), "w1".into(), "addr".into(), Currency::Flop);
        let escrow_id = Uuid::new_v4();
        ledger.lock(escrow_id, wallet.wallet_id, 100).await.unwrap();
        ledger.reduce_lock(escrow_id, 100).unwrap();
        assert_eq!(ledger.locked_funds(escrow_id).unwrap().status, LockStatus::Unlocked);
    }

    #[tokio::test]
    async fn second_lock_accounts_for_existing_lock() {
        let ledger = WalletLockLedger::new(Arc::new(FakeChain { balance: 100 }), Arc::new(AuditLog::new()));
        let wallet = ledger.register_wallet(Uuid::new_v4(), "w1".into(), "addr".into(), Currency::Flop);
        ledger.lock(Uuid::new_v4(), wallet.wallet_id, 60).await.unwrap();
        let err = ledger.lock(Uuid::new_v4(), wallet.wallet_id, 60).await.unwrap_err();
        assert!(matches!(err, DuxError::Resource(_)));
    }
}
