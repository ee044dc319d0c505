//! Shared types for the DuxNet core: currencies, money, ids, the error
//! taxonomy, and the wire-stable event payloads emitted by the trust core.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub type NodeId = Uuid;
pub type EscrowId = Uuid;
pub type WalletId = Uuid;
pub type DisputeId = Uuid;
pub type ProposalId = Uuid;
pub type VoteId = Uuid;
pub type TaskId = Uuid;

pub type Timestamp = chrono::DateTime<chrono::Utc>;

pub fn now() -> Timestamp {
    chrono::Utc::now()
}

/// Amounts are carried in integer minor-units everywhere in the core;
/// conversion to a chain's native denomination happens only at the
/// chain-adapter boundary (see `duxnet-chain`).
pub type Money = u64;

/// The closed set of currencies the core accepts. Unknown currencies
/// are rejected at escrow creation (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Flop,
    Btc,
    Eth,
    Usdt,
    Bnb,
    Xrp,
    Sol,
    Ada,
    Doge,
    Ton,
    Trx,
}

impl Currency {
    pub const ALL: [Currency; 11] = [
        Currency::Flop,
        Currency::Btc,
        Currency::Eth,
        Currency::Usdt,
        Currency::Bnb,
        Currency::Xrp,
        Currency::Sol,
        Currency::Ada,
        Currency::Doge,
        Currency::Ton,
        Currency::Trx,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Flop => "FLOP",
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::Usdt => "USDT",
            Currency::Bnb => "BNB",
            Currency::Xrp => "XRP",
            Currency::Sol => "SOL",
            Currency::Ada => "ADA",
            Currency::Doge => "DOGE",
            Currency::Ton => "TON",
            Currency::Trx => "TRX",
        }
    }

    pub fn parse(code: &str) -> Option<Currency> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Caller-visible error taxonomy (§7). Every component surfaces one of
/// these variants; the field carries the offending value or context so
/// callers can report it without re-deriving it.
#[derive(Debug, Error)]
pub enum DuxError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("resource unavailable: {0}")]
    Resource(String),
    #[error("external dependency failed: {0}")]
    External(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type DuxResult<T> = Result<T, DuxError>;

impl DuxError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DuxError::Validation(msg.into())
    }
    pub fn state(msg: impl Into<String>) -> Self {
        DuxError::State(msg.into())
    }
    pub fn auth(msg: impl Into<String>) -> Self {
        DuxError::Auth(msg.into())
    }
    pub fn resource(msg: impl Into<String>) -> Self {
        DuxError::Resource(msg.into())
    }
    pub fn external(msg: impl Into<String>) -> Self {
        DuxError::External(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        DuxError::Internal(msg.into())
    }
}

/// SHA-256 of `JSON(value, sorted_keys)`, lowercase hex, 64 chars.
/// Used both as the task result-hash and as the idempotency key for
/// escrow release (§6).
pub fn sorted_json_hash(value: &serde_json::Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonical value always serializes");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

/// Recursively rewrites a `serde_json::Value` so that every object's
/// keys serialize in sorted order. `serde_json` maps already iterate
/// in insertion order by default, so this makes the sort explicit
/// rather than depending on a cargo feature flag elsewhere in the
/// workspace.
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, serde_json::Value> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

pub fn is_valid_result_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Fire-and-forget event-bus payloads (§6). The core never blocks on a
/// subscriber; publication failures are logged, not propagated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum DuxEvent {
    EscrowCreated {
        escrow_id: EscrowId,
        amount: Money,
        currency: Currency,
        service_name: String,
        ts: Timestamp,
    },
    EscrowReleased {
        escrow_id: EscrowId,
        provider_amount: Money,
        community_amount: Money,
        currency: Currency,
        ts: Timestamp,
    },
    EscrowRefunded {
        escrow_id: EscrowId,
        amount: Money,
        currency: Currency,
        reason: String,
        ts: Timestamp,
    },
    DisputeOpened {
        dispute_id: DisputeId,
        escrow_id: EscrowId,
        ts: Timestamp,
    },
    DisputeResolved {
        dispute_id: DisputeId,
        escrow_id: EscrowId,
        ts: Timestamp,
    },
    FundAirdrop {
        total_amount: Money,
        wallet_count: usize,
        per_wallet: Money,
        ts: Timestamp,
    },
    TaskCompleted {
        task_id: TaskId,
        node_id: NodeId,
        ts: Timestamp,
    },
    TaskFailed {
        task_id: TaskId,
        node_id: Option<NodeId>,
        reason: String,
        ts: Timestamp,
    },
}

impl DuxEvent {
    /// The wire topic name listed in §6 (e.g. `escrow.created`).
    pub fn topic(&self) -> &'static str {
        match self {
            DuxEvent::EscrowCreated { .. } => "escrow.created",
            DuxEvent::EscrowReleased { .. } => "escrow.released",
            DuxEvent::EscrowRefunded { .. } => "escrow.refunded",
            DuxEvent::DisputeOpened { .. } => "dispute.opened",
            DuxEvent::DisputeResolved { .. } => "dispute.resolved",
            DuxEvent::FundAirdrop { .. } => "fund.airdrop",
            DuxEvent::TaskCompleted { .. } => "task.completed",
            DuxEvent::TaskFailed { .. } => "task.failed",
        }
    }
}

/// A fire-and-forget publication sink (§6). `publish` never blocks the
/// caller on a subscriber and never returns an error: a sink that needs
/// to report delivery failures logs them itself.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: DuxEvent);
}

/// Discards every event; useful in tests and for components wired
/// without an operator-visible bus.
#[derive(Debug, Default)]
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn publish(&self, _event: DuxEvent) {}
}

/// Logs every event at `info` via `tracing` and nothing else. The
/// default sink for a single-process deployment; a multi-subscriber
/// bus (e.g. backed by `tokio::sync::broadcast`) can wrap or replace it.
#[derive(Debug, Default)]
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn publish(&self, event: DuxEvent) {
        let topic = event.topic();
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(topic, payload, "event published"),
            Err(e) => tracing::warn!(topic, error = %e, "event payload not serializable"),
        }
    }
}

/// Splits an amount into the provider/community legs at the configured
/// basis-point share, with the remainder (avoiding float tolerance
/// issues) assigned to the community leg so `provider + community ==
/// amount` always holds exactly.
pub fn split_amount(amount: Money, provider_bps: u32) -> (Money, Money) {
    let provider = amount * provider_bps as u64 / 10_000;
    let community = amount - provider;
    (provider, community)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_exact() {
        let (p, c) = split_amount(7500, 9500);
        assert_eq!(p, 7125);
        assert_eq!(c, 375);
        assert_eq!(p + c, 7500);
    }

    #[test]
    fn split_handles_indivisible_amounts() {
        let (p, c) = split_amount(101, 9500);
        assert_eq!(p + c, 101);
    }

    #[test]
    fn hash_is_order_independent() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(sorted_json_hash(&a), sorted_json_hash(&b));
        assert!(is_valid_result_hash(&sorted_json_hash(&a)));
    }

    #[test]
    fn currency_roundtrip() {
        for c in Currency::ALL {
            assert_eq!(Currency::parse(c.code()), Some(c));
        }
        assert_eq!(Currency::parse("NOPE"), None);
    }
}
