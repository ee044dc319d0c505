//! Durable mirror of the process's in-memory authoritative state (§3,
//! "in-memory authoritative during process lifetime"; persistence
//! exists for restart recovery and operator inspection, not as the
//! read path for a running node).
//!
//! One table per §3 entity, each a JSONB blob keyed by its natural id
//! — the same shape the teacher used for its block/identity tables.
//! `CREATE TABLE IF NOT EXISTS` stands in for a migration framework,
//! same as the teacher.

use anyhow::Result;
use async_trait::async_trait;
use duxnet_core::{DisputeId, EscrowId, Money, NodeId, ProposalId, Timestamp, WalletId};
use duxnet_escrow::{Dispute, Escrow, EscrowTransaction, LockedFunds, Wallet};
use duxnet_governance::{Proposal, Vote};
use duxnet_registry::Node;
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

/// Level, issue/verify timestamps for a node's auth identity (§3,
/// "node_identities"). The identity's HMAC secret is never persisted
/// in plaintext here — a restarted node re-provisions it through C2,
/// the same boundary that keeps it out of API responses.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeIdentityRecord {
    pub node_id: NodeId,
    pub level: String,
    pub created_at: Timestamp,
    pub last_verified: Option<Timestamp>,
}

/// Point-in-time snapshot of the community fund's balance and airdrop
/// history (§3, "community_fund"), restored on node startup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FundSnapshot {
    pub balance: Money,
    pub last_airdrop_at: Option<Timestamp>,
    pub last_airdrop_amount: Money,
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn upsert_node(&self, node: &Node) -> Result<()>;
    async fn get_node(&self, node_id: NodeId) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn upsert_identity(&self, identity: &NodeIdentityRecord) -> Result<()>;
    async fn get_identity(&self, node_id: NodeId) -> Result<Option<NodeIdentityRecord>>;
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn upsert_wallet(&self, wallet: &Wallet) -> Result<()>;
    async fn get_wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>>;
    async fn list_wallets(&self) -> Result<Vec<Wallet>>;
}

#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn upsert_escrow(&self, escrow: &Escrow) -> Result<()>;
    async fn get_escrow(&self, escrow_id: EscrowId) -> Result<Option<Escrow>>;
    async fn list_escrows(&self) -> Result<Vec<Escrow>>;
    async fn append_transaction(&self, tx: &EscrowTransaction) -> Result<()>;
    async fn list_transactions(&self, escrow_id: EscrowId) -> Result<Vec<EscrowTransaction>>;
    async fn upsert_lock(&self, lock: &LockedFunds) -> Result<()>;
    async fn get_lock(&self, escrow_id: EscrowId) -> Result<Option<LockedFunds>>;
    async fn upsert_dispute(&self, dispute: &Dispute) -> Result<()>;
    async fn get_dispute(&self, dispute_id: DisputeId) -> Result<Option<Dispute>>;
}

#[async_trait]
pub trait FundStore: Send + Sync {
    async fn save_fund_snapshot(&self, snapshot: &FundSnapshot) -> Result<()>;
    async fn load_fund_snapshot(&self) -> Result<Option<FundSnapshot>>;
}

#[async_trait]
pub trait GovernanceStore: Send + Sync {
    async fn upsert_proposal(&self, proposal: &Proposal) -> Result<()>;
    async fn get_proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>>;
    async fn list_proposals(&self) -> Result<Vec<Proposal>>;
    async fn upsert_vote(&self, vote: &Vote) -> Result<()>;
    async fn list_votes(&self, proposal_id: ProposalId) -> Result<Vec<Vote>>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
        CREATE TABLE IF NOT EXISTS nodes(
            node_id UUID PRIMARY KEY,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS node_identities(
            node_id UUID PRIMARY KEY,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS wallets(
            wallet_id UUID PRIMARY KEY,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS escrows(
            escrow_id UUID PRIMARY KEY,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS escrow_transactions(
            id UUID PRIMARY KEY,
            escrow_id UUID NOT NULL,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS locked_funds(
            escrow_id UUID PRIMARY KEY,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS disputes(
            dispute_id UUID PRIMARY KEY,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS community_fund(
            id INT PRIMARY KEY DEFAULT 1,
            data JSONB NOT NULL,
            CHECK (id = 1)
        );
        CREATE TABLE IF NOT EXISTS proposals(
            proposal_id UUID PRIMARY KEY,
            data JSONB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS votes(
            vote_id UUID PRIMARY KEY,
            proposal_id UUID NOT NULL,
            data JSONB NOT NULL
        );
        "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeStore for PgStore {
    async fn upsert_node(&self, node: &Node) -> Result<()> {
        sqlx::query(
            "INSERT INTO nodes(node_id, data) VALUES ($1, $2) ON CONFLICT (node_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(node.node_id)
        .bind(json!(node))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, node_id: NodeId) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT data FROM nodes WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Node> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT data FROM nodes").fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| -> Result<Node> {
                let value: serde_json::Value = r.try_get("data")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn upsert_identity(&self, identity: &NodeIdentityRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_identities(node_id, data) VALUES ($1, $2) ON CONFLICT (node_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(identity.node_id)
        .bind(json!(identity))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_identity(&self, node_id: NodeId) -> Result<Option<NodeIdentityRecord>> {
        let row = sqlx::query("SELECT data FROM node_identities WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<NodeIdentityRecord> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }
}

#[async_trait]
impl WalletStore for PgStore {
    async fn upsert_wallet(&self, wallet: &Wallet) -> Result<()> {
        sqlx::query(
            "INSERT INTO wallets(wallet_id, data) VALUES ($1, $2) ON CONFLICT (wallet_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(wallet.wallet_id)
        .bind(json!(wallet))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>> {
        let row = sqlx::query("SELECT data FROM wallets WHERE wallet_id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Wallet> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }

    async fn list_wallets(&self) -> Result<Vec<Wallet>> {
        let rows = sqlx::query("SELECT data FROM wallets").fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| -> Result<Wallet> {
                let value: serde_json::Value = r.try_get("data")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }
}

#[async_trait]
impl EscrowStore for PgStore {
    async fn upsert_escrow(&self, escrow: &Escrow) -> Result<()> {
        sqlx::query(
            "INSERT INTO escrows(escrow_id, data) VALUES ($1, $2) ON CONFLICT (escrow_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(escrow.escrow_id)
        .bind(json!(escrow))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_escrow(&self, escrow_id: EscrowId) -> Result<Option<Escrow>> {
        let row = sqlx::query("SELECT data FROM escrows WHERE escrow_id = $1")
            .bind(escrow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Escrow> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }

    async fn list_escrows(&self) -> Result<Vec<Escrow>> {
        let rows = sqlx::query("SELECT data FROM escrows").fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| -> Result<Escrow> {
                let value: serde_json::Value = r.try_get("data")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn append_transaction(&self, tx: &EscrowTransaction) -> Result<()> {
        sqlx::query("INSERT INTO escrow_transactions(id, escrow_id, data) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING")
            .bind(tx.id)
            .bind(tx.escrow_id)
            .bind(json!(tx))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_transactions(&self, escrow_id: EscrowId) -> Result<Vec<EscrowTransaction>> {
        let rows = sqlx::query("SELECT data FROM escrow_transactions WHERE escrow_id = $1 ORDER BY id")
            .bind(escrow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| -> Result<EscrowTransaction> {
                let value: serde_json::Value = r.try_get("data")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn upsert_lock(&self, lock: &LockedFunds) -> Result<()> {
        sqlx::query(
            "INSERT INTO locked_funds(escrow_id, data) VALUES ($1, $2) ON CONFLICT (escrow_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(lock.escrow_id)
        .bind(json!(lock))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_lock(&self, escrow_id: EscrowId) -> Result<Option<LockedFunds>> {
        let row = sqlx::query("SELECT data FROM locked_funds WHERE escrow_id = $1")
            .bind(escrow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<LockedFunds> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }

    async fn upsert_dispute(&self, dispute: &Dispute) -> Result<()> {
        sqlx::query(
            "INSERT INTO disputes(dispute_id, data) VALUES ($1, $2) ON CONFLICT (dispute_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(dispute.dispute_id)
        .bind(json!(dispute))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_dispute(&self, dispute_id: DisputeId) -> Result<Option<Dispute>> {
        let row = sqlx::query("SELECT data FROM disputes WHERE dispute_id = $1")
            .bind(dispute_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Dispute> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }
}

#[async_trait]
impl FundStore for PgStore {
    async fn save_fund_snapshot(&self, snapshot: &FundSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO community_fund(id, data) VALUES (1, $1) ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(json!(snapshot))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_fund_snapshot(&self) -> Result<Option<FundSnapshot>> {
        let row = sqlx::query("SELECT data FROM community_fund WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<FundSnapshot> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }
}

#[async_trait]
impl GovernanceStore for PgStore {
    async fn upsert_proposal(&self, proposal: &Proposal) -> Result<()> {
        sqlx::query(
            "INSERT INTO proposals(proposal_id, data) VALUES ($1, $2) ON CONFLICT (proposal_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(proposal.proposal_id)
        .bind(json!(proposal))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>> {
        let row = sqlx::query("SELECT data FROM proposals WHERE proposal_id = $1")
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Proposal> {
            let value: serde_json::Value = r.try_get("data")?;
            Ok(serde_json::from_value(value)?)
        })
        .transpose()
    }

    async fn list_proposals(&self) -> Result<Vec<Proposal>> {
        let rows = sqlx::query("SELECT data FROM proposals").fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| -> Result<Proposal> {
                let value: serde_json::Value = r.try_get("data")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn upsert_vote(&self, vote: &Vote) -> Result<()> {
        sqlx::query(
            "INSERT INTO votes(vote_id, proposal_id, data) VALUES ($1, $2, $3) ON CONFLICT (vote_id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(vote.vote_id)
        .bind(vote.proposal_id)
        .bind(json!(vote))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_votes(&self, proposal_id: ProposalId) -> Result<Vec<Vote>> {
        let rows = sqlx::query("SELECT data FROM votes WHERE proposal_id = $1")
            .bind(proposal_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| -> Result<Vote> {
                let value: serde_json::Value = r.try_get("data")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No in-process Postgres is available in this workspace, so
    // connectivity is exercised only behind `DATABASE_URL` and is
    // skipped by default the same way the teacher's storage tests are.
    #[tokio::test]
    #[ignore]
    async fn roundtrips_a_node() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL for test");
        let store = PgStore::connect(&url, 5).await.unwrap();
        let node = Node {
            node_id: Uuid::new_v4(),
            network_address: "127.0.0.1:9000".into(),
            capabilities: Default::default(),
            status: duxnet_registry::NodeStatus::Online,
            reputation: 50.0,
            last_heartbeat: duxnet_core::now(),
            metadata: serde_json::json!({}),
            deleted: false,
        };
        store.upsert_node(&node).await.unwrap();
        let fetched = store.get_node(node.node_id).await.unwrap().unwrap();
        assert_eq!(fetched.node_id, node.node_id);
    }
}
