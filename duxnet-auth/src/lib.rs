//! C2 — Authenticator.
//!
//! Issues a 32-byte HMAC secret per node and verifies signed messages:
//! HMAC-SHA256 over `JSON(payload, sorted_keys) || timestamp`, with a
//! ±300s clock-skew window and a 5-failures-per-300s rate limit per
//! node (§4.2).

use base64::Engine;
use chrono::{DateTime, Utc};
use duxnet_core::{DuxError, DuxResult, NodeId};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_TTL_SECONDS: i64 = 300;
pub const MAX_AUTH_ATTEMPTS: usize = 5;
pub const AUTH_WINDOW_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AuthLevel {
    None,
    Basic,
    Signed,
    Verified,
}

/// Authorization requirements for the operation classes named in §4.2.
/// `query`/`list` need at least `basic`; mutating operations need
/// `signed` or better; administrative operations need `verified`.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    Query,
    List,
    Register,
    Update,
    Delete,
    Administrative,
}

impl Operation {
    pub fn required_level(self) -> AuthLevel {
        match self {
            Operation::Query | Operation::List => AuthLevel::Basic,
            Operation::Register | Operation::Update | Operation::Delete => AuthLevel::Signed,
            Operation::Administrative => AuthLevel::Verified,
        }
    }
}

pub fn authorize(op: Operation, level: AuthLevel) -> bool {
    level >= op.required_level()
}

struct Identity {
    secret: [u8; 32],
    level: AuthLevel,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    last_verified: Option<DateTime<Utc>>,
}

/// Fixed-capacity ring buffer of failure timestamps, per §9's
/// arena+index guidance: overflow simply overwrites the oldest entry.
struct FailureWindow {
    slots: Vec<i64>,
    next: usize,
    filled: usize,
}

impl FailureWindow {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity],
            next: 0,
            filled: 0,
        }
    }

    fn record(&mut self, ts: i64) {
        self.slots[self.next] = ts;
        self.next = (self.next + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    fn count_since(&self, cutoff: i64) -> usize {
        self.slots[..self.filled].iter().filter(|&&t| t >= cutoff).count()
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.next = 0;
    }
}

pub struct Authenticator {
    identities: RwLock<HashMap<NodeId, Identity>>,
    failures: RwLock<HashMap<NodeId, FailureWindow>>,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator {
    pub fn new() -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Issues a fresh 32-byte secret for `node_id`. The secret is
    /// returned once and never stored in a form retrievable later.
    pub fn issue(&self, node_id: NodeId) -> [u8; 32] {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        self.identities.write().insert(
            node_id,
            Identity {
                secret,
                level: AuthLevel::Signed,
                created_at: Utc::now(),
                last_verified: None,
            },
        );
        info!(%node_id, "issued node identity");
        secret
    }

    pub fn set_level(&self, node_id: NodeId, level: AuthLevel) -> DuxResult<()> {
        let mut identities = self.identities.write();
        let identity = identities
            .get_mut(&node_id)
            .ok_or_else(|| DuxError::validation("unknown node_id"))?;
        identity.level = level;
        Ok(())
    }

    pub fn level_of(&self, node_id: NodeId) -> AuthLevel {
        self.identities
            .read()
            .get(&node_id)
            .map(|i| i.level)
            .unwrap_or(AuthLevel::None)
    }

    pub fn last_verified(&self, node_id: NodeId) -> Option<DateTime<Utc>> {
        self.identities.read().get(&node_id).and_then(|i| i.last_verified)
    }

    /// Revocation removes the identity entirely; it is not merely
    /// deactivated.
    pub fn revoke(&self, node_id: NodeId) {
        self.identities.write().remove(&node_id);
        self.failures.write().remove(&node_id);
    }

    /// Signs `payload` with `node_id`'s stored secret. Used by the
    /// in-process orchestrator acting on a node's behalf (sandbox
    /// execution and signing both happen inside this same process in
    /// a single-node deployment) — never exposed over the API surface,
    /// which only ever accepts signatures, not secrets.
    pub fn sign_as<T: Serialize>(&self, node_id: NodeId, payload: &T, timestamp: i64) -> DuxResult<String> {
        let secret = self
            .identities
            .read()
            .get(&node_id)
            .map(|i| i.secret)
            .ok_or_else(|| DuxError::auth("unknown node_id"))?;
        Self::sign(&secret, payload, timestamp)
    }

    fn is_rate_limited(&self, node_id: NodeId, now_ts: i64) -> bool {
        let failures = self.failures.read();
        match failures.get(&node_id) {
            Some(window) => window.count_since(now_ts - AUTH_WINDOW_SECONDS) >= MAX_AUTH_ATTEMPTS,
            None => false,
        }
    }

    fn record_failure(&self, node_id: NodeId, now_ts: i64) {
        let mut failures = self.failures.write();
        failures
            .entry(node_id)
            .or_insert_with(|| FailureWindow::new(MAX_AUTH_ATTEMPTS))
            .record(now_ts);
    }

    fn reset_failures(&self, node_id: NodeId) {
        if let Some(window) = self.failures.write().get_mut(&node_id) {
            window.reset();
        }
    }

    /// Signs `payload` with `secret` using the canonical message form
    /// `JSON(payload, sorted_keys) || timestamp`.
    pub fn sign<T: Serialize>(secret: &[u8; 32], payload: &T, timestamp: i64) -> DuxResult<String> {
        let message = canonical_message(payload, timestamp)?;
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| DuxError::internal(format!("hmac key error: {e}")))?;
        mac.update(&message);
        let tag = mac.finalize().into_bytes();
        Ok(base64::engine::general_purpose::STANDARD.encode(tag))
    }

    /// Verifies a signed message for `node_id`. Requires: a known
    /// node, a timestamp within ±300s of now, the node not currently
    /// rate-limit-suspended, and a matching HMAC tag. A non-matching
    /// signature and an expired timestamp both count as a failed
    /// authentication for rate-limiting purposes; an already
    /// rate-limited node is rejected without attempting verification
    /// (so a 6th attempt is rejected "even if it would verify", §4.2).
    pub fn verify<T: Serialize>(
        &self,
        node_id: NodeId,
        payload: &T,
        timestamp: i64,
        signature_b64: &str,
        now_ts: i64,
    ) -> DuxResult<()> {
        if self.is_rate_limited(node_id, now_ts) {
            return Err(DuxError::auth("node is rate-limit-suspended"));
        }

        let secret = {
            let identities = self.identities.read();
            identities
                .get(&node_id)
                .map(|i| i.secret)
                .ok_or_else(|| DuxError::auth("unknown node_id"))?
        };

        if (now_ts - timestamp).abs() > SIGNATURE_TTL_SECONDS {
            self.record_failure(node_id, now_ts);
            return Err(DuxError::auth("timestamp outside of validity window"));
        }

        let expected = Self::sign(&secret, payload, timestamp)?;
        let provided = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|_| DuxError::auth("malformed signature"))?;
        let expected_bytes = base64::engine::general_purpose::STANDARD
            .decode(&expected)
            .expect("expected signature always valid base64");

        if provided != expected_bytes {
            self.record_failure(node_id, now_ts);
            return Err(DuxError::auth("signature mismatch"));
        }

        self.reset_failures(node_id);
        if let Some(identity) = self.identities.write().get_mut(&node_id) {
            identity.last_verified = Some(Utc::now());
        }
        Ok(())
    }
}

fn canonical_message<T: Serialize>(payload: &T, timestamp: i64) -> DuxResult<Vec<u8>> {
    let value = serde_json::to_value(payload)
        .map_err(|e| DuxError::internal(format!("payload not serializable: {e}")))?;
    let canonical = duxnet_core::canonicalize(&value);
    let mut bytes = serde_json::to_vec(&canonical)
        .map_err(|e| DuxError::internal(format!("canonical payload not serializable: {e}")))?;
    bytes.extend_from_slice(timestamp.to_string().as_bytes());
    Ok(bytes)
}

/// The canonical payload for an escrow release signature (§6).
#[derive(Debug, Clone, Serialize)]
pub struct EscrowReleasePayload {
    pub escrow_id: uuid::Uuid,
    pub result_hash: String,
    pub action: &'static str,
    pub timestamp: i64,
}

impl EscrowReleasePayload {
    pub fn new(escrow_id: uuid::Uuid, result_hash: String, timestamp: i64) -> Self {
        Self {
            escrow_id,
            result_hash,
            action: "release",
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_then_verify_roundtrip() {
        let auth = Authenticator::new();
        let node_id = uuid::Uuid::new_v4();
        let secret = auth.issue(node_id);
        let payload = json!({"hello": "world"});
        let now_ts = 1_000_000i64;
        let sig = Authenticator::sign(&secret, &payload, now_ts).unwrap();
        auth.verify(node_id, &payload, now_ts, &sig, now_ts).unwrap();
    }

    #[test]
    fn tampered_payload_fails() {
        let auth = Authenticator::new();
        let node_id = uuid::Uuid::new_v4();
        let secret = auth.issue(node_id);
        let now_ts = 1_000_000i64;
        let sig = Authenticator::sign(&secret, &json!({"a": 1}), now_ts).unwrap();
        let err = auth
            .verify(node_id, &json!({"a": 2}), now_ts, &sig, now_ts)
            .unwrap_err();
        assert!(matches!(err, DuxError::Auth(_)));
    }

    #[test]
    fn timestamp_boundary_300_ok_301_rejected() {
        let auth = Authenticator::new();
        let node_id = uuid::Uuid::new_v4();
        let secret = auth.issue(node_id);
        let payload = json!({"x": 1});
        let ts = 1_000_000i64;

        let sig = Authenticator::sign(&secret, &payload, ts).unwrap();
        auth.verify(node_id, &payload, ts, &sig, ts + 300).unwrap();

        let auth2 = Authenticator::new();
        let secret2 = auth2.issue(node_id);
        let sig2 = Authenticator::sign(&secret2, &payload, ts).unwrap();
        let err = auth2.verify(node_id, &payload, ts, &sig2, ts + 301).unwrap_err();
        assert!(matches!(err, DuxError::Auth(_)));
    }

    #[test]
    fn sixth_failure_in_window_is_rate_limited() {
        let auth = Authenticator::new();
        let node_id = uuid::Uuid::new_v4();
        auth.issue(node_id);
        let payload = json!({"a": 1});
        let bad_sig = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        for _ in 0..5 {
            let _ = auth.verify(node_id, &payload, 0, &bad_sig, 0);
        }
        let err = auth.verify(node_id, &payload, 0, &bad_sig, 0).unwrap_err();
        assert!(matches!(err, DuxError::Auth(_)));
        assert!(auth.is_rate_limited(node_id, 0));
    }

    #[test]
    fn successful_verification_resets_failure_counter() {
        let auth = Authenticator::new();
        let node_id = uuid::Uuid::new_v4();
        let secret = auth.issue(node_id);
        let payload = json!({"a": 1});
        let bad_sig = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        for _ in 0..4 {
            let _ = auth.verify(node_id, &payload, 0, &bad_sig, 0);
        }
        let good_sig = Authenticator::sign(&secret, &payload, 0).unwrap();
        auth.verify(node_id, &payload, 0, &good_sig, 0).unwrap();
        assert!(!auth.is_rate_limited(node_id, 0));
    }

    #[test]
    fn revoke_removes_identity() {
        let auth = Authenticator::new();
        let node_id = uuid::Uuid::new_v4();
        auth.issue(node_id);
        auth.revoke(node_id);
        assert_eq!(auth.level_of(node_id), AuthLevel::None);
    }

    #[test]
    fn authorization_map() {
        assert!(authorize(Operation::Query, AuthLevel::Basic));
        assert!(!authorize(Operation::Query, AuthLevel::None));
        assert!(authorize(Operation::Register, AuthLevel::Signed));
        assert!(!authorize(Operation::Register, AuthLevel::Basic));
        assert!(authorize(Operation::Administrative, AuthLevel::Verified));
        assert!(!authorize(Operation::Administrative, AuthLevel::Signed));
    }
}
