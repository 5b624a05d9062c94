//! Capability Token (C2) — spec §4.2.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capabilities::pattern::ResourcePattern;
use crate::error::{CapabilityDenialReason, CoreError, CoreResult};

/// Immutable (save for the monotonic usage counter and revocation flag)
/// credential granting operations on a family of resources.
///
/// `id`, `type_name`, `resource_patterns`, `allowed_operations`, `created_at`,
/// `expires_at`, `max_usage` and `creator_context_id` never change after
/// construction — only `usage_count` and `revoked` mutate, and only through
/// atomics, so a `CapabilityToken` is safely shared behind `Arc` across
/// contexts and threads without an external lock.
#[derive(Debug)]
pub struct CapabilityToken {
    id: Uuid,
    type_name: String,
    resource_patterns: Vec<ResourcePattern>,
    allowed_operations: HashSet<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    max_usage: Option<u64>,
    usage_count: AtomicU64,
    revoked: AtomicBool,
    creator_context_id: Uuid,
}

/// Wire-safe, fully-owned view of a token's public fields — what crosses the
/// sandbox process boundary (spec §4.6 point 2: "tokens reduced to their
/// public fields; secrets never cross"). There are no secrets on a
/// `CapabilityToken` today, but the snapshot type keeps the serialization
/// boundary explicit and stable even if one is added later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub id: Uuid,
    pub type_name: String,
    pub resource_patterns: Vec<String>,
    pub allowed_operations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_usage: Option<u64>,
    pub usage_count: u64,
    pub creator_context_id: Uuid,
}

impl CapabilityToken {
    /// Mint a new token. Fails with [`CoreError::InvalidConstraint`] if
    /// `patterns`/`ops` are empty, `ops` contains a name outside
    /// `type_vocabulary`, or `ttl` is non-positive (spec §4.2 `create`).
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        type_name: impl Into<String>,
        patterns: impl IntoIterator<Item = impl Into<String>>,
        ops: impl IntoIterator<Item = impl Into<String>>,
        type_vocabulary: &HashSet<String>,
        ttl: Option<chrono::Duration>,
        max_usage: Option<u64>,
        creator_context_id: Uuid,
    ) -> CoreResult<Self> {
        let type_name = type_name.into();

        let resource_patterns: Vec<ResourcePattern> = patterns
            .into_iter()
            .map(|p| ResourcePattern::new(p.into()))
            .collect::<Result<_, _>>()
            .map_err(CoreError::InvalidConstraint)?;
        if resource_patterns.is_empty() {
            return Err(CoreError::InvalidConstraint(
                "token must declare at least one resource pattern".into(),
            ));
        }

        let allowed_operations: HashSet<String> =
            ops.into_iter().map(Into::into).collect();
        if allowed_operations.is_empty() {
            return Err(CoreError::InvalidConstraint(
                "token must declare at least one allowed operation".into(),
            ));
        }
        for op in &allowed_operations {
            if !type_vocabulary.contains(op) {
                return Err(CoreError::InvalidConstraint(format!(
                    "operation '{}' is not in the vocabulary for capability type '{}'",
                    op, type_name
                )));
            }
        }

        let created_at = Utc::now();
        let expires_at = match ttl {
            Some(d) if d <= chrono::Duration::zero() => {
                return Err(CoreError::InvalidConstraint(
                    "ttl must be positive".into(),
                ));
            }
            Some(d) => Some(created_at + d),
            None => None,
        };
        if let Some(m) = max_usage {
            if m == 0 {
                return Err(CoreError::InvalidConstraint(
                    "max_usage must be positive when set".into(),
                ));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            type_name,
            resource_patterns,
            allowed_operations,
            created_at,
            expires_at,
            max_usage,
            usage_count: AtomicU64::new(0),
            revoked: AtomicBool::new(false),
            creator_context_id,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn creator_context_id(&self) -> Uuid {
        self.creator_context_id
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::SeqCst)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Active revocation (spec §3 "Lifecycles": tokens "expire ... actively
    /// (revocation)").
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() >= exp,
            None => false,
        }
    }

    /// A token is valid iff not expired, not revoked, and `usage_count <
    /// max_usage` (spec §3 invariants).
    pub fn is_valid(&self) -> bool {
        if self.is_revoked() || self.is_expired() {
            return false;
        }
        match self.max_usage {
            Some(max) => self.usage_count() < max,
            None => true,
        }
    }

    fn matches_pattern(&self, resource: &str) -> bool {
        self.resource_patterns.iter().any(|p| p.matches(resource))
    }

    fn reason_for_denial(&self, resource: &str, op: &str) -> CapabilityDenialReason {
        if self.is_revoked() || self.is_expired() {
            CapabilityDenialReason::Expired
        } else if let Some(max) = self.max_usage {
            if self.usage_count() >= max {
                return CapabilityDenialReason::UsageExhausted;
            }
            if !self.matches_pattern(resource) {
                CapabilityDenialReason::PatternMismatch
            } else {
                CapabilityDenialReason::OperationDenied
            }
        } else if !self.matches_pattern(resource) {
            CapabilityDenialReason::PatternMismatch
        } else {
            CapabilityDenialReason::OperationDenied
        }
    }

    /// Pure check — does not mutate `usage_count` (spec §4.2 `check`).
    pub fn check(&self, resource: &str, op: &str) -> CoreResult<()> {
        if self.is_valid() && self.matches_pattern(resource) && self.allowed_operations.contains(op)
        {
            Ok(())
        } else {
            Err(CoreError::CapabilityDenied {
                resource: resource.to_string(),
                operation: op.to_string(),
                reason: self.reason_for_denial(resource, op),
            })
        }
    }

    /// Atomically verifies and increments `usage_count`; fails if concurrent
    /// consumption would exceed `max_usage` (spec §4.2 `consume`).
    pub fn consume(&self, resource: &str, op: &str) -> CoreResult<()> {
        if !self.matches_pattern(resource) || !self.allowed_operations.contains(op) {
            return self.check(resource, op);
        }
        if self.is_revoked() || self.is_expired() {
            return self.check(resource, op);
        }

        match self.max_usage {
            None => {
                self.usage_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(max) => {
                let mut current = self.usage_count.load(Ordering::SeqCst);
                loop {
                    if current >= max {
                        return Err(CoreError::CapabilityDenied {
                            resource: resource.to_string(),
                            operation: op.to_string(),
                            reason: CapabilityDenialReason::UsageExhausted,
                        });
                    }
                    match self.usage_count.compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return Ok(()),
                        Err(observed) => current = observed,
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            id: self.id,
            type_name: self.type_name.clone(),
            resource_patterns: self
                .resource_patterns
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            allowed_operations: self.allowed_operations.iter().cloned().collect(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            max_usage: self.max_usage,
            usage_count: self.usage_count(),
            creator_context_id: self.creator_context_id,
        }
    }

    /// Reconstruct a token from a snapshot, e.g. in the sandboxed child
    /// process (spec §4.6 point 4). The reconstructed token is a distinct
    /// object — "tokens minted in the child are not reusable in the parent"
    /// and the converse holds too: this is a *copy* seeded with the parent's
    /// usage count, not a handle back to the original.
    pub fn from_snapshot(snapshot: TokenSnapshot) -> CoreResult<Self> {
        let resource_patterns = snapshot
            .resource_patterns
            .into_iter()
            .map(ResourcePattern::new)
            .collect::<Result<_, _>>()
            .map_err(CoreError::InvalidConstraint)?;
        Ok(Self {
            id: snapshot.id,
            type_name: snapshot.type_name,
            resource_patterns,
            allowed_operations: snapshot.allowed_operations.into_iter().collect(),
            created_at: snapshot.created_at,
            expires_at: snapshot.expires_at,
            max_usage: snapshot.max_usage,
            usage_count: AtomicU64::new(snapshot.usage_count),
            revoked: AtomicBool::new(false),
            creator_context_id: snapshot.creator_context_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn vocab(ops: &[&str]) -> HashSet<String> {
        ops.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn create_rejects_empty_patterns() {
        let v = vocab(&["read"]);
        let err = CapabilityToken::create(
            "file_read",
            Vec::<String>::new(),
            vec!["read"],
            &v,
            None,
            None,
            Uuid::nil(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConstraint(_)));
    }

    #[test]
    fn create_rejects_op_outside_vocabulary() {
        let v = vocab(&["read"]);
        let err = CapabilityToken::create(
            "file_read",
            vec!["*.txt"],
            vec!["delete"],
            &v,
            None,
            None,
            Uuid::nil(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConstraint(_)));
    }

    #[test]
    fn create_rejects_nonpositive_ttl() {
        let v = vocab(&["read"]);
        let err = CapabilityToken::create(
            "file_read",
            vec!["*.txt"],
            vec!["read"],
            &v,
            Some(chrono::Duration::seconds(0)),
            None,
            Uuid::nil(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConstraint(_)));
    }

    #[test]
    fn check_succeeds_on_pattern_and_op_match() {
        let v = vocab(&["read"]);
        let t = CapabilityToken::create(
            "file_read",
            vec!["data/*.txt"],
            vec!["read"],
            &v,
            None,
            None,
            Uuid::nil(),
        )
        .unwrap();
        assert!(t.check("data/a.txt", "read").is_ok());
        assert!(t.check("etc/passwd", "read").is_err());
    }

    #[test]
    fn consume_succeeds_only_if_check_succeeds() {
        let v = vocab(&["read"]);
        let t = CapabilityToken::create(
            "file_read",
            vec!["data/*.txt"],
            vec!["read"],
            &v,
            None,
            Some(1),
            Uuid::nil(),
        )
        .unwrap();
        assert!(t.consume("etc/passwd", "read").is_err());
        assert_eq!(t.usage_count(), 0);
        assert!(t.consume("data/a.txt", "read").is_ok());
        assert!(t.consume("data/a.txt", "read").is_err());
        assert_eq!(t.usage_count(), 1);
    }

    #[test]
    fn concurrent_consume_respects_max_usage() {
        let v = vocab(&["read"]);
        let t = Arc::new(
            CapabilityToken::create(
                "file_read",
                vec!["data/*.txt"],
                vec!["read"],
                &v,
                None,
                Some(10),
                Uuid::nil(),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || t.consume("data/a.txt", "read").is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 10);
        assert_eq!(t.usage_count(), 10);
    }

    #[test]
    fn snapshot_round_trip_preserves_usage_count() {
        use pretty_assertions::assert_eq;

        let v = vocab(&["read"]);
        let t = CapabilityToken::create(
            "file_read",
            vec!["data/*.txt"],
            vec!["read"],
            &v,
            None,
            Some(5),
            Uuid::nil(),
        )
        .unwrap();
        t.consume("data/a.txt", "read").unwrap();
        let snap = t.snapshot();
        let restored = CapabilityToken::from_snapshot(snap.clone()).unwrap();
        assert_eq!(restored.usage_count(), snap.usage_count);
        assert!(restored.check("data/a.txt", "read").is_ok());
    }
}
