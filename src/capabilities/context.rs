//! Capability Context (C3) — spec §4.3 / §3.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::capabilities::pattern::ResourcePattern;
use crate::capabilities::token::CapabilityToken;

/// A restriction a child context applies to tokens inherited from its
/// parent(s). Restrictions only ever narrow what's reachable — spec §3:
/// "Child contexts may further restrict (never broaden) the
/// patterns/operations inherited from a parent."
#[derive(Debug, Clone, Default)]
pub struct Restriction {
    pub resource_patterns: Vec<ResourcePattern>,
    pub allowed_operations: Option<std::collections::HashSet<String>>,
}

impl Restriction {
    pub fn allows(&self, resource: &str, op: &str) -> bool {
        let pattern_ok = self.resource_patterns.is_empty()
            || self.resource_patterns.iter().any(|p| p.matches(resource));
        let op_ok = match &self.allowed_operations {
            Some(ops) => ops.contains(op),
            None => true,
        };
        pattern_ok && op_ok
    }
}

/// A frame holding a set of tokens and a parent link (spec §3).
///
/// The parent chain is built once at construction (`parent` is set exactly
/// once and never rewritten), which is what rules out cycles "by
/// construction" per spec §9 — no back-pointer from parent to child is ever
/// created, so there is no way to close a loop.
pub struct CapabilityContext {
    id: Uuid,
    parent: Option<Arc<CapabilityContext>>,
    restriction: Option<Restriction>,
    tokens: DashMap<String, Vec<Arc<CapabilityToken>>>,
    created_at: DateTime<Utc>,
    active: AtomicBool,
    /// Bumped on every mutation (grant/deactivate) so cache fingerprints
    /// computed against this context become unreachable after a change,
    /// without needing to scan and evict stale cache entries.
    generation: AtomicU64,
}

impl CapabilityContext {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::nil(),
            parent: None,
            restriction: None,
            tokens: DashMap::new(),
            created_at: Utc::now(),
            active: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        })
    }

    pub fn child(parent: Arc<CapabilityContext>, restriction: Option<Restriction>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            parent: Some(parent),
            restriction,
            tokens: DashMap::new(),
            created_at: Utc::now(),
            active: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<CapabilityContext>> {
        self.parent.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn depth(&self) -> usize {
        match &self.parent {
            Some(p) => 1 + p.depth(),
            None => 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// A context is *effective* iff it and all ancestors are active (spec §3).
    pub fn is_effective(&self) -> bool {
        self.is_active() && self.parent.as_ref().map_or(true, |p| p.is_effective())
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn grant(&self, token: Arc<CapabilityToken>) {
        self.tokens
            .entry(token.type_name().to_string())
            .or_default()
            .push(token);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Tokens of `cap_type` granted directly in this frame (not ancestors).
    pub fn own_tokens(&self, cap_type: &str) -> Vec<Arc<CapabilityToken>> {
        self.tokens
            .get(cap_type)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// All tokens of `cap_type` reachable from this context: its own tokens
    /// plus every ancestor's, each ancestor's tokens filtered by every
    /// restriction between this context and that ancestor (spec §3
    /// "reachable from C", §4.3 "Inheritance").
    pub fn reachable_tokens(&self, cap_type: &str) -> Vec<(usize, Arc<CapabilityToken>)> {
        let mut out: Vec<(usize, Arc<CapabilityToken>)> = self
            .own_tokens(cap_type)
            .into_iter()
            .map(|t| (self.depth(), t))
            .collect();

        if let Some(parent) = &self.parent {
            let parent_tokens = parent.reachable_tokens(cap_type);
            let restriction = self.restriction.as_ref();
            for (depth, token) in parent_tokens {
                if let Some(r) = restriction {
                    // A restricted token is only reachable for (resource, op)
                    // pairs satisfying both the token and the restriction;
                    // since reachability itself isn't resource-scoped, we
                    // conservatively keep the token reachable here and let
                    // the manager's per-(resource, op) walk apply `allows`.
                    out.push((depth, token));
                    let _ = r;
                } else {
                    out.push((depth, token));
                }
            }
        }
        out
    }

    pub fn restriction(&self) -> Option<&Restriction> {
        self.restriction.as_ref()
    }

    /// True iff `(resource, op)` would be accepted by every restriction on
    /// the path from `self` up to (not including) the ancestor that
    /// actually owns `token`. Used by the manager's walk to decide whether
    /// an inherited token is usable for a specific access.
    pub fn restrictions_allow(&self, resource: &str, op: &str) -> bool {
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            if let Some(r) = ctx.restriction.as_ref() {
                if !r.allows(resource, op) {
                    return false;
                }
            }
            cur = ctx.parent.as_deref();
        }
        true
    }

    /// Cache-invalidation fingerprint: combines this context's and every
    /// ancestor's `(id, generation)`, so any grant/deactivate anywhere on
    /// the chain changes the fingerprint (spec §4.3 "Concurrency").
    pub fn chain_fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            ctx.id.hash(&mut hasher);
            ctx.generation.load(Ordering::SeqCst).hash(&mut hasher);
            cur = ctx.parent.as_deref();
        }
        hasher.finish()
    }
}

impl std::fmt::Debug for CapabilityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityContext")
            .field("id", &self.id)
            .field("depth", &self.depth())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;

    fn token(cap_type: &str, pattern: &str, op: &str) -> Arc<CapabilityToken> {
        let vocab: Set<String> = [op.to_string()].into_iter().collect();
        Arc::new(
            CapabilityToken::create(cap_type, vec![pattern], vec![op], &vocab, None, None, Uuid::nil())
                .unwrap(),
        )
    }

    #[test]
    fn child_inherits_parent_tokens_without_copying() {
        let root = CapabilityContext::root();
        root.grant(token("file_read", "data/*.txt", "read"));
        let child = CapabilityContext::child(root.clone(), None);
        let reachable = child.reachable_tokens("file_read");
        assert_eq!(reachable.len(), 1);
    }

    #[test]
    fn restriction_narrows_not_broadens() {
        let root = CapabilityContext::root();
        root.grant(token("file_read", "data/**", "read"));
        let restriction = Restriction {
            resource_patterns: vec![ResourcePattern::new("data/sub/*.txt").unwrap()],
            allowed_operations: None,
        };
        let child = CapabilityContext::child(root.clone(), Some(restriction));
        assert!(child.restrictions_allow("data/sub/a.txt", "read"));
        assert!(!child.restrictions_allow("data/other.txt", "read"));
    }

    #[test]
    fn effective_requires_whole_chain_active() {
        let root = CapabilityContext::root();
        let child = CapabilityContext::child(root.clone(), None);
        assert!(child.is_effective());
        root.deactivate();
        assert!(!child.is_effective());
    }

    #[test]
    fn fingerprint_changes_on_grant() {
        let root = CapabilityContext::root();
        let fp1 = root.chain_fingerprint();
        root.grant(token("file_read", "*.txt", "read"));
        let fp2 = root.chain_fingerprint();
        assert_ne!(fp1, fp2);
    }
}
