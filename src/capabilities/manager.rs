//! Capability Manager (C4) — spec §4.3.
//!
//! Process-wide registry of active contexts keyed by execution-flow
//! identity. Grounded in the teacher's reach for `dashmap` wherever a
//! shared, thread-safe registry is needed (`ccos::capability_marketplace`,
//! `rtfs::runtime::module_runtime`) rather than a single global `Mutex`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::capabilities::context::{CapabilityContext, Restriction};
use crate::capabilities::token::CapabilityToken;
use crate::error::{CapabilityDenialReason, CoreError, CoreResult};

/// Opaque logical-flow identity. Defaults to the calling OS thread, but an
/// explicit handle can be minted and carried across suspension points if
/// the embedding language later grows coroutines (spec §9 "Generators/
/// async").
pub type FlowId = u64;

pub fn current_thread_flow() -> FlowId {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone, Copy)]
struct CacheEntry {
    /// `None` = negative (denied); `Some(id)` = the token that last
    /// satisfied this fingerprint.
    token: Option<Uuid>,
    /// Negative entries expire after `capability_check_ttl_ms`; positive
    /// entries are kept until the fingerprint itself changes.
    expires_at_ms: Option<i64>,
}

/// Process-wide registry of active capability contexts (spec §4.3).
///
/// A context's own token map is a [`DashMap`] internally (see
/// [`CapabilityContext`]), and the manager's per-flow stacks and lookup
/// cache are `DashMap`s too. Because no public method calls another public,
/// locking method while already holding one of its own shard guards, this
/// gives the "single shared lock (re-entrant)" behavior spec §4.3 asks for
/// without needing an actual OS-level reentrant mutex (see DESIGN.md).
pub struct CapabilityManager {
    root: Arc<CapabilityContext>,
    contexts: DashMap<Uuid, Arc<CapabilityContext>>,
    stacks: DashMap<FlowId, Vec<Uuid>>,
    cache: DashMap<(Uuid, u64, String, String, String), CacheEntry>,
    negative_cache_ttl_ms: i64,
}

impl CapabilityManager {
    pub fn new() -> Self {
        Self::with_negative_cache_ttl(1_000)
    }

    pub fn with_negative_cache_ttl(ttl_ms: u64) -> Self {
        let root = CapabilityContext::root();
        let contexts = DashMap::new();
        contexts.insert(root.id(), root.clone());
        Self {
            root,
            contexts,
            stacks: DashMap::new(),
            cache: DashMap::new(),
            negative_cache_ttl_ms: ttl_ms as i64,
        }
    }

    pub fn root(&self) -> Arc<CapabilityContext> {
        self.root.clone()
    }

    /// The active context for the calling thread, or the root context if
    /// the calling flow has never entered a scope.
    pub fn current_context(&self) -> Arc<CapabilityContext> {
        self.current_context_for(current_thread_flow())
    }

    pub fn current_context_for(&self, flow: FlowId) -> Arc<CapabilityContext> {
        self.stacks
            .get(&flow)
            .and_then(|stack| stack.last().and_then(|id| self.contexts.get(id).map(|c| c.clone())))
            .unwrap_or_else(|| self.root.clone())
    }

    /// Push a new child context onto the calling flow's stack, restricted
    /// against its (current) parent. Returns the new context's id; pair
    /// with [`Self::exit`] or prefer [`Self::enter_scoped`] for guaranteed
    /// pairing on every exit path (spec §9 "Scoped acquisition").
    pub fn enter(&self, restriction: Option<Restriction>) -> Arc<CapabilityContext> {
        self.enter_for(current_thread_flow(), restriction)
    }

    pub fn enter_for(&self, flow: FlowId, restriction: Option<Restriction>) -> Arc<CapabilityContext> {
        let parent = self.current_context_for(flow);
        let child = CapabilityContext::child(parent, restriction);
        self.contexts.insert(child.id(), child.clone());
        self.stacks.entry(flow).or_default().push(child.id());
        child
    }

    pub fn exit(&self) {
        self.exit_for(current_thread_flow());
    }

    pub fn exit_for(&self, flow: FlowId) {
        if let Some(mut stack) = self.stacks.get_mut(&flow) {
            if let Some(id) = stack.pop() {
                if let Some(ctx) = self.contexts.get(&id) {
                    ctx.deactivate();
                }
            }
        }
    }

    /// RAII scope: pops on drop regardless of how the body exits, including
    /// panics during unwind (spec §9: "pop runs on every exit path").
    pub fn enter_scoped(self: &Arc<Self>, restriction: Option<Restriction>) -> ContextGuard {
        let flow = current_thread_flow();
        let ctx = self.enter_for(flow, restriction);
        ContextGuard {
            manager: Arc::clone(self),
            flow,
            context: ctx,
        }
    }

    pub fn grant(&self, token: Arc<CapabilityToken>) {
        self.current_context().grant(token);
    }

    pub fn grant_to(&self, context: &CapabilityContext, token: Arc<CapabilityToken>) {
        context.grant(token);
    }

    fn fingerprint_key(
        &self,
        context: &CapabilityContext,
        cap_type: &str,
        resource: &str,
        op: &str,
    ) -> (Uuid, u64, String, String, String) {
        (
            context.id(),
            context.chain_fingerprint(),
            cap_type.to_string(),
            resource.to_string(),
            op.to_string(),
        )
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Walk the current context's reachable tokens of `cap_type` and return
    /// the ones that pass both `check` and any restriction on the path
    /// (spec §4.3 `has_capability`/`use_capability`), deterministically
    /// ordered by `(depth asc, created_at asc)`.
    fn candidates(
        &self,
        context: &CapabilityContext,
        cap_type: &str,
        resource: &str,
        op: &str,
    ) -> Vec<Arc<CapabilityToken>> {
        let mut candidates: Vec<(usize, chrono::DateTime<chrono::Utc>, Arc<CapabilityToken>)> =
            context
                .reachable_tokens(cap_type)
                .into_iter()
                .filter(|(_, token)| token.check(resource, op).is_ok())
                .filter(|_| context.restrictions_allow(resource, op))
                .map(|(depth, token)| (depth, token.created_at(), token))
                .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, _, t)| t).collect()
    }

    /// `has_capability(type, resource, op)` — spec §4.3. Walks the current
    /// context's parent chain; true iff any reachable token passes `check`.
    pub fn has_capability(&self, cap_type: &str, resource: &str, op: &str) -> bool {
        if !self.current_context().is_effective() {
            return false;
        }
        let context = self.current_context();
        let key = self.fingerprint_key(&context, cap_type, resource, op);
        if let Some(entry) = self.cache.get(&key) {
            match entry.token {
                Some(_) => return true,
                None => {
                    if entry
                        .expires_at_ms
                        .map(|exp| Self::now_ms() < exp)
                        .unwrap_or(true)
                    {
                        return false;
                    }
                }
            }
        }

        let candidates = self.candidates(&context, cap_type, resource, op);
        let hit = candidates.first().map(|t| t.id());
        self.cache.insert(
            key,
            CacheEntry {
                token: hit,
                expires_at_ms: if hit.is_none() {
                    Some(Self::now_ms() + self.negative_cache_ttl_ms)
                } else {
                    None
                },
            },
        );
        hit.is_some()
    }

    /// `use_capability(type, resource, op)` — spec §4.3. Same walk, but
    /// calls `consume` on the first matching token, falling through to the
    /// next candidate if a race loses the usage-count compare-exchange.
    pub fn use_capability(&self, cap_type: &str, resource: &str, op: &str) -> CoreResult<()> {
        if !self.current_context().is_effective() {
            return Err(CoreError::CapabilityDenied {
                resource: resource.to_string(),
                operation: op.to_string(),
                reason: CapabilityDenialReason::NotFound,
            });
        }
        let context = self.current_context();
        let candidates = self.candidates(&context, cap_type, resource, op);
        if candidates.is_empty() {
            let key = self.fingerprint_key(&context, cap_type, resource, op);
            self.cache.insert(
                key,
                CacheEntry {
                    token: None,
                    expires_at_ms: Some(Self::now_ms() + self.negative_cache_ttl_ms),
                },
            );
            debug!(cap_type, resource, op, "capability denied: no reachable token");
            return Err(CoreError::CapabilityDenied {
                resource: resource.to_string(),
                operation: op.to_string(),
                reason: CapabilityDenialReason::NotFound,
            });
        }
        for token in &candidates {
            if token.consume(resource, op).is_ok() {
                return Ok(());
            }
        }
        debug!(cap_type, resource, op, "capability denied: usage exhausted on every candidate");
        Err(CoreError::CapabilityDenied {
            resource: resource.to_string(),
            operation: op.to_string(),
            reason: CapabilityDenialReason::UsageExhausted,
        })
    }
}

impl Default for CapabilityManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard pairing [`CapabilityManager::enter`]/[`CapabilityManager::exit`].
pub struct ContextGuard {
    manager: Arc<CapabilityManager>,
    flow: FlowId,
    context: Arc<CapabilityContext>,
}

impl ContextGuard {
    pub fn context(&self) -> &Arc<CapabilityContext> {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.manager.exit_for(self.flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;

    fn token(cap_type: &str, pattern: &str, op: &str, max_usage: Option<u64>) -> Arc<CapabilityToken> {
        let vocab: Set<String> = [op.to_string()].into_iter().collect();
        Arc::new(
            CapabilityToken::create(cap_type, vec![pattern], vec![op], &vocab, None, max_usage, Uuid::nil())
                .unwrap(),
        )
    }

    #[test]
    fn enter_exit_restores_previous_context_even_on_panic() {
        let manager = Arc::new(CapabilityManager::new());
        let root_id = manager.current_context().id();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = manager.enter_scoped(None);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(manager.current_context().id(), root_id);
    }

    #[test]
    fn has_capability_true_in_child_when_granted_in_parent() {
        let manager = CapabilityManager::new();
        manager.grant(token("file_read", "data/*.txt", "read", None));
        let child = manager.enter(None);
        assert!(manager.has_capability("file_read", "data/a.txt", "read"));
        manager.exit();
        let _ = child;
    }

    #[test]
    fn restriction_blocks_what_parent_would_allow() {
        let manager = CapabilityManager::new();
        manager.grant(token("file_read", "data/**", "read", None));
        let restriction = Restriction {
            resource_patterns: vec![crate::capabilities::pattern::ResourcePattern::new("data/sub/*").unwrap()],
            allowed_operations: None,
        };
        manager.enter(Some(restriction));
        assert!(manager.has_capability("file_read", "data/sub/a.txt", "read"));
        assert!(!manager.has_capability("file_read", "data/other.txt", "read"));
        manager.exit();
    }

    #[test]
    fn use_capability_denied_on_pattern_mismatch() {
        let manager = CapabilityManager::new();
        manager.grant(token("file_read", "data/*.txt", "read", None));
        let err = manager.use_capability("file_read", "etc/passwd", "read").unwrap_err();
        assert!(matches!(err, CoreError::CapabilityDenied { .. }));
    }

    #[test]
    fn use_capability_consumes_and_exhausts() {
        let manager = CapabilityManager::new();
        manager.grant(token("file_read", "data/*.txt", "read", Some(1)));
        assert!(manager.use_capability("file_read", "data/a.txt", "read").is_ok());
        let err = manager
            .use_capability("file_read", "data/a.txt", "read")
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::CapabilityDenied {
                reason: CapabilityDenialReason::UsageExhausted,
                ..
            }
        ));
    }
}
