use std::sync::Arc;

use parking_lot::Mutex;

/// Per-entry mutation state shared by every dispatch on the same servant.
///
/// A cookie is handed out by `Evictor::locate` and passed back to
/// `Evictor::finished`; in between, the dispatch layer updates it through
/// the hooks of the active [`MutationStrategy`]. The evictor reads it only
/// to decide whether a servant must be saved before eviction.
#[derive(Clone)]
pub struct Cookie(Arc<Mutex<CookieState>>);

struct CookieState {
    mutated: bool,
    // nested dispatches on the same servant, always 0 under
    // MutationStrategy::Eviction
    mutating_depth: u32,
    // total markings ever; lets an in-flight save detect that its state
    // snapshot went stale while the cache's lock was released
    mutation_count: u64,
}

impl CookieState {
    fn mark(&mut self) {
        self.mutated = true;
        self.mutation_count += 1;
    }
}

impl Cookie {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(CookieState {
            mutated: false,
            mutating_depth: 0,
            mutation_count: 0,
        })))
    }

    /// Marks the servant's persisted state as stale.
    ///
    /// Under [`MutationStrategy::Eviction`] the dispatch layer calls this
    /// directly when the invoked operation is declared mutating.
    pub fn mark_mutated(&self) {
        self.0.lock().mark();
    }

    pub fn is_mutated(&self) -> bool {
        self.0.lock().mutated
    }

    /// Never reset, not even by a save; two equal readings bracket a window
    /// with no new mutation.
    pub(crate) fn mutation_count(&self) -> u64 {
        self.0.lock().mutation_count
    }

    #[cfg(test)]
    pub(crate) fn mutating_depth(&self) -> u32 {
        self.0.lock().mutating_depth
    }
}

/// Decides, from the cookie alone, whether a servant is dirty and must be
/// written back before eviction. The cache itself never inspects the cookie.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationStrategy {
    /// Eager: the dispatch layer marks the cookie itself
    /// (see [`Cookie::mark_mutated`]) based on declared operation mutability.
    Eviction,
    /// Lazy, reentrant-safe: tracks a nested-dispatch depth so a save can
    /// never race a still-in-flight nested mutation on the same servant.
    Idle,
}

impl MutationStrategy {
    /// Hook at `locate`; pure bookkeeping, never fails.
    pub fn activated(&self, _cookie: &Cookie) {
        match self {
            Self::Eviction | Self::Idle => {}
        }
    }

    /// Hook before the application operation runs.
    pub fn pre_operation(&self, cookie: &Cookie) {
        match self {
            Self::Eviction => {}
            Self::Idle => {
                cookie.0.lock().mutating_depth += 1;
            }
        }
    }

    /// Hook after the application operation returned (or failed; the
    /// dispatch layer guarantees the call even on failure).
    pub fn post_operation(&self, cookie: &Cookie, mutated: bool) {
        match self {
            Self::Eviction => {
                if mutated {
                    cookie.0.lock().mark();
                }
            }
            Self::Idle => {
                let mut state = cookie.0.lock();
                if mutated {
                    state.mark();
                }
                assert!(state.mutating_depth > 0, "post_operation underflow");
                state.mutating_depth -= 1;
            }
        }
    }

    /// Hook at `finished`; pure bookkeeping, never fails.
    pub fn deactivated(&self, _cookie: &Cookie) {
        match self {
            Self::Eviction | Self::Idle => {}
        }
    }

    /// Whether eviction of this entry must be preceded by a save.
    ///
    /// Under `Idle` the dirty flag is only considered resolved once the
    /// nested-dispatch depth is back to 0.
    pub fn must_save(&self, cookie: &Cookie) -> bool {
        let state = cookie.0.lock();
        match self {
            Self::Eviction => state.mutated,
            Self::Idle => state.mutated && state.mutating_depth == 0,
        }
    }

    /// Clears the dirty flag after a successful save.
    pub fn saved(&self, cookie: &Cookie) {
        cookie.0.lock().mutated = false;
    }
}
