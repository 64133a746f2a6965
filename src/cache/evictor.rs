use crate::cache::queue::{EvictionQueue, SlotId};
use crate::cache::{ActivateError, Activator};
use crate::config::CONFIG;
use crate::identity::Identity;
use crate::store::StoreError;
use crate::strategy::{Cookie, MutationStrategy};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum EvictorError {
    #[error("no such servant")]
    NotFound,
    #[error("store")]
    Store(#[from] StoreError),
}

struct Entry<S> {
    servant: Arc<S>,
    use_count: u32,
    slot: SlotId,
    cookie: Cookie,
    last_access: i64,
    // a sweep is persisting this entry with the structural lock released;
    // other sweeps must neither save nor remove it until cleared
    saving: bool,
}

struct Inner<S> {
    map: HashMap<Identity, Entry<S>>,
    queue: EvictionQueue,
    capacity: usize,
    deactivated: bool,
}

/// Bounded cache of live servants with LRU-with-pinning eviction.
///
/// The RPC dispatch layer borrows a servant with [`locate`](Self::locate)
/// before invoking an operation and returns it with
/// [`finished`](Self::finished) afterwards; the operation itself runs with
/// no evictor lock held. An entry is evictable only once every borrow has
/// been returned, and a dirty entry is written back through the activator
/// before it is removed.
///
/// The caller contract is strict: every successful `locate` must be paired
/// with exactly one `finished` for the same identity, or the entry stays
/// pinned forever.
pub struct Evictor<A: Activator> {
    activator: A,
    strategy: MutationStrategy,
    inner: Mutex<Inner<A::Servant>>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap()
}

impl<A: Activator> Evictor<A> {
    pub fn new(activator: A, strategy: MutationStrategy) -> Self {
        Self::with_capacity(activator, strategy, CONFIG.EVICTOR_CAPACITY)
    }

    /// `capacity` 0 is legal and means "keep nothing beyond what is
    /// currently pinned".
    pub fn with_capacity(activator: A, strategy: MutationStrategy, capacity: usize) -> Self {
        Self {
            activator,
            strategy,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                queue: EvictionQueue::new(),
                capacity,
                deactivated: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.inner.lock().map.contains_key(identity)
    }

    /// Shrinking the capacity triggers an immediate sweep.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().capacity = capacity;
        self.evict_excess();
    }

    /// Borrows the servant for `identity`, loading it through the activator
    /// on a miss. The returned cookie must be handed back to
    /// [`finished`](Self::finished) once the dispatched operation completes.
    pub fn locate(&self, identity: &Identity) -> Result<(Arc<A::Servant>, Cookie), EvictorError> {
        {
            let mut inner = self.inner.lock();
            if let Some(borrowed) = self.touch(&mut inner, identity) {
                return Ok(borrowed);
            }
            if inner.deactivated {
                return Err(EvictorError::NotFound);
            }
        }

        // instantiate runs with the structural lock released; an
        // arbitrarily slow load must not serialize unrelated dispatches
        let servant = match self.activator.instantiate(identity) {
            Ok(servant) => Arc::new(servant),
            Err(ActivateError::NotFound) => return Err(EvictorError::NotFound),
            Err(ActivateError::Store(e)) => return Err(EvictorError::Store(e)),
        };

        let mut inner = self.inner.lock();
        // a racing locate may have admitted this identity while the lock
        // was released; re-validate so admission happens at most once
        if let Some(borrowed) = self.touch(&mut inner, identity) {
            return Ok(borrowed);
        }
        if inner.deactivated {
            return Err(EvictorError::NotFound);
        }

        let slot = inner.queue.push_front(identity.clone());
        let cookie = Cookie::new();
        self.strategy.activated(&cookie);
        inner.map.insert(
            identity.clone(),
            Entry {
                servant: servant.clone(),
                use_count: 1,
                slot,
                cookie: cookie.clone(),
                last_access: now(),
                saving: false,
            },
        );
        Ok((servant, cookie))
    }

    /// Hit path: refresh recency, pin, hand out servant and cookie.
    fn touch(
        &self,
        inner: &mut Inner<A::Servant>,
        identity: &Identity,
    ) -> Option<(Arc<A::Servant>, Cookie)> {
        let Inner { map, queue, .. } = inner;
        let entry = map.get_mut(identity)?;
        queue.move_to_front(entry.slot);
        entry.use_count += 1;
        entry.last_access = now();
        self.strategy.activated(&entry.cookie);
        Some((entry.servant.clone(), entry.cookie.clone()))
    }

    /// Returns a borrow taken with [`locate`](Self::locate).
    ///
    /// # Panics
    ///
    /// Panics on an unpaired call (unknown identity or use count already 0);
    /// that is a dispatch-layer bug and continuing would corrupt the cache.
    pub fn finished(&self, identity: &Identity, cookie: &Cookie) {
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.map.get_mut(identity) else {
                panic!("finished without matching locate: {identity}");
            };
            assert!(entry.use_count > 0, "use count underflow: {identity}");
            entry.use_count -= 1;
            self.strategy.deactivated(cookie);
        }
        self.evict_excess();
    }

    /// Evicts least-recently-used unpinned entries until the cache is back
    /// within capacity or every remaining excess entry is pinned.
    ///
    /// The excess is snapshotted at scan start, so entries admitted during
    /// the sweep are not reconsidered. Dirty entries are saved through the
    /// activator with the structural lock released and re-validated after
    /// it is reacquired; a failed save keeps the entry resident at the LRU
    /// end instead of dropping its state.
    pub fn evict_excess(&self) {
        let mut retired: Vec<(Identity, Entry<A::Servant>)> = Vec::new();

        let mut guard = self.inner.lock();
        let mut excess = guard.map.len().saturating_sub(guard.capacity);
        let mut cursor = guard.queue.back();
        while excess > 0 {
            let Some(slot) = cursor else { break };
            let next = guard.queue.toward_front(slot);
            let identity = guard
                .queue
                .get(slot)
                .expect("queue/map desynchronized")
                .clone();

            let (busy, dirty, cookie, servant) = {
                let entry = guard.map.get(&identity).expect("queue/map desynchronized");
                (
                    entry.use_count > 0 || entry.saving,
                    self.strategy.must_save(&entry.cookie),
                    entry.cookie.clone(),
                    entry.servant.clone(),
                )
            };
            if busy {
                // pinned or mid-save entries do not block eviction of
                // colder ones
                cursor = next;
                continue;
            }

            if dirty {
                // snapshot the mutation count before releasing the lock:
                // a dispatch that re-dirties the servant during the save
                // makes the persisted snapshot stale
                let mutation_snapshot = cookie.mutation_count();
                guard
                    .map
                    .get_mut(&identity)
                    .expect("queue/map desynchronized")
                    .saving = true;
                drop(guard);
                let saved = self.activator.persist(&identity, &servant);
                guard = self.inner.lock();
                if let Some(entry) = guard.map.get_mut(&identity) {
                    entry.saving = false;
                }

                // the world may have moved while the lock was released
                excess = excess.min(guard.map.len().saturating_sub(guard.capacity));
                let revalidated = cookie.mutation_count() == mutation_snapshot
                    && matches!(
                        guard.map.get(&identity),
                        Some(entry) if entry.use_count == 0 && entry.slot == slot
                    );
                if !revalidated {
                    // re-pinned or re-dirtied; leave the entry resident
                    // with its dirty flag intact so a later sweep saves
                    // the newer state
                    cursor = Self::next_cursor(&guard.queue, next);
                    continue;
                }
                match saved {
                    Ok(()) => {
                        self.strategy.saved(&cookie);
                        if excess == 0 {
                            // a concurrent sweep used up the eviction
                            // budget; the entry stays resident, now clean
                            break;
                        }
                    }
                    Err(e) => {
                        // losing a dirty update is never acceptable; keep
                        // the entry resident and report the failure
                        error!(identity = %identity, error = %e, "save-back failed, eviction aborted");
                        guard.queue.move_to_back(slot);
                        excess = excess.saturating_sub(1);
                        cursor = Self::next_cursor(&guard.queue, next);
                        continue;
                    }
                }
            }

            let entry = guard.map.remove(&identity).expect("queue/map desynchronized");
            guard.queue.remove(entry.slot);
            excess -= 1;
            debug!(identity = %identity, age_ns = now() - entry.last_access, "evicted");
            retired.push((identity, entry));
            cursor = Self::next_cursor(&guard.queue, next);
        }
        drop(guard);

        for (identity, entry) in retired {
            self.activator.retire(&identity, entry.servant, &entry.cookie);
        }
    }

    // A cursor captured before a lock release may be stale afterwards;
    // restart from the LRU end in that case. Sweep progress stays bounded
    // because every lock release also consumed eviction budget.
    fn next_cursor(queue: &EvictionQueue, next: Option<SlotId>) -> Option<SlotId> {
        match next {
            Some(slot) if queue.contains(slot) => Some(slot),
            Some(_) => queue.back(),
            None => None,
        }
    }

    /// Shuts the cache down: no new entries are admitted and everything
    /// unpinned is drained (with save-back where needed). Entries still
    /// mid-dispatch are left in place; the caller drains in-flight requests
    /// and their `finished` calls complete the sweep. Idempotent.
    pub fn deactivate(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.deactivated {
                debug!(resident = inner.map.len(), "deactivating evictor");
            }
            inner.deactivated = true;
            inner.capacity = 0;
        }
        self.evict_excess();
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let inner = self.inner.lock();
        assert_eq!(inner.map.len(), inner.queue.len());
        let mut seen = std::collections::HashSet::new();
        for identity in inner.queue.iter() {
            assert!(seen.insert(identity.clone()), "duplicate queue slot");
            let entry = inner.map.get(identity).expect("queue slot without map entry");
            assert_eq!(inner.queue.get(entry.slot), Some(identity));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Gateway, MemoryStore, RetryPolicy};

    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct TestActivator {
        gateway: Gateway<MemoryStore>,
        create_on_miss: bool,
        instantiated: AtomicU32,
        retired: Mutex<Vec<Identity>>,
    }

    impl TestActivator {
        fn new() -> Self {
            Self::with_store(MemoryStore::new())
        }

        fn with_store(store: MemoryStore) -> Self {
            let retry = RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(1),
                factor: 1,
            };
            Self {
                gateway: Gateway::with_retry(store, retry),
                create_on_miss: true,
                instantiated: AtomicU32::new(0),
                retired: Mutex::new(Vec::new()),
            }
        }
    }

    impl Activator for TestActivator {
        type Servant = Mutex<Vec<u8>>;

        fn instantiate(&self, identity: &Identity) -> Result<Self::Servant, ActivateError> {
            self.instantiated.fetch_add(1, Ordering::Relaxed);
            match self.gateway.load(identity) {
                Ok(state) => Ok(Mutex::new(state)),
                Err(StoreError::NotFound) if self.create_on_miss => Ok(Mutex::new(Vec::new())),
                Err(StoreError::NotFound) => Err(ActivateError::NotFound),
                Err(e) => Err(ActivateError::Store(e)),
            }
        }

        fn persist(&self, identity: &Identity, servant: &Self::Servant) -> Result<(), StoreError> {
            self.gateway.save(identity, &servant.lock())
        }

        fn retire(&self, identity: &Identity, _servant: Arc<Self::Servant>, _cookie: &Cookie) {
            self.retired.lock().push(identity.clone());
        }
    }

    // blocks the first persist until released, so tests can interleave a
    // full dispatch with an in-flight save-back
    struct BlockingActivator {
        gateway: Gateway<MemoryStore>,
        block_next_save: AtomicBool,
        entered: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl BlockingActivator {
        fn new() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let retry = RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(1),
                factor: 1,
            };
            let activator = Self {
                gateway: Gateway::with_retry(MemoryStore::new(), retry),
                block_next_save: AtomicBool::new(true),
                entered: entered_tx,
                release: Mutex::new(release_rx),
            };
            (activator, entered_rx, release_tx)
        }
    }

    impl Activator for BlockingActivator {
        type Servant = Mutex<Vec<u8>>;

        fn instantiate(&self, _identity: &Identity) -> Result<Self::Servant, ActivateError> {
            Ok(Mutex::new(Vec::new()))
        }

        fn persist(&self, identity: &Identity, servant: &Self::Servant) -> Result<(), StoreError> {
            // the state snapshot is taken before blocking, so a concurrent
            // dispatch can outrun it
            let state = servant.lock().clone();
            if self.block_next_save.swap(false, Ordering::SeqCst) {
                self.entered.send(()).unwrap();
                self.release.lock().recv().unwrap();
            }
            self.gateway.save(identity, &state)
        }
    }

    fn id(name: &str) -> Identity {
        Identity::new("test", name).unwrap()
    }

    fn evictor(capacity: usize) -> Evictor<TestActivator> {
        Evictor::with_capacity(TestActivator::new(), MutationStrategy::Eviction, capacity)
    }

    fn locate_finish(evictor: &Evictor<TestActivator>, name: &str) {
        let (_servant, cookie) = evictor.locate(&id(name)).unwrap();
        evictor.finished(&id(name), &cookie);
    }

    #[test]
    fn recency_ordering() {
        let evictor = evictor(2);
        locate_finish(&evictor, "a");
        locate_finish(&evictor, "b");
        locate_finish(&evictor, "c");

        // a was least recently used
        assert!(!evictor.contains(&id("a")));
        assert!(evictor.contains(&id("b")));
        assert!(evictor.contains(&id("c")));
        assert_eq!(evictor.len(), 2);
        assert_eq!(*evictor.activator.retired.lock(), vec![id("a")]);
    }

    #[test]
    fn locate_hit_refreshes_recency() {
        let evictor = evictor(2);
        locate_finish(&evictor, "a");
        locate_finish(&evictor, "b");
        locate_finish(&evictor, "a");
        locate_finish(&evictor, "c");

        assert!(evictor.contains(&id("a")));
        assert!(!evictor.contains(&id("b")));
        assert!(evictor.contains(&id("c")));
        // the second locate of a was a hit
        assert_eq!(evictor.activator.instantiated.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn pinned_entry_never_evicted() {
        let evictor = evictor(0);
        let (_servant, cookie) = evictor.locate(&id("a")).unwrap();
        evictor.evict_excess();
        assert!(evictor.contains(&id("a")));

        // a second borrow of a pinned entry does not block
        let (_servant2, cookie2) = evictor.locate(&id("a")).unwrap();
        evictor.finished(&id("a"), &cookie2);
        assert!(evictor.contains(&id("a")));

        evictor.finished(&id("a"), &cookie);
        assert!(!evictor.contains(&id("a")));
    }

    #[test]
    fn pinned_entry_does_not_block_colder_ones() {
        let evictor = evictor(4);
        // d is the LRU end and stays pinned
        let (_servant, cookie) = evictor.locate(&id("d")).unwrap();
        for name in ["a", "b", "c", "e", "f"] {
            locate_finish(&evictor, name);
        }

        // over capacity by 2; a and b were the coldest unpinned entries
        assert!(evictor.contains(&id("d")));
        assert!(!evictor.contains(&id("a")));
        assert!(!evictor.contains(&id("b")));
        assert_eq!(evictor.len(), 4);
        evictor.finished(&id("d"), &cookie);
    }

    #[test]
    fn capacity_convergence() {
        let evictor = evictor(3);
        for i in 0..10 {
            locate_finish(&evictor, &format!("s{i}"));
        }
        assert!(evictor.len() <= 3);
        evictor.check_invariants();
    }

    #[test]
    fn miss_without_backing_state_fails() {
        let mut activator = TestActivator::new();
        activator.create_on_miss = false;
        let evictor = Evictor::with_capacity(activator, MutationStrategy::Eviction, 2);

        assert!(matches!(
            evictor.locate(&id("ghost")),
            Err(EvictorError::NotFound)
        ));
        // nothing was admitted
        assert_eq!(evictor.len(), 0);
    }

    #[test]
    fn load_failure_surfaces_store_error() {
        let store = MemoryStore::new();
        store.inject_deadlocks(10);
        let evictor = Evictor::with_capacity(
            TestActivator::with_store(store),
            MutationStrategy::Eviction,
            2,
        );

        assert!(matches!(
            evictor.locate(&id("a")),
            Err(EvictorError::Store(StoreError::Contention))
        ));
        assert_eq!(evictor.len(), 0);
    }

    #[test]
    fn dirty_entry_saved_before_eviction() {
        let evictor = evictor(0);
        let (servant, cookie) = evictor.locate(&id("a")).unwrap();
        servant.lock().extend_from_slice(b"state");
        cookie.mark_mutated();
        evictor.finished(&id("a"), &cookie);

        assert!(!evictor.contains(&id("a")));
        let store = evictor.activator.gateway.backend();
        assert_eq!(store.committed_state(&id("a")).unwrap(), b"state");
    }

    #[test]
    fn at_most_once_save() {
        let evictor = evictor(0);
        let (servant, cookie) = evictor.locate(&id("a")).unwrap();
        servant.lock().extend_from_slice(b"v1");
        cookie.mark_mutated();
        evictor.finished(&id("a"), &cookie);
        assert_eq!(evictor.activator.gateway.backend().save_count(), 1);

        // reload and evict clean: no second save
        let (_servant, cookie) = evictor.locate(&id("a")).unwrap();
        evictor.finished(&id("a"), &cookie);
        assert!(!evictor.contains(&id("a")));
        assert_eq!(evictor.activator.gateway.backend().save_count(), 1);
    }

    #[test]
    fn failed_save_keeps_entry_resident() {
        let evictor = evictor(0);
        let (servant, cookie) = evictor.locate(&id("a")).unwrap();
        servant.lock().extend_from_slice(b"precious");
        cookie.mark_mutated();

        evictor.activator.gateway.backend().inject_save_failures(1);
        evictor.finished(&id("a"), &cookie);

        // the dirty entry survived the failed save
        assert!(evictor.contains(&id("a")));
        assert!(evictor.activator.gateway.backend().committed_state(&id("a")).is_none());
        evictor.check_invariants();

        // the next sweep saves the still-current state
        evictor.evict_excess();
        assert!(!evictor.contains(&id("a")));
        let store = evictor.activator.gateway.backend();
        assert_eq!(store.committed_state(&id("a")).unwrap(), b"precious");
    }

    #[test]
    fn deactivation_drains_unpinned() {
        let evictor = evictor(10);
        for i in 0..5 {
            locate_finish(&evictor, &format!("s{i}"));
        }
        let (_servant, cookie) = evictor.locate(&id("pinned")).unwrap();

        evictor.deactivate();
        assert_eq!(evictor.len(), 1);
        assert!(evictor.contains(&id("pinned")));
        assert_eq!(evictor.capacity(), 0);

        // no new admissions, but the resident entry is still locatable
        assert!(matches!(
            evictor.locate(&id("new")),
            Err(EvictorError::NotFound)
        ));
        let (_servant2, cookie2) = evictor.locate(&id("pinned")).unwrap();
        evictor.finished(&id("pinned"), &cookie2);

        evictor.finished(&id("pinned"), &cookie);
        assert!(evictor.is_empty());
    }

    #[test]
    fn idle_strategy_saves_through_dispatch_hooks() {
        let activator = TestActivator::new();
        let evictor = Evictor::with_capacity(activator, MutationStrategy::Idle, 0);
        let strategy = MutationStrategy::Idle;

        let (servant, cookie) = evictor.locate(&id("a")).unwrap();
        strategy.pre_operation(&cookie);
        servant.lock().extend_from_slice(b"nested");
        strategy.pre_operation(&cookie);
        strategy.post_operation(&cookie, true);
        strategy.post_operation(&cookie, false);
        evictor.finished(&id("a"), &cookie);

        assert!(!evictor.contains(&id("a")));
        let store = evictor.activator.gateway.backend();
        assert_eq!(store.committed_state(&id("a")).unwrap(), b"nested");
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    #[should_panic(expected = "finished without matching locate")]
    fn unpaired_finished_panics() {
        let evictor = evictor(2);
        evictor.finished(&id("a"), &Cookie::new());
    }

    #[test]
    #[should_panic(expected = "use count underflow")]
    fn double_finished_panics() {
        let evictor = evictor(2);
        let (_servant, cookie) = evictor.locate(&id("a")).unwrap();
        evictor.finished(&id("a"), &cookie);
        evictor.finished(&id("a"), &cookie);
    }

    // xorshift64, deterministic interleavings without a rand dependency
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn randomized_operations_hold_invariants() {
        let evictor = evictor(4);
        let mut rng = Rng(0x5eed_cafe);
        let mut outstanding: Vec<(Identity, Cookie)> = Vec::new();

        for step in 0..2000 {
            match rng.next() % 4 {
                0 | 1 => {
                    let identity = id(&format!("s{}", rng.next() % 8));
                    let (_servant, cookie) = evictor.locate(&identity).unwrap();
                    if rng.next() % 3 == 0 {
                        cookie.mark_mutated();
                    }
                    outstanding.push((identity, cookie));
                }
                2 if !outstanding.is_empty() => {
                    let pick = (rng.next() as usize) % outstanding.len();
                    let (identity, cookie) = outstanding.swap_remove(pick);
                    evictor.finished(&identity, &cookie);
                }
                _ => evictor.evict_excess(),
            }
            evictor.check_invariants();

            if step % 97 == 0 {
                // every pinned identity must still be resident
                for (identity, _) in &outstanding {
                    assert!(evictor.contains(identity));
                }
            }
        }

        for (identity, cookie) in outstanding.drain(..) {
            evictor.finished(&identity, &cookie);
        }
        evictor.check_invariants();
        assert!(evictor.len() <= 4);
    }

    #[test]
    fn concurrent_locate_finished() {
        let evictor = Arc::new(evictor(4));

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let evictor = evictor.clone();
                std::thread::spawn(move || {
                    for i in 0..5000u32 {
                        let identity = id(&format!("s{}", (t + i) % 8));
                        let (servant, cookie) = evictor.locate(&identity).unwrap();
                        if i % 5 == 0 {
                            servant.lock().push(t as u8);
                            cookie.mark_mutated();
                        }
                        evictor.finished(&identity, &cookie);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        evictor.check_invariants();
        assert!(evictor.len() <= 4);
    }

    #[test]
    fn redirty_during_save_is_not_lost() {
        let (activator, entered, release) = BlockingActivator::new();
        let evictor = Arc::new(Evictor::with_capacity(
            activator,
            MutationStrategy::Eviction,
            0,
        ));

        let (servant, cookie) = evictor.locate(&id("a")).unwrap();
        *servant.lock() = b"v1".to_vec();
        cookie.mark_mutated();

        let sweeper = {
            let evictor = evictor.clone();
            let cookie = cookie.clone();
            std::thread::spawn(move || evictor.finished(&id("a"), &cookie))
        };
        entered.recv().unwrap();

        // a full dispatch lands while the sweep holds the v1 snapshot
        let (servant, cookie) = evictor.locate(&id("a")).unwrap();
        *servant.lock() = b"v2".to_vec();
        cookie.mark_mutated();
        evictor.finished(&id("a"), &cookie);
        assert!(evictor.contains(&id("a")));

        release.send(()).unwrap();
        sweeper.join().unwrap();

        // the stale snapshot must not have evicted the entry
        assert!(evictor.contains(&id("a")));
        evictor.evict_excess();
        assert!(!evictor.contains(&id("a")));
        let store = evictor.activator.gateway.backend();
        assert_eq!(store.committed_state(&id("a")).unwrap(), b"v2");
    }

    #[test]
    fn concurrent_eviction_during_save_bounds_the_sweep() {
        let (activator, entered, release) = BlockingActivator::new();
        let evictor = Arc::new(Evictor::with_capacity(
            activator,
            MutationStrategy::Eviction,
            1,
        ));

        let (servant, cookie_a) = evictor.locate(&id("a")).unwrap();
        *servant.lock() = b"a1".to_vec();
        cookie_a.mark_mutated();
        let (_servant, cookie_b) = evictor.locate(&id("b")).unwrap();

        let sweeper = {
            let evictor = evictor.clone();
            let cookie_a = cookie_a.clone();
            std::thread::spawn(move || evictor.finished(&id("a"), &cookie_a))
        };
        entered.recv().unwrap();

        // this sweep consumes the whole eviction budget while the first
        // sweep is still blocked in its save-back
        evictor.finished(&id("b"), &cookie_b);
        assert!(!evictor.contains(&id("b")));
        assert!(evictor.contains(&id("a")));

        release.send(()).unwrap();
        sweeper.join().unwrap();

        evictor.check_invariants();
        assert!(evictor.contains(&id("a")));
        assert_eq!(evictor.len(), 1);
        let store = evictor.activator.gateway.backend();
        assert_eq!(store.committed_state(&id("a")).unwrap(), b"a1");
    }
}
