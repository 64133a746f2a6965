use crate::identity::Identity;
use crate::store::{StoreBackend, StoreError, TxnId};

use std::collections::HashMap;

use parking_lot::Mutex;

enum PendingOp {
    Put(Identity, Vec<u8>),
    Erase(Identity),
}

struct MemoryInner {
    committed: HashMap<Identity, Vec<u8>>,
    pending: HashMap<TxnId, Vec<PendingOp>>,
    next_txn: u64,
    injected_deadlocks: u32,
    injected_commit_deadlocks: u32,
    injected_save_failures: u32,
    save_count: u64,
    rollback_count: u64,
}

/// HashMap-backed store with per-transaction write buffering.
///
/// Fault injection (`inject_deadlocks`, `inject_save_failures`) lets tests
/// drive the gateway's retry path and the evictor's failed-save path without
/// a real transactional store.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                committed: HashMap::new(),
                pending: HashMap::new(),
                next_txn: 0,
                injected_deadlocks: 0,
                injected_commit_deadlocks: 0,
                injected_save_failures: 0,
                save_count: 0,
                rollback_count: 0,
            }),
        }
    }

    /// The next `n` operations fail with [`StoreError::Deadlock`].
    pub fn inject_deadlocks(&self, n: u32) {
        self.inner.lock().injected_deadlocks = n;
    }

    /// The next `n` commits fail with [`StoreError::Deadlock`], leaving the
    /// transaction open until it is rolled back.
    pub fn inject_commit_deadlocks(&self, n: u32) {
        self.inner.lock().injected_commit_deadlocks = n;
    }

    /// The next `n` saves fail with an I/O error.
    pub fn inject_save_failures(&self, n: u32) {
        self.inner.lock().injected_save_failures = n;
    }

    /// Number of rollbacks that actually closed an open transaction.
    pub fn rollback_count(&self) -> u64 {
        self.inner.lock().rollback_count
    }

    /// Transactions begun but neither committed nor rolled back.
    pub fn open_transactions(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of successfully buffered saves since construction.
    pub fn save_count(&self) -> u64 {
        self.inner.lock().save_count
    }

    pub fn committed_state(&self, key: &Identity) -> Option<Vec<u8>> {
        self.inner.lock().committed.get(key).cloned()
    }
}

impl MemoryInner {
    fn take_injected_deadlock(&mut self) -> bool {
        if self.injected_deadlocks > 0 {
            self.injected_deadlocks -= 1;
            true
        } else {
            false
        }
    }
}

impl StoreBackend for MemoryStore {
    fn begin(&self) -> Result<TxnId, StoreError> {
        let mut inner = self.inner.lock();
        let txn = TxnId(inner.next_txn);
        inner.next_txn += 1;
        inner.pending.insert(txn, Vec::new());
        Ok(txn)
    }

    fn commit(&self, txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.injected_commit_deadlocks > 0 {
            inner.injected_commit_deadlocks -= 1;
            return Err(StoreError::Deadlock);
        }
        let ops = inner.pending.remove(&txn).ok_or(StoreError::Corrupted)?;
        for op in ops {
            match op {
                PendingOp::Put(key, state) => {
                    inner.committed.insert(key, state);
                }
                PendingOp::Erase(key) => {
                    inner.committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, txn: TxnId) {
        let mut inner = self.inner.lock();
        if inner.pending.remove(&txn).is_some() {
            inner.rollback_count += 1;
        }
    }

    fn load(&self, txn: TxnId, key: &Identity) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.lock();
        if inner.take_injected_deadlock() {
            return Err(StoreError::Deadlock);
        }
        // a transaction reads its own buffered writes first
        if let Some(ops) = inner.pending.get(&txn) {
            for op in ops.iter().rev() {
                match op {
                    PendingOp::Put(k, state) if k == key => return Ok(state.clone()),
                    PendingOp::Erase(k) if k == key => return Err(StoreError::NotFound),
                    _ => {}
                }
            }
        }
        inner.committed.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn save(&self, txn: TxnId, key: &Identity, state: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.take_injected_deadlock() {
            return Err(StoreError::Deadlock);
        }
        if inner.injected_save_failures > 0 {
            inner.injected_save_failures -= 1;
            return Err(StoreError::Io(std::io::Error::other("injected save failure")));
        }
        let ops = inner.pending.get_mut(&txn).ok_or(StoreError::Corrupted)?;
        ops.push(PendingOp::Put(key.clone(), state.to_vec()));
        inner.save_count += 1;
        Ok(())
    }

    fn erase(&self, txn: TxnId, key: &Identity) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.take_injected_deadlock() {
            return Err(StoreError::Deadlock);
        }
        let known = inner.committed.contains_key(key);
        let ops = inner.pending.get_mut(&txn).ok_or(StoreError::Corrupted)?;
        let buffered = ops
            .iter()
            .any(|op| matches!(op, PendingOp::Put(k, _) if k == key));
        if !known && !buffered {
            return Err(StoreError::NotFound);
        }
        ops.push(PendingOp::Erase(key.clone()));
        Ok(())
    }
}
