use crate::config::CONFIG;
use crate::identity::Identity;

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("deadlock")]
    Deadlock,
    #[error("deadlock retry limit exceeded")]
    Contention,
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("store corrupted")]
    Corrupted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxnId(pub u64);

/// Transactional key-value store holding the authoritative servant state.
///
/// `load`/`save`/`erase` run inside an open transaction; a backend reports a
/// transient conflict by returning [`StoreError::Deadlock`] from any of them
/// (or from `commit`), in which case the caller rolls back and may retry the
/// whole transaction.
pub trait StoreBackend: Send + Sync {
    fn begin(&self) -> Result<TxnId, StoreError>;
    fn commit(&self, txn: TxnId) -> Result<(), StoreError>;
    fn rollback(&self, txn: TxnId);
    fn load(&self, txn: TxnId, key: &Identity) -> Result<Vec<u8>, StoreError>;
    fn save(&self, txn: TxnId, key: &Identity, state: &[u8]) -> Result<(), StoreError>;
    fn erase(&self, txn: TxnId, key: &Identity) -> Result<(), StoreError>;
}

/// Bounded deadlock-retry behavior for a single store operation.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: CONFIG.SAVE_RETRY_LIMIT,
            backoff: Duration::from_millis(CONFIG.SAVE_RETRY_BACKOFF_MS),
            factor: 2,
        }
    }
}

/// Thin adapter over a [`StoreBackend`] giving each `load`/`save`/`erase`
/// its own short-lived transaction with bounded deadlock retry.
///
/// Store-specific conflict signals never leak past this type: callers see
/// [`StoreError::Contention`] once retries are exhausted, never a raw
/// [`StoreError::Deadlock`].
pub struct Gateway<B> {
    backend: B,
    retry: RetryPolicy,
}

impl<B: StoreBackend> Gateway<B> {
    pub fn new(backend: B) -> Self {
        Self::with_retry(backend, RetryPolicy::default())
    }

    pub fn with_retry(backend: B, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn load(&self, key: &Identity) -> Result<Vec<u8>, StoreError> {
        self.transactional(key, |txn| self.backend.load(txn, key))
    }

    pub fn save(&self, key: &Identity, state: &[u8]) -> Result<(), StoreError> {
        self.transactional(key, |txn| self.backend.save(txn, key, state))
    }

    pub fn erase(&self, key: &Identity) -> Result<(), StoreError> {
        self.transactional(key, |txn| self.backend.erase(txn, key))
    }

    fn transactional<T>(
        &self,
        key: &Identity,
        op: impl Fn(TxnId) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut backoff = self.retry.backoff;
        let mut attempt = 0;
        loop {
            let txn = self.backend.begin()?;
            // a failed commit still leaves the transaction open on the
            // backend; it must be rolled back like a failed body
            let error = match op(txn) {
                Ok(value) => match self.backend.commit(txn) {
                    Ok(()) => return Ok(value),
                    Err(e) => {
                        self.backend.rollback(txn);
                        e
                    }
                },
                Err(e) => {
                    self.backend.rollback(txn);
                    e
                }
            };
            match error {
                StoreError::Deadlock if attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(key = %key, attempt, "store deadlock, retrying");
                    std::thread::sleep(backoff);
                    backoff *= self.retry.factor;
                }
                StoreError::Deadlock => return Err(StoreError::Contention),
                e => return Err(e),
            }
        }
    }
}
