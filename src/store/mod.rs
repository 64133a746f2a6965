mod file;
mod gateway;
mod memory;

pub use file::FileStore;
pub use gateway::{Gateway, RetryPolicy, StoreBackend, StoreError, TxnId};
pub use memory::MemoryStore;
