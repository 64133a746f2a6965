use crate::cache::DEFAULT_EVICTOR_CAPACITY;

use std::sync::LazyLock;

#[allow(non_snake_case)]
pub struct Config {
    // maximum number of resident servants per evictor
    pub EVICTOR_CAPACITY: usize,
    // deadlock retry bound for a single store operation
    pub SAVE_RETRY_LIMIT: u32,
    // initial backoff between deadlock retries
    pub SAVE_RETRY_BACKOFF_MS: u64,
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| Config {
    EVICTOR_CAPACITY: DEFAULT_EVICTOR_CAPACITY,
    SAVE_RETRY_LIMIT: 3,
    SAVE_RETRY_BACKOFF_MS: 10,
});
