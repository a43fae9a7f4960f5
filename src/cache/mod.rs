pub mod redis;
pub mod run_lock;

pub use self::redis::RedisRunLock;
pub use self::run_lock::{
    acquire_with_wait, job_lock_key, wait_until_free, LocalRunLock, LockToken, RunLock,
    SharedRunLock, NEWS_SUMMARIES_LOCK,
};
