//! Bounded session pool and its lease type.

pub mod lease;
pub mod session_pool;

pub use lease::SessionLease;
pub use session_pool::{PoolOptions, PoolStats, SessionPool, SessionSnapshot};
