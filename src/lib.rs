//! Datagate - scientific data gateway core
//!
//! Session pooling and transaction execution against a line-oriented data
//! backend. The library exposes the pool, the transaction runner, and the
//! supporting protocol pieces for embedding in a front-end service.

pub mod config;
pub mod endpoints;
pub mod errors;
pub mod fault;
pub mod metrics;
pub mod observability;
pub mod pool;
pub mod session;
pub mod test_utils;
pub mod transaction;

pub use config::Config;
pub use errors::{GatewayError, TransportError};
pub use fault::{BackendFault, FaultKind};
pub use pool::{PoolOptions, PoolStats, SessionLease, SessionPool};
pub use transaction::{Product, Transaction, TransactionReceipt, TransactionRunner};
