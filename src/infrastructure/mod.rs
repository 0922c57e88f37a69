//! Infrastructure layer
//!
//! External dependencies and infrastructure concerns: the ledger store and
//! its Redis implementation, the shared HTTP client, and retry policy.

pub mod db_retry;
pub mod http_client;
pub mod redis_client;
pub mod store;

pub use db_retry::{RetryOptions, Retryable, retry_db_operation};
pub use redis_client::RedisStore;
pub use store::{BillingStore, InvoiceScope, MemoryStore, Sequence, StoreResult};
