//! NexaCare Billing Service Library
//!
//! OPD invoicing for hospitals: the invoice state machine, per-hospital
//! invoice numbering, the payment and refund ledger, and online checkout
//! through a mock or Razorpay payment gateway. The binary wires these into
//! an HTTP service; tests drive them directly against the in-memory store.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod infrastructure;
pub mod ledger;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{BillingError, BillingResult};
pub use handlers::create_router;
pub use models::*;
pub use state::AppState;
