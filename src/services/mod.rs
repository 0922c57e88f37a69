//! Business logic services
//!
//! Services orchestrate ledger operations and coordinate with infrastructure.

pub mod billing_service;
pub mod checkout_service;
pub mod payment_gateway_service;
pub mod statement_service;
