//! Application state management
//!
//! This module defines the application state shared across all handlers and
//! services: the ledger store, the payment gateway, configuration, and the
//! per-invoice locks that serialize ledger mutations.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::{Config, StoreBackend};
use crate::error::StoreError;
use crate::infrastructure::{BillingStore, MemoryStore, RedisStore};
use crate::services::payment_gateway_service::PaymentGatewayService;

/// Global application state
///
/// Cheaply cloneable; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    /// Ledger persistence
    pub store: Arc<dyn BillingStore>,

    /// Mock or Razorpay payment gateway
    pub gateway: Arc<PaymentGatewayService>,

    invoice_locks: Arc<DashMap<u64, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one invoice
///
/// Dropping it releases the lock and forgets the invoice's mutex once no
/// other task holds or waits on it.
pub struct InvoiceLockGuard {
    invoice_id: u64,
    locks: Arc<DashMap<u64, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InvoiceLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.invoice_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl AppState {
    /// Create state with the store backend named in the config
    pub async fn new(config: Config) -> Result<Self, StoreError> {
        let store: Arc<dyn BillingStore> = match config.store_backend {
            StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis_url).await?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn BillingStore>) -> Self {
        let gateway = Arc::new(PaymentGatewayService::from_config(&config));
        Self {
            config: Arc::new(config),
            store,
            gateway,
            invoice_locks: Arc::new(DashMap::new()),
        }
    }

    /// Hold the returned guard for the duration of a ledger mutation
    pub async fn lock_invoice(&self, invoice_id: u64) -> InvoiceLockGuard {
        let lock = self
            .invoice_locks
            .entry(invoice_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        InvoiceLockGuard {
            invoice_id,
            locks: self.invoice_locks.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn memory_state() -> AppState {
        AppState::with_store(Config::default(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn released_locks_are_forgotten() {
        let state = memory_state();
        let guard = state.lock_invoice(7).await;
        assert_eq!(state.invoice_locks.len(), 1);
        drop(guard);
        assert!(state.invoice_locks.is_empty());
    }

    #[tokio::test]
    async fn waiting_task_keeps_lock_alive() {
        let state = memory_state();
        let first = state.lock_invoice(7).await;

        let contender = state.clone();
        let waiter = tokio::spawn(async move {
            let _second = contender.lock_invoice(7).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(state.invoice_locks.len(), 1);

        waiter.await.unwrap();
        assert!(state.invoice_locks.is_empty());
    }
}
