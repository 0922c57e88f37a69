//! Persistence seam for the billing ledger
//!
//! [`BillingStore`] is implemented by the Redis store used in production and
//! by [`MemoryStore`], which backs tests and `STORE_BACKEND=memory`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::models::{Appointment, AuditEntry, Invoice};

pub type StoreResult<T> = Result<T, StoreError>;

/// Id sequences allocated by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    Invoice,
    Payment,
    Refund,
    InvoiceItem,
}

impl Sequence {
    pub fn key(&self) -> &'static str {
        match self {
            Sequence::Invoice => "seq:invoice_id",
            Sequence::Payment => "seq:payment_id",
            Sequence::Refund => "seq:refund_id",
            Sequence::InvoiceItem => "seq:invoice_item_id",
        }
    }
}

/// Which index to read invoice ids from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceScope {
    All,
    Hospital(u64),
    Patient(u64),
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Next value of a global id sequence, starting at 1
    async fn next_id(&self, sequence: Sequence) -> StoreResult<u64>;

    /// Next invoice sequence for a hospital in a calendar year, starting at 1
    async fn next_invoice_sequence(&self, hospital_id: u64, year: i32) -> StoreResult<u64>;

    /// Claim an appointment for an invoice; false if already claimed
    async fn reserve_appointment_invoice(
        &self,
        appointment_id: u64,
        invoice_id: u64,
    ) -> StoreResult<bool>;

    async fn release_appointment_invoice(&self, appointment_id: u64) -> StoreResult<()>;

    async fn get_appointment(&self, appointment_id: u64) -> StoreResult<Option<Appointment>>;

    async fn put_appointment(&self, appointment: &Appointment) -> StoreResult<()>;

    /// Persist a new invoice and add it to the time indexes
    async fn insert_invoice(&self, invoice: &Invoice) -> StoreResult<()>;

    /// Overwrite an existing invoice aggregate
    async fn save_invoice(&self, invoice: &Invoice) -> StoreResult<()>;

    async fn get_invoice(&self, invoice_id: u64) -> StoreResult<Option<Invoice>>;

    /// Invoice ids in the scope, newest first
    async fn list_invoice_ids(&self, scope: InvoiceScope) -> StoreResult<Vec<u64>>;

    async fn get_invoices(&self, invoice_ids: &[u64]) -> StoreResult<Vec<Invoice>>;

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    sequences: HashMap<Sequence, u64>,
    invoice_sequences: HashMap<(u64, i32), u64>,
    appointment_invoices: HashMap<u64, u64>,
    appointments: HashMap<u64, Appointment>,
    invoices: BTreeMap<u64, Invoice>,
    audit: Vec<AuditEntry>,
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn next_id(&self, sequence: Sequence) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let counter = inner.sequences.entry(sequence).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn next_invoice_sequence(&self, hospital_id: u64, year: i32) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let counter = inner
            .invoice_sequences
            .entry((hospital_id, year))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn reserve_appointment_invoice(
        &self,
        appointment_id: u64,
        invoice_id: u64,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.appointment_invoices.contains_key(&appointment_id) {
            return Ok(false);
        }
        inner.appointment_invoices.insert(appointment_id, invoice_id);
        Ok(true)
    }

    async fn release_appointment_invoice(&self, appointment_id: u64) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .appointment_invoices
            .remove(&appointment_id);
        Ok(())
    }

    async fn get_appointment(&self, appointment_id: u64) -> StoreResult<Option<Appointment>> {
        Ok(self.inner.lock().await.appointments.get(&appointment_id).cloned())
    }

    async fn put_appointment(&self, appointment: &Appointment) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .appointments
            .insert(appointment.id, appointment.clone());
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .invoices
            .insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn save_invoice(&self, invoice: &Invoice) -> StoreResult<()> {
        self.insert_invoice(invoice).await
    }

    async fn get_invoice(&self, invoice_id: u64) -> StoreResult<Option<Invoice>> {
        Ok(self.inner.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn list_invoice_ids(&self, scope: InvoiceScope) -> StoreResult<Vec<u64>> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<&Invoice> = inner
            .invoices
            .values()
            .filter(|inv| match scope {
                InvoiceScope::All => true,
                InvoiceScope::Hospital(id) => inv.hospital_id == id,
                InvoiceScope::Patient(id) => inv.patient_id == id,
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching.into_iter().map(|inv| inv.id).collect())
    }

    async fn get_invoices(&self, invoice_ids: &[u64]) -> StoreResult<Vec<Invoice>> {
        let inner = self.inner.lock().await;
        Ok(invoice_ids
            .iter()
            .filter_map(|id| inner.invoices.get(id).cloned())
            .collect())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.inner.lock().await.audit.push(entry.clone());
        Ok(())
    }
}
