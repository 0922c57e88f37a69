use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::infrastructure::store::{BillingStore, InvoiceScope, Sequence, StoreResult};
use crate::models::{Appointment, AuditEntry, Invoice};

const INVOICES_BY_TIME: &str = "invoices_by_time";

fn invoice_key(invoice_id: u64) -> String {
    format!("invoice:{}", invoice_id)
}

fn appointment_key(appointment_id: u64) -> String {
    format!("appointment:{}", appointment_id)
}

fn appointment_invoice_key(appointment_id: u64) -> String {
    format!("appointment:{}:invoice", appointment_id)
}

fn hospital_index_key(hospital_id: u64) -> String {
    format!("hospital:{}:invoices", hospital_id)
}

fn patient_index_key(patient_id: u64) -> String {
    format!("patient:{}:invoices", patient_id)
}

fn invoice_sequence_key(hospital_id: u64, year: i32) -> String {
    format!("seq:invoice_number:{}:{}", hospital_id, year)
}

/// Redis-backed ledger store
///
/// Each invoice aggregate is one JSON document; sorted sets scored by
/// creation time index invoices globally, per hospital and per patient.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl BillingStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut con = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }

    async fn next_id(&self, sequence: Sequence) -> StoreResult<u64> {
        let mut con = self.conn.clone();
        let id: u64 = con.incr(sequence.key(), 1).await?;
        Ok(id)
    }

    async fn next_invoice_sequence(&self, hospital_id: u64, year: i32) -> StoreResult<u64> {
        let mut con = self.conn.clone();
        let seq: u64 = con.incr(invoice_sequence_key(hospital_id, year), 1).await?;
        Ok(seq)
    }

    async fn reserve_appointment_invoice(
        &self,
        appointment_id: u64,
        invoice_id: u64,
    ) -> StoreResult<bool> {
        let mut con = self.conn.clone();
        let claimed: bool = con
            .set_nx(appointment_invoice_key(appointment_id), invoice_id)
            .await?;
        Ok(claimed)
    }

    async fn release_appointment_invoice(&self, appointment_id: u64) -> StoreResult<()> {
        let mut con = self.conn.clone();
        let _: () = con.del(appointment_invoice_key(appointment_id)).await?;
        Ok(())
    }

    async fn get_appointment(&self, appointment_id: u64) -> StoreResult<Option<Appointment>> {
        let mut con = self.conn.clone();
        let raw: Option<String> = con.get(appointment_key(appointment_id)).await?;
        Ok(match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    async fn put_appointment(&self, appointment: &Appointment) -> StoreResult<()> {
        let mut con = self.conn.clone();
        let value = serde_json::to_string(appointment)?;
        let _: () = con.set(appointment_key(appointment.id), value).await?;
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> StoreResult<()> {
        let mut con = self.conn.clone();
        let value = serde_json::to_string(invoice)?;
        let score = invoice.created_at.timestamp_millis();

        let _: () = redis::pipe()
            .atomic()
            .set(invoice_key(invoice.id), value)
            .ignore()
            .zadd(INVOICES_BY_TIME, invoice.id, score)
            .ignore()
            .zadd(hospital_index_key(invoice.hospital_id), invoice.id, score)
            .ignore()
            .zadd(patient_index_key(invoice.patient_id), invoice.id, score)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn save_invoice(&self, invoice: &Invoice) -> StoreResult<()> {
        let mut con = self.conn.clone();
        let value = serde_json::to_string(invoice)?;
        let _: () = con.set(invoice_key(invoice.id), value).await?;
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: u64) -> StoreResult<Option<Invoice>> {
        let mut con = self.conn.clone();
        let raw: Option<String> = con.get(invoice_key(invoice_id)).await?;
        Ok(match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    async fn list_invoice_ids(&self, scope: InvoiceScope) -> StoreResult<Vec<u64>> {
        let mut con = self.conn.clone();
        let key = match scope {
            InvoiceScope::All => INVOICES_BY_TIME.to_string(),
            InvoiceScope::Hospital(id) => hospital_index_key(id),
            InvoiceScope::Patient(id) => patient_index_key(id),
        };
        let ids: Vec<u64> = con.zrevrange(key, 0, -1).await?;
        Ok(ids)
    }

    async fn get_invoices(&self, invoice_ids: &[u64]) -> StoreResult<Vec<Invoice>> {
        if invoice_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.conn.clone();
        let keys: Vec<String> = invoice_ids.iter().map(|id| invoice_key(*id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut con).await?;

        let mut invoices = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            invoices.push(serde_json::from_str(&json)?);
        }
        Ok(invoices)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        let mut con = self.conn.clone();
        let value = serde_json::to_string(entry)?;
        let _: () = con
            .rpush(format!("audit:{}", entry.hospital_id), value)
            .await?;
        Ok(())
    }
}
