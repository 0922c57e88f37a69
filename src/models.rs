//! Domain models and data structures
//!
//! This module contains all the core data types used throughout the service:
//! the invoice aggregate, appointment snapshots synced from the hospital
//! platform, gateway orders, and the request/response bodies of the HTTP API.
//! These are "pure" data structures; the arithmetic lives in `ledger`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    PartiallyPaid,
    Paid,
    Refunded,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Refunded => "refunded",
            InvoiceStatus::Void => "void",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Amount,
    Percent,
}

/// Accepted payment channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    Online,
    Gpay,
    Phonepe,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Upi => "upi",
            PaymentMethod::Online => "online",
            PaymentMethod::Gpay => "gpay",
            PaymentMethod::Phonepe => "phonepe",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "upi" => Ok(PaymentMethod::Upi),
            "online" => Ok(PaymentMethod::Online),
            "gpay" => Ok(PaymentMethod::Gpay),
            "phonepe" => Ok(PaymentMethod::Phonepe),
            other => Err(format!("Invalid payment method: {}", other)),
        }
    }
}

/// Line item on an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceItem {
    pub id: u64,
    #[serde(rename = "type")]
    pub item_type: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

/// A payment applied to an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: u64,
    pub invoice_id: u64,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub reference: Option<String>,
    pub received_by_user_id: u64,
    pub received_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub id: u64,
    pub invoice_id: u64,
    pub amount: Decimal,
    pub reason: String,
    pub processed_by_user_id: u64,
    pub processed_at: DateTime<Utc>,
}

/// Invoice aggregate
///
/// Items, payments and refunds are stored with the invoice so a single write
/// persists every ledger change together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: u64,
    pub hospital_id: u64,
    pub patient_id: u64,
    pub appointment_id: Option<u64>,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub discount_type: Option<DiscountType>,
    pub discount_reason: Option<String>,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub paid_amount: Decimal,
    pub balance_amount: Decimal,
    pub currency: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
    #[serde(default)]
    pub payments: Vec<Payment>,
    #[serde(default)]
    pub refunds: Vec<Refund>,
}

/// Doctor details carried on a synced appointment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorInfo {
    pub consultation_fee: Option<Decimal>,
    pub specialty: Option<String>,
}

/// Appointment snapshot synced from the hospital platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    #[serde(default)]
    pub id: u64,
    pub hospital_id: Option<u64>,
    pub patient_id: u64,
    #[serde(default)]
    pub doctor: Option<DoctorInfo>,
    pub payment_status: Option<String>,
    pub notes: Option<String>,
    pub appointment_date: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Audit trail entry for billing mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub hospital_id: u64,
    pub patient_id: u64,
    pub actor_user_id: u64,
    pub actor_role: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: u64,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Filters for invoice listing
#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub hospital_id: Option<u64>,
    pub patient_id: Option<u64>,
    pub appointment_id: Option<u64>,
    pub status: Option<InvoiceStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl InvoiceFilter {
    pub fn matches(&self, invoice: &Invoice) -> bool {
        self.hospital_id.is_none_or(|id| invoice.hospital_id == id)
            && self.patient_id.is_none_or(|id| invoice.patient_id == id)
            && self
                .appointment_id
                .is_none_or(|id| invoice.appointment_id == Some(id))
            && self.status.is_none_or(|s| invoice.status == s)
            && self.date_from.is_none_or(|from| invoice.created_at >= from)
            && self.date_to.is_none_or(|to| invoice.created_at <= to)
    }
}

// ---------------------------------------------------------------------------
// HTTP request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceItemInput {
    #[serde(rename = "type")]
    pub item_type: String,
    pub description: String,
    pub quantity: Option<u32>,
    pub unit_price: Decimal,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceRequest {
    pub appointment_id: Option<u64>,
    pub patient_id: Option<u64>,
    pub items: Option<Vec<InvoiceItemInput>>,
    pub discount_amount: Option<Decimal>,
    pub discount_type: Option<DiscountType>,
    pub discount_reason: Option<String>,
    pub tax_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceListQuery {
    pub patient_id: Option<u64>,
    pub appointment_id: Option<u64>,
    pub status: Option<InvoiceStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentRequest {
    pub method: Option<String>,
    pub amount: Option<Decimal>,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub invoice_id: Option<u64>,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
    pub invoice_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateSuccessRequest {
    pub order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// HTTP response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PaymentResult {
    pub payment: Payment,
    pub invoice: Invoice,
}

#[derive(Debug, Serialize)]
pub struct RefundResult {
    pub refund: Refund,
    pub invoice: Invoice,
}

#[derive(Debug, Serialize)]
pub struct OrderSummary {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: OrderStatus,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub success: bool,
    pub order: OrderSummary,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
    pub message: String,
    pub payment: Payment,
    pub invoice: Invoice,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub success: bool,
    pub order: PaymentOrder,
}

#[derive(Debug, Serialize)]
pub struct SimulateSuccessResponse {
    pub success: bool,
    pub message: String,
    pub payment: SimulatedPayment,
}

#[derive(Debug, Serialize)]
pub struct Acknowledgement {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store: &'static str,
    pub gateway: &'static str,
}

// ---------------------------------------------------------------------------
// Payment gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Attempted,
    Paid,
    Failed,
    Refunded,
    PartiallyRefunded,
}

/// Order as reported by the payment gateway; amounts are in paise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub id: String,
    pub entity: String,
    pub amount: i64,
    pub amount_paid: i64,
    pub amount_due: i64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: OrderStatus,
    pub attempts: u32,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    pub created_at: i64,
}

/// Parameters for a new gateway order; `amount` is in paise
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOrderData {
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PaymentVerification {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    pub order_id: String,
    pub amount: i64,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub amount: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatedPayment {
    pub payment_id: String,
    pub order_id: String,
    pub status: String,
}
