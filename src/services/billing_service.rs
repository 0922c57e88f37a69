//! Invoice lifecycle
//!
//! Creation, issuing, payments, refunds and voiding of invoices. Each
//! mutation holds the invoice's lock from load to save, runs a `ledger`
//! transition, persists the aggregate and writes an audit entry.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use crate::auth::Actor;
use crate::error::{BillingError, BillingResult};
use crate::infrastructure::{InvoiceScope, RetryOptions, Sequence, retry_db_operation};
use crate::ledger;
use crate::models::*;
use crate::state::AppState;

pub const CONSULTATION_FEE: &str = "consultation_fee";

/// User id credited with payments that arrived without a desk operator
const SYSTEM_USER_ID: u64 = 1;

/// Line items and adjustments shared by every invoice kind
#[derive(Debug, Clone, Default)]
pub struct Charges {
    pub items: Vec<InvoiceItemInput>,
    pub discount_amount: Option<Decimal>,
    pub discount_type: Option<DiscountType>,
    pub discount_reason: Option<String>,
    pub tax_amount: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub hospital_id: u64,
    pub appointment_id: u64,
    pub charges: Charges,
}

#[derive(Debug, Clone)]
pub struct CreateLabInvoice {
    pub hospital_id: u64,
    pub patient_id: u64,
    pub charges: Charges,
}

#[derive(Debug, Clone)]
pub struct RecordPayment {
    pub invoice_id: u64,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub received_by_user_id: u64,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ProcessRefund {
    pub invoice_id: u64,
    pub amount: Decimal,
    pub reason: String,
    pub processed_by_user_id: u64,
}

// ---------------------------------------------------------------------------
// Invoice numbering
// ---------------------------------------------------------------------------

/// `HOSP-2026-000042`
pub fn format_invoice_number(year: i32, sequence: u64) -> String {
    format!("HOSP-{}-{:06}", year, sequence)
}

pub fn parse_invoice_sequence(invoice_number: &str) -> Option<u64> {
    invoice_number.rsplit('-').next()?.parse().ok()
}

async fn allocate_invoice_number(state: &AppState, hospital_id: u64, now: DateTime<Utc>) -> BillingResult<String> {
    let year = now.year();
    let sequence = state.store.next_invoice_sequence(hospital_id, year).await?;
    Ok(format_invoice_number(year, sequence))
}

// ---------------------------------------------------------------------------
// Pre-payment notes
// ---------------------------------------------------------------------------

/// Payment details written into appointment notes by online booking
///
/// `Payment: TXN123 | Method: card | Amount: ₹500 | Status: success`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrepaymentNote {
    pub reference: Option<String>,
    pub method: Option<PaymentMethod>,
    pub amount: Option<Decimal>,
    pub paid_at: Option<DateTime<Utc>>,
}

const NOTE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%m/%d/%Y"];
const NOTE_TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M:%S %p"];

fn parse_note_datetime(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = NOTE_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date, fmt).ok())?;
    let time = NOTE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&time.to_uppercase(), fmt).ok())?;
    Some(date.and_time(time).and_utc())
}

pub fn parse_prepayment_note(notes: &str) -> PrepaymentNote {
    let mut parsed = PrepaymentNote::default();
    let mut date = None;
    let mut time = None;

    for segment in notes.split(['|', '\n']) {
        let Some((key, value)) = segment.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "payment" => parsed.reference = Some(value.to_string()),
            "method" => parsed.method = PaymentMethod::from_str(value).ok(),
            "amount" => {
                let cleaned: String = value
                    .chars()
                    .filter(|c| !matches!(c, '₹' | ',') && !c.is_whitespace())
                    .collect();
                parsed.amount = Decimal::from_str(&cleaned)
                    .ok()
                    .filter(|amount| *amount > Decimal::ZERO);
            }
            "date" => date = Some(value.to_string()),
            "time" => time = Some(value.to_string()),
            _ => {}
        }
    }

    if let (Some(date), Some(time)) = (date, time) {
        parsed.paid_at = parse_note_datetime(&date, &time);
    }
    parsed
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_charges(charges: &Charges) -> BillingResult<()> {
    for item in &charges.items {
        if item.unit_price < Decimal::ZERO {
            return Err(BillingError::validation("Item unit price cannot be negative"));
        }
        if item.quantity == Some(0) {
            return Err(BillingError::validation("Item quantity must be at least 1"));
        }
    }
    if charges.discount_amount.is_some_and(|d| d < Decimal::ZERO) {
        return Err(BillingError::validation("Discount cannot be negative"));
    }
    if charges.tax_amount.is_some_and(|t| t < Decimal::ZERO) {
        return Err(BillingError::validation("Tax cannot be negative"));
    }
    Ok(())
}

async fn build_items(state: &AppState, inputs: &[InvoiceItemInput]) -> BillingResult<Vec<InvoiceItem>> {
    let mut items = Vec::with_capacity(inputs.len());
    for input in inputs {
        let quantity = input.quantity.unwrap_or(1);
        items.push(InvoiceItem {
            id: state.store.next_id(Sequence::InvoiceItem).await?,
            item_type: input.item_type.clone(),
            description: input.description.clone(),
            quantity,
            unit_price: input.unit_price,
            amount: ledger::line_amount(input.unit_price, quantity)?,
        });
    }
    Ok(items)
}

/// Unpaid invoice skeleton with totals computed from `charges`
#[allow(clippy::too_many_arguments)]
fn draft_invoice(
    id: u64,
    hospital_id: u64,
    patient_id: u64,
    appointment_id: Option<u64>,
    invoice_number: String,
    charges: &Charges,
    items: Vec<InvoiceItem>,
    currency: &str,
    now: DateTime<Utc>,
) -> BillingResult<Invoice> {
    let subtotal = ledger::subtotal(items.iter().map(|i| (i.unit_price, i.quantity)))?;
    let totals = ledger::calculate_totals(
        subtotal,
        charges.discount_amount.unwrap_or_default(),
        charges.discount_type,
        charges.tax_amount.unwrap_or_default(),
    )?;

    Ok(Invoice {
        id,
        hospital_id,
        patient_id,
        appointment_id,
        invoice_number,
        status: ledger::derive_status(Decimal::ZERO, totals.total, false, false),
        subtotal: totals.subtotal,
        discount_amount: totals.discount_amount,
        discount_type: charges.discount_type,
        discount_reason: charges.discount_reason.clone(),
        tax_amount: totals.tax_amount,
        total: totals.total,
        paid_amount: Decimal::ZERO,
        balance_amount: totals.total,
        currency: currency.to_string(),
        issued_at: None,
        voided_at: None,
        created_at: now,
        updated_at: None,
        items,
        payments: Vec::new(),
        refunds: Vec::new(),
    })
}

fn ledger_snapshot(invoice: &Invoice) -> serde_json::Value {
    json!({
        "invoiceId": invoice.id,
        "paidAmount": invoice.paid_amount,
        "status": invoice.status,
    })
}

struct AuditEvent<'a> {
    action: &'static str,
    entity_type: &'static str,
    entity_id: u64,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
    message: String,
    invoice: &'a Invoice,
}

/// Record an audit entry; failures are logged, the ledger write stands
async fn audit(state: &AppState, actor: Option<&Actor>, event: AuditEvent<'_>) {
    let Some(actor) = actor else {
        return;
    };
    tracing::info!(
        action = event.action,
        entity_type = event.entity_type,
        entity_id = event.entity_id,
        invoice_number = %event.invoice.invoice_number,
        actor_user_id = actor.user_id,
        actor_role = %actor.role,
        "{}",
        event.message
    );

    let entry = AuditEntry {
        hospital_id: event.invoice.hospital_id,
        patient_id: event.invoice.patient_id,
        actor_user_id: actor.user_id,
        actor_role: actor.role.to_string(),
        action: event.action.to_string(),
        entity_type: event.entity_type.to_string(),
        entity_id: event.entity_id,
        before: event.before,
        after: event.after,
        message: event.message,
        created_at: Utc::now(),
    };
    if let Err(e) = state.store.append_audit(&entry).await {
        tracing::warn!(error = %e, action = %entry.action, "failed to write audit entry");
    }
}

async fn load_invoice(state: &AppState, invoice_id: u64) -> BillingResult<Invoice> {
    state
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| BillingError::not_found("Invoice not found"))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Create the invoice for an appointment
///
/// A consultation fee line is added when the caller did not supply one.
/// Appointments paid online at booking start with that payment applied.
pub async fn create_appointment_invoice(
    state: &AppState,
    input: CreateInvoice,
    actor: Option<&Actor>,
) -> BillingResult<Invoice> {
    validate_charges(&input.charges)?;

    let store = state.store.as_ref();
    let appointment_id = input.appointment_id;
    let appointment = retry_db_operation(
        move || store.get_appointment(appointment_id),
        RetryOptions::reads(),
    )
    .await?
    .filter(|a| a.hospital_id.is_none_or(|h| h == input.hospital_id))
    .ok_or_else(|| BillingError::not_found("Appointment not found"))?;

    let invoice_id = state.store.next_id(Sequence::Invoice).await?;
    if !state
        .store
        .reserve_appointment_invoice(appointment_id, invoice_id)
        .await?
    {
        return Err(BillingError::Conflict(
            "Invoice already exists for this appointment".to_string(),
        ));
    }

    let created = build_appointment_invoice(state, invoice_id, &input, &appointment, actor).await;
    match created {
        Ok(invoice) => Ok(invoice),
        Err(e) => {
            if let Err(release_err) = state.store.release_appointment_invoice(appointment_id).await {
                tracing::error!(error = %release_err, appointment_id, "failed to release appointment reservation");
            }
            Err(e)
        }
    }
}

async fn build_appointment_invoice(
    state: &AppState,
    invoice_id: u64,
    input: &CreateInvoice,
    appointment: &Appointment,
    actor: Option<&Actor>,
) -> BillingResult<Invoice> {
    let now = Utc::now();
    let mut charges = input.charges.clone();

    if !charges.items.iter().any(|i| i.item_type == CONSULTATION_FEE) {
        let doctor = appointment.doctor.clone().unwrap_or_default();
        charges.items.push(InvoiceItemInput {
            item_type: CONSULTATION_FEE.to_string(),
            description: format!(
                "Consultation fee - {}",
                doctor.specialty.as_deref().unwrap_or("General")
            ),
            quantity: Some(1),
            unit_price: doctor
                .consultation_fee
                .unwrap_or(state.config.default_consultation_fee),
        });
    }

    let items = build_items(state, &charges.items).await?;
    let invoice_number = allocate_invoice_number(state, input.hospital_id, now).await?;
    let mut invoice = draft_invoice(
        invoice_id,
        input.hospital_id,
        appointment.patient_id,
        Some(appointment.id),
        invoice_number,
        &charges,
        items,
        &state.config.currency,
        now,
    )?;

    let prepaid = appointment
        .payment_status
        .as_deref()
        .filter(|s| s.eq_ignore_ascii_case("paid"))
        .and(appointment.notes.as_deref())
        .map(parse_prepayment_note)
        .unwrap_or_default();

    let mut prepaid_amount = Decimal::ZERO;
    if let Some(amount) = prepaid.amount {
        let applied = amount.min(invoice.total);
        if applied > Decimal::ZERO {
            match state.store.next_id(Sequence::Payment).await {
                Ok(payment_id) => {
                    ledger::apply_payment(&mut invoice, applied, now)?;
                    invoice.updated_at = None;
                    invoice.payments.push(Payment {
                        id: payment_id,
                        invoice_id,
                        method: prepaid.method.unwrap_or(PaymentMethod::Online),
                        amount: applied,
                        reference: prepaid.reference.clone(),
                        received_by_user_id: actor.map_or(SYSTEM_USER_ID, |a| a.user_id),
                        received_at: prepaid
                            .paid_at
                            .or(appointment.confirmed_at)
                            .or(appointment.appointment_date)
                            .unwrap_or(now),
                        notes: Some(format!(
                            "Online payment completed during appointment booking. Amount: ₹{}",
                            applied
                        )),
                        created_at: now,
                    });
                    prepaid_amount = applied;
                }
                Err(e) => {
                    tracing::error!(error = %e, invoice_id, "failed to record pre-paid appointment payment");
                }
            }
        }
    }

    state.store.insert_invoice(&invoice).await?;

    let mut message = format!(
        "Invoice {} created for appointment {}. Total: ₹{}",
        invoice.invoice_number, appointment.id, invoice.total
    );
    if prepaid_amount > Decimal::ZERO {
        message.push_str(&format!(", Pre-paid: ₹{}", prepaid_amount));
    }
    audit(
        state,
        actor,
        AuditEvent {
            action: "create_invoice",
            entity_type: "invoice",
            entity_id: invoice.id,
            before: None,
            after: Some(json!({
                "invoiceId": invoice.id,
                "invoiceNumber": invoice.invoice_number,
                "appointmentId": appointment.id,
                "total": invoice.total,
                "status": invoice.status,
            })),
            message,
            invoice: &invoice,
        },
    )
    .await;

    Ok(invoice)
}

/// Create an invoice for lab work billed without an appointment
pub async fn create_lab_test_invoice(
    state: &AppState,
    input: CreateLabInvoice,
    actor: Option<&Actor>,
) -> BillingResult<Invoice> {
    if input.charges.items.is_empty() {
        return Err(BillingError::validation(
            "At least one invoice item is required",
        ));
    }
    validate_charges(&input.charges)?;

    let now = Utc::now();
    let invoice_id = state.store.next_id(Sequence::Invoice).await?;
    let items = build_items(state, &input.charges.items).await?;
    let invoice_number = allocate_invoice_number(state, input.hospital_id, now).await?;
    let invoice = draft_invoice(
        invoice_id,
        input.hospital_id,
        input.patient_id,
        None,
        invoice_number,
        &input.charges,
        items,
        &state.config.currency,
        now,
    )?;

    state.store.insert_invoice(&invoice).await?;

    audit(
        state,
        actor,
        AuditEvent {
            action: "create_invoice",
            entity_type: "invoice",
            entity_id: invoice.id,
            before: None,
            after: Some(json!({
                "invoiceId": invoice.id,
                "invoiceNumber": invoice.invoice_number,
                "total": invoice.total,
                "status": invoice.status,
            })),
            message: format!(
                "Invoice {} created for lab test. Total: ₹{}",
                invoice.invoice_number, invoice.total
            ),
            invoice: &invoice,
        },
    )
    .await;

    Ok(invoice)
}

pub async fn issue_invoice(state: &AppState, invoice_id: u64, actor: Option<&Actor>) -> BillingResult<Invoice> {
    let _guard = state.lock_invoice(invoice_id).await;
    let mut invoice = load_invoice(state, invoice_id).await?;
    let before = invoice.status;

    ledger::issue(&mut invoice, Utc::now())?;
    state.store.save_invoice(&invoice).await?;

    audit(
        state,
        actor,
        AuditEvent {
            action: "issue_invoice",
            entity_type: "invoice",
            entity_id: invoice.id,
            before: Some(json!({ "status": before })),
            after: Some(json!({ "status": invoice.status })),
            message: format!("Invoice {} issued", invoice.invoice_number),
            invoice: &invoice,
        },
    )
    .await;

    Ok(invoice)
}

/// Apply a payment to an invoice
///
/// A payment whose `reference` is already on the invoice is not applied
/// again; the earlier payment is returned with the invoice unchanged.
pub async fn record_payment(
    state: &AppState,
    input: RecordPayment,
    actor: Option<&Actor>,
) -> BillingResult<PaymentResult> {
    let _guard = state.lock_invoice(input.invoice_id).await;
    let mut invoice = load_invoice(state, input.invoice_id).await?;

    if let Some(reference) = input.reference.as_deref() {
        let existing = invoice
            .payments
            .iter()
            .find(|p| p.reference.as_deref() == Some(reference))
            .cloned();
        if let Some(payment) = existing {
            tracing::info!(
                invoice_id = invoice.id,
                payment_id = payment.id,
                reference,
                "payment reference already recorded"
            );
            return Ok(PaymentResult { payment, invoice });
        }
    }

    let now = Utc::now();
    let before = ledger_snapshot(&invoice);
    ledger::apply_payment(&mut invoice, input.amount, now)?;

    let payment = Payment {
        id: state.store.next_id(Sequence::Payment).await?,
        invoice_id: invoice.id,
        method: input.method,
        amount: input.amount,
        reference: input.reference,
        received_by_user_id: input.received_by_user_id,
        received_at: input.received_at.unwrap_or(now),
        notes: input.notes,
        created_at: now,
    };
    invoice.payments.push(payment.clone());
    state.store.save_invoice(&invoice).await?;

    let mut after = ledger_snapshot(&invoice);
    after["paymentMethod"] = json!(payment.method);
    after["paymentAmount"] = json!(payment.amount);
    audit(
        state,
        actor,
        AuditEvent {
            action: "record_payment",
            entity_type: "payment",
            entity_id: payment.id,
            before: Some(before),
            after: Some(after),
            message: format!(
                "Payment of ₹{} recorded via {} for invoice {}",
                payment.amount, payment.method, invoice.invoice_number
            ),
            invoice: &invoice,
        },
    )
    .await;

    Ok(PaymentResult { payment, invoice })
}

pub async fn process_refund(
    state: &AppState,
    input: ProcessRefund,
    actor: Option<&Actor>,
) -> BillingResult<RefundResult> {
    if input.reason.trim().is_empty() {
        return Err(BillingError::validation("Refund reason is required"));
    }

    let _guard = state.lock_invoice(input.invoice_id).await;
    let mut invoice = load_invoice(state, input.invoice_id).await?;

    let now = Utc::now();
    let before = ledger_snapshot(&invoice);
    ledger::apply_refund(&mut invoice, input.amount, now)?;

    let refund = Refund {
        id: state.store.next_id(Sequence::Refund).await?,
        invoice_id: invoice.id,
        amount: input.amount,
        reason: input.reason,
        processed_by_user_id: input.processed_by_user_id,
        processed_at: now,
    };
    invoice.refunds.push(refund.clone());
    state.store.save_invoice(&invoice).await?;

    let mut after = ledger_snapshot(&invoice);
    after["refundAmount"] = json!(refund.amount);
    audit(
        state,
        actor,
        AuditEvent {
            action: "process_refund",
            entity_type: "refund",
            entity_id: refund.id,
            before: Some(before),
            after: Some(after),
            message: format!(
                "Refund of ₹{} processed for invoice {}. Reason: {}",
                refund.amount, invoice.invoice_number, refund.reason
            ),
            invoice: &invoice,
        },
    )
    .await;

    Ok(RefundResult { refund, invoice })
}

pub async fn void_invoice(state: &AppState, invoice_id: u64, actor: Option<&Actor>) -> BillingResult<Invoice> {
    let _guard = state.lock_invoice(invoice_id).await;
    let mut invoice = load_invoice(state, invoice_id).await?;
    let before = invoice.status;

    ledger::void(&mut invoice, Utc::now())?;
    state.store.save_invoice(&invoice).await?;

    audit(
        state,
        actor,
        AuditEvent {
            action: "void_invoice",
            entity_type: "invoice",
            entity_id: invoice.id,
            before: Some(json!({ "status": before })),
            after: Some(json!({ "status": invoice.status })),
            message: format!("Invoice {} voided", invoice.invoice_number),
            invoice: &invoice,
        },
    )
    .await;

    Ok(invoice)
}

/// Invoice with items, refunds, and payments newest first
pub async fn get_invoice(state: &AppState, invoice_id: u64) -> BillingResult<Invoice> {
    let store = state.store.as_ref();
    let mut invoice = retry_db_operation(
        move || store.get_invoice(invoice_id),
        RetryOptions::reads(),
    )
    .await?
    .ok_or_else(|| BillingError::not_found("Invoice not found"))?;

    invoice
        .payments
        .sort_by(|a, b| b.received_at.cmp(&a.received_at));
    Ok(invoice)
}

/// Invoices matching `filter`, newest first
pub async fn list_invoices(state: &AppState, filter: &InvoiceFilter) -> BillingResult<Vec<Invoice>> {
    let scope = match (filter.patient_id, filter.hospital_id) {
        (Some(patient_id), _) => InvoiceScope::Patient(patient_id),
        (None, Some(hospital_id)) => InvoiceScope::Hospital(hospital_id),
        (None, None) => InvoiceScope::All,
    };

    let store = state.store.as_ref();
    let invoices = retry_db_operation(
        move || async move {
            let ids = store.list_invoice_ids(scope).await?;
            store.get_invoices(&ids).await
        },
        RetryOptions::reads(),
    )
    .await?;

    Ok(invoices.into_iter().filter(|inv| filter.matches(inv)).collect())
}

/// Store an appointment snapshot pushed by the hospital platform
pub async fn sync_appointment(
    state: &AppState,
    appointment_id: u64,
    mut appointment: Appointment,
) -> BillingResult<Appointment> {
    appointment.id = appointment_id;
    state.store.put_appointment(&appointment).await?;
    tracing::debug!(appointment_id, "appointment synced");
    Ok(appointment)
}
