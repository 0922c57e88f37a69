//! Online checkout against the payment gateway
//!
//! Ties gateway orders to invoices: an order is opened for part or all of an
//! invoice's balance, and a verified gateway payment is booked on the ledger
//! as an `online` payment referenced by the gateway payment id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::auth::Actor;
use crate::error::{BillingError, BillingResult};
use crate::ledger;
use crate::models::{
    InvoiceStatus, PaymentMethod, PaymentOrder, PaymentOrderData, PaymentResult,
    PaymentVerification,
};
use crate::services::billing_service::{self, RecordPayment};
use crate::state::AppState;

/// Open a gateway order for `amount` rupees against an invoice
pub async fn create_invoice_order(
    state: &AppState,
    invoice_id: u64,
    amount: Decimal,
    actor: &Actor,
) -> BillingResult<PaymentOrder> {
    let invoice = billing_service::get_invoice(state, invoice_id).await?;
    actor.ensure_can_view(&invoice)?;

    if invoice.status == InvoiceStatus::Void {
        return Err(BillingError::validation("Cannot collect payment for void invoice"));
    }
    if amount <= Decimal::ZERO {
        return Err(BillingError::validation("amount must be positive"));
    }
    if amount > invoice.balance_amount {
        return Err(BillingError::validation(format!(
            "amount {} exceeds outstanding balance {}",
            amount, invoice.balance_amount
        )));
    }

    let data = PaymentOrderData {
        amount: ledger::to_paise(amount)?,
        currency: invoice.currency.clone(),
        receipt: format!("invoice_{}_{}", invoice.id, Utc::now().timestamp_millis()),
        notes: BTreeMap::from([
            ("invoice_id".to_string(), invoice.id.to_string()),
            ("patient_id".to_string(), invoice.patient_id.to_string()),
            ("invoice_number".to_string(), invoice.invoice_number.clone()),
        ]),
    };
    Ok(state.gateway.create_order(&data).await?)
}

/// Verify a gateway payment and book it on the invoice
///
/// Safe to repeat: the gateway payment id is the ledger reference, so a
/// second verification returns the payment recorded by the first.
pub async fn settle_gateway_payment(
    state: &AppState,
    invoice_id: u64,
    verification: PaymentVerification,
    actor: &Actor,
) -> BillingResult<PaymentResult> {
    if !state.gateway.verify_payment(&verification).await {
        return Err(BillingError::validation("Payment verification failed"));
    }

    let order = state
        .gateway
        .get_order(&verification.order_id)
        .await?
        .ok_or_else(|| BillingError::not_found("Order not found"))?;

    if let Some(noted) = order.notes.get("invoice_id") {
        if noted != &invoice_id.to_string() {
            return Err(BillingError::validation(
                "Order does not belong to this invoice",
            ));
        }
    }

    let received_at = DateTime::<Utc>::from_timestamp(order.created_at, 0);
    billing_service::record_payment(
        state,
        RecordPayment {
            invoice_id,
            method: PaymentMethod::Online,
            amount: ledger::from_paise(order.amount),
            reference: Some(verification.payment_id.clone()),
            notes: Some(format!(
                "Online payment via payment gateway. Order ID: {}",
                verification.order_id
            )),
            received_by_user_id: actor.user_id,
            received_at,
        },
        Some(actor),
    )
    .await
}
