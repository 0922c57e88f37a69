//! Invoice ledger arithmetic
//!
//! Pure functions over the [`Invoice`] aggregate. Nothing in here touches the
//! store; the billing service loads an invoice, runs one of these transitions
//! and persists the result.
//!
//! Invariants kept by every transition:
//! - `balance_amount == total - paid_amount`
//! - `0 <= paid_amount <= total`
//! - `status` is recomputed from the amounts, never set directly

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};
use crate::models::{DiscountType, Invoice, InvoiceStatus};

const MONEY_DP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Round to paise precision, half away from zero
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

fn out_of_range() -> BillingError {
    BillingError::validation("Amount out of range")
}

/// Convert rupees to integer paise for the gateway
pub fn to_paise(rupees: Decimal) -> BillingResult<i64> {
    rupees
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|paise| paise.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|paise| paise.to_i64())
        .ok_or_else(out_of_range)
}

pub fn from_paise(paise: i64) -> Decimal {
    Decimal::new(paise, 2)
}

pub fn line_amount(unit_price: Decimal, quantity: u32) -> BillingResult<Decimal> {
    unit_price
        .checked_mul(Decimal::from(quantity))
        .map(round_money)
        .ok_or_else(out_of_range)
}

/// Sum of `unit_price * quantity` over `(unit_price, quantity)` pairs
pub fn subtotal<I>(lines: I) -> BillingResult<Decimal>
where
    I: IntoIterator<Item = (Decimal, u32)>,
{
    lines.into_iter().try_fold(Decimal::ZERO, |sum, (price, qty)| {
        sum.checked_add(line_amount(price, qty)?)
            .ok_or_else(out_of_range)
    })
}

pub fn calculate_totals(
    subtotal: Decimal,
    discount: Decimal,
    discount_type: Option<DiscountType>,
    tax: Decimal,
) -> BillingResult<Totals> {
    let discount_amount = match discount_type {
        Some(DiscountType::Percent) if discount > Decimal::ZERO => subtotal
            .checked_mul(discount)
            .map(|d| d / Decimal::ONE_HUNDRED)
            .ok_or_else(out_of_range)?,
        _ => discount,
    };
    let total = subtotal
        .checked_sub(discount_amount)
        .and_then(|net| net.checked_add(tax))
        .ok_or_else(out_of_range)?
        .max(Decimal::ZERO);

    Ok(Totals {
        subtotal: round_money(subtotal),
        discount_amount: round_money(discount_amount),
        tax_amount: round_money(tax),
        total: round_money(total),
    })
}

/// Status implied by the current amounts
///
/// `void` is terminal and never derived; callers check it first.
pub fn derive_status(
    paid: Decimal,
    total: Decimal,
    issued: bool,
    has_refunds: bool,
) -> InvoiceStatus {
    if paid >= total {
        InvoiceStatus::Paid
    } else if paid > Decimal::ZERO {
        InvoiceStatus::PartiallyPaid
    } else if has_refunds {
        InvoiceStatus::Refunded
    } else if issued {
        InvoiceStatus::Issued
    } else {
        InvoiceStatus::Draft
    }
}

fn recompute(invoice: &mut Invoice) {
    invoice.balance_amount = invoice.total - invoice.paid_amount;
    if invoice.status != InvoiceStatus::Void {
        invoice.status = derive_status(
            invoice.paid_amount,
            invoice.total,
            invoice.issued_at.is_some(),
            !invoice.refunds.is_empty(),
        );
    }
}

/// Apply a payment of `amount` to the invoice
pub fn apply_payment(invoice: &mut Invoice, amount: Decimal, at: DateTime<Utc>) -> BillingResult<()> {
    if invoice.status == InvoiceStatus::Void {
        return Err(BillingError::validation(
            "Cannot record payment for void invoice",
        ));
    }
    if amount <= Decimal::ZERO {
        return Err(BillingError::validation("Payment amount must be positive"));
    }
    if amount > invoice.balance_amount {
        return Err(BillingError::validation(format!(
            "Payment amount {} exceeds outstanding balance {}",
            amount, invoice.balance_amount
        )));
    }

    invoice.paid_amount = round_money(invoice.paid_amount + amount);
    invoice.updated_at = Some(at);
    recompute(invoice);
    Ok(())
}

/// Validate a refund of `amount` and take it off the paid amount
///
/// The caller appends the refund record once this succeeds.
pub fn apply_refund(invoice: &mut Invoice, amount: Decimal, at: DateTime<Utc>) -> BillingResult<()> {
    if invoice.status == InvoiceStatus::Void {
        return Err(BillingError::validation("Cannot refund void invoice"));
    }
    if invoice.paid_amount.is_zero() {
        return Err(BillingError::validation("Cannot refund unpaid invoice"));
    }
    if amount <= Decimal::ZERO {
        return Err(BillingError::validation("Refund amount must be positive"));
    }
    if amount > invoice.paid_amount {
        return Err(BillingError::validation(
            "Refund amount cannot exceed paid amount",
        ));
    }

    invoice.paid_amount = round_money(invoice.paid_amount - amount);
    invoice.updated_at = Some(at);
    invoice.balance_amount = invoice.total - invoice.paid_amount;
    invoice.status = derive_status(
        invoice.paid_amount,
        invoice.total,
        invoice.issued_at.is_some(),
        true,
    );
    Ok(())
}

pub fn issue(invoice: &mut Invoice, at: DateTime<Utc>) -> BillingResult<()> {
    if invoice.status != InvoiceStatus::Draft {
        return Err(BillingError::InvalidTransition {
            action: "issue",
            status: invoice.status,
        });
    }
    invoice.issued_at = Some(at);
    invoice.updated_at = Some(at);
    recompute(invoice);
    Ok(())
}

pub fn void(invoice: &mut Invoice, at: DateTime<Utc>) -> BillingResult<()> {
    let voidable = matches!(invoice.status, InvoiceStatus::Draft | InvoiceStatus::Issued);
    if !voidable || !invoice.paid_amount.is_zero() {
        return Err(BillingError::InvalidTransition {
            action: "void",
            status: invoice.status,
        });
    }
    invoice.status = InvoiceStatus::Void;
    invoice.voided_at = Some(at);
    invoice.updated_at = Some(at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn invoice(total: Decimal) -> Invoice {
        Invoice {
            id: 1,
            hospital_id: 7,
            patient_id: 11,
            appointment_id: None,
            invoice_number: "HOSP-2026-000001".to_string(),
            status: derive_status(Decimal::ZERO, total, false, false),
            subtotal: total,
            discount_amount: Decimal::ZERO,
            discount_type: None,
            discount_reason: None,
            tax_amount: Decimal::ZERO,
            total,
            paid_amount: Decimal::ZERO,
            balance_amount: total,
            currency: "INR".to_string(),
            issued_at: None,
            voided_at: None,
            created_at: Utc::now(),
            updated_at: None,
            items: Vec::new(),
            payments: Vec::new(),
            refunds: Vec::new(),
        }
    }

    #[test]
    fn percent_discount_is_taken_from_subtotal() {
        let totals =
            calculate_totals(dec!(1000), dec!(10), Some(DiscountType::Percent), dec!(18)).unwrap();
        assert_eq!(totals.discount_amount, dec!(100.00));
        assert_eq!(totals.total, dec!(918.00));
    }

    #[test]
    fn absolute_discount_and_negative_total_clamped() {
        let totals =
            calculate_totals(dec!(300), dec!(500), Some(DiscountType::Amount), dec!(0)).unwrap();
        assert_eq!(totals.discount_amount, dec!(500));
        assert_eq!(totals.total, Decimal::ZERO);

        let untyped = calculate_totals(dec!(300), dec!(50), None, dec!(5)).unwrap();
        assert_eq!(untyped.total, dec!(255));
    }

    #[test]
    fn subtotal_multiplies_quantities() {
        let s = subtotal([(dec!(250.50), 2), (dec!(99.99), 1)]).unwrap();
        assert_eq!(s, dec!(600.99));
    }

    #[test]
    fn oversized_amounts_are_rejected() {
        let err = line_amount(Decimal::MAX, 2).unwrap_err();
        assert_eq!(err.to_string(), "Amount out of range");

        assert!(subtotal([(Decimal::MAX, 1), (dec!(1), 1)]).is_err());
        assert!(calculate_totals(Decimal::MAX, Decimal::MAX, Some(DiscountType::Percent), dec!(0)).is_err());
        assert!(calculate_totals(Decimal::MAX, dec!(0), None, Decimal::MAX).is_err());
        assert!(to_paise(Decimal::MAX).is_err());
    }

    #[test]
    fn paise_conversion_rounds_half_away_from_zero() {
        assert_eq!(to_paise(dec!(500)).unwrap(), 50_000);
        assert_eq!(to_paise(dec!(12.345)).unwrap(), 1_235);
        assert_eq!(from_paise(1_235), dec!(12.35));
    }

    #[test]
    fn status_derivation_table() {
        assert_eq!(derive_status(dec!(0), dec!(100), false, false), InvoiceStatus::Draft);
        assert_eq!(derive_status(dec!(0), dec!(100), true, false), InvoiceStatus::Issued);
        assert_eq!(derive_status(dec!(40), dec!(100), true, false), InvoiceStatus::PartiallyPaid);
        assert_eq!(derive_status(dec!(100), dec!(100), false, false), InvoiceStatus::Paid);
        assert_eq!(derive_status(dec!(0), dec!(100), true, true), InvoiceStatus::Refunded);
        assert_eq!(derive_status(dec!(0), dec!(0), false, false), InvoiceStatus::Paid);
    }

    #[test]
    fn payments_move_invoice_to_paid() {
        let mut inv = invoice(dec!(500));
        apply_payment(&mut inv, dec!(200), Utc::now()).unwrap();
        assert_eq!(inv.status, InvoiceStatus::PartiallyPaid);
        assert_eq!(inv.balance_amount, dec!(300));

        apply_payment(&mut inv, dec!(300), Utc::now()).unwrap();
        assert_eq!(inv.status, InvoiceStatus::Paid);
        assert_eq!(inv.balance_amount, Decimal::ZERO);
    }

    #[test]
    fn overpayment_is_rejected() {
        let mut inv = invoice(dec!(500));
        let err = apply_payment(&mut inv, dec!(500.01), Utc::now()).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(inv.paid_amount, Decimal::ZERO);
    }

    #[test]
    fn payment_on_void_invoice_is_rejected() {
        let mut inv = invoice(dec!(500));
        void(&mut inv, Utc::now()).unwrap();
        let err = apply_payment(&mut inv, dec!(10), Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "Cannot record payment for void invoice");
    }

    #[test]
    fn refund_rules() {
        let mut inv = invoice(dec!(500));
        let err = apply_refund(&mut inv, dec!(10), Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "Cannot refund unpaid invoice");

        apply_payment(&mut inv, dec!(500), Utc::now()).unwrap();
        let err = apply_refund(&mut inv, dec!(600), Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "Refund amount cannot exceed paid amount");

        apply_refund(&mut inv, dec!(100), Utc::now()).unwrap();
        assert_eq!(inv.status, InvoiceStatus::PartiallyPaid);
        assert_eq!(inv.balance_amount, dec!(100));

        apply_refund(&mut inv, dec!(400), Utc::now()).unwrap();
        assert_eq!(inv.status, InvoiceStatus::Refunded);
        assert_eq!(inv.balance_amount, dec!(500));
    }

    #[test]
    fn issue_only_from_draft() {
        let mut inv = invoice(dec!(500));
        issue(&mut inv, Utc::now()).unwrap();
        assert_eq!(inv.status, InvoiceStatus::Issued);
        assert!(inv.issued_at.is_some());

        let err = issue(&mut inv, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            BillingError::InvalidTransition { action: "issue", status: InvoiceStatus::Issued }
        ));
    }

    #[test]
    fn void_requires_no_payments() {
        let mut inv = invoice(dec!(500));
        apply_payment(&mut inv, dec!(50), Utc::now()).unwrap();
        assert!(void(&mut inv, Utc::now()).is_err());

        let mut fresh = invoice(dec!(500));
        issue(&mut fresh, Utc::now()).unwrap();
        void(&mut fresh, Utc::now()).unwrap();
        assert_eq!(fresh.status, InvoiceStatus::Void);
    }
}
