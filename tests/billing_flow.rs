mod common;

use chrono::{Datelike, TimeZone, Utc};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;

use nexacare_billing::BillingError;
use nexacare_billing::models::*;
use nexacare_billing::services::billing_service::{
    self, Charges, CreateInvoice, CreateLabInvoice, ProcessRefund, RecordPayment,
};
use nexacare_billing::services::checkout_service;

use common::{appointment, memory_state, patient, receptionist, sync};

fn cash(invoice_id: u64, amount: rust_decimal::Decimal, reference: Option<&str>) -> RecordPayment {
    RecordPayment {
        invoice_id,
        method: PaymentMethod::Cash,
        amount,
        reference: reference.map(str::to_string),
        notes: None,
        received_by_user_id: 40,
        received_at: None,
    }
}

fn lab_charges(unit_price: rust_decimal::Decimal, quantity: u32) -> Charges {
    Charges {
        items: vec![InvoiceItemInput {
            item_type: "lab_test".to_string(),
            description: "Complete blood count".to_string(),
            quantity: Some(quantity),
            unit_price,
        }],
        ..Charges::default()
    }
}

#[tokio::test]
async fn appointment_invoice_lifecycle() {
    let (state, store) = memory_state();
    let desk = receptionist(1);
    sync(&state, 10, appointment(1, 7, dec!(700))).await;

    let invoice = billing_service::create_appointment_invoice(
        &state,
        CreateInvoice {
            hospital_id: 1,
            appointment_id: 10,
            charges: Charges::default(),
        },
        Some(&desk),
    )
    .await
    .unwrap();

    let year = Utc::now().year();
    assert_eq!(invoice.invoice_number, format!("HOSP-{}-000001", year));
    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.patient_id, 7);
    assert_eq!(invoice.total, dec!(700));
    assert_eq!(invoice.items.len(), 1);
    assert_eq!(invoice.items[0].item_type, "consultation_fee");
    assert_eq!(invoice.items[0].description, "Consultation fee - Cardiology");

    let issued = billing_service::issue_invoice(&state, invoice.id, Some(&desk))
        .await
        .unwrap();
    assert_eq!(issued.status, InvoiceStatus::Issued);
    assert!(issued.issued_at.is_some());

    let again = billing_service::issue_invoice(&state, invoice.id, Some(&desk)).await;
    assert!(matches!(again, Err(BillingError::InvalidTransition { .. })));

    let first = billing_service::record_payment(&state, cash(invoice.id, dec!(200), Some("RCPT-1")), Some(&desk))
        .await
        .unwrap();
    assert_eq!(first.invoice.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(first.invoice.balance_amount, dec!(500));

    let repeated = billing_service::record_payment(&state, cash(invoice.id, dec!(200), Some("RCPT-1")), Some(&desk))
        .await
        .unwrap();
    assert_eq!(repeated.payment.id, first.payment.id);
    assert_eq!(repeated.invoice.paid_amount, dec!(200));
    assert_eq!(repeated.invoice.payments.len(), 1);

    let over = billing_service::record_payment(&state, cash(invoice.id, dec!(600), None), Some(&desk)).await;
    assert!(matches!(over, Err(BillingError::Validation(_))));

    let settled = billing_service::record_payment(&state, cash(invoice.id, dec!(500), None), Some(&desk))
        .await
        .unwrap();
    assert_eq!(settled.invoice.status, InvoiceStatus::Paid);
    assert_eq!(settled.invoice.balance_amount, dec!(0));

    let void = billing_service::void_invoice(&state, invoice.id, Some(&desk)).await;
    assert!(matches!(void, Err(BillingError::InvalidTransition { .. })));

    let partial = billing_service::process_refund(
        &state,
        ProcessRefund {
            invoice_id: invoice.id,
            amount: dec!(300),
            reason: "Procedure cancelled".to_string(),
            processed_by_user_id: 40,
        },
        Some(&desk),
    )
    .await
    .unwrap();
    assert_eq!(partial.invoice.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(partial.invoice.paid_amount, dec!(400));

    let full = billing_service::process_refund(
        &state,
        ProcessRefund {
            invoice_id: invoice.id,
            amount: dec!(400),
            reason: "Procedure cancelled".to_string(),
            processed_by_user_id: 40,
        },
        Some(&desk),
    )
    .await
    .unwrap();
    assert_eq!(full.invoice.status, InvoiceStatus::Refunded);
    assert_eq!(full.invoice.paid_amount, dec!(0));
    assert_eq!(full.invoice.balance_amount, dec!(700));
    assert_eq!(full.invoice.refunds.len(), 2);

    let actions: Vec<String> = store.audit_log().await.into_iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            "create_invoice",
            "issue_invoice",
            "record_payment",
            "record_payment",
            "process_refund",
            "process_refund",
        ]
    );
}

#[tokio::test]
async fn refund_requires_reason_and_paid_amount() {
    let (state, _) = memory_state();
    let desk = receptionist(1);
    let invoice = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges: lab_charges(dec!(250), 1),
        },
        Some(&desk),
    )
    .await
    .unwrap();

    let blank = billing_service::process_refund(
        &state,
        ProcessRefund {
            invoice_id: invoice.id,
            amount: dec!(10),
            reason: "  ".to_string(),
            processed_by_user_id: 40,
        },
        Some(&desk),
    )
    .await;
    assert!(matches!(blank, Err(BillingError::Validation(_))));

    let unpaid = billing_service::process_refund(
        &state,
        ProcessRefund {
            invoice_id: invoice.id,
            amount: dec!(10),
            reason: "Duplicate".to_string(),
            processed_by_user_id: 40,
        },
        Some(&desk),
    )
    .await
    .unwrap_err();
    assert_eq!(unpaid.to_string(), "Cannot refund unpaid invoice");
}

#[tokio::test]
async fn duplicate_appointment_invoice_conflicts() {
    let (state, _) = memory_state();
    let desk = receptionist(1);
    sync(&state, 11, appointment(1, 7, dec!(500))).await;

    let request = CreateInvoice {
        hospital_id: 1,
        appointment_id: 11,
        charges: Charges::default(),
    };
    billing_service::create_appointment_invoice(&state, request.clone(), Some(&desk))
        .await
        .unwrap();

    let second = billing_service::create_appointment_invoice(&state, request, Some(&desk)).await;
    assert!(matches!(second, Err(BillingError::Conflict(_))));
}

#[tokio::test]
async fn appointment_from_another_hospital_is_not_found() {
    let (state, _) = memory_state();
    sync(&state, 12, appointment(2, 7, dec!(500))).await;

    let result = billing_service::create_appointment_invoice(
        &state,
        CreateInvoice {
            hospital_id: 1,
            appointment_id: 12,
            charges: Charges::default(),
        },
        None,
    )
    .await;
    assert!(matches!(result, Err(BillingError::NotFound(_))));
}

#[tokio::test]
async fn invoice_numbers_are_sequenced_per_hospital() {
    let (state, _) = memory_state();
    let mut numbers = Vec::new();
    for hospital_id in [1, 1, 2] {
        let invoice = billing_service::create_lab_test_invoice(
            &state,
            CreateLabInvoice {
                hospital_id,
                patient_id: 3,
                charges: lab_charges(dec!(100), 1),
            },
            None,
        )
        .await
        .unwrap();
        numbers.push(billing_service::parse_invoice_sequence(&invoice.invoice_number));
    }
    assert_eq!(numbers, vec![Some(1), Some(2), Some(1)]);
}

#[tokio::test]
async fn prepaid_appointment_starts_paid() {
    let (state, _) = memory_state();
    let mut booked = appointment(1, 7, dec!(500));
    booked.payment_status = Some("PAID".to_string());
    booked.notes = Some(
        "Payment: TXN9 | Method: card | Amount: ₹500 | Date: 2026-03-14 | Time: 10:30".to_string(),
    );
    sync(&state, 13, booked).await;

    let invoice = billing_service::create_appointment_invoice(
        &state,
        CreateInvoice {
            hospital_id: 1,
            appointment_id: 13,
            charges: Charges::default(),
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.paid_amount, dec!(500));
    assert_eq!(invoice.payments.len(), 1);
    let payment = &invoice.payments[0];
    assert_eq!(payment.method, PaymentMethod::Card);
    assert_eq!(payment.reference.as_deref(), Some("TXN9"));
    assert_eq!(payment.received_by_user_id, 1);
    assert_eq!(
        payment.received_at,
        Utc.with_ymd_and_hms(2026, 3, 14, 10, 30, 0).unwrap()
    );
}

#[tokio::test]
async fn lab_invoice_applies_discount_and_tax() {
    let (state, _) = memory_state();

    let empty = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges: Charges::default(),
        },
        None,
    )
    .await;
    assert!(matches!(empty, Err(BillingError::Validation(_))));

    let mut charges = lab_charges(dec!(150), 2);
    charges.discount_amount = Some(dec!(10));
    charges.discount_type = Some(DiscountType::Percent);
    charges.tax_amount = Some(dec!(13.5));

    let invoice = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges,
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(invoice.appointment_id, None);
    assert_eq!(invoice.subtotal, dec!(300));
    assert_eq!(invoice.discount_amount, dec!(30));
    assert_eq!(invoice.total, dec!(283.5));
    assert_eq!(invoice.items[0].amount, dec!(300));
}

#[tokio::test]
async fn voided_invoice_rejects_payments() {
    let (state, _) = memory_state();
    let invoice = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges: lab_charges(dec!(100), 1),
        },
        None,
    )
    .await
    .unwrap();

    let voided = billing_service::void_invoice(&state, invoice.id, None).await.unwrap();
    assert_eq!(voided.status, InvoiceStatus::Void);
    assert!(voided.voided_at.is_some());

    let payment = billing_service::record_payment(&state, cash(invoice.id, dec!(50), None), None).await;
    assert!(matches!(payment, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn list_filters_by_status_and_patient() {
    let (state, _) = memory_state();
    for patient_id in [3, 4] {
        billing_service::create_lab_test_invoice(
            &state,
            CreateLabInvoice {
                hospital_id: 1,
                patient_id,
                charges: lab_charges(dec!(100), 1),
            },
            None,
        )
        .await
        .unwrap();
    }
    billing_service::issue_invoice(&state, 1, None).await.unwrap();

    let issued = billing_service::list_invoices(
        &state,
        &InvoiceFilter {
            hospital_id: Some(1),
            status: Some(InvoiceStatus::Issued),
            ..InvoiceFilter::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].id, 1);

    let mine = billing_service::list_invoices(
        &state,
        &InvoiceFilter {
            patient_id: Some(4),
            ..InvoiceFilter::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].patient_id, 4);
}

#[tokio::test]
async fn online_checkout_books_gateway_payment_once() {
    let (state, _) = memory_state();
    let desk = receptionist(1);
    let invoice = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges: lab_charges(dec!(1000), 1),
        },
        Some(&desk),
    )
    .await
    .unwrap();

    let too_much = checkout_service::create_invoice_order(&state, invoice.id, dec!(1500), &desk).await;
    assert!(matches!(too_much, Err(BillingError::Validation(_))));

    let stranger = checkout_service::create_invoice_order(&state, invoice.id, dec!(400), &patient(99)).await;
    assert!(matches!(stranger, Err(BillingError::NotFound(_))));

    let order = checkout_service::create_invoice_order(&state, invoice.id, dec!(400), &patient(3))
        .await
        .unwrap();
    assert_eq!(order.amount, 40000);
    assert_eq!(order.notes.get("invoice_id").map(String::as_str), Some("1"));

    let forged = PaymentVerification {
        order_id: order.id.clone(),
        payment_id: "pay_unknown".to_string(),
        signature: "mock_signature".to_string(),
    };
    let rejected = checkout_service::settle_gateway_payment(&state, invoice.id, forged, &patient(3)).await;
    assert!(matches!(rejected, Err(BillingError::Validation(_))));

    let captured = state.gateway.simulate_success(&order.id).await.unwrap();
    let verification = PaymentVerification {
        order_id: order.id.clone(),
        payment_id: captured.payment_id.clone(),
        signature: "mock_signature".to_string(),
    };

    let booked = checkout_service::settle_gateway_payment(&state, invoice.id, verification.clone(), &patient(3))
        .await
        .unwrap();
    assert_eq!(booked.payment.method, PaymentMethod::Online);
    assert_eq!(booked.payment.amount, dec!(400));
    assert_eq!(booked.payment.reference.as_deref(), Some(captured.payment_id.as_str()));
    assert_eq!(booked.invoice.status, InvoiceStatus::PartiallyPaid);

    let replay = checkout_service::settle_gateway_payment(&state, invoice.id, verification, &patient(3))
        .await
        .unwrap();
    assert_eq!(replay.payment.id, booked.payment.id);
    assert_eq!(replay.invoice.paid_amount, dec!(400));
}

#[tokio::test]
async fn gateway_order_cannot_settle_another_invoice() {
    let (state, _) = memory_state();
    let desk = receptionist(1);
    let mut ids = Vec::new();
    for _ in 0..2 {
        let invoice = billing_service::create_lab_test_invoice(
            &state,
            CreateLabInvoice {
                hospital_id: 1,
                patient_id: 3,
                charges: lab_charges(dec!(100), 1),
            },
            None,
        )
        .await
        .unwrap();
        ids.push(invoice.id);
    }

    let order = checkout_service::create_invoice_order(&state, ids[0], dec!(100), &desk)
        .await
        .unwrap();
    let captured = state.gateway.simulate_success(&order.id).await.unwrap();

    let result = checkout_service::settle_gateway_payment(
        &state,
        ids[1],
        PaymentVerification {
            order_id: order.id,
            payment_id: captured.payment_id,
            signature: String::new(),
        },
        &desk,
    )
    .await
    .unwrap_err();
    assert_eq!(result.to_string(), "Order does not belong to this invoice");
}

#[tokio::test]
async fn oversized_amounts_fail_validation() {
    let (state, _) = memory_state();
    let result = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges: lab_charges(rust_decimal::Decimal::MAX, 2),
        },
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(result.to_string(), "Amount out of range");

    sync(&state, 14, appointment(1, 7, rust_decimal::Decimal::MAX)).await;
    let mut charges = lab_charges(dec!(1), 1);
    charges.items[0].item_type = "registration".to_string();
    let appointment_invoice = billing_service::create_appointment_invoice(
        &state,
        CreateInvoice {
            hospital_id: 1,
            appointment_id: 14,
            charges,
        },
        None,
    )
    .await;
    assert!(matches!(appointment_invoice, Err(BillingError::Validation(_))));

    // The failed attempt must not leave the appointment claimed
    sync(&state, 14, appointment(1, 7, dec!(500))).await;
    billing_service::create_appointment_invoice(
        &state,
        CreateInvoice {
            hospital_id: 1,
            appointment_id: 14,
            charges: Charges::default(),
        },
        None,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn date_bounds_are_inclusive() {
    let (state, _) = memory_state();
    let invoice = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges: lab_charges(dec!(100), 1),
        },
        None,
    )
    .await
    .unwrap();
    let created = invoice.created_at;

    let exact = billing_service::list_invoices(
        &state,
        &InvoiceFilter {
            hospital_id: Some(1),
            date_from: Some(created),
            date_to: Some(created),
            ..InvoiceFilter::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(exact.len(), 1);

    let later = billing_service::list_invoices(
        &state,
        &InvoiceFilter {
            hospital_id: Some(1),
            date_from: Some(created + chrono::Duration::milliseconds(1)),
            ..InvoiceFilter::default()
        },
    )
    .await
    .unwrap();
    assert!(later.is_empty());

    let earlier = billing_service::list_invoices(
        &state,
        &InvoiceFilter {
            hospital_id: Some(1),
            date_to: Some(created - chrono::Duration::milliseconds(1)),
            ..InvoiceFilter::default()
        },
    )
    .await
    .unwrap();
    assert!(earlier.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_payments_cannot_exceed_total() {
    let (state, _) = memory_state();
    let invoice = billing_service::create_lab_test_invoice(
        &state,
        CreateLabInvoice {
            hospital_id: 1,
            patient_id: 3,
            charges: lab_charges(dec!(500), 1),
        },
        None,
    )
    .await
    .unwrap();

    let first_state = state.clone();
    let second_state = state.clone();
    let first = tokio::spawn(async move {
        billing_service::record_payment(&first_state, cash(1, dec!(300), Some("DESK-A")), None).await
    });
    let second = tokio::spawn(async move {
        billing_service::record_payment(&second_state, cash(1, dec!(300), Some("DESK-B")), None).await
    });
    let (first, second) = tokio::join!(first, second);
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(BillingError::Validation(_))))
    );

    let stored = billing_service::get_invoice(&state, invoice.id).await.unwrap();
    assert_eq!(stored.paid_amount, dec!(300));
    assert!(stored.paid_amount <= stored.total);
    assert_eq!(stored.payments.len(), 1);
}
