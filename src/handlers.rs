//! HTTP request handlers
//!
//! Each handler extracts the caller and request data, checks the caller's
//! role, calls the appropriate service, and returns a JSON response.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, patch, post, put},
};
use tower_http::trace::TraceLayer;

use crate::auth::{Actor, BILLING_DESK, Role};
use crate::error::{BillingError, BillingResult};
use crate::models::*;
use crate::services::billing_service::{
    self, Charges, CreateInvoice, CreateLabInvoice, ProcessRefund, RecordPayment,
};
use crate::services::{checkout_service, statement_service};
use crate::state::AppState;

const CHECKOUT_ROLES: &[Role] = &[Role::Patient, Role::Admin, Role::Hospital, Role::Receptionist];
const STATEMENT_ROLES: &[Role] = &[Role::Admin, Role::Hospital, Role::Receptionist, Role::Doctor];
const HOSPITAL_ADMINS: &[Role] = &[Role::Admin, Role::Hospital];

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/opd/invoices", post(create_invoice).get(list_invoices))
        .route("/opd/invoices/{id}", get(get_invoice))
        .route("/opd/invoices/{id}/issue", patch(issue_invoice))
        .route("/opd/invoices/{id}/payments", post(record_payment))
        .route("/opd/invoices/{id}/refund", post(process_refund))
        .route("/opd/invoices/{id}/void", post(void_invoice))
        .route("/opd/invoices/{id}/statement", get(invoice_statement))
        .route("/my/invoices", get(my_invoices))
        .route("/payments/create-order", post(create_payment_order))
        .route("/payments/verify", post(verify_payment))
        .route("/payments/webhook", post(payment_webhook))
        .route("/payments/simulate-success", post(simulate_payment_success))
        .route("/payments/order/{id}", get(get_payment_order))
        .route("/internal/appointments/{id}", put(sync_appointment))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness plus store reachability
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let store_ok = state.store.ping().await.is_ok();
    let report = HealthReport {
        status: if store_ok { "ok" } else { "degraded" },
        store: if store_ok { "up" } else { "down" },
        gateway: state.gateway.provider().as_str(),
    };
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Create an appointment invoice, or a lab invoice when only `patientId` is given
pub async fn create_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateInvoiceRequest>,
) -> BillingResult<Json<Invoice>> {
    actor.require_roles(BILLING_DESK)?;
    let hospital_id = actor.hospital_id()?;

    let CreateInvoiceRequest {
        appointment_id,
        patient_id,
        items,
        discount_amount,
        discount_type,
        discount_reason,
        tax_amount,
    } = payload;
    let charges = Charges {
        items: items.unwrap_or_default(),
        discount_amount,
        discount_type,
        discount_reason,
        tax_amount,
    };

    let invoice = match (appointment_id, patient_id) {
        (Some(appointment_id), _) => {
            billing_service::create_appointment_invoice(
                &state,
                CreateInvoice {
                    hospital_id,
                    appointment_id,
                    charges,
                },
                Some(&actor),
            )
            .await?
        }
        (None, Some(patient_id)) => {
            billing_service::create_lab_test_invoice(
                &state,
                CreateLabInvoice {
                    hospital_id,
                    patient_id,
                    charges,
                },
                Some(&actor),
            )
            .await?
        }
        (None, None) => {
            return Err(BillingError::validation(
                "appointmentId or patientId is required",
            ));
        }
    };
    Ok(Json(invoice))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<u64>,
) -> BillingResult<Json<Invoice>> {
    let invoice = billing_service::get_invoice(&state, invoice_id).await?;
    actor.ensure_can_view(&invoice)?;
    Ok(Json(invoice))
}

/// List the caller's hospital invoices
///
/// Query parameters (all optional): `patientId`, `appointmentId`, `status`,
/// `dateFrom`, `dateTo` (RFC3339, inclusive).
pub async fn list_invoices(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<InvoiceListQuery>,
) -> BillingResult<Json<Vec<Invoice>>> {
    if !actor.role.is_staff() {
        return Err(BillingError::forbidden("Staff access required"));
    }
    let filter = InvoiceFilter {
        hospital_id: Some(actor.hospital_id()?),
        patient_id: query.patient_id,
        appointment_id: query.appointment_id,
        status: query.status,
        date_from: query.date_from,
        date_to: query.date_to,
    };
    Ok(Json(billing_service::list_invoices(&state, &filter).await?))
}

pub async fn my_invoices(
    State(state): State<AppState>,
    actor: Actor,
) -> BillingResult<Json<Vec<Invoice>>> {
    actor.require_roles(&[Role::Patient])?;
    let filter = InvoiceFilter {
        patient_id: Some(actor.patient_id()?),
        ..InvoiceFilter::default()
    };
    Ok(Json(billing_service::list_invoices(&state, &filter).await?))
}

/// Load an invoice for mutation, hiding other hospitals' invoices
async fn authorize_invoice(state: &AppState, actor: &Actor, invoice_id: u64) -> BillingResult<()> {
    let invoice = billing_service::get_invoice(state, invoice_id).await?;
    actor.ensure_can_view(&invoice)
}

pub async fn issue_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<u64>,
) -> BillingResult<Json<Invoice>> {
    actor.require_roles(BILLING_DESK)?;
    authorize_invoice(&state, &actor, invoice_id).await?;
    let invoice = billing_service::issue_invoice(&state, invoice_id, Some(&actor)).await?;
    Ok(Json(invoice))
}

pub async fn void_invoice(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<u64>,
) -> BillingResult<Json<Invoice>> {
    actor.require_roles(HOSPITAL_ADMINS)?;
    authorize_invoice(&state, &actor, invoice_id).await?;
    let invoice = billing_service::void_invoice(&state, invoice_id, Some(&actor)).await?;
    Ok(Json(invoice))
}

pub async fn record_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<u64>,
    Json(payload): Json<RecordPaymentRequest>,
) -> BillingResult<Json<PaymentResult>> {
    actor.require_roles(BILLING_DESK)?;

    let (Some(method), Some(amount)) = (payload.method, payload.amount) else {
        return Err(BillingError::validation("method and amount are required"));
    };
    let method: PaymentMethod = method
        .parse()
        .map_err(|_| BillingError::validation("Invalid payment method"))?;

    authorize_invoice(&state, &actor, invoice_id).await?;
    let result = billing_service::record_payment(
        &state,
        RecordPayment {
            invoice_id,
            method,
            amount,
            reference: payload.reference,
            notes: payload.notes,
            received_by_user_id: actor.user_id,
            received_at: payload.received_at,
        },
        Some(&actor),
    )
    .await?;
    Ok(Json(result))
}

pub async fn process_refund(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<u64>,
    Json(payload): Json<RefundRequest>,
) -> BillingResult<Json<RefundResult>> {
    actor.require_roles(BILLING_DESK)?;

    let (Some(amount), Some(reason)) = (payload.amount, payload.reason) else {
        return Err(BillingError::validation("amount and reason are required"));
    };

    authorize_invoice(&state, &actor, invoice_id).await?;
    let result = billing_service::process_refund(
        &state,
        ProcessRefund {
            invoice_id,
            amount,
            reason,
            processed_by_user_id: actor.user_id,
        },
        Some(&actor),
    )
    .await?;
    Ok(Json(result))
}

/// Download a text statement of the invoice
pub async fn invoice_statement(
    State(state): State<AppState>,
    actor: Actor,
    Path(invoice_id): Path<u64>,
) -> BillingResult<impl IntoResponse> {
    actor.require_roles(STATEMENT_ROLES)?;
    let invoice = billing_service::get_invoice(&state, invoice_id).await?;
    actor.ensure_can_view(&invoice)?;

    let body = statement_service::render_statement(&invoice);
    let disposition = format!("attachment; filename=\"invoice-{}.txt\"", invoice_id);
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

// ---------------------------------------------------------------------------
// Payment gateway
// ---------------------------------------------------------------------------

pub async fn create_payment_order(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateOrderRequest>,
) -> BillingResult<Json<CreateOrderResponse>> {
    actor.require_roles(CHECKOUT_ROLES)?;
    let (Some(invoice_id), Some(amount)) = (payload.invoice_id, payload.amount) else {
        return Err(BillingError::validation("invoiceId and amount are required"));
    };

    let order = checkout_service::create_invoice_order(&state, invoice_id, amount, &actor).await?;
    Ok(Json(CreateOrderResponse {
        success: true,
        order: OrderSummary {
            id: order.id,
            amount: order.amount,
            currency: order.currency,
            receipt: order.receipt,
            status: order.status,
            key: state.gateway.public_key().to_string(),
        },
    }))
}

pub async fn verify_payment(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<VerifyPaymentRequest>,
) -> BillingResult<Json<VerifyPaymentResponse>> {
    actor.require_roles(CHECKOUT_ROLES)?;
    let (Some(order_id), Some(payment_id), Some(invoice_id)) =
        (payload.order_id, payload.payment_id, payload.invoice_id)
    else {
        return Err(BillingError::validation(
            "orderId, paymentId, and invoiceId are required",
        ));
    };

    let verification = PaymentVerification {
        order_id,
        payment_id,
        signature: payload
            .signature
            .unwrap_or_else(|| "mock_signature".to_string()),
    };
    authorize_invoice(&state, &actor, invoice_id).await?;
    let result =
        checkout_service::settle_gateway_payment(&state, invoice_id, verification, &actor).await?;

    Ok(Json(VerifyPaymentResponse {
        success: true,
        message: "Payment verified and recorded successfully".to_string(),
        payment: result.payment,
        invoice: result.invoice,
    }))
}

/// Gateway webhook; the raw body is needed for signature checking
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> BillingResult<Json<Acknowledgement>> {
    let signature = headers
        .get("x-razorpay-signature")
        .and_then(|v| v.to_str().ok());
    if !state.gateway.verify_webhook(&body, signature) {
        return Err(BillingError::Unauthorized(
            "Invalid webhook signature".to_string(),
        ));
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| BillingError::validation(format!("Invalid webhook payload: {}", e)))?;
    tracing::info!(event = %event.event, payload = %event.payload, "payment webhook received");

    Ok(Json(Acknowledgement {
        success: true,
        message: "Webhook received".to_string(),
    }))
}

pub async fn simulate_payment_success(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<SimulateSuccessRequest>,
) -> BillingResult<Json<SimulateSuccessResponse>> {
    actor.require_roles(HOSPITAL_ADMINS)?;
    let order_id = payload
        .order_id
        .ok_or_else(|| BillingError::validation("orderId is required"))?;

    let payment = state.gateway.simulate_success(&order_id).await?;
    Ok(Json(SimulateSuccessResponse {
        success: true,
        message: "Payment simulated successfully".to_string(),
        payment,
    }))
}

pub async fn get_payment_order(
    State(state): State<AppState>,
    _actor: Actor,
    Path(order_id): Path<String>,
) -> BillingResult<Json<OrderResponse>> {
    let order = state
        .gateway
        .get_order(&order_id)
        .await?
        .ok_or_else(|| BillingError::not_found("Order not found"))?;
    Ok(Json(OrderResponse {
        success: true,
        order,
    }))
}

// ---------------------------------------------------------------------------
// Platform sync
// ---------------------------------------------------------------------------

/// Receive an appointment snapshot from the hospital platform
pub async fn sync_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<u64>,
    Json(payload): Json<Appointment>,
) -> BillingResult<Json<Appointment>> {
    let appointment = billing_service::sync_appointment(&state, appointment_id, payload).await?;
    Ok(Json(appointment))
}
