//! Payment gateway abstraction
//!
//! Two providers sit behind [`PaymentGateway`]: an in-process mock used in
//! development and tests, and Razorpay. [`PaymentGatewayService`] picks the
//! provider from configuration. When Razorpay fails on order or refund calls
//! it falls back to the mock; signature verification never falls back.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::config::{Config, GatewayProvider};
use crate::error::GatewayError;
use crate::infrastructure::http_client::{self, BasicAuth};
use crate::models::{
    GatewayPayment, GatewayRefund, OrderStatus, PaymentOrder, PaymentOrderData,
    PaymentVerification, SimulatedPayment,
};

type HmacSha256 = Hmac<Sha256>;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, data: &PaymentOrderData) -> GatewayResult<PaymentOrder>;

    async fn get_order(&self, order_id: &str) -> GatewayResult<Option<PaymentOrder>>;

    async fn verify_payment(&self, verification: &PaymentVerification) -> GatewayResult<bool>;

    /// Refund `amount` paise, or the full payment when `None`
    async fn refund(&self, payment_id: &str, amount: Option<i64>) -> GatewayResult<GatewayRefund>;

    /// Capture a payment for an order without a real payer
    async fn simulate_success(&self, order_id: &str) -> GatewayResult<SimulatedPayment>;
}

/// Hex HMAC-SHA256 of `message`
pub fn sign(secret: &str, message: &[u8]) -> GatewayResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Signature(e.to_string()))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex HMAC-SHA256 signature
pub fn verify_signature(secret: &str, message: &[u8], signature_hex: &str) -> GatewayResult<bool> {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return Ok(false);
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Signature(e.to_string()))?;
    mac.update(message);
    Ok(mac.verify_slice(&signature).is_ok())
}

fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn mock_id(prefix: &str) -> String {
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), random_suffix())
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// In-memory gateway that records orders and captured payments
#[derive(Default)]
pub struct MockGateway {
    orders: Mutex<HashMap<String, PaymentOrder>>,
    payments: Mutex<HashMap<String, GatewayPayment>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an order paid and capture a payment against it
    async fn capture(&self, order_id: &str) -> GatewayResult<SimulatedPayment> {
        let amount = {
            let mut orders = self.orders.lock().await;
            let order = orders
                .get_mut(order_id)
                .ok_or_else(|| GatewayError::NotFound("Order not found".to_string()))?;
            order.status = OrderStatus::Paid;
            order.amount_paid = order.amount;
            order.amount_due = 0;
            order.attempts += 1;
            order.amount
        };

        let payment_id = mock_id("pay_mock");
        let payment = GatewayPayment {
            id: payment_id.clone(),
            order_id: order_id.to_string(),
            amount,
            status: "captured".to_string(),
            created_at: Utc::now().timestamp(),
        };
        self.payments
            .lock()
            .await
            .insert(payment_id.clone(), payment);

        tracing::info!(payment_id = %payment_id, order_id, amount_paise = amount, "mock payment captured");

        Ok(SimulatedPayment {
            payment_id,
            order_id: order_id.to_string(),
            status: "captured".to_string(),
        })
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(&self, data: &PaymentOrderData) -> GatewayResult<PaymentOrder> {
        let order = PaymentOrder {
            id: mock_id("order_mock"),
            entity: "order".to_string(),
            amount: data.amount,
            amount_paid: 0,
            amount_due: data.amount,
            currency: data.currency.clone(),
            receipt: Some(data.receipt.clone()),
            status: OrderStatus::Created,
            attempts: 0,
            notes: data.notes.clone(),
            created_at: Utc::now().timestamp(),
        };
        self.orders
            .lock()
            .await
            .insert(order.id.clone(), order.clone());

        tracing::info!(
            order_id = %order.id,
            amount_paise = order.amount,
            receipt = %data.receipt,
            "mock payment order created"
        );
        Ok(order)
    }

    async fn get_order(&self, order_id: &str) -> GatewayResult<Option<PaymentOrder>> {
        Ok(self.orders.lock().await.get(order_id).cloned())
    }

    async fn verify_payment(&self, verification: &PaymentVerification) -> GatewayResult<bool> {
        let payments = self.payments.lock().await;
        let verified = payments
            .get(&verification.payment_id)
            .is_some_and(|p| p.order_id == verification.order_id);
        if verified {
            tracing::info!(payment_id = %verification.payment_id, "mock payment verified");
        } else {
            tracing::warn!(payment_id = %verification.payment_id, "mock payment not found");
        }
        Ok(verified)
    }

    async fn refund(&self, payment_id: &str, amount: Option<i64>) -> GatewayResult<GatewayRefund> {
        let payments = self.payments.lock().await;
        let payment = payments
            .get(payment_id)
            .ok_or_else(|| GatewayError::NotFound("Payment not found".to_string()))?;

        let refund = GatewayRefund {
            id: mock_id("refund_mock"),
            amount: amount.unwrap_or(payment.amount),
            status: "processed".to_string(),
        };
        tracing::info!(refund_id = %refund.id, amount_paise = refund.amount, "mock refund processed");
        Ok(refund)
    }

    async fn simulate_success(&self, order_id: &str) -> GatewayResult<SimulatedPayment> {
        self.capture(order_id).await
    }
}

// ---------------------------------------------------------------------------
// Razorpay provider
// ---------------------------------------------------------------------------

/// Order as returned by the Razorpay API; `notes` is `[]` when empty
#[derive(Deserialize)]
struct RazorpayOrder {
    id: String,
    entity: String,
    amount: i64,
    amount_paid: i64,
    amount_due: i64,
    currency: String,
    receipt: Option<String>,
    status: OrderStatus,
    attempts: u32,
    #[serde(default)]
    notes: serde_json::Value,
    created_at: i64,
}

impl From<RazorpayOrder> for PaymentOrder {
    fn from(order: RazorpayOrder) -> Self {
        let notes: BTreeMap<String, String> = match order.notes {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        PaymentOrder {
            id: order.id,
            entity: order.entity,
            amount: order.amount,
            amount_paid: order.amount_paid,
            amount_due: order.amount_due,
            currency: order.currency,
            receipt: order.receipt,
            status: order.status,
            attempts: order.attempts,
            notes,
            created_at: order.created_at,
        }
    }
}

pub struct RazorpayGateway {
    key_id: String,
    key_secret: String,
    api_base: String,
}

impl RazorpayGateway {
    pub fn new(key_id: String, key_secret: String, api_base: String) -> Self {
        Self {
            key_id,
            key_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn auth(&self) -> BasicAuth<'_> {
        BasicAuth {
            username: &self.key_id,
            password: &self.key_secret,
        }
    }

    async fn rejected(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        GatewayError::Rejected { status, body }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(&self, data: &PaymentOrderData) -> GatewayResult<PaymentOrder> {
        let url = format!("{}/v1/orders", self.api_base);
        let response = http_client::post_json(&url, data, &self.auth()).await?;
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        let order: PaymentOrder = response.json::<RazorpayOrder>().await?.into();
        tracing::info!(order_id = %order.id, amount_paise = order.amount, "razorpay order created");
        Ok(order)
    }

    async fn get_order(&self, order_id: &str) -> GatewayResult<Option<PaymentOrder>> {
        let url = format!("{}/v1/orders/{}", self.api_base, order_id);
        let response = http_client::get(&url, &self.auth()).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        Ok(Some(response.json::<RazorpayOrder>().await?.into()))
    }

    async fn verify_payment(&self, verification: &PaymentVerification) -> GatewayResult<bool> {
        let message = format!("{}|{}", verification.order_id, verification.payment_id);
        let valid = verify_signature(&self.key_secret, message.as_bytes(), &verification.signature)?;
        if valid {
            tracing::info!(payment_id = %verification.payment_id, "razorpay payment verified");
        } else {
            tracing::warn!(payment_id = %verification.payment_id, "razorpay signature mismatch");
        }
        Ok(valid)
    }

    async fn refund(&self, payment_id: &str, amount: Option<i64>) -> GatewayResult<GatewayRefund> {
        let url = format!("{}/v1/payments/{}/refund", self.api_base, payment_id);
        let body = match amount {
            Some(amount) => serde_json::json!({ "amount": amount }),
            None => serde_json::json!({}),
        };
        let response = http_client::post_json(&url, &body, &self.auth()).await?;
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        let refund: GatewayRefund = response.json().await?;
        tracing::info!(refund_id = %refund.id, amount_paise = refund.amount, "razorpay refund processed");
        Ok(refund)
    }

    async fn simulate_success(&self, _order_id: &str) -> GatewayResult<SimulatedPayment> {
        Err(GatewayError::Unsupported(
            "Payment simulation is only available in mock mode".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct PaymentGatewayService {
    provider: GatewayProvider,
    razorpay: Option<RazorpayGateway>,
    mock: MockGateway,
    public_key: String,
    webhook_secret: Option<String>,
}

impl PaymentGatewayService {
    pub fn from_config(config: &Config) -> Self {
        let provider = config.effective_gateway();
        let razorpay = match (
            provider,
            config.razorpay.key_id.clone(),
            config.razorpay.key_secret.clone(),
        ) {
            (GatewayProvider::Razorpay, Some(key_id), Some(key_secret)) => Some(
                RazorpayGateway::new(key_id, key_secret, config.razorpay.api_base.clone()),
            ),
            _ => None,
        };
        let public_key = config
            .razorpay
            .key_id
            .clone()
            .unwrap_or_else(|| "mock_key".to_string());

        Self {
            provider: if razorpay.is_some() {
                GatewayProvider::Razorpay
            } else {
                GatewayProvider::Mock
            },
            razorpay,
            mock: MockGateway::new(),
            public_key,
            webhook_secret: config.razorpay.webhook_secret.clone(),
        }
    }

    pub fn provider(&self) -> GatewayProvider {
        self.provider
    }

    /// Key id handed to the checkout frontend
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub async fn create_order(&self, data: &PaymentOrderData) -> GatewayResult<PaymentOrder> {
        if let Some(razorpay) = &self.razorpay {
            match razorpay.create_order(data).await {
                Ok(order) => return Ok(order),
                Err(e) => tracing::error!(error = %e, "razorpay order creation failed, using mock"),
            }
        }
        self.mock.create_order(data).await
    }

    pub async fn get_order(&self, order_id: &str) -> GatewayResult<Option<PaymentOrder>> {
        if let Some(razorpay) = &self.razorpay {
            match razorpay.get_order(order_id).await {
                Ok(order) => return Ok(order),
                Err(e) => tracing::error!(error = %e, order_id, "razorpay get order failed, using mock"),
            }
        }
        self.mock.get_order(order_id).await
    }

    /// Verification errors count as a failed verification
    pub async fn verify_payment(&self, verification: &PaymentVerification) -> bool {
        let result = match &self.razorpay {
            Some(razorpay) => razorpay.verify_payment(verification).await,
            None => self.mock.verify_payment(verification).await,
        };
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "payment verification error");
            false
        })
    }

    /// Operator-initiated gateway refund; ledger refunds do not call this
    pub async fn refund(&self, payment_id: &str, amount: Option<i64>) -> GatewayResult<GatewayRefund> {
        if let Some(razorpay) = &self.razorpay {
            match razorpay.refund(payment_id, amount).await {
                Ok(refund) => return Ok(refund),
                Err(e) => tracing::error!(error = %e, payment_id, "razorpay refund failed, using mock"),
            }
        }
        self.mock.refund(payment_id, amount).await
    }

    /// Always served by the mock, which also holds orders created on fallback
    pub async fn simulate_success(&self, order_id: &str) -> GatewayResult<SimulatedPayment> {
        self.mock.simulate_success(order_id).await
    }

    /// Check a webhook body against `X-Razorpay-Signature`
    ///
    /// Without a configured webhook secret every body is accepted.
    pub fn verify_webhook(&self, body: &[u8], signature: Option<&str>) -> bool {
        let Some(secret) = self.webhook_secret.as_deref() else {
            return true;
        };
        signature
            .map(|sig| verify_signature(secret, body, sig).unwrap_or(false))
            .unwrap_or(false)
    }
}
