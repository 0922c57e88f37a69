//! Service configuration
//!
//! Everything is read from environment variables once at startup.

use std::str::FromStr;

use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayProvider {
    Razorpay,
    Mock,
}

impl GatewayProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayProvider::Razorpay => "razorpay",
            GatewayProvider::Mock => "mock",
        }
    }
}

/// Credentials and endpoint for the Razorpay provider
#[derive(Debug, Clone, Default)]
pub struct RazorpayConfig {
    pub key_id: Option<String>,
    pub key_secret: Option<String>,
    pub webhook_secret: Option<String>,
    pub api_base: String,
}

impl RazorpayConfig {
    pub fn has_credentials(&self) -> bool {
        self.key_id.as_deref().is_some_and(|k| !k.is_empty())
            && self.key_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind_addr: String,
    pub redis_url: String,
    pub store_backend: StoreBackend,
    /// Requested gateway provider; see [`Config::effective_gateway`]
    pub gateway: GatewayProvider,
    pub razorpay: RazorpayConfig,
    /// Fee used when the appointment's doctor has none configured
    pub default_consultation_fee: Decimal,
    pub currency: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_backend: StoreBackend::Redis,
            gateway: GatewayProvider::Mock,
            razorpay: RazorpayConfig {
                api_base: "https://api.razorpay.com".to_string(),
                ..RazorpayConfig::default()
            },
            default_consultation_fee: Decimal::from(500),
            currency: "INR".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            Some("memory") => StoreBackend::Memory,
            _ => StoreBackend::Redis,
        };
        let gateway = match lookup("PAYMENT_GATEWAY").as_deref() {
            Some("razorpay") => GatewayProvider::Razorpay,
            _ => GatewayProvider::Mock,
        };
        let default_consultation_fee = lookup("DEFAULT_CONSULTATION_FEE")
            .and_then(|v| Decimal::from_str(v.trim()).ok())
            .unwrap_or(defaults.default_consultation_fee);

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            store_backend,
            gateway,
            razorpay: RazorpayConfig {
                key_id: lookup("RAZORPAY_KEY_ID"),
                key_secret: lookup("RAZORPAY_KEY_SECRET"),
                webhook_secret: lookup("RAZORPAY_WEBHOOK_SECRET"),
                api_base: lookup("RAZORPAY_API_BASE").unwrap_or(defaults.razorpay.api_base),
            },
            default_consultation_fee,
            currency: lookup("CURRENCY").unwrap_or(defaults.currency),
        }
    }

    /// Provider actually used: razorpay without credentials degrades to mock
    pub fn effective_gateway(&self) -> GatewayProvider {
        match self.gateway {
            GatewayProvider::Razorpay if !self.razorpay.has_credentials() => {
                tracing::warn!(
                    "razorpay provider selected but credentials missing, falling back to mock mode"
                );
                GatewayProvider::Mock
            }
            other => other,
        }
    }
}
