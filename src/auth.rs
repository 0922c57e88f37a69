//! Caller identity
//!
//! Authentication happens at the platform gateway in front of this service;
//! it forwards the verified identity as `x-user-*` headers. This module
//! turns those headers into an [`Actor`] and provides the role guards used by
//! the handlers.

use std::fmt;
use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};

use crate::error::BillingError;
use crate::models::Invoice;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const HOSPITAL_ID_HEADER: &str = "x-hospital-id";
pub const PATIENT_ID_HEADER: &str = "x-patient-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Hospital,
    Receptionist,
    Doctor,
    Nurse,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Hospital => "HOSPITAL",
            Role::Receptionist => "RECEPTIONIST",
            Role::Doctor => "DOCTOR",
            Role::Nurse => "NURSE",
            Role::Patient => "PATIENT",
        }
    }

    pub fn is_staff(&self) -> bool {
        !matches!(self, Role::Patient)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "HOSPITAL" => Ok(Role::Hospital),
            "RECEPTIONIST" => Ok(Role::Receptionist),
            "DOCTOR" => Ok(Role::Doctor),
            "NURSE" => Ok(Role::Nurse),
            "PATIENT" => Ok(Role::Patient),
            other => Err(format!("unknown role {}", other)),
        }
    }
}

/// Roles allowed to create and settle invoices
pub const BILLING_DESK: &[Role] = &[Role::Admin, Role::Hospital, Role::Receptionist];

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: u64,
    pub role: Role,
    pub hospital_id: Option<u64>,
    pub patient_id: Option<u64>,
}

impl Actor {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, BillingError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| BillingError::Unauthorized("User not authenticated".to_string()))?;
        let role = header(USER_ROLE_HEADER)
            .and_then(|v| v.parse::<Role>().ok())
            .ok_or_else(|| BillingError::forbidden("Unknown or missing role"))?;

        Ok(Self {
            user_id,
            role,
            hospital_id: header(HOSPITAL_ID_HEADER).and_then(|v| v.parse().ok()),
            patient_id: header(PATIENT_ID_HEADER).and_then(|v| v.parse().ok()),
        })
    }

    pub fn require_roles(&self, allowed: &[Role]) -> Result<(), BillingError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(BillingError::forbidden(format!(
                "Role {} is not permitted to perform this action",
                self.role
            )))
        }
    }

    pub fn hospital_id(&self) -> Result<u64, BillingError> {
        self.hospital_id.ok_or_else(|| {
            BillingError::forbidden(
                "You are not authorized to access billing. Hospital ID not found for your account.",
            )
        })
    }

    pub fn patient_id(&self) -> Result<u64, BillingError> {
        self.patient_id
            .ok_or_else(|| BillingError::not_found("Patient not found"))
    }

    /// Staff see their hospital's invoices, patients see their own
    pub fn ensure_can_view(&self, invoice: &Invoice) -> Result<(), BillingError> {
        let allowed = if self.role.is_staff() {
            self.hospital_id == Some(invoice.hospital_id)
        } else {
            self.patient_id == Some(invoice.patient_id)
        };
        if allowed {
            Ok(())
        } else {
            // Same answer as a missing invoice so ids cannot be probed
            Err(BillingError::not_found("Invoice not found"))
        }
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = BillingError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Actor::from_headers(&parts.headers)
    }
}
