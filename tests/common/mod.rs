#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;

use nexacare_billing::auth::{Actor, Role};
use nexacare_billing::infrastructure::MemoryStore;
use nexacare_billing::models::{Appointment, DoctorInfo};
use nexacare_billing::services::billing_service;
use nexacare_billing::{AppState, Config};

pub fn memory_state() -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::with_store(Config::default(), store.clone());
    (state, store)
}

pub fn receptionist(hospital_id: u64) -> Actor {
    Actor {
        user_id: 40,
        role: Role::Receptionist,
        hospital_id: Some(hospital_id),
        patient_id: None,
    }
}

pub fn patient(patient_id: u64) -> Actor {
    Actor {
        user_id: 90,
        role: Role::Patient,
        hospital_id: None,
        patient_id: Some(patient_id),
    }
}

pub fn appointment(hospital_id: u64, patient_id: u64, fee: Decimal) -> Appointment {
    Appointment {
        id: 0,
        hospital_id: Some(hospital_id),
        patient_id,
        doctor: Some(DoctorInfo {
            consultation_fee: Some(fee),
            specialty: Some("Cardiology".to_string()),
        }),
        payment_status: None,
        notes: None,
        appointment_date: None,
        confirmed_at: None,
    }
}

pub async fn sync(state: &AppState, appointment_id: u64, appointment: Appointment) {
    billing_service::sync_appointment(state, appointment_id, appointment)
        .await
        .unwrap();
}
