use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub balance: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// A new, active product.
    pub fn new(sku: impl Into<String>, name: impl Into<String>, balance: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            sku: sku.into(),
            name: name.into(),
            balance,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// Values of the `reservations.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Reserved,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn reserved(invoice_id: Uuid, product_id: Uuid, quantity: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            product_id,
            quantity,
            status: ReservationStatus::Reserved.as_str().to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.status == ReservationStatus::Reserved.as_str()
    }

    /// CANCELLED is terminal, so this is only ever applied to a RESERVED row.
    pub fn cancelled(self) -> Self {
        Self {
            status: ReservationStatus::Cancelled.as_str().to_string(),
            ..self
        }
    }
}
