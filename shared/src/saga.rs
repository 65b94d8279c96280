use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Per-invoice saga state as observed by billing.
///
/// There is no orchestrator: billing moves an invoice forward only when an
/// inbound event arrives, so every state here is reached by a local
/// transaction reacting to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaState {
    Created,
    ReservationRequested,
    Reserved,
    Rejected,
    Confirmed,
    Compensated,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaTransition {
    RequestReservation,
    ReservationConfirmed,
    ReservationFailed,
    Finalize,
    Compensate,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply {transition:?} to an invoice in state {from}")]
pub struct InvalidTransition {
    pub from: SagaState,
    pub transition: SagaTransition,
}

impl SagaState {
    pub fn apply(self, transition: SagaTransition) -> Result<SagaState, InvalidTransition> {
        use SagaState::*;
        use SagaTransition::*;

        match (self, transition) {
            (Created, RequestReservation) => Ok(ReservationRequested),
            (ReservationRequested, ReservationConfirmed) => Ok(Reserved),
            (ReservationRequested, ReservationFailed) => Ok(Rejected),
            (Reserved, Finalize) => Ok(Confirmed),
            (Rejected, Compensate) => Ok(Compensated),
            // A rejected invoice stays open and may ask for stock again.
            (Compensated, RequestReservation) => Ok(ReservationRequested),
            (Confirmed, Cancel) => Ok(Cancelled),
            (from, transition) => Err(InvalidTransition { from, transition }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Created => "CREATED",
            SagaState::ReservationRequested => "RESERVATION_REQUESTED",
            SagaState::Reserved => "RESERVED",
            SagaState::Rejected => "REJECTED",
            SagaState::Confirmed => "CONFIRMED",
            SagaState::Compensated => "COMPENSATED",
            SagaState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(SagaState::Created),
            "RESERVATION_REQUESTED" => Ok(SagaState::ReservationRequested),
            "RESERVED" => Ok(SagaState::Reserved),
            "REJECTED" => Ok(SagaState::Rejected),
            "CONFIRMED" => Ok(SagaState::Confirmed),
            "COMPENSATED" => Ok(SagaState::Compensated),
            "CANCELLED" => Ok(SagaState::Cancelled),
            other => Err(format!("unknown saga state: {}", other)),
        }
    }
}
