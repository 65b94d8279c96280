pub mod handlers;
pub mod ledger;
pub mod models;
pub mod reservation;
pub mod schema;

pub use handlers::StockEventHandler;
pub use ledger::{InMemoryStockLedger, PgStockLedger, StockLedger, StockTables};
pub use models::{Product, Reservation, ReservationStatus};
pub use reservation::{
    plan_reservation, RejectionReason, ReservationError, ReservationOutcome, ReservationRequest,
    ReservationService,
};
