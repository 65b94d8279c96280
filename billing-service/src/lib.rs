pub mod handlers;
pub mod invoices;
pub mod ledger;
pub mod models;
pub mod schema;

pub use handlers::BillingEventHandler;
pub use invoices::{settle_state, InvoiceError, InvoiceService, ReservationReply, Settlement};
pub use ledger::{BillingLedger, BillingTables, InMemoryBillingLedger, PgBillingLedger};
pub use models::{Invoice, InvoiceItem, InvoiceWithItems};
