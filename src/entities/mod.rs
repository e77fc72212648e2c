//! SeaORM entities for the invoicing domain.
//!
//! Ownership is rooted at [`user`]: clients and invoices carry a `user_id`
//! and every query in the service layer is scoped by it.

pub mod client;
pub mod invoice;
pub mod invoice_item;
pub mod invoice_sequence;
pub mod outbox_event;
pub mod payment;
pub mod user;

pub use invoice::InvoiceStatus;
pub use payment::PaymentMethod;
