//! Domain events and the dispatcher that fans them out to the broker.
//!
//! Services never talk to the message queue directly: they enqueue intents
//! into the outbox (same transaction as the state change), and the outbox
//! worker feeds [`EventSender`]. The dispatch loop maps each event to its
//! exchange, routing key, and priority, then publishes through
//! [`MessageQueue`]. Monetary fields serialize as decimal strings so JSON
//! never loses cents.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::message_queue::{Message, MessageQueue};

pub mod outbox;

/// Amounts travel as fixed two-decimal strings. Serializing through
/// [`crate::money::to_currency`] repairs scale lost on storage round-trips.
mod currency {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::money::to_currency(*amount).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub const EXCHANGE_INVOICES: &str = "invoices";
pub const EXCHANGE_EMAILS: &str = "emails";
pub const EXCHANGE_PAYMENTS: &str = "payments";

/// Events emitted by the invoice lifecycle and payment reconciliation
/// services. Variant payloads match the wire shape consumed downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    InvoiceCreated {
        invoice_id: Uuid,
        user_id: Uuid,
        invoice_number: String,
        #[serde(with = "currency")]
        total_amount: Decimal,
    },
    InvoiceUpdated {
        invoice_id: Uuid,
        user_id: Uuid,
        status: String,
    },
    InvoicePaid {
        invoice_id: Uuid,
        user_id: Uuid,
        #[serde(with = "currency")]
        amount: Decimal,
    },
    /// Emitted when a draft invoice is sent; drives the outgoing email.
    InvoiceSent {
        invoice_id: Uuid,
        user_id: Uuid,
        client_email: String,
        client_name: String,
        invoice_number: String,
        #[serde(with = "currency")]
        total_amount: Decimal,
        due_date: NaiveDate,
    },
    /// Reminder for an unpaid invoice. `days_overdue` is negative for
    /// due-soon reminders (-3 means due in three days).
    PaymentReminder {
        invoice_id: Uuid,
        user_id: Uuid,
        client_email: Option<String>,
        invoice_number: String,
        #[serde(with = "currency")]
        total_amount: Decimal,
        days_overdue: i64,
    },
    /// An invoice reached full payment through recorded payments.
    PaymentCompleted {
        invoice_id: Uuid,
        user_id: Uuid,
        #[serde(with = "currency")]
        amount: Decimal,
        #[serde(with = "currency")]
        total_amount: Decimal,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::InvoiceCreated { .. } => "InvoiceCreated",
            Event::InvoiceUpdated { .. } => "InvoiceUpdated",
            Event::InvoicePaid { .. } => "InvoicePaid",
            Event::InvoiceSent { .. } => "InvoiceSent",
            Event::PaymentReminder { .. } => "PaymentReminder",
            Event::PaymentCompleted { .. } => "PaymentCompleted",
        }
    }

    pub fn aggregate_id(&self) -> Uuid {
        match self {
            Event::InvoiceCreated { invoice_id, .. }
            | Event::InvoiceUpdated { invoice_id, .. }
            | Event::InvoicePaid { invoice_id, .. }
            | Event::InvoiceSent { invoice_id, .. }
            | Event::PaymentReminder { invoice_id, .. }
            | Event::PaymentCompleted { invoice_id, .. } => *invoice_id,
        }
    }

    /// Broker destinations for this event: (exchange, routing key, priority).
    /// Priorities follow the production queues: invoice emails at 8,
    /// overdue reminders at 9, due-soon reminders at 7, the rest default.
    pub fn publications(&self) -> Vec<(&'static str, &'static str, u8)> {
        match self {
            Event::InvoiceCreated { .. } => vec![(EXCHANGE_INVOICES, "invoice.created", 5)],
            Event::InvoiceUpdated { .. } => vec![(EXCHANGE_INVOICES, "invoice.updated", 5)],
            Event::InvoicePaid { .. } => vec![(EXCHANGE_INVOICES, "invoice.paid", 5)],
            Event::InvoiceSent { .. } => vec![(EXCHANGE_EMAILS, "email.invoice_sent", 8)],
            Event::PaymentReminder { days_overdue, .. } => {
                let priority = if *days_overdue < 0 { 7 } else { 9 };
                vec![(EXCHANGE_EMAILS, "email.payment_reminder", priority)]
            }
            Event::PaymentCompleted { .. } => vec![
                (EXCHANGE_PAYMENTS, "payment.completed", 5),
                (EXCHANGE_EMAILS, "email.payment_received", 6),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Dispatch loop: consumes events and publishes them to the broker.
/// Runs until the sending side closes.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, queue: Arc<dyn MessageQueue>) {
    info!("Starting event dispatch loop");

    while let Some(event) = rx.recv().await {
        if let Err(e) = dispatch(&event, queue.as_ref()).await {
            error!(
                event_type = event.event_type(),
                invoice_id = %event.aggregate_id(),
                "Failed to dispatch event: {}",
                e
            );
        }
    }

    warn!("Event dispatch loop has ended");
}

async fn dispatch(event: &Event, queue: &dyn MessageQueue) -> Result<(), String> {
    let payload = serde_json::to_value(event).map_err(|e| e.to_string())?;
    for (exchange, routing_key, priority) in event.publications() {
        let message = Message::with_priority(exchange, routing_key, payload.clone(), priority);
        queue
            .publish(message)
            .await
            .map_err(|e| format!("publish to {exchange}/{routing_key} failed: {e}"))?;
        info!(
            exchange,
            routing_key,
            priority,
            invoice_id = %event.aggregate_id(),
            "Published event"
        );
    }
    Ok(())
}
