//! Multi-tenant invoicing backend: invoice lifecycle, payment
//! reconciliation, cached analytics, and the background workers that keep
//! reminders and caches moving.

pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod message_queue;
pub mod migrator;
pub mod money;
pub mod schedulers;
pub mod services;

use std::sync::Arc;

use crate::cache::CacheBackend;
use crate::events::EventSender;
use crate::message_queue::MessageQueue;
use crate::services::{AnalyticsService, ClientService, InvoiceService, PageLimits, PaymentService};

/// Shared application state: one database pool, one cache backend, one
/// broker handle, and the services built over them. Everything is injected;
/// nothing reaches for a global.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::DbPool>,
    pub cache: Arc<dyn CacheBackend>,
    pub message_queue: Arc<dyn MessageQueue>,
    pub event_sender: EventSender,
    pub invoices: InvoiceService,
    pub payments: PaymentService,
    pub clients: ClientService,
    pub analytics: AnalyticsService,
}

impl AppState {
    pub fn new(
        db: Arc<db::DbPool>,
        cache: Arc<dyn CacheBackend>,
        message_queue: Arc<dyn MessageQueue>,
        event_sender: EventSender,
        limits: PageLimits,
    ) -> Self {
        Self {
            invoices: InvoiceService::new(db.clone(), cache.clone(), limits),
            payments: PaymentService::new(db.clone(), cache.clone()),
            clients: ClientService::new(db.clone(), limits),
            analytics: AnalyticsService::new(db.clone(), cache.clone()),
            db,
            cache,
            message_queue,
            event_sender,
        }
    }
}
