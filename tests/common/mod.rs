use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use invoicing_api::{
    cache::InMemoryCache,
    db,
    entities::{client, user},
    events::{self, outbox, EventSender},
    message_queue::InMemoryMessageQueue,
    money::LineItemInput,
    services::{invoices::CreateInvoiceRequest, PageLimits},
    AppState,
};

/// Harness wiring the full service stack over a throwaway SQLite database,
/// with the in-memory cache and broker standing in for Redis and AMQP.
pub struct TestApp {
    pub state: AppState,
    pub queue: Arc<InMemoryMessageQueue>,
    pub event_sender: EventSender,
    _event_task: tokio::task::JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create temp dir for test db");
        let db_path = tmp.path().join("invoicing_test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = db::establish_connection(&url)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let cache = Arc::new(InMemoryCache::new());
        let queue = Arc::new(InMemoryMessageQueue::new());

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(
            event_rx,
            queue.clone() as Arc<dyn invoicing_api::message_queue::MessageQueue>,
        ));

        let state = AppState::new(
            db_arc,
            cache,
            queue.clone() as Arc<dyn invoicing_api::message_queue::MessageQueue>,
            event_sender.clone(),
            PageLimits::default(),
        );

        Self {
            state,
            queue,
            event_sender,
            _event_task: event_task,
            _tmp: tmp,
        }
    }

    /// Run one outbox drain cycle and give the dispatch loop a moment to
    /// publish, so tests can assert on the broker.
    pub async fn deliver_outbox(&self) -> usize {
        let delivered = outbox::drain_once(&self.state.db, &self.event_sender, 100)
            .await
            .expect("outbox drain");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        delivered
    }

    pub async fn seed_user(&self, email: &str) -> user::Model {
        let now = Utc::now();
        user::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email.to_string()),
            full_name: Set("Test User".to_string()),
            company_name: Set(None),
            phone: Set(None),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed user")
    }

    pub async fn seed_client(&self, user_id: Uuid, email: Option<&str>) -> client::Model {
        let now = Utc::now();
        client::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            name: Set("Acme Corp".to_string()),
            email: Set(email.map(str::to_string)),
            phone: Set(None),
            address: Set(None),
            company: Set(Some("Acme".to_string())),
            tax_id: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed client")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// A one-line-item invoice request with sensible defaults.
#[allow(dead_code)]
pub fn invoice_request(
    client_id: Option<Uuid>,
    unit_price: Decimal,
    quantity: i32,
) -> CreateInvoiceRequest {
    CreateInvoiceRequest {
        client_id,
        issue_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
        due_date: NaiveDate::from_ymd_opt(2025, 2, 10).unwrap(),
        tax_rate: Decimal::ZERO,
        discount: Decimal::ZERO,
        notes: None,
        items: vec![LineItemInput {
            description: "Consulting".to_string(),
            quantity,
            unit_price,
        }],
    }
}
