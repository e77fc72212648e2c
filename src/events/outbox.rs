//! Transactional outbox.
//!
//! Writes the event intent in the same transaction as the state change, then
//! a polling worker delivers it through the in-process [`EventSender`]. A
//! failed delivery is retried with capped exponential backoff instead of
//! being dropped, which gives at-least-once semantics across broker or
//! process restarts.

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::outbox_event::{self, Entity as OutboxEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: i64 = 2;
const POLL_INTERVAL_MS: u64 = 500;
const BATCH_SIZE: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Enqueue a domain event. Must be called on the same transaction as the
/// state change it describes.
pub async fn enqueue<C: ConnectionTrait>(db: &C, event: &Event) -> Result<(), ServiceError> {
    let payload = serde_json::to_string(event)?;
    let row = outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        aggregate_type: Set("invoice".to_string()),
        aggregate_id: Set(Some(event.aggregate_id())),
        event_type: Set(event.event_type().to_string()),
        payload: Set(payload),
        status: Set(OutboxStatus::Pending.as_str().to_string()),
        attempts: Set(0),
        available_at: Set(Utc::now()),
        created_at: Set(Utc::now()),
        updated_at: Set(None),
        processed_at: Set(None),
        error_message: Set(None),
    };
    row.insert(db).await?;
    Ok(())
}

/// Spawn the polling worker. A single worker owns the claim step, so rows
/// move pending -> processing -> delivered/failed without lock contention.
pub fn start_worker(db: Arc<DatabaseConnection>, sender: EventSender) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Outbox worker started");
        loop {
            match drain_once(&db, &sender, BATCH_SIZE).await {
                Ok(0) => {}
                Ok(n) => info!(delivered = n, "Outbox batch dispatched"),
                Err(e) => error!("Outbox worker error: {}", e),
            }
            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    })
}

/// Claim and dispatch one batch of due pending events. Returns how many
/// were delivered.
pub async fn drain_once(
    db: &DatabaseConnection,
    sender: &EventSender,
    batch_size: u64,
) -> Result<usize, ServiceError> {
    let now = Utc::now();
    let due = OutboxEntity::find()
        .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
        .filter(outbox_event::Column::AvailableAt.lte(now))
        .order_by_asc(outbox_event::Column::CreatedAt)
        .limit(batch_size)
        .all(db)
        .await?;

    let mut delivered = 0usize;
    for row in due {
        let attempts = row.attempts + 1;
        let mut claim: outbox_event::ActiveModel = row.clone().into();
        claim.status = Set(OutboxStatus::Processing.as_str().to_string());
        claim.attempts = Set(attempts);
        claim.updated_at = Set(Some(Utc::now()));
        let claimed = claim.update(db).await?;

        match serde_json::from_str::<Event>(&claimed.payload) {
            Ok(event) => match sender.send(event).await {
                Ok(()) => {
                    mark_delivered(db, claimed).await?;
                    delivered += 1;
                }
                Err(e) => schedule_retry(db, claimed, attempts, &e).await?,
            },
            Err(e) => {
                // Undeliverable payload; retrying cannot help.
                warn!(outbox_id = %claimed.id, "Dropping malformed outbox payload: {}", e);
                mark_failed(db, claimed, &format!("malformed payload: {e}")).await?;
            }
        }
    }
    Ok(delivered)
}

async fn mark_delivered(
    db: &DatabaseConnection,
    row: outbox_event::Model,
) -> Result<(), ServiceError> {
    let mut model: outbox_event::ActiveModel = row.into();
    model.status = Set(OutboxStatus::Delivered.as_str().to_string());
    model.processed_at = Set(Some(Utc::now()));
    model.updated_at = Set(Some(Utc::now()));
    model.error_message = Set(None);
    model.update(db).await?;
    Ok(())
}

async fn schedule_retry(
    db: &DatabaseConnection,
    row: outbox_event::Model,
    attempts: i32,
    reason: &str,
) -> Result<(), ServiceError> {
    if attempts >= MAX_ATTEMPTS {
        warn!(outbox_id = %row.id, attempts, "Outbox event exceeded max attempts");
        return mark_failed(db, row, "max attempts exceeded").await;
    }
    let backoff = ChronoDuration::seconds(BASE_BACKOFF_SECS.saturating_pow(attempts as u32));
    let mut model: outbox_event::ActiveModel = row.into();
    model.status = Set(OutboxStatus::Pending.as_str().to_string());
    model.available_at = Set(Utc::now() + backoff);
    model.updated_at = Set(Some(Utc::now()));
    model.error_message = Set(Some(reason.to_string()));
    model.update(db).await?;
    Ok(())
}

async fn mark_failed(
    db: &DatabaseConnection,
    row: outbox_event::Model,
    reason: &str,
) -> Result<(), ServiceError> {
    let mut model: outbox_event::ActiveModel = row.into();
    model.status = Set(OutboxStatus::Failed.as_str().to_string());
    model.updated_at = Set(Some(Utc::now()));
    model.error_message = Set(Some(reason.to_string()));
    model.update(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(OutboxStatus::Pending.as_str(), "pending");
        assert_eq!(OutboxStatus::Processing.as_str(), "processing");
        assert_eq!(OutboxStatus::Delivered.as_str(), "delivered");
        assert_eq!(OutboxStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn backoff_grows_exponentially() {
        let first = BASE_BACKOFF_SECS.saturating_pow(1);
        let fourth = BASE_BACKOFF_SECS.saturating_pow(4);
        assert_eq!(first, 2);
        assert_eq!(fourth, 16);
    }
}
