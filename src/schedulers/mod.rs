//! Background ticks: overdue sweeps, reminder fan-out, and analytics
//! cache refresh. Each loop logs failures and keeps ticking; a bad cycle
//! must never kill the worker.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, instrument};

use crate::entities::client;
use crate::entities::invoice::{self, Entity as InvoiceEntity, InvoiceStatus};
use crate::entities::user::{self, Entity as UserEntity};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::services::{AnalyticsService, InvoiceService};

const HOURLY_TICK: Duration = Duration::from_secs(60 * 60);
const ANALYTICS_TICK: Duration = Duration::from_secs(30 * 60);
const DUE_SOON_DAYS: i64 = 3;

#[derive(Clone)]
pub struct Scheduler {
    db: Arc<DatabaseConnection>,
    invoices: InvoiceService,
    analytics: AnalyticsService,
}

impl Scheduler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        invoices: InvoiceService,
        analytics: AnalyticsService,
    ) -> Self {
        Self {
            db,
            invoices,
            analytics,
        }
    }

    /// Hourly loop: flip newly overdue invoices, then send due-soon and
    /// recurring overdue reminders.
    pub fn start_invoice_loop(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(HOURLY_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Invoice scheduler started");
            loop {
                tick.tick().await;
                let today = Utc::now().date_naive();
                if let Err(e) = self.run_invoice_tick(today).await {
                    error!("Invoice scheduler tick failed: {}", e);
                }
            }
        })
    }

    /// Half-hourly loop keeping per-user analytics caches warm.
    pub fn start_analytics_loop(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(ANALYTICS_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Analytics scheduler started");
            loop {
                tick.tick().await;
                if let Err(e) = self.run_analytics_tick().await {
                    error!("Analytics scheduler tick failed: {}", e);
                }
            }
        })
    }

    #[instrument(skip(self))]
    pub async fn run_invoice_tick(&self, today: NaiveDate) -> Result<(), ServiceError> {
        let flipped = self.invoices.sweep_overdue(today).await?;
        let due_soon = self.send_due_soon_reminders(today).await?;
        let recurring = self.send_recurring_overdue_reminders(today).await?;
        info!(
            flipped,
            due_soon, recurring, "Invoice scheduler tick complete"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_analytics_tick(&self) -> Result<(), ServiceError> {
        let users = UserEntity::find()
            .filter(user::Column::IsActive.eq(true))
            .all(&*self.db)
            .await?;

        let mut refreshed = 0usize;
        for u in users {
            match self.analytics.refresh_analytics(u.id).await {
                Ok(_) => refreshed += 1,
                Err(e) => error!(user_id = %u.id, "Analytics refresh failed: {}", e),
            }
        }
        info!(refreshed, "Analytics caches refreshed");
        Ok(())
    }

    /// Courtesy reminder for `sent` invoices due in exactly three days.
    /// `days_overdue` is negative so consumers can tell the direction.
    pub async fn send_due_soon_reminders(&self, today: NaiveDate) -> Result<usize, ServiceError> {
        let target = today + ChronoDuration::days(DUE_SOON_DAYS);
        let upcoming = InvoiceEntity::find()
            .filter(invoice::Column::Status.eq(InvoiceStatus::Sent))
            .filter(invoice::Column::DueDate.eq(target))
            .all(&*self.db)
            .await?;

        let mut sent = 0usize;
        for inv in upcoming {
            self.enqueue_reminder(&inv, -DUE_SOON_DAYS).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Weekly nag for invoices that are already `overdue`: one reminder
    /// every seventh day past due.
    pub async fn send_recurring_overdue_reminders(
        &self,
        today: NaiveDate,
    ) -> Result<usize, ServiceError> {
        let overdue = InvoiceEntity::find()
            .filter(invoice::Column::Status.eq(InvoiceStatus::Overdue))
            .all(&*self.db)
            .await?;

        let mut sent = 0usize;
        for inv in overdue {
            let days_overdue = (today - inv.due_date).num_days();
            if days_overdue > 0 && days_overdue % 7 == 0 {
                self.enqueue_reminder(&inv, days_overdue).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    async fn enqueue_reminder(
        &self,
        inv: &invoice::Model,
        days_overdue: i64,
    ) -> Result<(), ServiceError> {
        let client_email = match inv.client_id {
            Some(client_id) => client::Entity::find_by_id(client_id)
                .one(&*self.db)
                .await?
                .and_then(|c| c.email),
            None => None,
        };

        outbox::enqueue(
            &*self.db,
            &Event::PaymentReminder {
                invoice_id: inv.id,
                user_id: inv.user_id,
                client_email,
                invoice_number: inv.invoice_number.clone(),
                total_amount: inv.total_amount,
                days_overdue,
            },
        )
        .await
    }
}
