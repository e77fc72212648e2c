use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Months, Utc};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::cache::{self, keys, CacheBackend};
use crate::entities::invoice::{self, Entity as InvoiceEntity, InvoiceStatus};
use crate::errors::ServiceError;

const ANALYTICS_TTL: Duration = Duration::from_secs(60 * 60);
const SUMMARY_TTL: Duration = Duration::from_secs(10 * 60);
const REVENUE_MONTHS: u32 = 12;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusCounts {
    pub draft: u64,
    pub sent: u64,
    pub paid: u64,
    pub overdue: u64,
    pub cancelled: u64,
}

/// Per-user reporting payload. `monthly_revenue` covers the trailing twelve
/// months keyed `YYYY-MM`, zero-filled so charts render gapless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub user_id: Uuid,
    pub status_counts: StatusCounts,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_revenue: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub outstanding_amount: Decimal,
    pub monthly_revenue: BTreeMap<String, Decimal>,
    pub average_days_to_pay: Option<f64>,
    pub generated_at: chrono::DateTime<Utc>,
}

/// Compact dashboard summary, cheaper than the full report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSummary {
    pub total_invoices: u64,
    pub status_counts: StatusCounts,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_revenue: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub outstanding_amount: Decimal,
}

/// Read-side reporting over the invoice store. Both payloads are derived
/// data and safe to cache; invalidation rides the same per-user pattern the
/// write paths sweep.
#[derive(Clone)]
pub struct AnalyticsService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
}

impl AnalyticsService {
    pub fn new(db: Arc<DatabaseConnection>, cache: Arc<dyn CacheBackend>) -> Self {
        Self { db, cache }
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_analytics(&self, user_id: Uuid) -> Result<AnalyticsReport, ServiceError> {
        let key = keys::analytics(user_id);
        match cache::get_json::<AnalyticsReport>(self.cache.as_ref(), &key).await {
            Ok(Some(report)) => return Ok(report),
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }

        let report = self.compute_analytics(user_id).await?;
        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &key, &report, Some(ANALYTICS_TTL)).await
        {
            warn!("Cache write failed for {}: {}", key, e);
        }
        Ok(report)
    }

    /// Recompute and overwrite the cached report, bypassing any cached copy.
    /// Used by the background refresh so dashboards stay warm.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn refresh_analytics(&self, user_id: Uuid) -> Result<AnalyticsReport, ServiceError> {
        let report = self.compute_analytics(user_id).await?;
        let key = keys::analytics(user_id);
        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &key, &report, Some(ANALYTICS_TTL)).await
        {
            warn!("Cache write failed for {}: {}", key, e);
        }
        Ok(report)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_invoice_summary(&self, user_id: Uuid) -> Result<InvoiceSummary, ServiceError> {
        let key = keys::invoice_summary(user_id);
        match cache::get_json::<InvoiceSummary>(self.cache.as_ref(), &key).await {
            Ok(Some(summary)) => return Ok(summary),
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }

        let invoices = self.load_invoices(user_id).await?;
        let status_counts = count_statuses(&invoices);
        let summary = InvoiceSummary {
            total_invoices: invoices.len() as u64,
            total_revenue: sum_where(&invoices, InvoiceStatus::Paid),
            outstanding_amount: sum_where(&invoices, InvoiceStatus::Sent)
                + sum_where(&invoices, InvoiceStatus::Overdue),
            status_counts,
        };

        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &key, &summary, Some(SUMMARY_TTL)).await
        {
            warn!("Cache write failed for {}: {}", key, e);
        }
        Ok(summary)
    }

    async fn compute_analytics(&self, user_id: Uuid) -> Result<AnalyticsReport, ServiceError> {
        let invoices = self.load_invoices(user_id).await?;
        let now = Utc::now();

        let status_counts = count_statuses(&invoices);
        let total_revenue = sum_where(&invoices, InvoiceStatus::Paid);
        let outstanding_amount =
            sum_where(&invoices, InvoiceStatus::Sent) + sum_where(&invoices, InvoiceStatus::Overdue);

        let mut monthly_revenue: BTreeMap<String, Decimal> = BTreeMap::new();
        let current_month = now
            .date_naive()
            .with_day(1)
            .unwrap_or_else(|| now.date_naive());
        for offset in 0..REVENUE_MONTHS {
            if let Some(month) = current_month.checked_sub_months(Months::new(offset)) {
                monthly_revenue.insert(month.format("%Y-%m").to_string(), Decimal::ZERO);
            }
        }
        for inv in &invoices {
            if inv.status != InvoiceStatus::Paid {
                continue;
            }
            let Some(paid_at) = inv.paid_at else { continue };
            let bucket = paid_at.format("%Y-%m").to_string();
            if let Some(slot) = monthly_revenue.get_mut(&bucket) {
                *slot += inv.total_amount;
            }
        }

        // Days between sending and settlement, over invoices that saw both.
        let durations: Vec<i64> = invoices
            .iter()
            .filter(|inv| inv.status == InvoiceStatus::Paid)
            .filter_map(|inv| match (inv.sent_at, inv.paid_at) {
                (Some(sent), Some(paid)) => Some((paid - sent).num_days()),
                _ => None,
            })
            .collect();
        let average_days_to_pay = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        Ok(AnalyticsReport {
            user_id,
            status_counts,
            total_revenue,
            outstanding_amount,
            monthly_revenue,
            average_days_to_pay,
            generated_at: now,
        })
    }

    async fn load_invoices(&self, user_id: Uuid) -> Result<Vec<invoice::Model>, ServiceError> {
        Ok(InvoiceEntity::find()
            .filter(invoice::Column::UserId.eq(user_id))
            .all(&*self.db)
            .await?)
    }
}

fn count_statuses(invoices: &[invoice::Model]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for inv in invoices {
        match inv.status {
            InvoiceStatus::Draft => counts.draft += 1,
            InvoiceStatus::Sent => counts.sent += 1,
            InvoiceStatus::Paid => counts.paid += 1,
            InvoiceStatus::Overdue => counts.overdue += 1,
            InvoiceStatus::Cancelled => counts.cancelled += 1,
        }
    }
    counts
}

fn sum_where(invoices: &[invoice::Model], status: InvoiceStatus) -> Decimal {
    invoices
        .iter()
        .filter(|inv| inv.status == status)
        .map(|inv| inv.total_amount)
        .sum()
}
