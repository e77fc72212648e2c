use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    ModelTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{keys, CacheBackend};
use crate::entities::invoice::{self, Entity as InvoiceEntity, InvoiceStatus};
use crate::entities::payment::{self, Entity as PaymentEntity, PaymentMethod};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::money;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub notes: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub notes: Option<String>,
    pub payment_date: DateTime<Utc>,
    pub invoice_status: InvoiceStatus,
    pub remaining_balance: Decimal,
}

/// Payment recording and reconciliation against invoice totals.
///
/// Overpayment is rejected, full payment flips the invoice to `paid`, and
/// both happen under a row lock so concurrent payments against the same
/// invoice serialize instead of double-settling.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
}

impl PaymentService {
    pub fn new(db: Arc<DatabaseConnection>, cache: Arc<dyn CacheBackend>) -> Self {
        Self { db, cache }
    }

    #[instrument(skip(self, request), fields(invoice_id = %invoice_id))]
    pub async fn record_payment(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
        request: RecordPaymentRequest,
    ) -> Result<PaymentResponse, ServiceError> {
        if request.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount must be positive".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let invoice_model = self.load_locked(&txn, user_id, invoice_id).await?;

        if invoice_model.status == InvoiceStatus::Cancelled {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Cannot record payments against a cancelled invoice".to_string(),
            ));
        }

        let existing = sum_payments(&txn, invoice_id).await?;
        let remaining = invoice_model.total_amount - existing;
        if request.amount > remaining {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(format!(
                "Payment of {} exceeds remaining balance of {}",
                money::to_currency(request.amount),
                money::to_currency(remaining)
            )));
        }

        let now = Utc::now();
        let payment_model = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            invoice_id: Set(invoice_id),
            amount: Set(request.amount),
            method: Set(request.method),
            transaction_id: Set(request.transaction_id),
            notes: Set(request.notes),
            payment_date: Set(request.payment_date.unwrap_or(now)),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let paid_total = existing + request.amount;
        let settled = paid_total >= invoice_model.total_amount;
        let status = if settled {
            let mut active: invoice::ActiveModel = invoice_model.clone().into();
            active.status = Set(InvoiceStatus::Paid);
            active.paid_at = Set(Some(now));
            active.updated_at = Set(Some(now));
            active.update(&txn).await?;

            outbox::enqueue(
                &txn,
                &Event::PaymentCompleted {
                    invoice_id,
                    user_id,
                    amount: request.amount,
                    total_amount: invoice_model.total_amount,
                },
            )
            .await?;
            InvoiceStatus::Paid
        } else {
            invoice_model.status
        };

        txn.commit().await?;
        info!(
            invoice_id = %invoice_id,
            amount = %request.amount,
            settled,
            "Payment recorded"
        );

        self.invalidate_caches(user_id, invoice_id).await;

        Ok(PaymentResponse {
            id: payment_model.id,
            invoice_id,
            amount: payment_model.amount,
            method: payment_model.method,
            transaction_id: payment_model.transaction_id,
            notes: payment_model.notes,
            payment_date: payment_model.payment_date,
            invoice_status: status,
            remaining_balance: money::to_currency(invoice_model.total_amount - paid_total),
        })
    }

    /// Payments for an owned invoice, most recent first.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice_payments(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        let invoice_model = match InvoiceEntity::find_by_id(invoice_id).one(&*self.db).await? {
            Some(model) if model.user_id == user_id => model,
            Some(_) => {
                return Err(ServiceError::Unauthorized(
                    "invoice belongs to another user".to_string(),
                ))
            }
            None => return Err(ServiceError::NotFound("Invoice not found".to_string())),
        };

        let payments = invoice_model
            .find_related(PaymentEntity)
            .order_by_desc(payment::Column::PaymentDate)
            .all(&*self.db)
            .await?;
        Ok(payments)
    }

    /// Remove a payment. A settled invoice whose payments no longer cover
    /// the total reverts to `sent`. Returns `false` when the payment does
    /// not exist or belongs to someone else's invoice.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn delete_payment(
        &self,
        user_id: Uuid,
        payment_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        let Some(payment_model) = PaymentEntity::find_by_id(payment_id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(false);
        };

        let invoice_id = payment_model.invoice_id;
        let invoice_model = InvoiceEntity::find_by_id(invoice_id)
            .lock_exclusive()
            .one(&txn)
            .await?;
        let Some(invoice_model) = invoice_model.filter(|m| m.user_id == user_id) else {
            txn.rollback().await?;
            return Ok(false);
        };

        let deleted_amount = payment_model.amount;
        payment_model.delete(&txn).await?;

        if invoice_model.status == InvoiceStatus::Paid {
            let remaining_sum = sum_payments(&txn, invoice_id).await?;
            if remaining_sum < invoice_model.total_amount {
                let mut active: invoice::ActiveModel = invoice_model.into();
                active.status = Set(InvoiceStatus::Sent);
                active.paid_at = Set(None);
                active.updated_at = Set(Some(Utc::now()));
                active.update(&txn).await?;
            }
        }

        txn.commit().await?;
        info!(
            payment_id = %payment_id,
            invoice_id = %invoice_id,
            amount = %deleted_amount,
            "Payment deleted"
        );

        self.invalidate_caches(user_id, invoice_id).await;
        Ok(true)
    }

    async fn load_locked(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<invoice::Model, ServiceError> {
        let found = InvoiceEntity::find_by_id(invoice_id)
            .lock_exclusive()
            .one(txn)
            .await?;
        match found {
            Some(model) if model.user_id == user_id => Ok(model),
            Some(_) => Err(ServiceError::Unauthorized(
                "invoice belongs to another user".to_string(),
            )),
            None => Err(ServiceError::NotFound("Invoice not found".to_string())),
        }
    }

    async fn invalidate_caches(&self, user_id: Uuid, invoice_id: Uuid) {
        if let Err(e) = self.cache.delete(&keys::invoice(invoice_id)).await {
            warn!(invoice_id = %invoice_id, "Cache delete failed: {}", e);
        }
        if let Err(e) = self
            .cache
            .invalidate_pattern(&keys::user_invoices_pattern(user_id))
            .await
        {
            warn!(user_id = %user_id, "Cache pattern invalidation failed: {}", e);
        }
        if let Err(e) = self.cache.delete(&keys::analytics(user_id)).await {
            warn!(user_id = %user_id, "Analytics cache delete failed: {}", e);
        }
    }
}

async fn sum_payments(
    txn: &DatabaseTransaction,
    invoice_id: Uuid,
) -> Result<Decimal, ServiceError> {
    let payments = PaymentEntity::find()
        .filter(payment::Column::InvoiceId.eq(invoice_id))
        .all(txn)
        .await?;
    Ok(payments.iter().map(|p| p.amount).sum())
}
