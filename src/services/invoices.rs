use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{self, keys, CacheBackend};
use crate::entities::invoice::{self, Entity as InvoiceEntity, InvoiceStatus};
use crate::entities::invoice_item::{self, Entity as InvoiceItemEntity};
use crate::entities::invoice_sequence::{self, Entity as InvoiceSequenceEntity};
use crate::entities::{client, payment};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::money::{self, LineItemInput};
use crate::services::PageLimits;

const INVOICE_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    pub client_id: Option<Uuid>,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub notes: Option<String>,
    pub items: Vec<LineItemInput>,
}

/// Typed partial update: `None` leaves the field untouched. Replacing
/// `items` recomputes the stored totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInvoiceRequest {
    pub client_id: Option<Uuid>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub tax_rate: Option<Decimal>,
    pub discount: Option<Decimal>,
    pub notes: Option<String>,
    pub items: Option<Vec<LineItemInput>>,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub client_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvoiceItemResponse {
    pub id: Uuid,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvoiceResponse {
    pub id: Uuid,
    pub invoice_number: String,
    pub client_id: Option<Uuid>,
    pub status: InvoiceStatus,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub tax_rate: Decimal,
    pub discount: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub items: Vec<InvoiceItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvoiceListResponse {
    pub invoices: Vec<InvoiceResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Partial projection stored in the cache. Deliberately too thin to
/// reconstruct an invoice: good for existence/ownership checks only, the
/// authoritative read always goes to the store.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedInvoice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
}

/// Invoice lifecycle orchestration: creation, mutation, and the status
/// state machine, with cache and outbox side effects.
#[derive(Clone)]
pub struct InvoiceService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    limits: PageLimits,
}

impl InvoiceService {
    pub fn new(db: Arc<DatabaseConnection>, cache: Arc<dyn CacheBackend>, limits: PageLimits) -> Self {
        Self { db, cache, limits }
    }

    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn create_invoice(
        &self,
        user_id: Uuid,
        request: CreateInvoiceRequest,
    ) -> Result<InvoiceResponse, ServiceError> {
        if request.due_date < request.issue_date {
            return Err(ServiceError::ValidationError(
                "Due date must not be before issue date".to_string(),
            ));
        }
        let totals = money::compute_totals(&request.items, request.tax_rate, request.discount)?;

        let txn = self.db.begin().await?;

        if let Some(client_id) = request.client_id {
            self.verify_client_ownership(&txn, user_id, client_id).await?;
        }

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let invoice_number =
            next_invoice_number(&txn, user_id, request.issue_date).await?;

        let invoice_model = invoice::ActiveModel {
            id: Set(invoice_id),
            user_id: Set(user_id),
            client_id: Set(request.client_id),
            invoice_number: Set(invoice_number.clone()),
            issue_date: Set(request.issue_date),
            due_date: Set(request.due_date),
            status: Set(InvoiceStatus::Draft),
            tax_rate: Set(request.tax_rate),
            discount: Set(request.discount),
            subtotal: Set(totals.subtotal),
            tax_amount: Set(totals.tax_amount),
            total_amount: Set(totals.total_amount),
            sent_at: Set(None),
            paid_at: Set(None),
            notes: Set(request.notes),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await?;

        insert_items(&txn, invoice_id, &request.items).await?;

        outbox::enqueue(
            &txn,
            &Event::InvoiceCreated {
                invoice_id,
                user_id,
                invoice_number: invoice_number.clone(),
                total_amount: totals.total_amount,
            },
        )
        .await?;

        txn.commit().await?;
        info!(invoice_id = %invoice_id, invoice_number = %invoice_number, "Invoice created");

        self.invalidate_user_caches(user_id, None).await;
        self.load_response(invoice_model).await
    }

    /// Authoritative read. The cache entry is only a projection, so a hit is
    /// used for a fast ownership check; full data always comes from the store
    /// and repopulates the cache with a bounded TTL.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<InvoiceResponse, ServiceError> {
        let key = keys::invoice(invoice_id);
        match cache::get_json::<CachedInvoice>(self.cache.as_ref(), &key).await {
            Ok(Some(cached)) if cached.user_id != user_id => {
                return Err(ServiceError::Unauthorized(
                    "invoice belongs to another user".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }

        let model = self.load_owned(&*self.db, user_id, invoice_id).await?;

        let projection = CachedInvoice {
            id: model.id,
            user_id: model.user_id,
            invoice_number: model.invoice_number.clone(),
            status: model.status,
            total_amount: model.total_amount,
        };
        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &key, &projection, Some(INVOICE_CACHE_TTL)).await
        {
            warn!("Cache write failed for {}: {}", key, e);
        }

        self.load_response(model).await
    }

    #[instrument(skip(self, filter))]
    pub async fn list_invoices(
        &self,
        user_id: Uuid,
        filter: InvoiceFilter,
        page: u64,
        per_page: u64,
    ) -> Result<InvoiceListResponse, ServiceError> {
        let page = page.max(1);
        let per_page = self.limits.clamp(per_page);
        let mut query = InvoiceEntity::find().filter(invoice::Column::UserId.eq(user_id));

        if let Some(status) = filter.status {
            query = query.filter(invoice::Column::Status.eq(status));
        }
        if let Some(client_id) = filter.client_id {
            query = query.filter(invoice::Column::ClientId.eq(client_id));
        }
        if let Some(start) = filter.start_date {
            query = query.filter(invoice::Column::IssueDate.gte(start));
        }
        if let Some(end) = filter.end_date {
            query = query.filter(invoice::Column::IssueDate.lte(end));
        }
        if let Some(search) = filter.search.as_deref() {
            let pattern = format!("%{}%", search);
            query = query.filter(
                invoice::Column::InvoiceNumber
                    .like(pattern.clone())
                    .or(invoice::Column::Notes.like(pattern)),
            );
        }

        let paginator = query
            .order_by_desc(invoice::Column::CreatedAt)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let models = paginator.fetch_page(page - 1).await?;

        let mut invoices = Vec::with_capacity(models.len());
        for model in models {
            invoices.push(self.load_response(model).await?);
        }

        Ok(InvoiceListResponse {
            invoices,
            total,
            page,
            per_page,
        })
    }

    #[instrument(skip(self, request), fields(invoice_id = %invoice_id))]
    pub async fn update_invoice(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
        request: UpdateInvoiceRequest,
    ) -> Result<InvoiceResponse, ServiceError> {
        let txn = self.db.begin().await?;
        let model = self.load_owned_for_update(&txn, user_id, invoice_id).await?;

        if model.status.is_terminal() {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(format!(
                "Cannot update invoice with status {}",
                model.status
            )));
        }

        if let Some(client_id) = request.client_id {
            self.verify_client_ownership(&txn, user_id, client_id).await?;
        }

        let merged = merge_invoice_fields(&model, &request);
        if merged.due_date < merged.issue_date {
            txn.rollback().await?;
            return Err(ServiceError::ValidationError(
                "Due date must not be before issue date".to_string(),
            ));
        }

        let mut active: invoice::ActiveModel = model.clone().into();
        active.client_id = Set(merged.client_id);
        active.issue_date = Set(merged.issue_date);
        active.due_date = Set(merged.due_date);
        active.tax_rate = Set(merged.tax_rate);
        active.discount = Set(merged.discount);
        active.notes = Set(merged.notes);
        active.updated_at = Set(Some(Utc::now()));

        let new_totals = if let Some(items) = &request.items {
            Some(money::compute_totals(items, merged.tax_rate, merged.discount)?)
        } else if request.tax_rate.is_some() || request.discount.is_some() {
            // Rate or discount changed without replacing items: recompute
            // from the stored lines.
            let stored = self.item_inputs(&txn, invoice_id).await?;
            Some(money::compute_totals(&stored, merged.tax_rate, merged.discount)?)
        } else {
            None
        };

        if let Some(totals) = &new_totals {
            // The total can never drop below what has already been paid.
            let paid = sum_payments(&txn, invoice_id).await?;
            if totals.total_amount < paid {
                txn.rollback().await?;
                return Err(ServiceError::Conflict(format!(
                    "New total {} is below the {} already paid",
                    money::to_currency(totals.total_amount),
                    money::to_currency(paid)
                )));
            }
        }

        if let Some(totals) = new_totals {
            if let Some(items) = &request.items {
                InvoiceItemEntity::delete_many()
                    .filter(invoice_item::Column::InvoiceId.eq(invoice_id))
                    .exec(&txn)
                    .await?;
                insert_items(&txn, invoice_id, items).await?;
            }
            active.subtotal = Set(totals.subtotal);
            active.tax_amount = Set(totals.tax_amount);
            active.total_amount = Set(totals.total_amount);
        }

        let updated = active.update(&txn).await?;

        outbox::enqueue(
            &txn,
            &Event::InvoiceUpdated {
                invoice_id,
                user_id,
                status: updated.status.to_string(),
            },
        )
        .await?;

        txn.commit().await?;
        info!(invoice_id = %invoice_id, "Invoice updated");

        self.invalidate_user_caches(user_id, Some(invoice_id)).await;
        self.load_response(updated).await
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn delete_invoice(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;
        let model = match self.try_load_owned(&txn, user_id, invoice_id).await? {
            Some(model) => model,
            None => {
                txn.rollback().await?;
                return Ok(false);
            }
        };

        if model.status == InvoiceStatus::Paid {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Cannot delete paid invoices".to_string(),
            ));
        }

        // Children first: foreign key cascades are not guaranteed on every
        // backend the test suite runs against.
        payment::Entity::delete_many()
            .filter(payment::Column::InvoiceId.eq(invoice_id))
            .exec(&txn)
            .await?;
        InvoiceItemEntity::delete_many()
            .filter(invoice_item::Column::InvoiceId.eq(invoice_id))
            .exec(&txn)
            .await?;
        InvoiceEntity::delete_by_id(invoice_id).exec(&txn).await?;

        txn.commit().await?;
        info!(invoice_id = %invoice_id, "Invoice deleted");

        self.invalidate_user_caches(user_id, Some(invoice_id)).await;
        Ok(true)
    }

    /// draft -> sent. Requires a client with an email address; the outgoing
    /// mail is driven by the `email.invoice_sent` event.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn send_invoice(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<InvoiceResponse, ServiceError> {
        let txn = self.db.begin().await?;
        let model = self.load_owned_for_update(&txn, user_id, invoice_id).await?;

        if model.status != InvoiceStatus::Draft {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Can only send draft invoices".to_string(),
            ));
        }

        let client_model = match model.client_id {
            Some(client_id) => client::Entity::find_by_id(client_id).one(&txn).await?,
            None => None,
        };
        let (client_email, client_name) = match client_model {
            Some(ref c) => match c.email.as_deref() {
                Some(email) => (email.to_string(), c.name.clone()),
                None => {
                    txn.rollback().await?;
                    return Err(ServiceError::ValidationError(
                        "Invoice must have a client with email".to_string(),
                    ));
                }
            },
            None => {
                txn.rollback().await?;
                return Err(ServiceError::ValidationError(
                    "Invoice must have a client with email".to_string(),
                ));
            }
        };

        let now = Utc::now();
        let mut active: invoice::ActiveModel = model.clone().into();
        active.status = Set(InvoiceStatus::Sent);
        active.sent_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let updated = active.update(&txn).await?;

        outbox::enqueue(
            &txn,
            &Event::InvoiceSent {
                invoice_id,
                user_id,
                client_email,
                client_name,
                invoice_number: updated.invoice_number.clone(),
                total_amount: updated.total_amount,
                due_date: updated.due_date,
            },
        )
        .await?;

        txn.commit().await?;
        info!(invoice_id = %invoice_id, "Invoice sent");

        self.invalidate_user_caches(user_id, Some(invoice_id)).await;
        self.load_response(updated).await
    }

    /// Manual settle without recording a payment row. Idempotence: marking
    /// an already-paid invoice paid is a conflict.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn mark_as_paid(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<InvoiceResponse, ServiceError> {
        let txn = self.db.begin().await?;
        let model = self.load_owned_for_update(&txn, user_id, invoice_id).await?;

        if model.status == InvoiceStatus::Paid {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Invoice is already paid".to_string(),
            ));
        }
        if model.status == InvoiceStatus::Cancelled {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Cannot mark a cancelled invoice as paid".to_string(),
            ));
        }

        let now = Utc::now();
        let mut active: invoice::ActiveModel = model.clone().into();
        active.status = Set(InvoiceStatus::Paid);
        active.paid_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let updated = active.update(&txn).await?;

        outbox::enqueue(
            &txn,
            &Event::InvoicePaid {
                invoice_id,
                user_id,
                amount: updated.total_amount,
            },
        )
        .await?;

        txn.commit().await?;
        info!(invoice_id = %invoice_id, "Invoice marked paid");

        self.invalidate_user_caches(user_id, Some(invoice_id)).await;
        self.load_response(updated).await
    }

    /// draft/sent -> cancelled. Terminal; nothing leaves `cancelled`.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn cancel_invoice(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<InvoiceResponse, ServiceError> {
        let txn = self.db.begin().await?;
        let model = self.load_owned_for_update(&txn, user_id, invoice_id).await?;

        if !matches!(model.status, InvoiceStatus::Draft | InvoiceStatus::Sent) {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(format!(
                "Cannot cancel invoice with status {}",
                model.status
            )));
        }

        let mut active: invoice::ActiveModel = model.clone().into();
        active.status = Set(InvoiceStatus::Cancelled);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await?;

        outbox::enqueue(
            &txn,
            &Event::InvoiceUpdated {
                invoice_id,
                user_id,
                status: updated.status.to_string(),
            },
        )
        .await?;

        txn.commit().await?;
        info!(invoice_id = %invoice_id, "Invoice cancelled");

        self.invalidate_user_caches(user_id, Some(invoice_id)).await;
        self.load_response(updated).await
    }

    /// Overdue sweep: every `sent` invoice past due as of `today` moves to
    /// `overdue`, with one reminder event each. Returns how many flipped.
    #[instrument(skip(self))]
    pub async fn sweep_overdue(&self, today: NaiveDate) -> Result<usize, ServiceError> {
        let due = InvoiceEntity::find()
            .filter(invoice::Column::Status.eq(InvoiceStatus::Sent))
            .filter(invoice::Column::DueDate.lt(today))
            .all(&*self.db)
            .await?;

        let mut flipped = 0usize;
        for candidate in due {
            let invoice_id = candidate.id;

            let txn = self.db.begin().await?;
            // The candidate list is a stale snapshot: a payment can settle
            // the invoice between the select and this transaction. Re-load
            // under the row lock and skip anything no longer eligible.
            let current = InvoiceEntity::find_by_id(invoice_id)
                .lock_exclusive()
                .one(&txn)
                .await?;
            let Some(model) =
                current.filter(|m| m.status == InvoiceStatus::Sent && m.due_date < today)
            else {
                txn.rollback().await?;
                continue;
            };

            let user_id = model.user_id;
            let days_overdue = (today - model.due_date).num_days();
            let client_email = match model.client_id {
                Some(client_id) => client::Entity::find_by_id(client_id)
                    .one(&txn)
                    .await?
                    .and_then(|c| c.email),
                None => None,
            };

            let invoice_number = model.invoice_number.clone();
            let total_amount = model.total_amount;
            let mut active: invoice::ActiveModel = model.into();
            active.status = Set(InvoiceStatus::Overdue);
            active.updated_at = Set(Some(Utc::now()));
            active.update(&txn).await?;

            outbox::enqueue(
                &txn,
                &Event::PaymentReminder {
                    invoice_id,
                    user_id,
                    client_email,
                    invoice_number,
                    total_amount,
                    days_overdue,
                },
            )
            .await?;

            txn.commit().await?;
            self.invalidate_user_caches(user_id, Some(invoice_id)).await;
            flipped += 1;
        }

        if flipped > 0 {
            info!(count = flipped, "Marked invoices overdue");
        }
        Ok(flipped)
    }

    // ---- internals ----

    async fn verify_client_ownership(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<(), ServiceError> {
        match client::Entity::find_by_id(client_id).one(txn).await? {
            Some(c) if c.user_id == user_id => Ok(()),
            Some(_) => Err(ServiceError::Unauthorized(
                "client belongs to another user".to_string(),
            )),
            None => Err(ServiceError::NotFound("Client not found".to_string())),
        }
    }

    /// Load an invoice, distinguishing missing from foreign-owned. The
    /// distinction stays internal; `for_client()` collapses it.
    async fn load_owned<C: sea_orm::ConnectionTrait>(
        &self,
        db: &C,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<invoice::Model, ServiceError> {
        match InvoiceEntity::find_by_id(invoice_id).one(db).await? {
            Some(model) if model.user_id == user_id => Ok(model),
            Some(_) => Err(ServiceError::Unauthorized(
                "invoice belongs to another user".to_string(),
            )),
            None => Err(ServiceError::NotFound("Invoice not found".to_string())),
        }
    }

    async fn try_load_owned(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<invoice::Model>, ServiceError> {
        match self.load_owned(txn, user_id, invoice_id).await {
            Ok(model) => Ok(Some(model)),
            Err(ServiceError::NotFound(_)) | Err(ServiceError::Unauthorized(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Row-locked load for read-modify-write paths, serializing concurrent
    /// mutations of the same invoice.
    async fn load_owned_for_update(
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

    async fn item_inputs<C: sea_orm::ConnectionTrait>(
        &self,
        db: &C,
        invoice_id: Uuid,
    ) -> Result<Vec<LineItemInput>, ServiceError> {
        let items = InvoiceItemEntity::find()
            .filter(invoice_item::Column::InvoiceId.eq(invoice_id))
            .all(db)
            .await?;
        Ok(items
            .into_iter()
            .map(|item| LineItemInput {
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect())
    }

    async fn load_response(&self, model: invoice::Model) -> Result<InvoiceResponse, ServiceError> {
        let items = InvoiceItemEntity::find()
            .filter(invoice_item::Column::InvoiceId.eq(model.id))
            .order_by_asc(invoice_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(model_to_response(model, items))
    }

    /// Best-effort cache invalidation, only called after a durable commit.
    /// Failures are logged and swallowed: the store already holds the truth.
    async fn invalidate_user_caches(&self, user_id: Uuid, invoice_id: Option<Uuid>) {
        if let Some(invoice_id) = invoice_id {
            if let Err(e) = self.cache.delete(&keys::invoice(invoice_id)).await {
                warn!(invoice_id = %invoice_id, "Cache delete failed: {}", e);
            }
        }
        let pattern = keys::user_invoices_pattern(user_id);
        if let Err(e) = self.cache.invalidate_pattern(&pattern).await {
            warn!(user_id = %user_id, "Cache pattern invalidation failed: {}", e);
        }
        if let Err(e) = self.cache.delete(&keys::analytics(user_id)).await {
            warn!(user_id = %user_id, "Analytics cache delete failed: {}", e);
        }
    }
}

struct MergedFields {
    client_id: Option<Uuid>,
    issue_date: NaiveDate,
    due_date: NaiveDate,
    tax_rate: Decimal,
    discount: Decimal,
    notes: Option<String>,
}

/// Explicit field-by-field merge for partial updates.
fn merge_invoice_fields(model: &invoice::Model, request: &UpdateInvoiceRequest) -> MergedFields {
    MergedFields {
        client_id: request.client_id.or(model.client_id),
        issue_date: request.issue_date.unwrap_or(model.issue_date),
        due_date: request.due_date.unwrap_or(model.due_date),
        tax_rate: request.tax_rate.unwrap_or(model.tax_rate),
        discount: request.discount.unwrap_or(model.discount),
        notes: request.notes.clone().or_else(|| model.notes.clone()),
    }
}

/// Allocate the next invoice number for a user: `INV-{yyyymm}-{seq:04}`,
/// backed by an atomically incremented per-user counter row. Runs inside
/// the creation transaction so a rollback releases the number's slot.
async fn next_invoice_number(
    txn: &DatabaseTransaction,
    user_id: Uuid,
    issue_date: NaiveDate,
) -> Result<String, ServiceError> {
    let period = issue_date.format("%Y%m").to_string();

    let existing = InvoiceSequenceEntity::find_by_id((user_id, period.clone()))
        .lock_exclusive()
        .one(txn)
        .await?;

    let seq = match existing {
        Some(row) => {
            let seq = row.next_seq;
            let mut active: invoice_sequence::ActiveModel = row.into();
            active.next_seq = Set(seq + 1);
            active.update(txn).await?;
            seq
        }
        None => {
            invoice_sequence::ActiveModel {
                user_id: Set(user_id),
                period: Set(period.clone()),
                next_seq: Set(2),
            }
            .insert(txn)
            .await?;
            1
        }
    };

    Ok(format!("INV-{}-{:04}", period, seq))
}

async fn sum_payments(
    txn: &DatabaseTransaction,
    invoice_id: Uuid,
) -> Result<Decimal, ServiceError> {
    let payments = payment::Entity::find()
        .filter(payment::Column::InvoiceId.eq(invoice_id))
        .all(txn)
        .await?;
    Ok(payments.iter().map(|p| p.amount).sum())
}

async fn insert_items(
    txn: &DatabaseTransaction,
    invoice_id: Uuid,
    items: &[LineItemInput],
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let rows: Vec<invoice_item::ActiveModel> = items
        .iter()
        .map(|item| invoice_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            invoice_id: Set(invoice_id),
            description: Set(item.description.clone()),
            quantity: Set(item.quantity),
            unit_price: Set(item.unit_price),
            total: Set(item.line_total()),
            created_at: Set(now),
        })
        .collect();
    InvoiceItemEntity::insert_many(rows).exec(txn).await?;
    Ok(())
}

fn model_to_response(model: invoice::Model, items: Vec<invoice_item::Model>) -> InvoiceResponse {
    InvoiceResponse {
        id: model.id,
        invoice_number: model.invoice_number,
        client_id: model.client_id,
        status: model.status,
        issue_date: model.issue_date,
        due_date: model.due_date,
        tax_rate: model.tax_rate,
        discount: model.discount,
        subtotal: model.subtotal,
        tax_amount: model.tax_amount,
        total_amount: model.total_amount,
        sent_at: model.sent_at,
        paid_at: model.paid_at,
        notes: model.notes,
        items: items
            .into_iter()
            .map(|item| InvoiceItemResponse {
                id: item.id,
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price,
                total: item.total,
            })
            .collect(),
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_model() -> invoice::Model {
        invoice::Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            client_id: None,
            invoice_number: "INV-202501-0001".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2025, 2, 10).unwrap(),
            status: InvoiceStatus::Draft,
            tax_rate: dec!(10),
            discount: Decimal::ZERO,
            subtotal: dec!(100.00),
            tax_amount: dec!(10.00),
            total_amount: dec!(110.00),
            sent_at: None,
            paid_at: None,
            notes: Some("net 30".to_string()),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn merge_keeps_unset_fields() {
        let model = sample_model();
        let merged = merge_invoice_fields(&model, &UpdateInvoiceRequest::default());
        assert_eq!(merged.issue_date, model.issue_date);
        assert_eq!(merged.due_date, model.due_date);
        assert_eq!(merged.tax_rate, model.tax_rate);
        assert_eq!(merged.notes.as_deref(), Some("net 30"));
    }

    #[test]
    fn merge_applies_set_fields() {
        let model = sample_model();
        let request = UpdateInvoiceRequest {
            due_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            tax_rate: Some(dec!(20)),
            notes: Some("net 60".to_string()),
            ..Default::default()
        };
        let merged = merge_invoice_fields(&model, &request);
        assert_eq!(merged.due_date, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(merged.tax_rate, dec!(20));
        assert_eq!(merged.notes.as_deref(), Some("net 60"));
        assert_eq!(merged.issue_date, model.issue_date);
    }

    #[test]
    fn response_carries_items_in_order() {
        let model = sample_model();
        let invoice_id = model.id;
        let now = Utc::now();
        let items = vec![invoice_item::Model {
            id: Uuid::new_v4(),
            invoice_id,
            description: "consulting".to_string(),
            quantity: 2,
            unit_price: dec!(50.00),
            total: dec!(100.00),
            created_at: now,
        }];
        let response = model_to_response(model, items);
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.items[0].total, dec!(100.00));
        assert_eq!(response.total_amount, dec!(110.00));
    }
}
