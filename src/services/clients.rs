use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::client::{self, Entity as ClientEntity};
use crate::entities::invoice::{self, Entity as InvoiceEntity};
use crate::entities::invoice_item;
use crate::entities::payment;
use crate::errors::ServiceError;
use crate::services::PageLimits;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateClientRequest {
    #[validate(length(min = 1, max = 255, message = "Client name is required"))]
    pub name: String,
    #[validate(email(message = "Client email must be a valid address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub company: Option<String>,
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateClientRequest {
    #[validate(length(min = 1, max = 255, message = "Client name is required"))]
    pub name: Option<String>,
    #[validate(email(message = "Client email must be a valid address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub company: Option<String>,
    pub tax_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientListResponse {
    pub clients: Vec<client::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Client book, scoped per user. Deleting a client takes its invoices and
/// their children with it.
#[derive(Clone)]
pub struct ClientService {
    db: Arc<DatabaseConnection>,
    limits: PageLimits,
}

impl ClientService {
    pub fn new(db: Arc<DatabaseConnection>, limits: PageLimits) -> Self {
        Self { db, limits }
    }

    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn create_client(
        &self,
        user_id: Uuid,
        request: CreateClientRequest,
    ) -> Result<client::Model, ServiceError> {
        request.validate()?;

        let now = Utc::now();
        let model = client::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            name: Set(request.name),
            email: Set(request.email),
            phone: Set(request.phone),
            address: Set(request.address),
            company: Set(request.company),
            tax_id: Set(request.tax_id),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&*self.db)
        .await?;

        info!(client_id = %model.id, "Client created");
        Ok(model)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn get_client(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<client::Model, ServiceError> {
        match ClientEntity::find_by_id(client_id).one(&*self.db).await? {
            Some(model) if model.user_id == user_id => Ok(model),
            Some(_) => Err(ServiceError::Unauthorized(
                "client belongs to another user".to_string(),
            )),
            None => Err(ServiceError::NotFound("Client not found".to_string())),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_clients(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<ClientListResponse, ServiceError> {
        let page = page.max(1);
        let per_page = self.limits.clamp(per_page);
        let paginator = ClientEntity::find()
            .filter(client::Column::UserId.eq(user_id))
            .order_by_asc(client::Column::Name)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let clients = paginator.fetch_page(page - 1).await?;

        Ok(ClientListResponse {
            clients,
            total,
            page,
            per_page,
        })
    }

    #[instrument(skip(self, request), fields(client_id = %client_id))]
    pub async fn update_client(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        request: UpdateClientRequest,
    ) -> Result<client::Model, ServiceError> {
        request.validate()?;
        let model = self.get_client(user_id, client_id).await?;

        let mut active: client::ActiveModel = model.clone().into();
        if let Some(name) = request.name {
            active.name = Set(name);
        }
        if request.email.is_some() {
            active.email = Set(request.email);
        }
        if request.phone.is_some() {
            active.phone = Set(request.phone);
        }
        if request.address.is_some() {
            active.address = Set(request.address);
        }
        if request.company.is_some() {
            active.company = Set(request.company);
        }
        if request.tax_id.is_some() {
            active.tax_id = Set(request.tax_id);
        }
        active.updated_at = Set(Some(Utc::now()));

        let updated = active.update(&*self.db).await?;
        info!(client_id = %client_id, "Client updated");
        Ok(updated)
    }

    /// Delete a client and everything hanging off it. Explicit child deletes
    /// because foreign key cascades are not guaranteed on every backend.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn delete_client(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        let owned = match ClientEntity::find_by_id(client_id).one(&txn).await? {
            Some(model) if model.user_id == user_id => model,
            _ => {
                txn.rollback().await?;
                return Ok(false);
            }
        };

        let invoice_ids: Vec<Uuid> = InvoiceEntity::find()
            .filter(invoice::Column::ClientId.eq(client_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();

        if !invoice_ids.is_empty() {
            payment::Entity::delete_many()
                .filter(payment::Column::InvoiceId.is_in(invoice_ids.clone()))
                .exec(&txn)
                .await?;
            invoice_item::Entity::delete_many()
                .filter(invoice_item::Column::InvoiceId.is_in(invoice_ids.clone()))
                .exec(&txn)
                .await?;
            InvoiceEntity::delete_many()
                .filter(invoice::Column::Id.is_in(invoice_ids))
                .exec(&txn)
                .await?;
        }

        ClientEntity::delete_by_id(owned.id).exec(&txn).await?;
        txn.commit().await?;

        info!(client_id = %client_id, "Client deleted");
        Ok(true)
    }
}
