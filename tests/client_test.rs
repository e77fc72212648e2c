mod common;

use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

use common::{invoice_request, TestApp};
use invoicing_api::entities::invoice;
use invoicing_api::errors::ServiceError;
use invoicing_api::services::clients::{CreateClientRequest, UpdateClientRequest};

fn client_request(name: &str, email: Option<&str>) -> CreateClientRequest {
    CreateClientRequest {
        name: name.to_string(),
        email: email.map(str::to_string),
        phone: None,
        address: None,
        company: None,
        tax_id: None,
    }
}

#[tokio::test]
async fn create_and_get_roundtrip() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let created = app
        .state
        .clients
        .create_client(user.id, client_request("Acme Corp", Some("ap@acme.test")))
        .await
        .unwrap();

    let fetched = app
        .state
        .clients
        .get_client(user.id, created.id)
        .await
        .unwrap();
    assert_eq!(fetched.name, "Acme Corp");
    assert_eq!(fetched.email.as_deref(), Some("ap@acme.test"));
}

#[tokio::test]
async fn rejects_invalid_input() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let err = app
        .state
        .clients
        .create_client(user.id, client_request("", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    let err = app
        .state
        .clients
        .create_client(user.id, client_request("Acme", Some("not-an-email")))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn clients_are_scoped_per_user() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let other = app.seed_user("other@example.com").await;

    let mine = app
        .state
        .clients
        .create_client(user.id, client_request("Acme Corp", None))
        .await
        .unwrap();

    let err = app
        .state
        .clients
        .get_client(other.id, mine.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));

    let missing = app
        .state
        .clients
        .get_client(user.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(missing, ServiceError::NotFound(_)));

    let listed = app.state.clients.list_clients(other.id, 1, 20).await.unwrap();
    assert_eq!(listed.total, 0);
}

#[tokio::test]
async fn update_applies_only_set_fields() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let created = app
        .state
        .clients
        .create_client(user.id, client_request("Acme Corp", Some("ap@acme.test")))
        .await
        .unwrap();

    let updated = app
        .state
        .clients
        .update_client(
            user.id,
            created.id,
            UpdateClientRequest {
                phone: Some("+1 555 0100".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.name, "Acme Corp");
    assert_eq!(updated.email.as_deref(), Some("ap@acme.test"));
    assert_eq!(updated.phone.as_deref(), Some("+1 555 0100"));
}

#[tokio::test]
async fn delete_cascades_to_invoices() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;

    app.state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(50.00), 1))
        .await
        .unwrap();

    assert!(app
        .state
        .clients
        .delete_client(user.id, client.id)
        .await
        .unwrap());

    let remaining = invoice::Entity::find()
        .filter(invoice::Column::ClientId.eq(client.id))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    // Foreign or missing clients delete as a no-op.
    let other = app.seed_user("other@example.com").await;
    assert!(!app
        .state
        .clients
        .delete_client(other.id, client.id)
        .await
        .unwrap());
}
