mod common;

use chrono::NaiveDate;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{invoice_request, TestApp};
use invoicing_api::entities::InvoiceStatus;
use invoicing_api::errors::ServiceError;
use invoicing_api::money::LineItemInput;
use invoicing_api::services::invoices::{
    CreateInvoiceRequest, InvoiceFilter, UpdateInvoiceRequest,
};

#[tokio::test]
async fn create_assigns_sequential_numbers_per_user_and_month() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let other = app.seed_user("other@example.com").await;

    let first = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(100.00), 1))
        .await
        .unwrap();
    let second = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(50.00), 2))
        .await
        .unwrap();
    let theirs = app
        .state
        .invoices
        .create_invoice(other.id, invoice_request(None, dec!(10.00), 1))
        .await
        .unwrap();

    assert_eq!(first.invoice_number, "INV-202501-0001");
    assert_eq!(second.invoice_number, "INV-202501-0002");
    // Sequences are per user, so the other tenant starts at one.
    assert_eq!(theirs.invoice_number, "INV-202501-0001");

    assert_eq!(first.status, InvoiceStatus::Draft);
    assert_eq!(first.total_amount, dec!(100.00));
    assert_eq!(second.total_amount, dec!(100.00));
    assert_eq!(first.items.len(), 1);
}

#[tokio::test]
async fn create_computes_tax_and_discount() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let request = CreateInvoiceRequest {
        client_id: None,
        issue_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        due_date: NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
        tax_rate: dec!(10),
        discount: dec!(20.00),
        notes: Some("spring project".to_string()),
        items: vec![
            LineItemInput {
                description: "Design".to_string(),
                quantity: 2,
                unit_price: dec!(50.00),
            },
            LineItemInput {
                description: "Hosting".to_string(),
                quantity: 1,
                unit_price: dec!(20.00),
            },
        ],
    };

    let invoice = app
        .state
        .invoices
        .create_invoice(user.id, request)
        .await
        .unwrap();

    assert_eq!(invoice.subtotal, dec!(120.00));
    assert_eq!(invoice.tax_amount, dec!(10.00));
    assert_eq!(invoice.total_amount, dec!(110.00));
    assert_eq!(invoice.invoice_number, "INV-202503-0001");
}

#[tokio::test]
async fn rejects_due_date_before_issue_date() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let mut request = invoice_request(None, dec!(10.00), 1);
    request.due_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();

    let err = app
        .state
        .invoices
        .create_invoice(user.id, request)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn foreign_invoice_reads_as_not_found_for_clients() {
    let app = TestApp::new().await;
    let owner = app.seed_user("owner@example.com").await;
    let intruder = app.seed_user("intruder@example.com").await;

    let invoice = app
        .state
        .invoices
        .create_invoice(owner.id, invoice_request(None, dec!(10.00), 1))
        .await
        .unwrap();

    let err = app
        .state
        .invoices
        .get_invoice(intruder.id, invoice.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));
    assert!(matches!(err.for_client(), ServiceError::NotFound(_)));

    let missing = app
        .state
        .invoices
        .get_invoice(owner.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(missing, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn send_requires_client_with_email() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let mute_client = app.seed_client(user.id, None).await;

    let no_client = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(10.00), 1))
        .await
        .unwrap();
    let err = app
        .state
        .invoices
        .send_invoice(user.id, no_client.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    let no_email = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(mute_client.id), dec!(10.00), 1))
        .await
        .unwrap();
    let err = app
        .state
        .invoices
        .send_invoice(user.id, no_email.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn send_flips_to_sent_and_emits_email_event() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;

    let invoice = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(200.00), 1))
        .await
        .unwrap();

    let sent = app
        .state
        .invoices
        .send_invoice(user.id, invoice.id)
        .await
        .unwrap();
    assert_eq!(sent.status, InvoiceStatus::Sent);
    assert!(sent.sent_at.is_some());

    app.deliver_outbox().await;
    let emails = app.queue.drain_topic("emails/email.invoice_sent");
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].priority, 8);
    assert_eq!(emails[0].payload["client_email"], "billing@acme.test");

    // Only draft invoices can be sent.
    let err = app
        .state
        .invoices
        .send_invoice(user.id, invoice.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn update_merges_fields_and_recomputes_totals() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let invoice = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(100.00), 1))
        .await
        .unwrap();

    let updated = app
        .state
        .invoices
        .update_invoice(
            user.id,
            invoice.id,
            UpdateInvoiceRequest {
                tax_rate: Some(dec!(10)),
                notes: Some("updated terms".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.tax_amount, dec!(10.00));
    assert_eq!(updated.total_amount, dec!(110.00));
    assert_eq!(updated.notes.as_deref(), Some("updated terms"));
    // Untouched fields survive the merge.
    assert_eq!(updated.due_date, invoice.due_date);

    let replaced = app
        .state
        .invoices
        .update_invoice(
            user.id,
            invoice.id,
            UpdateInvoiceRequest {
                items: Some(vec![LineItemInput {
                    description: "Rework".to_string(),
                    quantity: 3,
                    unit_price: dec!(10.00),
                }]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(replaced.subtotal, dec!(30.00));
    assert_eq!(replaced.total_amount, dec!(33.00));
    assert_eq!(replaced.items.len(), 1);
}

#[tokio::test]
async fn terminal_invoices_refuse_updates() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let invoice = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(10.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .mark_as_paid(user.id, invoice.id)
        .await
        .unwrap();

    let err = app
        .state
        .invoices
        .update_invoice(
            user.id,
            invoice.id,
            UpdateInvoiceRequest {
                notes: Some("too late".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    // Paid is absorbing: marking paid again or cancelling both conflict.
    assert!(matches!(
        app.state
            .invoices
            .mark_as_paid(user.id, invoice.id)
            .await
            .unwrap_err(),
        ServiceError::Conflict(_)
    ));
    assert!(matches!(
        app.state
            .invoices
            .cancel_invoice(user.id, invoice.id)
            .await
            .unwrap_err(),
        ServiceError::Conflict(_)
    ));
}

#[tokio::test]
async fn cancel_only_from_draft_or_sent() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;

    let invoice = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(10.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, invoice.id)
        .await
        .unwrap();

    let cancelled = app
        .state
        .invoices
        .cancel_invoice(user.id, invoice.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);

    let err = app
        .state
        .invoices
        .mark_as_paid(user.id, invoice.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn delete_refuses_paid_invoices() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let draft = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(10.00), 1))
        .await
        .unwrap();
    assert!(app
        .state
        .invoices
        .delete_invoice(user.id, draft.id)
        .await
        .unwrap());

    let paid = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(10.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .mark_as_paid(user.id, paid.id)
        .await
        .unwrap();
    let err = app
        .state
        .invoices
        .delete_invoice(user.id, paid.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    // Missing and foreign invoices both read as a silent no-op.
    assert!(!app
        .state
        .invoices
        .delete_invoice(user.id, Uuid::new_v4())
        .await
        .unwrap());
}

#[tokio::test]
async fn list_filters_by_status_and_search() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;

    let mut request = invoice_request(Some(client.id), dec!(10.00), 1);
    request.notes = Some("website redesign".to_string());
    let first = app
        .state
        .invoices
        .create_invoice(user.id, request)
        .await
        .unwrap();
    app.state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(20.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, first.id)
        .await
        .unwrap();

    let all = app
        .state
        .invoices
        .list_invoices(user.id, InvoiceFilter::default(), 1, 20)
        .await
        .unwrap();
    assert_eq!(all.total, 2);

    let sent_only = app
        .state
        .invoices
        .list_invoices(
            user.id,
            InvoiceFilter {
                status: Some(InvoiceStatus::Sent),
                ..Default::default()
            },
            1,
            20,
        )
        .await
        .unwrap();
    assert_eq!(sent_only.total, 1);
    assert_eq!(sent_only.invoices[0].id, first.id);

    let by_notes = app
        .state
        .invoices
        .list_invoices(
            user.id,
            InvoiceFilter {
                search: Some("redesign".to_string()),
                ..Default::default()
            },
            1,
            20,
        )
        .await
        .unwrap();
    assert_eq!(by_notes.total, 1);

    let by_client = app
        .state
        .invoices
        .list_invoices(
            user.id,
            InvoiceFilter {
                client_id: Some(client.id),
                ..Default::default()
            },
            1,
            20,
        )
        .await
        .unwrap();
    assert_eq!(by_client.total, 1);

    // Tenant isolation: another user sees nothing.
    let other = app.seed_user("other@example.com").await;
    let theirs = app
        .state
        .invoices
        .list_invoices(other.id, InvoiceFilter::default(), 1, 20)
        .await
        .unwrap();
    assert_eq!(theirs.total, 0);
}

#[tokio::test]
async fn list_page_size_is_defaulted_and_capped() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    for _ in 0..3 {
        app.state
            .invoices
            .create_invoice(user.id, invoice_request(None, dec!(10.00), 1))
            .await
            .unwrap();
    }

    let oversized = app
        .state
        .invoices
        .list_invoices(user.id, InvoiceFilter::default(), 1, 500)
        .await
        .unwrap();
    assert_eq!(oversized.per_page, 100);
    assert_eq!(oversized.total, 3);

    let defaulted = app
        .state
        .invoices
        .list_invoices(user.id, InvoiceFilter::default(), 1, 0)
        .await
        .unwrap();
    assert_eq!(defaulted.per_page, 20);
    assert_eq!(defaulted.invoices.len(), 3);
}

#[tokio::test]
async fn created_events_flow_through_outbox() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    app.state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(75.00), 1))
        .await
        .unwrap();

    let delivered = app.deliver_outbox().await;
    assert_eq!(delivered, 1);

    let created = app.queue.drain_topic("invoices/invoice.created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].payload["invoice_number"], "INV-202501-0001");
    assert_eq!(created[0].payload["total_amount"], "75.00");

    // Nothing pending on a second drain.
    assert_eq!(app.deliver_outbox().await, 0);
}

#[tokio::test]
async fn rejects_invoice_against_foreign_client() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let other = app.seed_user("other@example.com").await;
    let foreign_client = app.seed_client(other.id, Some("x@y.test")).await;

    let err = app
        .state
        .invoices
        .create_invoice(
            user.id,
            invoice_request(Some(foreign_client.id), dec!(10.00), 1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));

    let err = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(Uuid::new_v4()), dec!(10.00), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}
