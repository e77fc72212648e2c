mod common;

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};

use common::{invoice_request, TestApp};
use invoicing_api::entities::invoice;
use invoicing_api::entities::{InvoiceStatus, PaymentMethod};
use invoicing_api::schedulers::Scheduler;
use invoicing_api::services::payments::RecordPaymentRequest;

fn scheduler(app: &TestApp) -> Scheduler {
    Scheduler::new(
        app.state.db.clone(),
        app.state.invoices.clone(),
        app.state.analytics.clone(),
    )
}

async fn set_due_date(app: &TestApp, invoice_id: uuid::Uuid, due: NaiveDate) {
    let model = invoice::Entity::find_by_id(invoice_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    let mut active: invoice::ActiveModel = model.into();
    active.due_date = Set(due);
    active.update(&*app.state.db).await.unwrap();
}

#[tokio::test]
async fn sweep_marks_past_due_sent_invoices_overdue() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;
    let today = Utc::now().date_naive();

    let invoice_resp = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(100.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, invoice_resp.id)
        .await
        .unwrap();
    set_due_date(&app, invoice_resp.id, today - Duration::days(2)).await;

    // A draft invoice past due must be left alone.
    let draft = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(10.00), 1))
        .await
        .unwrap();
    set_due_date(&app, draft.id, today - Duration::days(10)).await;

    let flipped = app.state.invoices.sweep_overdue(today).await.unwrap();
    assert_eq!(flipped, 1);

    let reloaded = app
        .state
        .invoices
        .get_invoice(user.id, invoice_resp.id)
        .await
        .unwrap();
    assert_eq!(reloaded.status, InvoiceStatus::Overdue);
    let draft_reloaded = app
        .state
        .invoices
        .get_invoice(user.id, draft.id)
        .await
        .unwrap();
    assert_eq!(draft_reloaded.status, InvoiceStatus::Draft);

    app.deliver_outbox().await;
    let reminders = app.queue.drain_topic("emails/email.payment_reminder");
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].priority, 9);
    assert_eq!(reminders[0].payload["days_overdue"], 2);
    assert_eq!(reminders[0].payload["client_email"], "billing@acme.test");

    // Already overdue: a second sweep flips nothing.
    assert_eq!(app.state.invoices.sweep_overdue(today).await.unwrap(), 0);
}

#[tokio::test]
async fn sweep_never_reverses_a_settled_invoice() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;
    let today = Utc::now().date_naive();

    let invoice_resp = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(75.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, invoice_resp.id)
        .await
        .unwrap();
    set_due_date(&app, invoice_resp.id, today - Duration::days(2)).await;

    // Race the sweep against a settling payment. Whichever interleaving
    // wins, a fully paid invoice must come out paid.
    let sweeper = {
        let invoices = app.state.invoices.clone();
        tokio::spawn(async move {
            // Write collisions with the payer resolve on retry, same as the
            // payer task below; SQLite reports them as retryable busy errors.
            let mut result = invoices.sweep_overdue(today).await;
            for _ in 0..20 {
                match &result {
                    Err(err) if err.is_retryable() => {
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        result = invoices.sweep_overdue(today).await;
                    }
                    _ => break,
                }
            }
            result
        })
    };
    let payer = {
        let payments = app.state.payments.clone();
        let user_id = user.id;
        let invoice_id = invoice_resp.id;
        tokio::spawn(async move {
            for _ in 0..20 {
                let request = RecordPaymentRequest {
                    amount: dec!(75.00),
                    method: PaymentMethod::BankTransfer,
                    transaction_id: None,
                    notes: None,
                    payment_date: None,
                };
                // Write collisions with the sweep resolve on retry.
                if payments
                    .record_payment(user_id, invoice_id, request)
                    .await
                    .is_ok()
                {
                    return true;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            false
        })
    };

    sweeper.await.unwrap().unwrap();
    assert!(payer.await.unwrap(), "payment never landed");

    let reloaded = app
        .state
        .invoices
        .get_invoice(user.id, invoice_resp.id)
        .await
        .unwrap();
    assert_eq!(reloaded.status, InvoiceStatus::Paid);
    assert!(reloaded.paid_at.is_some());

    // A later sweep still sees the old due date and must leave it alone.
    assert_eq!(app.state.invoices.sweep_overdue(today).await.unwrap(), 0);
    let settled = app
        .state
        .invoices
        .get_invoice(user.id, invoice_resp.id)
        .await
        .unwrap();
    assert_eq!(settled.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn due_soon_reminders_fire_three_days_out() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;
    let today = Utc::now().date_naive();

    let soon = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(50.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, soon.id)
        .await
        .unwrap();
    set_due_date(&app, soon.id, today + Duration::days(3)).await;

    let later = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(50.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, later.id)
        .await
        .unwrap();
    set_due_date(&app, later.id, today + Duration::days(10)).await;

    let sched = scheduler(&app);
    let sent = sched.send_due_soon_reminders(today).await.unwrap();
    assert_eq!(sent, 1);

    app.queue.drain_topic("emails/email.invoice_sent");
    app.deliver_outbox().await;
    let reminders = app.queue.drain_topic("emails/email.payment_reminder");
    assert_eq!(reminders.len(), 1);
    // Due-soon reminders carry the negative sentinel and lower urgency.
    assert_eq!(reminders[0].payload["days_overdue"], -3);
    assert_eq!(reminders[0].priority, 7);
}

#[tokio::test]
async fn weekly_reminders_only_on_seventh_day_multiples() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;
    let today = Utc::now().date_naive();

    let seven = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(75.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, seven.id)
        .await
        .unwrap();
    set_due_date(&app, seven.id, today - Duration::days(7)).await;

    let five = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(75.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, five.id)
        .await
        .unwrap();
    set_due_date(&app, five.id, today - Duration::days(5)).await;

    // Move both to overdue first, then check the recurring pass.
    app.state.invoices.sweep_overdue(today).await.unwrap();

    let sched = scheduler(&app);
    let sent = sched.send_recurring_overdue_reminders(today).await.unwrap();
    assert_eq!(sent, 1);
}

#[tokio::test]
async fn invoice_tick_runs_all_three_passes() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;
    let client = app.seed_client(user.id, Some("billing@acme.test")).await;
    let today = Utc::now().date_naive();

    let overdue = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(Some(client.id), dec!(100.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .send_invoice(user.id, overdue.id)
        .await
        .unwrap();
    set_due_date(&app, overdue.id, today - Duration::days(1)).await;

    scheduler(&app).run_invoice_tick(today).await.unwrap();

    let reloaded = app
        .state
        .invoices
        .get_invoice(user.id, overdue.id)
        .await
        .unwrap();
    assert_eq!(reloaded.status, InvoiceStatus::Overdue);

    app.queue.drain_topic("emails/email.invoice_sent");
    app.deliver_outbox().await;
    let reminders = app.queue.drain_topic("emails/email.payment_reminder");
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].payload["days_overdue"], 1);
}

#[tokio::test]
async fn analytics_tick_warms_caches_for_active_users() {
    let app = TestApp::new().await;
    let user = app.seed_user("owner@example.com").await;

    let invoice = app
        .state
        .invoices
        .create_invoice(user.id, invoice_request(None, dec!(100.00), 1))
        .await
        .unwrap();
    app.state
        .invoices
        .mark_as_paid(user.id, invoice.id)
        .await
        .unwrap();

    scheduler(&app).run_analytics_tick().await.unwrap();

    let report = app.state.analytics.get_analytics(user.id).await.unwrap();
    assert_eq!(report.status_counts.paid, 1);
    assert_eq!(report.total_revenue, dec!(100.00));
}
