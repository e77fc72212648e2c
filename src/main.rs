use std::sync::Arc;

use clap::Parser;
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

use invoicing_api as api;

/// Invoicing backend worker runner.
#[derive(Debug, Parser)]
#[command(name = "invoicing-api", about = "Invoicing backend workers")]
struct Args {
    /// Run the hourly invoice scheduler (overdue sweep and reminders)
    #[arg(long)]
    invoice_scheduler: bool,

    /// Run the analytics cache refresh loop
    #[arg(long)]
    analytics_refresher: bool,

    /// Run the outbox delivery worker
    #[arg(long)]
    outbox_worker: bool,

    /// Run every worker (default when no flag is given)
    #[arg(long)]
    all: bool,
}

impl Args {
    fn run_all(&self) -> bool {
        self.all || (!self.invoice_scheduler && !self.analytics_refresher && !self.outbox_worker)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let redis_client = match cfg.redis_url.as_deref() {
        Some(url) => match redis::Client::open(url) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!("Invalid Redis URL, continuing without Redis: {}", e);
                None
            }
        },
        None => None,
    };
    let cache = api::cache::CacheFactory::create(&cfg.cache_type, redis_client);

    let message_queue: Arc<dyn api::message_queue::MessageQueue> =
        Arc::new(api::message_queue::InMemoryMessageQueue::new());

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx, message_queue.clone()));

    let state = api::AppState::new(
        db.clone(),
        cache,
        message_queue,
        event_sender.clone(),
        api::services::PageLimits::from(&cfg),
    );

    let mut handles = Vec::new();

    if args.run_all() || args.outbox_worker {
        handles.push(api::events::outbox::start_worker(db.clone(), event_sender));
    }

    let scheduler = api::schedulers::Scheduler::new(
        db.clone(),
        state.invoices.clone(),
        state.analytics.clone(),
    );
    if args.run_all() || args.invoice_scheduler {
        handles.push(scheduler.clone().start_invoice_loop());
    }
    if args.run_all() || args.analytics_refresher {
        handles.push(scheduler.start_analytics_loop());
    }

    if handles.is_empty() {
        error!("No workers selected");
        return Ok(());
    }

    info!(workers = handles.len(), "invoicing-api workers running");
    shutdown_signal().await;
    info!("Shutdown signal received; stopping workers");
    for handle in handles {
        handle.abort();
    }

    api::db::close_pool((*db).clone()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
