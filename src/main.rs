//! Marketplace Core - maintenance sweeper
//!
//! Purges expired carts and reports orders left needing reconciliation.

use anyhow::Result;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketplace_core::store::{OrderStore, PgStore};
use marketplace_core::{CartEngine, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(&settings.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let carts = CartEngine::new(store.clone(), store.clone(), settings.pricing.clone());

    tracing::info!(interval_secs = settings.sweep_interval.as_secs(), "marketplace sweeper started");
    let mut ticker = tokio::time::interval(settings.sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(&carts, store.as_ref()).await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("shutting down");
    pool.close().await;
    Ok(())
}

async fn sweep(carts: &CartEngine, orders: &dyn OrderStore) {
    if let Err(error) = carts.purge_expired(Utc::now()).await {
        tracing::error!(%error, "cart purge failed");
    }
    match orders.orders_needing_reconciliation().await {
        Ok(flagged) => {
            for order in &flagged {
                let reason = order.reconciliation().map_or("", |issue| issue.reason.as_str());
                tracing::warn!(order_number = %order.order_number(), status = %order.status(), reason, "order needs reconciliation");
            }
        }
        Err(error) => tracing::error!(%error, "reconciliation scan failed"),
    }
}
