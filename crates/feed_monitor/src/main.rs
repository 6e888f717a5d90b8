//! Console monitor for the realtime scan-analytics feed.
//!
//! Connects to the feed, subscribes to a set of code ids, and logs every
//! update. Mostly useful for watching a deployment or driving the client
//! against a live environment.

use anyhow::Result;
use feed_client::{FeedClient, FeedConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".into())
        .parse()
        .unwrap_or(9090);
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;
    info!(
        "Prometheus metrics available at http://0.0.0.0:{}/metrics",
        metrics_port
    );

    let targets: Vec<String> = std::env::var("FEED_TARGETS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if targets.is_empty() {
        warn!("FEED_TARGETS is empty, nothing to subscribe to");
    }

    let client = FeedClient::new(FeedConfig::from_env());

    client.on_state_change(|state| info!(%state, "feed state changed"));
    client.on_error(|message| warn!(error = message, "feed error"));
    client.on_metrics_update(|update| {
        info!(target_id = %update.target_id, metrics = %update.metrics, "metrics update");
        Ok(())
    });
    client.on_snapshot_update(|update| {
        info!(target_id = %update.target_id, snapshot = %update.snapshot, "snapshot update");
        Ok(())
    });

    if !targets.is_empty() {
        info!(count = targets.len(), "subscribing to targets");
        client.subscribe(targets, None).await?;
    } else {
        client.connect().await?;
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    client.disconnect().await;

    Ok(())
}
