//! Replicated event-projection node for a totally ordered stream.
//!
//! The node accepts intent events, runs them through a deterministic
//! projection inside one database transaction per batch, appends the
//! results to a gapless append-only log, and keeps itself converged with a
//! single upstream authority by pulling missing history whenever delivery
//! arrives out of order. Committed batches are pushed to registered
//! subscribers on a best-effort basis.

use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{error, info, info_span, warn};

mod api;
pub mod cursor;
pub mod env;
pub mod error;
pub mod event;
mod fanout;
mod game;
mod projection;
mod sequence;
mod stream_out;
mod subscriber;
pub mod sync;
pub mod upstream;
mod user;

#[cfg(test)]
pub mod test_utils;

use crate::env::Config;
use crate::fanout::Notifier;
use crate::sync::SyncController;
use crate::upstream::{HttpUpstream, UpstreamSource};

pub async fn launch(config: Config) -> anyhow::Result<()> {
    let launch_span = info_span!("launch");
    let _enter = launch_span.enter();

    let pool = config.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let http_client = config.http_client()?;

    let (notifier, fanout_task) =
        Notifier::spawn(pool.clone(), http_client.clone(), config.fanout_queue_capacity);

    let upstream = config
        .upstream_stream_out_url
        .clone()
        .map(|url| Arc::new(HttpUpstream::new(http_client.clone(), url)) as Arc<dyn UpstreamSource>);
    let controller = Arc::new(SyncController::new(pool.clone(), upstream, notifier.clone()));

    let server_task = spawn_server_task(&config, &pool, controller.clone());
    let poller_task = spawn_sync_poller(&config, controller.clone());

    announce_to_upstream(&config, &http_client).await;
    renotify_latest_batch(&pool, &notifier).await;

    await_shutdown(server_task, poller_task, &fanout_task).await;

    info!("Shutdown complete");
    Ok(())
}

fn spawn_server_task(
    config: &Config,
    pool: &SqlitePool,
    controller: Arc<SyncController>,
) -> JoinHandle<Result<rocket::Rocket<rocket::Ignite>, rocket::Error>> {
    let rocket_config = rocket::Config::figment()
        .merge(("port", config.server_port))
        .merge(("address", "0.0.0.0"));

    let rocket = rocket::custom(rocket_config)
        .mount("/", api::routes())
        .manage(pool.clone())
        .manage(controller);

    tokio::spawn(rocket.launch())
}

fn spawn_sync_poller(config: &Config, controller: Arc<SyncController>) -> Option<JoinHandle<()>> {
    if !controller.has_upstream() {
        info!("no upstream configured, running as push-only node");
        return None;
    }

    let poller_config = config.get_sync_poller_config();
    Some(tokio::spawn(sync::run_poller(controller, poller_config)))
}

/// Registers this node's stream-in callback with the upstream authority.
/// Best effort: the poller keeps the node converging even if registration
/// fails, it just won't receive pushes.
async fn announce_to_upstream(config: &Config, http_client: &reqwest::Client) {
    let (Some(register_url), Some(callback_url)) = (
        &config.upstream_register_url,
        &config.callback_stream_in_url,
    ) else {
        return;
    };

    if let Err(e) = upstream::register_with_upstream(http_client, register_url, callback_url).await
    {
        warn!("failed to register with upstream: {e}");
    }
}

/// Re-announces the most recently applied batch so subscribers that missed
/// the last pre-restart notification converge without waiting for new
/// traffic.
async fn renotify_latest_batch(pool: &SqlitePool, notifier: &Notifier) {
    match stream_out::most_recent_batch(pool).await {
        Ok(events) => {
            if let Some(latest) = events.last() {
                let total_order_id = latest.total_order_id;
                notifier.enqueue(total_order_id, events);
            }
        }
        Err(e) => warn!("failed to load most recent batch: {e}"),
    }
}

async fn await_shutdown(
    server_task: JoinHandle<Result<rocket::Rocket<rocket::Ignite>, rocket::Error>>,
    poller_task: Option<JoinHandle<()>>,
    fanout_task: &JoinHandle<()>,
) {
    let server_abort = server_task.abort_handle();
    let poller_abort = poller_task.as_ref().map(JoinHandle::abort_handle);
    let fanout_abort = fanout_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
            abort_task("server", &server_abort);
        }
        result = server_task => {
            log_server_result(result);
        }
    }

    if let Some(abort) = poller_abort {
        abort_task("sync poller", &abort);
    }
    abort_task("fan-out worker", &fanout_abort);
}

fn abort_task(name: &str, handle: &AbortHandle) {
    info!("Aborting {name} task");
    handle.abort();
}

fn log_server_result(result: Result<Result<rocket::Rocket<rocket::Ignite>, rocket::Error>, JoinError>) {
    match result {
        Ok(Ok(_)) => info!("Server completed successfully"),
        Ok(Err(e)) => error!("Server failed: {e}"),
        Err(e) => error!("Server task panicked: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::tests::create_test_config;
    use crate::event::StreamBatch;
    use crate::test_utils::login_intent;
    use backon::{ExponentialBuilder, Retryable};
    use serde_json::json;
    use serial_test::serial;
    use std::time::Duration;

    #[tokio::test]
    #[serial]
    async fn launch_serves_the_node_end_to_end() {
        let mut config = create_test_config();
        config.server_port = 8135;
        let base_url = format!("http://127.0.0.1:{}", config.server_port);

        tokio::spawn(async move { launch(config).await });

        let client = reqwest::Client::new();
        let health_url = format!("{base_url}/health");

        let retry_strategy = ExponentialBuilder::default()
            .with_max_delay(Duration::from_secs(1))
            .with_max_times(20);

        let health_check = || async { client.get(&health_url).send().await?.error_for_status() };
        health_check
            .retry(&retry_strategy)
            .await
            .expect("Server should become ready within timeout");

        let body = json!({
            "totalOrderId": 1,
            "events": [serde_json::to_value(login_intent(1, 1, "a@example.com")).unwrap()],
        });
        let response = client
            .post(format!("{base_url}/stream-in"))
            .json(&body)
            .send()
            .await
            .expect("stream-in should be accessible");
        assert_eq!(response.status(), 201);

        let listed: StreamBatch = client
            .get(format!("{base_url}/stream-out"))
            .send()
            .await
            .expect("stream-out should be accessible")
            .json()
            .await
            .expect("valid envelope");

        assert_eq!(listed.total_order_id, 1);
        assert_eq!(listed.events.len(), 2);
    }
}
