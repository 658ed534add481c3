//! Best-effort subscriber fan-out.
//!
//! The write path hands a committed batch to [`Notifier::enqueue`] and moves
//! on; a single worker task drains the bounded queue in order, loads the
//! subscriber list, and POSTs the batch to every URL concurrently. Delivery
//! is at-most-once: a full queue drops the notification, a failed POST is
//! logged and never retried, and nothing here can fail the write path.
//! Because one worker drains the queue, a given subscriber sees batches in
//! commit order; only the per-subscriber POSTs of a single batch fan out in
//! parallel.

use futures_util::stream::{self, StreamExt};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::{StreamBatch, TotallyOrderedStreamEvent};
use crate::subscriber;

const CONCURRENT_DELIVERY_LIMIT: usize = 10;

/// Clonable handle for the write path. Dropping every handle (or aborting
/// the worker) shuts fan-out down; pending notifications are discarded,
/// which the at-most-once contract allows.
#[derive(Clone)]
pub(crate) struct Notifier {
    sender: mpsc::Sender<StreamBatch>,
}

impl Notifier {
    pub(crate) fn spawn(
        pool: SqlitePool,
        client: reqwest::Client,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let worker = tokio::spawn(run(pool, client, receiver));
        (Self { sender }, worker)
    }

    /// Non-blocking hand-off from the write path, called strictly after the
    /// batch's transaction committed.
    pub(crate) fn enqueue(&self, total_order_id: i64, events: Vec<TotallyOrderedStreamEvent>) {
        if events.is_empty() {
            return;
        }

        let batch = StreamBatch {
            total_order_id,
            events,
        };
        match self.sender.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                warn!(
                    total_order_id = batch.total_order_id,
                    dropped_events = batch.events.len(),
                    "fan-out queue full, dropping notification"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("fan-out worker stopped, dropping notification");
            }
        }
    }

    /// Handle whose worker is already gone; enqueue becomes a quiet no-op.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (sender, _) = mpsc::channel(1);
        Self { sender }
    }
}

async fn run(pool: SqlitePool, client: reqwest::Client, mut receiver: mpsc::Receiver<StreamBatch>) {
    info!("fan-out worker started");

    while let Some(batch) = receiver.recv().await {
        deliver(&pool, &client, &batch).await;
    }

    info!("fan-out worker stopped");
}

#[tracing::instrument(
    skip_all,
    fields(total_order_id = batch.total_order_id, events = batch.events.len()),
    level = tracing::Level::DEBUG
)]
async fn deliver(pool: &SqlitePool, client: &reqwest::Client, batch: &StreamBatch) {
    let subscribers = match subscriber::list(pool).await {
        Ok(subscribers) => subscribers,
        Err(e) => {
            error!("failed to load subscriber list: {e}");
            return;
        }
    };

    if subscribers.is_empty() {
        return;
    }

    debug!("notifying {} subscribers", subscribers.len());

    stream::iter(subscribers)
        .map(|subscriber| async move {
            match client.post(&subscriber.url).json(batch).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(
                        url = %subscriber.url,
                        status = %response.status(),
                        "subscriber rejected notification"
                    );
                }
                Err(e) => {
                    warn!(url = %subscriber.url, "failed to notify subscriber: {e}");
                }
            }
        })
        .buffer_unordered(CONCURRENT_DELIVERY_LIMIT)
        .collect::<Vec<_>>()
        .await;
}
