//! Upstream synchronization control.
//!
//! [`SyncController`] enforces that batches apply in strictly increasing
//! `total_order_id` order. Out-of-sequence delivery is an ordinary outcome,
//! not an exception: [`apply_batch`](SyncController::apply_batch) returns a
//! [`BatchOutcome`] the caller matches on, and
//! [`on_event`](SyncController::on_event) responds to a gap by pulling the
//! missing range from the authority and replaying it before retrying the
//! inbound batch. Replaying is idempotent because anything at or below the
//! cursor is skipped without touching the projection.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::SqlitePool;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::cursor::{self, UpstreamCursor};
use crate::error::SyncError;
use crate::event::TotallyOrderedStreamEvent;
use crate::fanout::Notifier;
use crate::projection::project_event;
use crate::upstream::UpstreamSource;

/// How often an inbound batch is retried after catch-up before the caller
/// gets a `Diverged` error. Each retry is preceded by a full catch-up pass,
/// so more than a couple of attempts means the authority itself is moving
/// backwards or misbehaving.
const MAX_APPLY_ATTEMPTS: u32 = 3;

/// Upper bound on fetch rounds inside one catch-up pass, so a badly behaved
/// upstream cannot pin the caller in-line forever.
const MAX_CATCH_UP_ROUNDS: u32 = 16;

/// Result of offering a batch to the local log.
#[derive(Debug)]
pub enum BatchOutcome {
    /// The batch was the immediate successor of the cursor and committed;
    /// carries the produced output events.
    Applied(Vec<TotallyOrderedStreamEvent>),
    /// The batch's position is at or below the cursor. Nothing was re-run.
    AlreadyApplied,
    /// The batch skips ahead of the cursor; the gap must be fetched from
    /// upstream before it can apply.
    OutOfSequence { expected: i64, received: i64 },
}

pub struct SyncController {
    pool: SqlitePool,
    upstream: Option<Arc<dyn UpstreamSource>>,
    notifier: Notifier,
    /// Coalesces concurrent catch-up passes. Idempotency makes concurrent
    /// resyncs safe; this just keeps them from issuing redundant fetches.
    catch_up_gate: tokio::sync::Mutex<()>,
}

impl SyncController {
    pub(crate) fn new(
        pool: SqlitePool,
        upstream: Option<Arc<dyn UpstreamSource>>,
        notifier: Notifier,
    ) -> Self {
        Self {
            pool,
            upstream,
            notifier,
            catch_up_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    /// Applies one inbound batch, self-healing gaps by pulling missing
    /// history from the authority. Returns the output events produced for
    /// this batch (empty when the batch was already applied).
    #[tracing::instrument(skip_all, fields(total_order_id, events = events.len()), level = tracing::Level::INFO)]
    pub async fn on_event(
        &self,
        events: Vec<TotallyOrderedStreamEvent>,
        total_order_id: i64,
    ) -> Result<Vec<TotallyOrderedStreamEvent>, SyncError> {
        for attempt in 1..=MAX_APPLY_ATTEMPTS {
            match self.apply_batch(&events, total_order_id).await? {
                BatchOutcome::Applied(outputs) => {
                    self.notifier.enqueue(total_order_id, outputs.clone());
                    return Ok(outputs);
                }
                BatchOutcome::AlreadyApplied => {
                    debug!(total_order_id, "batch already applied, skipping");
                    return Ok(Vec::new());
                }
                BatchOutcome::OutOfSequence { expected, received } => {
                    warn!(
                        expected,
                        received, attempt, "batch out of sequence, catching up from upstream"
                    );
                    self.catch_up().await?;
                }
            }
        }

        let cursor = cursor::get(&self.pool).await?;
        Err(SyncError::Diverged {
            attempts: MAX_APPLY_ATTEMPTS,
            received: total_order_id,
            cursor,
        })
    }

    /// Offers a batch to the log inside one transaction. Only the immediate
    /// successor of the cursor applies; everything at or below the cursor is
    /// reported as [`BatchOutcome::AlreadyApplied`] without re-running the
    /// projection.
    pub(crate) async fn apply_batch(
        &self,
        events: &[TotallyOrderedStreamEvent],
        total_order_id: i64,
    ) -> Result<BatchOutcome, SyncError> {
        let mut sql_tx = self.pool.begin().await?;
        let current = cursor::ensure(&mut sql_tx).await?;

        if total_order_id <= current.total_order_id {
            return Ok(BatchOutcome::AlreadyApplied);
        }
        if total_order_id != current.total_order_id + 1 {
            return Ok(BatchOutcome::OutOfSequence {
                expected: current.total_order_id + 1,
                received: total_order_id,
            });
        }

        let mut outputs = Vec::new();
        let mut last_stream_id = current.stream_id;
        for event in events {
            // Inbound ids at or below the cursor were applied by an earlier,
            // partially overlapping delivery of the same batch.
            if event.stream_id <= current.stream_id {
                continue;
            }
            outputs.extend(project_event(&mut sql_tx, event).await?);
            last_stream_id = event.stream_id;
        }

        cursor::advance(
            &mut sql_tx,
            UpstreamCursor {
                stream_id: last_stream_id,
                total_order_id,
            },
        )
        .await?;
        sql_tx.commit().await?;

        info!(
            total_order_id,
            outputs = outputs.len(),
            "applied batch and advanced cursor"
        );
        Ok(BatchOutcome::Applied(outputs))
    }

    /// Pulls everything after the cursor from the authority and replays it,
    /// batch by batch. Converges when a fetch comes back empty or the
    /// cursor reaches the authority's reported head.
    #[tracing::instrument(skip_all, level = tracing::Level::INFO)]
    pub(crate) async fn catch_up(&self) -> Result<(), SyncError> {
        let Some(upstream) = &self.upstream else {
            return Err(crate::error::UpstreamError::NotConfigured.into());
        };

        let _gate = self.catch_up_gate.lock().await;

        for _round in 0..MAX_CATCH_UP_ROUNDS {
            let cursor = cursor::get(&self.pool).await?;
            let batch = upstream.fetch_after(cursor).await?;

            if batch.events.is_empty() {
                debug!(
                    total_order_id = cursor.total_order_id,
                    "caught up, upstream has nothing newer"
                );
                return Ok(());
            }

            for (total_order_id, group) in group_by_total_order(batch.events) {
                match self.apply_batch(&group, total_order_id).await? {
                    BatchOutcome::Applied(outputs) => {
                        self.notifier.enqueue(total_order_id, outputs);
                    }
                    BatchOutcome::AlreadyApplied => {}
                    BatchOutcome::OutOfSequence { expected, received } => {
                        // The fetched range itself starts past the cursor;
                        // refetch from the current position.
                        warn!(expected, received, "fetched range is stale, refetching");
                        break;
                    }
                }
            }

            let after = cursor::get(&self.pool).await?;
            if after.total_order_id >= batch.total_order_id {
                return Ok(());
            }
        }

        warn!("catch-up did not converge, deferring to the next pass");
        Ok(())
    }
}

/// Splits a fetched position-ordered range into per-`total_order_id`
/// batches, preserving order.
fn group_by_total_order(
    events: Vec<TotallyOrderedStreamEvent>,
) -> Vec<(i64, Vec<TotallyOrderedStreamEvent>)> {
    let mut groups: Vec<(i64, Vec<TotallyOrderedStreamEvent>)> = Vec::new();
    for event in events {
        match groups.last_mut() {
            Some((total_order_id, group)) if *total_order_id == event.total_order_id => {
                group.push(event);
            }
            _ => groups.push((event.total_order_id, vec![event])),
        }
    }
    groups
}

#[derive(Debug, Clone)]
pub struct SyncPollerConfig {
    pub polling_interval: Duration,
    pub max_jitter: Duration,
}

impl Default for SyncPollerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(5),
            max_jitter: Duration::from_secs(2),
        }
    }
}

/// Background task that periodically runs the fetch-and-apply path so the
/// node converges even without inbound push traffic.
pub(crate) async fn run_poller(controller: Arc<SyncController>, config: SyncPollerConfig) {
    info!(
        "starting upstream sync poller with interval: {:?}",
        config.polling_interval
    );

    let mut ticker = interval(config.polling_interval);
    loop {
        ticker.tick().await;
        jittered_delay(config.max_jitter).await;

        if let Err(e) = controller.catch_up().await {
            // The next tick retries; an unreachable upstream is routine.
            error!("sync poll failed: {e}");
        }
    }
}

async fn jittered_delay(max_jitter: Duration) {
    let max_ms = max_jitter.as_millis() as u64;
    if max_ms == 0 {
        return;
    }
    let jitter = rand::rng().random_range(0..max_ms);
    tokio::time::sleep(Duration::from_millis(jitter)).await;
}
