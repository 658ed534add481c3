use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Route, State, get, post, routes};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, warn};

use crate::cursor;
use crate::error::SyncError;
use crate::event::{StreamBatch, TotallyOrderedStreamEvent};
use crate::stream_out;
use crate::subscriber;
use crate::sync::SyncController;
use crate::upstream::SubscriberRequest;

#[derive(Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
}

#[get("/health")]
fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

#[post("/stream-in", format = "json", data = "<batch>")]
async fn stream_in(
    batch: Json<StreamBatch>,
    controller: &State<Arc<SyncController>>,
) -> Result<(Status, Json<Vec<TotallyOrderedStreamEvent>>), Status> {
    let batch = batch.into_inner();
    match controller.on_event(batch.events, batch.total_order_id).await {
        Ok(outputs) => Ok((Status::Created, Json(outputs))),
        Err(SyncError::Diverged { .. }) => Err(Status::Conflict),
        Err(e) => {
            error!("failed to apply inbound batch: {e}");
            Err(Status::InternalServerError)
        }
    }
}

/// Serves the output log. With `after_total_order_id` set this is the
/// replica-fetch form: events strictly after that position, wrapped in the
/// envelope a downstream node feeds back into its own sync controller.
/// Without it, a plain bounded listing in `stream_id` order. Either way the
/// node first catches up from its own upstream so callers never read a
/// knowingly stale log.
#[get("/stream-out?<after_id>&<end_id>&<limit>&<offset>&<after_total_order_id>&<after_stream_id>")]
#[allow(clippy::too_many_arguments)]
async fn stream_out_route(
    after_id: Option<i64>,
    end_id: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
    after_total_order_id: Option<i64>,
    after_stream_id: Option<i64>,
    pool: &State<SqlitePool>,
    controller: &State<Arc<SyncController>>,
) -> Result<Json<StreamBatch>, Status> {
    if controller.has_upstream()
        && let Err(e) = controller.catch_up().await
    {
        // Serve what we have; the poller will close the gap.
        warn!("catch-up before read failed: {e}");
    }

    let events = match after_total_order_id {
        Some(total_order_id) => {
            stream_out::find_after_position(
                pool,
                total_order_id,
                after_stream_id.unwrap_or(0),
                limit,
            )
            .await
        }
        None => stream_out::find_range(pool, after_id.unwrap_or(0), end_id, limit, offset).await,
    }
    .map_err(|e| {
        error!("failed to read output log: {e}");
        Status::InternalServerError
    })?;

    let cursor = cursor::get(pool).await.map_err(|e| {
        error!("failed to read cursor: {e}");
        Status::InternalServerError
    })?;

    Ok(Json(StreamBatch {
        total_order_id: cursor.total_order_id,
        events,
    }))
}

#[post("/subscribers/register", format = "json", data = "<request>")]
async fn register_subscriber(
    request: Json<SubscriberRequest>,
    pool: &State<SqlitePool>,
) -> Result<Status, Status> {
    let created = subscriber::register(pool, &request.url)
        .await
        .map_err(|e| {
            error!("failed to register subscriber: {e}");
            Status::InternalServerError
        })?;

    Ok(if created { Status::Created } else { Status::Ok })
}

#[post("/subscribers/unregister", format = "json", data = "<request>")]
async fn unregister_subscriber(
    request: Json<SubscriberRequest>,
    pool: &State<SqlitePool>,
) -> Result<Status, Status> {
    let removed = subscriber::unregister(pool, &request.url)
        .await
        .map_err(|e| {
            error!("failed to unregister subscriber: {e}");
            Status::InternalServerError
        })?;

    if removed { Ok(Status::Ok) } else { Err(Status::NotFound) }
}

pub(crate) fn routes() -> Vec<Route> {
    routes![
        health,
        stream_in,
        stream_out_route,
        register_subscriber,
        unregister_subscriber,
    ]
}
