//! Client side of the upstream synchronization protocol.
//!
//! The upstream authority is just another node exposing the same
//! `/stream-out` endpoint; [`HttpUpstream`] pulls everything strictly after
//! a given cursor position. The trait seam exists so the sync controller
//! can be driven by a scripted source in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::cursor::UpstreamCursor;
use crate::error::UpstreamError;
use crate::event::StreamBatch;

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// All events strictly after `cursor`, in position order. The returned
    /// envelope's `total_order_id` is the serving node's applied head, which
    /// tells the caller how far behind it still is even when `events` was
    /// truncated by a limit.
    async fn fetch_after(&self, cursor: UpstreamCursor) -> Result<StreamBatch, UpstreamError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    stream_out_url: Url,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client, stream_out_url: Url) -> Self {
        Self {
            client,
            stream_out_url,
        }
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn fetch_after(&self, cursor: UpstreamCursor) -> Result<StreamBatch, UpstreamError> {
        let response = self
            .client
            .get(self.stream_out_url.clone())
            .query(&[
                ("after_total_order_id", cursor.total_order_id),
                ("after_stream_id", cursor.stream_id),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }

        Ok(response.json().await?)
    }
}

/// Request body shared by subscriber registration in both directions: this
/// node registering itself upstream, and downstream nodes registering with
/// this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberRequest {
    pub url: String,
}

/// Registers this node's stream-in callback with its upstream authority.
/// Registration is idempotent on the serving side, so retrying on every
/// boot is safe.
pub(crate) async fn register_with_upstream(
    client: &reqwest::Client,
    register_url: &Url,
    callback_url: &Url,
) -> Result<(), UpstreamError> {
    let response = client
        .post(register_url.clone())
        .json(&SubscriberRequest {
            url: callback_url.to_string(),
        })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::Status(status));
    }

    info!(%callback_url, "registered with upstream authority");
    Ok(())
}
