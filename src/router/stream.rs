//! Gateway stream sessions
//!
//! One task per open gateway stream. Uplink and status sessions wait on the
//! gateway's rate limiter before handling each message, so a flooding gateway
//! is slowed down rather than dropped. The downlink session forwards the
//! gateway's schedule into a sink and unsubscribes when it ends.
//!
//! Every session ends when its cancellation token fires or its peer goes away.

use super::Router;
use crate::error::RouterError;
use crate::gateway::GatewayId;
use crate::message::{DownlinkMessage, GatewayStatus, UplinkMessage};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Downlink stream closed by peer")]
pub struct StreamClosed;

/// Where a gateway's downlinks are written
#[async_trait]
pub trait DownlinkSink: Send {
    async fn send(&mut self, downlink: DownlinkMessage) -> Result<(), StreamClosed>;
}

#[async_trait]
impl DownlinkSink for mpsc::Sender<DownlinkMessage> {
    async fn send(&mut self, downlink: DownlinkMessage) -> Result<(), StreamClosed> {
        mpsc::Sender::send(self, downlink).await.map_err(|_| StreamClosed)
    }
}

/// Sleep for `delay` unless cancelled first; false when cancelled
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Handle uplinks from gateway `id` until the stream ends
///
/// Returns the number of uplinks handled without error.
pub async fn run_uplink_stream(
    router: &Router,
    id: GatewayId,
    mut uplinks: mpsc::Receiver<UplinkMessage>,
    cancel: CancellationToken,
) -> usize {
    info!("Gateway {id}: uplink stream open");
    let mut handled = 0;
    loop {
        let uplink = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            uplink = uplinks.recv() => match uplink {
                Some(uplink) => uplink,
                None => break,
            },
        };
        if !backoff(router.uplink_limiter().wait(&id), &cancel).await {
            break;
        }
        match router.handle_uplink(&id, uplink).await {
            Ok(()) => handled += 1,
            Err(e) => warn!("Gateway {id}: uplink not handled: {e}"),
        }
    }
    info!("Gateway {id}: uplink stream closed after {handled} uplinks");
    handled
}

/// Handle status reports from gateway `id` until the stream ends
pub async fn run_status_stream(
    router: &Router,
    id: GatewayId,
    mut statuses: mpsc::Receiver<GatewayStatus>,
    cancel: CancellationToken,
) -> usize {
    let mut handled = 0;
    loop {
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            status = statuses.recv() => match status {
                Some(status) => status,
                None => break,
            },
        };
        if !backoff(router.status_limiter().wait(&id), &cancel).await {
            break;
        }
        match router.handle_gateway_status(&id, status) {
            Ok(()) => handled += 1,
            Err(e) => warn!("Gateway {id}: status not handled: {e}"),
        }
    }
    debug!("Gateway {id}: status stream closed");
    handled
}

/// Deliver gateway `id`'s downlinks into `sink` until cancelled or the sink closes
///
/// Fails when the gateway already has a downlink subscriber. Returns the
/// number of downlinks delivered.
pub async fn run_downlink_stream<S: DownlinkSink>(
    router: &Router,
    id: GatewayId,
    mut sink: S,
    cancel: CancellationToken,
) -> Result<usize, RouterError> {
    let mut downlinks = router.subscribe_gateway(&id)?;
    let mut delivered = 0;
    loop {
        let downlink = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            downlink = downlinks.recv() => match downlink {
                Some(downlink) => downlink,
                None => break,
            },
        };
        if let Err(e) = sink.send(downlink).await {
            debug!("Gateway {id}: {e}");
            break;
        }
        delivered += 1;
    }
    router.unsubscribe_gateway(&id);
    Ok(delivered)
}
