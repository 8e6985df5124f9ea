//! # Monitor Push
//!
//! Fire-and-forget copies of gateway traffic for an observability sink. The
//! router never waits on the monitor: messages go into a bounded queue and are
//! dropped when it is full, with warnings throttled per gateway.
//!
//! [`MonitorClient`] moves through `Unopened -> Opening -> Open -> Closed`
//! under one lock. A failed open returns to `Unopened` so it can be retried;
//! `Closed` is terminal.

use crate::config::MonitorConfig;
use crate::gateway::GatewayId;
use crate::message::{DeviceActivationRequest, DownlinkMessage, GatewayStatus, UplinkMessage};
use crate::util::ThrottleManager;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Monitor buffer full")]
    BufferFull,

    #[error("Monitor stream not open")]
    NotOpen,

    #[error("Monitor client closed")]
    Closed,

    #[error("Monitor sink error: {0}")]
    Sink(String),
}

/// One message kind per monitor stream
#[derive(Debug, Clone)]
pub enum MonitorMessage {
    Uplink {
        gateway_id: GatewayId,
        message: UplinkMessage,
    },
    Downlink {
        gateway_id: GatewayId,
        message: DownlinkMessage,
    },
    Status {
        gateway_id: GatewayId,
        status: GatewayStatus,
    },
    Activation {
        gateway_id: GatewayId,
        request: DeviceActivationRequest,
    },
}

impl MonitorMessage {
    pub fn gateway_id(&self) -> &GatewayId {
        match self {
            MonitorMessage::Uplink { gateway_id, .. }
            | MonitorMessage::Downlink { gateway_id, .. }
            | MonitorMessage::Status { gateway_id, .. }
            | MonitorMessage::Activation { gateway_id, .. } => gateway_id,
        }
    }
}

/// Destination of monitor traffic
#[async_trait]
pub trait MonitorSink: Send + Sync {
    /// Establish the connection; called once per successful open
    async fn connect(&self) -> Result<(), MonitorError> {
        Ok(())
    }

    async fn uplink(&self, gateway_id: &GatewayId, message: &UplinkMessage) -> Result<(), MonitorError>;

    async fn downlink(&self, gateway_id: &GatewayId, message: &DownlinkMessage) -> Result<(), MonitorError>;

    async fn status(&self, gateway_id: &GatewayId, status: &GatewayStatus) -> Result<(), MonitorError>;

    async fn activation(&self, gateway_id: &GatewayId, request: &DeviceActivationRequest) -> Result<(), MonitorError>;
}

/// Route a message to the sink method for its kind
pub async fn dispatch(sink: &dyn MonitorSink, message: &MonitorMessage) -> Result<(), MonitorError> {
    match message {
        MonitorMessage::Uplink { gateway_id, message } => sink.uplink(gateway_id, message).await,
        MonitorMessage::Downlink { gateway_id, message } => sink.downlink(gateway_id, message).await,
        MonitorMessage::Status { gateway_id, status } => sink.status(gateway_id, status).await,
        MonitorMessage::Activation { gateway_id, request } => sink.activation(gateway_id, request).await,
    }
}

enum State {
    Unopened,
    Opening,
    Open {
        tx: mpsc::Sender<MonitorMessage>,
        cancel: CancellationToken,
    },
    Closed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Unopened => "unopened",
            State::Opening => "opening",
            State::Open { .. } => "open",
            State::Closed => "closed",
        }
    }
}

pub struct MonitorClient {
    sink: Arc<dyn MonitorSink>,
    config: MonitorConfig,
    state: Mutex<State>,
    throttles: ThrottleManager,
}

impl MonitorClient {
    pub fn new(sink: Arc<dyn MonitorSink>, config: MonitorConfig) -> Self {
        Self {
            sink,
            throttles: ThrottleManager::new(config.warn_window_ms, config.warn_cap),
            config,
            state: Mutex::new(State::Unopened),
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.lock_state().name()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect and start forwarding; a no-op when already open or opening
    pub async fn open(&self) -> Result<(), MonitorError> {
        {
            let mut state = self.lock_state();
            match *state {
                State::Open { .. } | State::Opening => return Ok(()),
                State::Closed => return Err(MonitorError::Closed),
                State::Unopened => *state = State::Opening,
            }
        }

        if let Err(e) = self.sink.connect().await {
            let mut state = self.lock_state();
            if matches!(*state, State::Opening) {
                *state = State::Unopened;
            }
            warn!("Monitor connect failed: {e}");
            return Err(e);
        }

        let mut state = self.lock_state();
        if !matches!(*state, State::Opening) {
            // Closed while connecting
            return Err(MonitorError::Closed);
        }
        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let cancel = CancellationToken::new();
        tokio::spawn(forward(Arc::clone(&self.sink), rx, cancel.clone()));
        *state = State::Open { tx, cancel };
        info!("Monitor stream open");
        Ok(())
    }

    /// Queue `message` without waiting; dropped when the queue is full or closed
    pub fn send(&self, message: MonitorMessage) -> Result<(), MonitorError> {
        let state = self.lock_state();
        let State::Open { tx, .. } = &*state else {
            debug!("Monitor {}: dropping message for {}", state.name(), message.gateway_id());
            return Err(MonitorError::NotOpen);
        };
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                let gateway_id = message.gateway_id();
                if self.throttles.allow(gateway_id.as_str()) {
                    warn!("Monitor buffer full, dropping message for {gateway_id}");
                }
                Err(MonitorError::BufferFull)
            }
            Err(TrySendError::Closed(_)) => Err(MonitorError::Closed),
        }
    }

    /// Stop forwarding; idempotent
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), State::Closed);
        if let State::Open { cancel, .. } = previous {
            cancel.cancel();
            info!("Monitor stream closed");
        }
    }
}

impl Drop for MonitorClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn forward(sink: Arc<dyn MonitorSink>, mut rx: mpsc::Receiver<MonitorMessage>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = dispatch(sink.as_ref(), &message).await {
            debug!("Monitor push for {} failed: {e}", message.gateway_id());
        }
    }
}
