//! Signals shared between the supervisor and its slots

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Request to drop and re-establish a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSignal {
    /// Target slot; `None` lets the supervisor pick one at random
    pub conn_index: Option<u8>,
    /// How long the slot waits after disconnecting
    pub delay: Duration,
}

impl ReconnectSignal {
    pub fn slot(conn_index: u8, delay: Duration) -> Self {
        Self {
            conn_index: Some(conn_index),
            delay,
        }
    }

    pub fn any(delay: Duration) -> Self {
        Self {
            conn_index: None,
            delay,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectQueueError {
    #[error("Reconnect queue is full")]
    Full,

    #[error("Supervisor is not running")]
    Closed,
}

/// Producer side of the bounded reconnect queue; never blocks
#[derive(Debug, Clone)]
pub struct ReconnectSender {
    tx: mpsc::Sender<ReconnectSignal>,
}

impl ReconnectSender {
    pub fn send(&self, signal: ReconnectSignal) -> Result<(), ReconnectQueueError> {
        self.tx.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ReconnectQueueError::Full,
            mpsc::error::TrySendError::Closed(_) => ReconnectQueueError::Closed,
        })
    }
}

/// Create the bounded reconnect queue
pub fn reconnect_queue(capacity: usize) -> (ReconnectSender, mpsc::Receiver<ReconnectSignal>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ReconnectSender { tx }, rx)
}

/// Fires once, the first time any slot reaches Serving
#[derive(Debug, Clone)]
pub struct ConnectedSignal {
    tx: watch::Sender<bool>,
}

impl ConnectedSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Mark connected; returns true only for the call that fired the signal
    pub fn notify(&self) -> bool {
        self.tx.send_if_modified(|connected| {
            if *connected {
                false
            } else {
                *connected = true;
                true
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe for the connected event
    pub fn subscribe(&self) -> ConnectedWaiter {
        ConnectedWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ConnectedSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for the connected event
#[derive(Debug, Clone)]
pub struct ConnectedWaiter {
    rx: watch::Receiver<bool>,
}

impl ConnectedWaiter {
    /// Resolves once connected; returns false if the signal was dropped first
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|connected| *connected).await.is_ok()
    }
}
