//! Outstanding RPC calls
//!
//! Routes result frames read off the control stream back to the task that
//! issued the call.

use dashmap::DashMap;
use edgetunnel_proto::RpcBody;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Calls awaiting a result, keyed by request ID
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<DashMap<u64, oneshot::Sender<RpcBody>>>,
    closed: Arc<AtomicBool>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call; `None` once the session has closed
    pub fn register(&self, id: u64) -> Option<oneshot::Receiver<RpcBody>> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        // Checked after the insert so close_all cannot miss this entry
        if self.closed.load(Ordering::Acquire) {
            self.calls.remove(&id);
            return None;
        }
        Some(rx)
    }

    /// Deliver a result; returns false if no call was waiting for it
    pub fn respond(&self, id: u64, body: RpcBody) -> bool {
        let Some((_, tx)) = self.calls.remove(&id) else {
            warn!("No pending call for response {} ({})", id, body.method());
            return false;
        };
        if tx.send(body).is_err() {
            debug!("Caller for response {} went away", id);
            return false;
        }
        true
    }

    /// Forget a call (timed out or abandoned)
    pub fn cancel(&self, id: u64) {
        if self.calls.remove(&id).is_some() {
            debug!("Cancelled pending call {}", id);
        }
    }

    /// Fail every outstanding call and refuse new ones
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<u64> = self.calls.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            // Dropping the sender wakes the caller with a closed channel
            self.calls.remove(&id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> RpcBody {
        RpcBody::UnregisterConnectionResult
    }

    #[tokio::test]
    async fn test_register_and_respond() {
        let pending = PendingCalls::new();
        let rx = pending.register(1).unwrap();
        assert_eq!(pending.count(), 1);

        assert!(pending.respond(1, result()));
        assert_eq!(pending.count(), 0);
        assert_eq!(rx.await.unwrap(), result());
    }

    #[tokio::test]
    async fn test_respond_unknown_id() {
        let pending = PendingCalls::new();
        assert!(!pending.respond(99, result()));
    }

    #[tokio::test]
    async fn test_respond_after_caller_dropped() {
        let pending = PendingCalls::new();
        let rx = pending.register(5).unwrap();
        drop(rx);
        assert!(!pending.respond(5, result()));
    }

    #[tokio::test]
    async fn test_cancel_drops_sender() {
        let pending = PendingCalls::new();
        let rx = pending.register(2).unwrap();
        pending.cancel(2);
        pending.cancel(2);

        assert_eq!(pending.count(), 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_fails_outstanding_calls() {
        let pending = PendingCalls::new();
        let receivers: Vec<_> = (1..=3).map(|id| pending.register(id).unwrap()).collect();

        pending.close_all();
        assert!(pending.is_closed());
        assert_eq!(pending.count(), 0);
        for rx in receivers {
            assert!(rx.await.is_err());
        }

        assert!(pending.register(4).is_none());
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let pending = PendingCalls::new();
        let mut handles = Vec::new();

        for id in 1..=20u64 {
            let pending = pending.clone();
            handles.push(tokio::spawn(async move {
                let rx = pending.register(id).unwrap();
                tokio::task::yield_now().await;
                pending.respond(id, RpcBody::UpdateLocalConfigurationResult { err: id.to_string() });
                rx.await.unwrap()
            }));
        }

        for (id, handle) in (1..=20u64).zip(handles) {
            assert_eq!(
                handle.await.unwrap(),
                RpcBody::UpdateLocalConfigurationResult { err: id.to_string() }
            );
        }
        assert_eq!(pending.count(), 0);
    }
}
