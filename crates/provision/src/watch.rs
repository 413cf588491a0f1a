//! Long-lived watch subscriptions.
//!
//! A [`Subscription`] owns one task per collection. The task opens the raw
//! stream, emits `Opened`, forwards data events to its [`EventHandler`], emits
//! `Closed` when the stream ends, then consults the [`ReconnectPolicy`].
//! Reconnecting re-lists from scratch, so handlers see current objects again
//! as `Added` and must be idempotent.
//!
//! States move `Connecting -> Open -> Closed`; a reconnect goes back to
//! `Connecting`. Cancellation is explicit through [`CancelHandle`] and is safe
//! from inside a handler: the task checks it after every delivery. Dropping a
//! `Subscription` without cancelling detaches the task.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkthrough_core::{ResourceClient, ResourceDescriptor, WatchEvent, WatchStream};

use crate::error::ProvisionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connecting,
    Open,
    Closed,
}

/// What to do once a watch closes or fails to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// `Closed` is terminal.
    Never,
    /// Exponential backoff from `initial` up to `max`. `max_attempts` bounds
    /// consecutive reconnects that delivered no data event; a stream that
    /// opens and fails before its first object counts as a failed attempt.
    /// `None` retries forever.
    Backoff { initial: Duration, max: Duration, max_attempts: Option<u32> },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Backoff { initial: Duration::from_secs(1), max: Duration::from_secs(30), max_attempts: None }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (1-based), `None` to give up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff { initial, max, max_attempts } => {
                if attempt == 0 || matches!(max_attempts, Some(limit) if attempt > *limit) {
                    return None;
                }
                let shift = (attempt - 1).min(16);
                Some(initial.saturating_mul(1u32 << shift).min(*max))
            }
        }
    }
}

/// Consumer of one subscription's events.
///
/// An error is logged and counted; the subscription keeps running and the
/// next event is the retry.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: WatchEvent) -> ProvisionResult<()>;
}

/// Cloneable, idempotent cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub struct Subscription {
    descriptor: ResourceDescriptor,
    cancel: CancelHandle,
    state: watch::Receiver<WatchState>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn spawn(
        client: Arc<dyn ResourceClient>,
        descriptor: ResourceDescriptor,
        policy: ReconnectPolicy,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self::spawn_with_cancel(client, descriptor, policy, handler, CancelHandle::new())
    }

    /// Like [`Subscription::spawn`], with a handle created up front so the
    /// handler itself can hold a clone.
    pub fn spawn_with_cancel(
        client: Arc<dyn ResourceClient>,
        descriptor: ResourceDescriptor,
        policy: ReconnectPolicy,
        handler: Arc<dyn EventHandler>,
        cancel: CancelHandle,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(WatchState::Connecting);
        let task = tokio::spawn(run(client, descriptor.clone(), policy, handler, cancel.subscribe(), state_tx));
        Self { descriptor, cancel, state: state_rx, task }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to stop (after cancel, or when the policy gives up).
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(resource = %self.descriptor, error = %e, "watch task panicked");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Pump {
    /// Stream ended or failed; `delivered` is whether any data event got through.
    Ended { delivered: bool },
    Cancelled,
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

async fn deliver(handler: &dyn EventHandler, descriptor: &ResourceDescriptor, event: WatchEvent) {
    let kind = event.kind();
    if let Err(e) = handler.handle(event).await {
        counter!("walkthrough_handler_errors_total", 1u64);
        warn!(resource = %descriptor, event = ?kind, error = %e, "event handler failed; waiting for next event");
    }
}

async fn pump(
    mut stream: WatchStream,
    handler: &dyn EventHandler,
    descriptor: &ResourceDescriptor,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Pump {
    let mut delivered = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut *cancel_rx) => return Pump::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) if event.is_lifecycle() => {
                debug!(resource = %descriptor, event = ?event.kind(), "ignoring lifecycle marker from client stream");
            }
            Some(Ok(event)) => {
                deliver(handler, descriptor, event).await;
                delivered = true;
                if *cancel_rx.borrow() {
                    return Pump::Cancelled;
                }
            }
            Some(Err(e)) => {
                warn!(resource = %descriptor, error = %e, "watch stream error");
                return Pump::Ended { delivered };
            }
            None => {
                debug!(resource = %descriptor, "watch stream ended");
                return Pump::Ended { delivered };
            }
        }
    }
}

async fn run(
    client: Arc<dyn ResourceClient>,
    descriptor: ResourceDescriptor,
    policy: ReconnectPolicy,
    handler: Arc<dyn EventHandler>,
    mut cancel_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<WatchState>,
) {
    let mut attempt = 0u32;
    loop {
        if *cancel_rx.borrow() {
            break;
        }
        state_tx.send_replace(WatchState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => break,
            res = client.watch(&descriptor) => res,
        };
        match opened {
            Ok(stream) => {
                state_tx.send_replace(WatchState::Open);
                info!(resource = %descriptor, ns = ?descriptor.namespace, "subscription open");
                deliver(handler.as_ref(), &descriptor, WatchEvent::Opened).await;
                if *cancel_rx.borrow() {
                    break;
                }
                let outcome = pump(stream, handler.as_ref(), &descriptor, &mut cancel_rx).await;
                state_tx.send_replace(WatchState::Closed);
                match outcome {
                    Pump::Cancelled => break,
                    Pump::Ended { delivered: true } => attempt = 0,
                    Pump::Ended { delivered: false } => {}
                }
                deliver(handler.as_ref(), &descriptor, WatchEvent::Closed).await;
                if *cancel_rx.borrow() {
                    break;
                }
            }
            Err(e) => {
                state_tx.send_replace(WatchState::Closed);
                warn!(resource = %descriptor, error = %e, "watch failed to open");
            }
        }

        attempt += 1;
        let Some(delay) = policy.delay(attempt) else {
            info!(resource = %descriptor, "subscription closed; reconnect policy exhausted");
            break;
        };
        counter!("walkthrough_watch_reconnects_total", 1u64);
        debug!(resource = %descriptor, attempt, delay_ms = delay.as_millis() as u64, "reconnecting watch");
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    state_tx.send_replace(WatchState::Closed);
    info!(resource = %descriptor, "subscription ended");
}
