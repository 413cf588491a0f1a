//! Walkthrough store: folds provisioning notifications into an atomically
//! swapped snapshot of the user's services, keyed by service class, plus the
//! broker credentials last mirrored into the namespace.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use walkthrough_core::{payload, AmqCredentials, Notification, NotificationSink, Resource};

/// Coalescing queue keyed by class with FIFO order and fixed capacity.
///
/// Only the latest notification per key survives; folding is last-write-wins
/// per key, so this loses nothing a reader could observe as long as the
/// capacity covers every key. Past that the oldest key is evicted.
pub struct Coalescer {
    map: FxHashMap<String, Notification>,
    order: VecDeque<String>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, n: Notification) {
        let key = n.key().to_string();
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    warn!(key = %old, "state queue full; dropped oldest pending notification");
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, n);
    }

    pub fn drain_ready(&mut self) -> Vec<Notification> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(n) = self.map.remove(&key) {
                out.push(n);
            }
        }
        out
    }
}

/// Immutable view handed to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalkthroughState {
    pub epoch: u64,
    /// Latest service instance per class external name.
    pub services: BTreeMap<String, Resource>,
    /// Broker login, once the credentials secret has been reconciled.
    pub amq_credentials: Option<AmqCredentials>,
}

impl WalkthroughState {
    pub fn get(&self, class: &str) -> Option<&Resource> {
        self.services.get(class)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// `url`, `username` or `password` of the messaging service, as the
    /// walkthrough pages read them. `url` is the AMQ instance's dashboard URL.
    pub fn messaging(&self, field: &str) -> Option<&str> {
        match field {
            "username" => self.amq_credentials.as_ref().map(|c| c.username.as_str()),
            "password" => self.amq_credentials.as_ref().map(|c| c.password.as_str()),
            "url" => self.services.values().find(|r| is_amq(r)).and_then(payload::dashboard_url),
            _ => None,
        }
    }
}

fn is_amq(resource: &Resource) -> bool {
    payload::class_name(resource).map(|c| c.starts_with("amq")).unwrap_or(false)
}

/// Builds [`WalkthroughState`] snapshots from notifications.
#[derive(Default)]
pub struct StateBuilder {
    epoch: u64,
    services: BTreeMap<String, Resource>,
    amq_credentials: Option<AmqCredentials>,
}

impl StateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts replace, removals delete; each applied notification bumps the epoch.
    pub fn apply(&mut self, batch: Vec<Notification>) {
        for n in batch {
            match n {
                Notification::Upserted { key, resource } => {
                    self.services.insert(key, resource);
                }
                Notification::Removed { key, .. } => {
                    if self.services.remove(&key).is_none() {
                        debug!(key = %key, "removal for unknown service");
                    }
                }
                Notification::Credentials(creds) => {
                    self.amq_credentials = Some(creds);
                }
            }
            self.epoch = self.epoch.saturating_add(1);
        }
    }

    pub fn freeze(&self) -> Arc<WalkthroughState> {
        Arc::new(WalkthroughState {
            epoch: self.epoch,
            services: self.services.clone(),
            amq_credentials: self.amq_credentials.clone(),
        })
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct StateHandle {
    snap: Arc<ArcSwap<WalkthroughState>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StateHandle {
    pub fn current(&self) -> Arc<WalkthroughState> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

/// Coalescer capacity that never evicts when `keys` distinct keys can be pending.
fn coalescer_capacity(cap: usize, keys: usize) -> usize {
    cap.max(keys).max(1)
}

/// Spawn the fold loop. Returns the sender notifications go into and a read handle.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<Notification>, StateHandle) {
    spawn_ingest_for_keys(cap, 0)
}

/// Like [`spawn_ingest`], with the coalescer sized for at least `keys`
/// distinct keys so a pending removal is never evicted.
pub fn spawn_ingest_for_keys(cap: usize, keys: usize) -> (mpsc::Sender<Notification>, StateHandle) {
    let (tx, mut rx) = mpsc::channel::<Notification>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(WalkthroughState::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(coalescer_capacity(cap, keys));
        let mut builder = StateBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        let publish = |coalescer: &mut Coalescer, builder: &mut StateBuilder| {
            let batch = coalescer.drain_ready();
            if batch.is_empty() {
                return;
            }
            builder.apply(batch);
            let next = builder.freeze();
            let epoch = next.epoch;
            gauge!("walkthrough_state_services", next.len() as f64);
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(n) => coalescer.push(n),
                        None => {
                            debug!("notification channel closed; draining and exiting state loop");
                            publish(&mut coalescer, &mut builder);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => publish(&mut coalescer, &mut builder),
            }
        }
        info!(dropped = coalescer.dropped(), "state loop stopped");
    });

    (tx, StateHandle { snap, epoch_rx })
}

/// Notification sink backed by the fold loop.
#[derive(Clone)]
pub struct StateStore {
    tx: mpsc::Sender<Notification>,
    handle: StateHandle,
}

impl StateStore {
    pub fn spawn(cap: usize) -> Self {
        let (tx, handle) = spawn_ingest(cap);
        Self { tx, handle }
    }

    /// Store for a walkthrough with `services` allow-listed classes; the
    /// credentials key comes on top.
    pub fn for_services(cap: usize, services: usize) -> Self {
        let keys = services.saturating_add(1);
        if cap < keys {
            warn!(cap, keys, "queue capacity below the number of tracked keys; raising it");
        }
        let (tx, handle) = spawn_ingest_for_keys(cap, keys);
        Self { tx, handle }
    }

    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }

    pub fn current(&self) -> Arc<WalkthroughState> {
        self.handle.current()
    }

    /// Load pre-built service instances as upserts, without a cluster.
    /// Instances without a class are skipped; returns how many were queued.
    pub async fn seed<I>(&self, instances: I) -> usize
    where
        I: IntoIterator<Item = Resource>,
    {
        let mut seeded = 0;
        for resource in instances {
            let key = match payload::class_name(&resource) {
                Ok(class) => class.to_string(),
                Err(e) => {
                    warn!(instance = ?payload::name(&resource), reason = %e, "seed instance skipped");
                    continue;
                }
            };
            self.notify(Notification::Upserted { key, resource }).await;
            seeded += 1;
        }
        seeded
    }
}

#[async_trait::async_trait]
impl NotificationSink for StateStore {
    async fn notify(&self, notification: Notification) {
        self.tx.notify(notification).await;
    }
}
