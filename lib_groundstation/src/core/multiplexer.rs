//! # Latest-Value Cache and Subscription Multiplexer
//!
//! The multiplexer decouples the delivery cadence from the ingestion rate.
//! Ingestion overwrites the cache on every message; a single distribution task
//! wakes once per period, reads the cache once, and hands the same sample to
//! every active subscriber of an identifier.
//!
//! ## Core Design Principles:
//!
//! 1.  **Last-Value-Wins Coalescing**: Only the newest sample per identifier is
//!     kept. A burst of messages inside one period collapses into one delivery
//!     at the next tick. This is the backpressure mechanism: a slow consumer
//!     can never build up a queue.
//!
//! 2.  **One Snapshot Per Tick**: All subscribers of the same identifier are
//!     served from the same cache read, so concurrent subscriptions observe
//!     identical sequences.
//!
//! 3.  **Synchronous Cancellation**: A handle is a record in a table keyed by
//!     handle id. `unsubscribe` flips its flag and, if another thread is in the
//!     middle of invoking its callback, waits for that invocation to finish.
//!     When it returns, the callback will not run again. Called from inside
//!     the callback itself it returns immediately instead of waiting on itself.
//!
//! 4.  **Fault Isolation**: Each callback runs under `catch_unwind`. A
//!     panicking subscriber is logged and skipped; the remaining subscribers
//!     of the tick are still served.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::telemetry::{Subscription, TelemetryCallback, TelemetryProvider};
use crate::core::types::{Identifier, ObjectDescriptor, TelemetryDatum};

/// Cadence of the ground display: one update per second.
pub const DEFAULT_DISTRIBUTION_PERIOD: Duration = Duration::from_secs(1);

/// Identifiers nobody serves that are kept before the oldest is evicted.
pub const DEFAULT_UNSERVED_LIMIT: usize = 64;

/// A cached sample and the revision it was written at.
#[derive(Debug, Clone)]
pub struct CachedSample {
    pub revision: u64,
    pub datum: Arc<TelemetryDatum>,
}

/// # Latest-Value Cache
///
/// `identifier -> newest datum` for one connection. Memory resident only.
///
/// Identifiers marked with [`LatestValueCache::serve`] are always kept. Any
/// other identifier a source names is held in a bounded pool, so a source
/// inventing identifiers cannot grow the cache without limit.
#[derive(Debug)]
pub struct LatestValueCache {
    entries: RwLock<HashMap<Identifier, CachedSample>>,
    served: RwLock<HashSet<Identifier>>,
    unserved_limit: usize,
    revision: AtomicU64,
}

impl Default for LatestValueCache {
    fn default() -> Self {
        Self::with_unserved_limit(DEFAULT_UNSERVED_LIMIT)
    }
}

impl LatestValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unserved_limit(limit: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            served: RwLock::new(HashSet::new()),
            unserved_limit: limit.max(1),
            revision: AtomicU64::new(0),
        }
    }

    /// Marks `identifier` as consumed by a provider or subscriber.
    pub fn serve(&self, identifier: Identifier) {
        self.served
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier);
    }

    pub fn is_served(&self, identifier: &Identifier) -> bool {
        self.served
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(identifier)
    }

    /// Overwrites the sample for the datum's identifier. Returns its revision.
    pub fn put(&self, datum: TelemetryDatum) -> u64 {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        let served = self.served.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if !served.contains(&datum.identifier) && !entries.contains_key(&datum.identifier) {
            let unserved = entries.keys().filter(|id| !served.contains(*id)).count();
            if unserved >= self.unserved_limit {
                let oldest = entries
                    .iter()
                    .filter(|(id, _)| !served.contains(*id))
                    .min_by_key(|(_, sample)| sample.revision)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    log::debug!("Evicted unserved identifier {} from the latest-value cache", oldest);
                }
            }
        }

        entries.insert(
            datum.identifier.clone(),
            CachedSample {
                revision,
                datum: Arc::new(datum),
            },
        );
        revision
    }

    pub fn get(&self, identifier: &Identifier) -> Option<CachedSample> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(identifier).cloned()
    }

    /// Reads several identifiers under one lock.
    pub fn snapshot<'a>(
        &self,
        identifiers: impl IntoIterator<Item = &'a Identifier>,
    ) -> HashMap<Identifier, CachedSample> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        identifiers
            .into_iter()
            .filter_map(|id| entries.get(id).map(|sample| (id.clone(), sample.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether an unchanged sample is delivered again on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Deliver the cached sample on every tick (the observed behaviour).
    #[default]
    EveryTick,
    /// Deliver only samples the handle has not seen yet.
    OnChange,
}

/// Identity of a subscription handle inside one multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

struct HandleState {
    active: bool,
    delivering: Option<ThreadId>,
    last_revision: Option<u64>,
}

/// # Subscription Handle
///
/// `{identifier, callback, active}` plus the bookkeeping needed to cancel
/// synchronously.
struct Handle {
    id: HandleId,
    identifier: Identifier,
    callback: TelemetryCallback,
    state: Mutex<HandleState>,
    idle: Condvar,
}

impl Handle {
    /// Invokes the callback unless the handle was cancelled. Returns whether
    /// the callback ran.
    fn deliver(&self, sample: &CachedSample, mode: DeliveryMode) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.active {
                return false;
            }
            if mode == DeliveryMode::OnChange && state.last_revision == Some(sample.revision) {
                return false;
            }
            state.delivering = Some(thread::current().id());
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(&sample.datum)));

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.delivering = None;
            state.last_revision = Some(sample.revision);
        }
        self.idle.notify_all();

        if outcome.is_err() {
            log::error!(
                "Subscriber {:?} of {} panicked; continuing with remaining subscribers",
                self.id,
                self.identifier
            );
        }
        true
    }

    /// Marks the handle inactive and waits out an invocation running on
    /// another thread.
    fn deactivate(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.active = false;
        while matches!(state.delivering, Some(owner) if owner != me) {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// # Subscription Multiplexer
///
/// Fans cached samples out to subscription handles on a fixed period.
pub struct SubscriptionMultiplexer {
    cache: Arc<LatestValueCache>,
    handles: Mutex<BTreeMap<HandleId, Arc<Handle>>>,
    next_id: AtomicU64,
    period: Duration,
    mode: DeliveryMode,
}

impl SubscriptionMultiplexer {
    pub fn new(cache: Arc<LatestValueCache>, period: Duration) -> Self {
        Self {
            cache,
            handles: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            period,
            mode: DeliveryMode::default(),
        }
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cache(&self) -> &Arc<LatestValueCache> {
        &self.cache
    }

    /// Registers a handle. It is served from the next tick on.
    pub fn subscribe(&self, identifier: Identifier, callback: TelemetryCallback) -> HandleId {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.cache.serve(identifier.clone());
        let handle = Arc::new(Handle {
            id,
            identifier,
            callback,
            state: Mutex::new(HandleState {
                active: true,
                delivering: None,
                last_revision: None,
            }),
            idle: Condvar::new(),
        });

        log::debug!("Subscription {:?} registered for {}", id, handle.identifier);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        id
    }

    /// Cancels a handle. Idempotent and safe to call from a callback.
    pub fn unsubscribe(&self, id: HandleId) {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if let Some(handle) = removed {
            handle.deactivate();
            log::debug!("Subscription {:?} for {} cancelled", id, handle.identifier);
        }
    }

    /// `subscribe` wrapped in a [`Subscription`] that cancels the handle.
    pub fn subscription(self: &Arc<Self>, identifier: Identifier, callback: TelemetryCallback) -> Subscription {
        let id = self.subscribe(identifier, callback);
        let multiplexer = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(multiplexer) = multiplexer.upgrade() {
                multiplexer.unsubscribe(id);
            }
        })
    }

    pub fn is_active(&self, id: HandleId) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn active_handles(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// # Distribute
    ///
    /// One distribution pass. Returns the number of callbacks invoked.
    ///
    /// ## Logic:
    /// 1.  Snapshots the handle table so callbacks may subscribe or cancel
    ///     without contending with the pass.
    /// 2.  Reads the cache once for every identifier with a subscriber.
    /// 3.  Hands each active handle the sample of its identifier. Identifiers
    ///     that were never sampled are skipped.
    pub fn distribute(&self) -> usize {
        let handles: Vec<Arc<Handle>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if handles.is_empty() {
            return 0;
        }

        let wanted: HashSet<&Identifier> = handles.iter().map(|h| &h.identifier).collect();
        let samples = self.cache.snapshot(wanted);

        handles
            .iter()
            .filter(|handle| {
                samples
                    .get(&handle.identifier)
                    .map(|sample| handle.deliver(sample, self.mode))
                    .unwrap_or(false)
            })
            .count()
    }

    /// # Spawn Distribution
    ///
    /// Starts the periodic distribution task. The first tick fires one period
    /// after the call. The task ends when `shutdown` is cancelled.
    pub fn spawn_distribution(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let multiplexer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + multiplexer.period, multiplexer.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("Distribution timer started ({:?} period)", multiplexer.period);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("Distribution timer stopped.");
                        break;
                    }
                    _ = ticker.tick() => {
                        let delivered = multiplexer.distribute();
                        log::trace!("Distribution tick delivered {} sample(s)", delivered);
                    }
                }
            }
        })
    }
}

/// # Live Telemetry Provider
///
/// Serves live subscriptions for a fixed set of identifiers of one object
/// type from a multiplexer.
pub struct LiveTelemetryProvider {
    object_type: String,
    identifiers: HashSet<Identifier>,
    multiplexer: Arc<SubscriptionMultiplexer>,
}

impl LiveTelemetryProvider {
    pub fn new(
        object_type: &str,
        identifiers: impl IntoIterator<Item = Identifier>,
        multiplexer: Arc<SubscriptionMultiplexer>,
    ) -> Self {
        let identifiers: HashSet<Identifier> = identifiers.into_iter().collect();
        for identifier in &identifiers {
            multiplexer.cache().serve(identifier.clone());
        }
        Self {
            object_type: object_type.to_string(),
            identifiers,
            multiplexer,
        }
    }
}

impl TelemetryProvider for LiveTelemetryProvider {
    fn supports_subscribe(&self, object: &ObjectDescriptor) -> bool {
        object.object_type == self.object_type && self.identifiers.contains(&object.identifier)
    }

    fn subscribe(&self, object: &ObjectDescriptor, callback: TelemetryCallback) -> Subscription {
        self.multiplexer.subscription(object.identifier.clone(), callback)
    }
}
