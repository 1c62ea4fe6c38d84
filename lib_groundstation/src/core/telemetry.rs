//! # Telemetry Provider Chain
//!
//! Picks the single provider that owns live delivery for an object and hands
//! out cancellable subscriptions.
//!
//! Ownership is exclusive. The first provider (in composition order) that
//! answers `supports_subscribe` becomes the owner, and it stays pinned for that
//! identifier while any of its subscriptions are live, even if a module
//! declared earlier is enabled in the meantime. Once the owning module is
//! disabled its deliveries are dropped as stale and the next subscription
//! resolves a new owner. Every subscription carries the pin it was granted
//! under, so a replaced owner stays muted even if its module comes back.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use thiserror::Error;

use crate::core::composer::ExtensionComposer;
use crate::core::registry::{Extension, ExtensionCategory};
use crate::core::types::{Identifier, ObjectDescriptor, TelemetryDatum};

/// Receives live samples. Invoked from the distribution task.
pub type TelemetryCallback = Arc<dyn Fn(&TelemetryDatum) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("no telemetry provider supports subscriptions for {0}")]
    NoProvider(Identifier),
}

/// A source of live telemetry.
pub trait TelemetryProvider: Send + Sync {
    fn supports_subscribe(&self, object: &ObjectDescriptor) -> bool;

    /// Starts delivering samples of `object` to `callback`.
    fn subscribe(&self, object: &ObjectDescriptor, callback: TelemetryCallback) -> Subscription;
}

enum CancelState {
    Armed(Box<dyn FnOnce() + Send>),
    Running(ThreadId),
    Done,
}

/// # Subscription
///
/// Cancel handle returned by `subscribe`. Once `unsubscribe` returns, the
/// callback is never invoked again, whichever thread calls it and however many
/// threads call it at once. Cancelling twice is a no-op, and the handle may be
/// cancelled from inside the callback it cancels. Dropping the handle cancels
/// it.
pub struct Subscription {
    state: Mutex<CancelState>,
    finished: Condvar,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            state: Mutex::new(CancelState::Armed(Box::new(cancel))),
            finished: Condvar::new(),
        }
    }

    pub fn unsubscribe(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match std::mem::replace(&mut *state, CancelState::Done) {
                CancelState::Armed(cancel) => {
                    *state = CancelState::Running(me);
                    drop(state);
                    let _finish = FinishCancel(self);
                    cancel();
                    return;
                }
                // Another thread is cancelling: wait until it is done.
                CancelState::Running(owner) if owner != me => {
                    *state = CancelState::Running(owner);
                    state = self.finished.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                other => {
                    *state = other;
                    return;
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            CancelState::Armed(_)
        )
    }
}

/// Marks the cancel as finished even if the cancel closure panics.
struct FinishCancel<'a>(&'a Subscription);

impl Drop for FinishCancel<'_> {
    fn drop(&mut self) {
        *self.0.state.lock().unwrap_or_else(PoisonError::into_inner) = CancelState::Done;
        self.0.finished.notify_all();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.is_active()).finish()
    }
}

struct Owner {
    module_id: String,
    provider: Arc<dyn TelemetryProvider>,
    pin: u64,
    live: usize,
}

pub struct TelemetryProviderChain {
    composer: Arc<ExtensionComposer>,
    owners: Arc<Mutex<HashMap<Identifier, Owner>>>,
    next_pin: AtomicU64,
}

impl TelemetryProviderChain {
    pub fn new(composer: Arc<ExtensionComposer>) -> Self {
        Self {
            composer,
            owners: Arc::new(Mutex::new(HashMap::new())),
            next_pin: AtomicU64::new(1),
        }
    }

    /// The module id and provider that own live delivery for `object`.
    pub fn provider_for(&self, object: &ObjectDescriptor) -> Option<(String, Arc<dyn TelemetryProvider>)> {
        let pinned = {
            let owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
            self.pinned(&owners, &object.identifier)
        };
        pinned.or_else(|| self.resolve(object))
    }

    pub fn supports_subscribe(&self, object: &ObjectDescriptor) -> bool {
        self.provider_for(object).is_some()
    }

    /// Module currently pinned as owner of `identifier`, if any.
    pub fn owner_of(&self, identifier: &Identifier) -> Option<String> {
        let owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        self.pinned(&owners, identifier).map(|(module_id, _)| module_id)
    }

    /// Subscribes `callback` through the owning provider.
    pub fn subscribe(
        &self,
        object: &ObjectDescriptor,
        callback: TelemetryCallback,
    ) -> Result<Subscription, TelemetryError> {
        let identifier = object.identifier.clone();

        let claimed = {
            let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
            self.claim(&mut owners, &identifier)
        };
        let (module_id, provider, pin) = match claimed {
            Some(owner) => owner,
            None => {
                // Providers are consulted without holding the owners lock.
                let (module_id, provider) = self
                    .resolve(object)
                    .ok_or_else(|| TelemetryError::NoProvider(identifier.clone()))?;
                let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
                match self.claim(&mut owners, &identifier) {
                    Some(owner) => owner,
                    None => {
                        let pin = self.next_pin.fetch_add(1, Ordering::Relaxed);
                        owners.insert(
                            identifier.clone(),
                            Owner {
                                module_id: module_id.clone(),
                                provider: Arc::clone(&provider),
                                pin,
                                live: 1,
                            },
                        );
                        log::info!("Module '{}' owns live telemetry for {}", module_id, identifier);
                        (module_id, provider, pin)
                    }
                }
            }
        };

        let registry = Arc::clone(self.composer.registry());
        let owners = Arc::clone(&self.owners);
        let watched = identifier.clone();
        let guarded: TelemetryCallback = Arc::new(move |datum: &TelemetryDatum| {
            let current = owners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&watched)
                .is_some_and(|owner| owner.pin == pin);
            if current && registry.is_enabled(&module_id) {
                callback(datum);
            }
        });
        let inner = provider.subscribe(object, guarded);

        let owners = Arc::clone(&self.owners);
        Ok(Subscription::new(move || {
            inner.unsubscribe();
            release(&owners, &identifier, pin);
        }))
    }

    /// Joins the live owner of `identifier`, if it is still enabled.
    fn claim(
        &self,
        owners: &mut HashMap<Identifier, Owner>,
        identifier: &Identifier,
    ) -> Option<(String, Arc<dyn TelemetryProvider>, u64)> {
        let owner = owners.get_mut(identifier)?;
        if !self.composer.registry().is_enabled(&owner.module_id) {
            return None;
        }
        owner.live += 1;
        Some((owner.module_id.clone(), Arc::clone(&owner.provider), owner.pin))
    }

    fn pinned(
        &self,
        owners: &HashMap<Identifier, Owner>,
        identifier: &Identifier,
    ) -> Option<(String, Arc<dyn TelemetryProvider>)> {
        owners
            .get(identifier)
            .filter(|owner| self.composer.registry().is_enabled(&owner.module_id))
            .map(|owner| (owner.module_id.clone(), Arc::clone(&owner.provider)))
    }

    fn resolve(&self, object: &ObjectDescriptor) -> Option<(String, Arc<dyn TelemetryProvider>)> {
        self.composer
            .compose(ExtensionCategory::TelemetryProviders)
            .iter()
            .find_map(|contribution| match &contribution.extension {
                Extension::TelemetryProvider(provider) if provider.supports_subscribe(object) => {
                    Some((contribution.module_id.clone(), Arc::clone(provider)))
                }
                _ => None,
            })
    }
}

fn release(owners: &Mutex<HashMap<Identifier, Owner>>, identifier: &Identifier, pin: u64) {
    let mut owners = owners.lock().unwrap_or_else(PoisonError::into_inner);
    let emptied = match owners.get_mut(identifier) {
        Some(owner) if owner.pin == pin => {
            owner.live = owner.live.saturating_sub(1);
            owner.live == 0
        }
        _ => false,
    };
    if emptied {
        owners.remove(identifier);
        log::debug!("Released live telemetry ownership of {}", identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::core::registry::{ModuleDescriptor, ModuleRegistry};

    /// Records subscriptions and lets tests push samples by hand.
    #[derive(Default)]
    struct Manual {
        callbacks: Mutex<Vec<(Arc<std::sync::atomic::AtomicBool>, TelemetryCallback)>>,
        cancelled: AtomicUsize,
    }

    impl Manual {
        fn push(&self, datum: &TelemetryDatum) {
            for (active, callback) in self.callbacks.lock().unwrap().iter() {
                if active.load(Ordering::SeqCst) {
                    callback(datum);
                }
            }
        }
    }

    struct ManualProvider(Arc<Manual>, &'static str);

    impl TelemetryProvider for ManualProvider {
        fn supports_subscribe(&self, object: &ObjectDescriptor) -> bool {
            object.object_type == self.1
        }

        fn subscribe(&self, _object: &ObjectDescriptor, callback: TelemetryCallback) -> Subscription {
            let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
            self.0.callbacks.lock().unwrap().push((Arc::clone(&active), callback));
            let manual = Arc::clone(&self.0);
            Subscription::new(move || {
                active.store(false, Ordering::SeqCst);
                manual.cancelled.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    /// Asks the chain who owns the object from inside `supports_subscribe`.
    struct Curious(Arc<Mutex<Option<Arc<TelemetryProviderChain>>>>, Arc<Manual>);

    impl TelemetryProvider for Curious {
        fn supports_subscribe(&self, object: &ObjectDescriptor) -> bool {
            let chain = self.0.lock().unwrap().clone();
            if let Some(chain) = chain {
                let _ = chain.owner_of(&object.identifier);
            }
            object.object_type == "sensor"
        }

        fn subscribe(&self, object: &ObjectDescriptor, callback: TelemetryCallback) -> Subscription {
            ManualProvider(Arc::clone(&self.1), "sensor").subscribe(object, callback)
        }
    }

    fn point() -> ObjectDescriptor {
        ObjectDescriptor::new(Identifier::new("ns", "point"), "Point", "sensor")
    }

    fn counter() -> (Arc<AtomicUsize>, TelemetryCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (count, Arc::new(move |_: &TelemetryDatum| {
            seen.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn setup(modules: Vec<ModuleDescriptor>) -> TelemetryProviderChain {
        let registry = Arc::new(ModuleRegistry::new());
        for module in modules {
            registry.declare(module).unwrap();
        }
        TelemetryProviderChain::new(Arc::new(ExtensionComposer::new(registry)))
    }

    #[test]
    fn first_supporting_provider_owns_delivery() {
        let first = Arc::new(Manual::default());
        let second = Arc::new(Manual::default());
        let chain = setup(vec![
            ModuleDescriptor::builder("other").telemetry_provider(ManualProvider(Arc::new(Manual::default()), "camera")).build(),
            ModuleDescriptor::builder("first").telemetry_provider(ManualProvider(Arc::clone(&first), "sensor")).build(),
            ModuleDescriptor::builder("second").telemetry_provider(ManualProvider(Arc::clone(&second), "sensor")).build(),
        ]);

        let (count, callback) = counter();
        let _subscription = chain.subscribe(&point(), callback).unwrap();

        assert_eq!(chain.owner_of(&point().identifier).as_deref(), Some("first"));
        assert_eq!(first.callbacks.lock().unwrap().len(), 1);
        assert!(second.callbacks.lock().unwrap().is_empty());

        first.push(&TelemetryDatum::new(point().identifier, 1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsupported_object_is_an_error_not_a_panic() {
        let chain = setup(vec![]);
        let (_, callback) = counter();
        assert!(!chain.supports_subscribe(&point()));
        assert_eq!(
            chain.subscribe(&point(), callback).unwrap_err(),
            TelemetryError::NoProvider(point().identifier)
        );
    }

    #[test]
    fn ownership_stays_pinned_while_subscriptions_live() {
        let late = Arc::new(Manual::default());
        let owner = Arc::new(Manual::default());
        let chain = setup(vec![
            ModuleDescriptor::builder("late")
                .telemetry_provider(ManualProvider(Arc::clone(&late), "sensor"))
                .enabled(false)
                .build(),
            ModuleDescriptor::builder("owner").telemetry_provider(ManualProvider(Arc::clone(&owner), "sensor")).build(),
        ]);

        let (_, first_cb) = counter();
        let first = chain.subscribe(&point(), first_cb).unwrap();

        chain.composer.registry().enable("late").unwrap();
        let (_, second_cb) = counter();
        let second = chain.subscribe(&point(), second_cb).unwrap();
        assert_eq!(owner.callbacks.lock().unwrap().len(), 2);
        assert!(late.callbacks.lock().unwrap().is_empty());

        first.unsubscribe();
        second.unsubscribe();
        assert_eq!(chain.owner_of(&point().identifier), None);

        let (_, third_cb) = counter();
        let _third = chain.subscribe(&point(), third_cb).unwrap();
        assert_eq!(chain.owner_of(&point().identifier).as_deref(), Some("late"));
    }

    #[test]
    fn deliveries_from_disabled_owner_are_dropped() {
        let owner = Arc::new(Manual::default());
        let chain = setup(vec![ModuleDescriptor::builder("owner")
            .telemetry_provider(ManualProvider(Arc::clone(&owner), "sensor"))
            .build()]);

        let (count, callback) = counter();
        let _subscription = chain.subscribe(&point(), callback).unwrap();
        chain.composer.registry().disable("owner").unwrap();

        owner.push(&TelemetryDatum::new(point().identifier, 1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(chain.owner_of(&point().identifier), None);
    }

    #[test]
    fn unsubscribe_twice_and_drop_are_harmless() {
        let owner = Arc::new(Manual::default());
        let chain = setup(vec![ModuleDescriptor::builder("owner")
            .telemetry_provider(ManualProvider(Arc::clone(&owner), "sensor"))
            .build()]);

        let (_, callback) = counter();
        let subscription = chain.subscribe(&point(), callback).unwrap();
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        drop(subscription);

        assert_eq!(owner.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replaced_owner_stays_muted_after_its_module_returns() {
        let a = Arc::new(Manual::default());
        let b = Arc::new(Manual::default());
        let chain = setup(vec![
            ModuleDescriptor::builder("a").telemetry_provider(ManualProvider(Arc::clone(&a), "sensor")).build(),
            ModuleDescriptor::builder("b").telemetry_provider(ManualProvider(Arc::clone(&b), "sensor")).build(),
        ]);

        let (via_a, first_cb) = counter();
        let _first = chain.subscribe(&point(), first_cb).unwrap();
        assert_eq!(chain.owner_of(&point().identifier).as_deref(), Some("a"));

        chain.composer.registry().disable("a").unwrap();
        let (via_b, second_cb) = counter();
        let _second = chain.subscribe(&point(), second_cb).unwrap();
        assert_eq!(chain.owner_of(&point().identifier).as_deref(), Some("b"));

        chain.composer.registry().enable("a").unwrap();
        let datum = TelemetryDatum::new(point().identifier, 1);
        a.push(&datum);
        b.push(&datum);

        assert_eq!(via_a.load(Ordering::SeqCst), 0);
        assert_eq!(via_b.load(Ordering::SeqCst), 1);
        assert_eq!(chain.owner_of(&point().identifier).as_deref(), Some("b"));
    }

    #[test]
    fn provider_may_query_the_chain_while_being_resolved() {
        use std::sync::mpsc;
        use std::time::Duration;

        let slot = Arc::new(Mutex::new(None));
        let manual = Arc::new(Manual::default());
        let chain = Arc::new(setup(vec![ModuleDescriptor::builder("curious")
            .telemetry_provider(Curious(Arc::clone(&slot), Arc::clone(&manual)))
            .build()]));
        *slot.lock().unwrap() = Some(Arc::clone(&chain));

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&chain);
        thread::spawn(move || {
            let (_, callback) = counter();
            let outcome = worker.subscribe(&point(), callback).map(|s| s.is_active());
            let _ = tx.send(outcome);
        });

        let outcome = rx.recv_timeout(Duration::from_secs(5)).expect("subscribe did not return");
        assert_eq!(outcome, Ok(true));
        assert_eq!(manual.callbacks.lock().unwrap().len(), 1);
        *slot.lock().unwrap() = None;
    }
}
