//! Session Registry with Per-Address Serialization
//!
//! Many instruments share one physical bus, and a driver session is not safe
//! for concurrent use. This registry serializes access per instrument address
//! while letting different addresses proceed in parallel.
//!
//! # Design
//!
//! - One [`DeviceSession`] per address, created lazily by a caller-supplied
//!   factory (at most once per address while the entry is cached)
//! - Each entry's session slot sits behind a capacity-one async lock; callers
//!   wait for it in FIFO order and the wait can be cancelled
//! - The factory runs behind that per-entry lock, never under the map's shard
//!   lock, so a slow open never delays lookups of other addresses
//! - A background sweep evicts entries idle for longer than a threshold, but
//!   only when it can take the lock without waiting
//! - [`SessionRegistry::dispose`] drains every in-flight operation before
//!   closing its session
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_gpib::address::InstrumentAddress;
//! use rust_gpib::bus::SimulatedBus;
//! use rust_gpib::registry::SessionRegistry;
//! use rust_gpib::session::{DeviceSession, SessionOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> rust_gpib::GpibResult<()> {
//! let bus = Arc::new(SimulatedBus::new());
//! let registry = SessionRegistry::new(move |address| {
//!     DeviceSession::open(bus.clone(), address, &SessionOptions::default())
//! });
//!
//! let address = InstrumentAddress::primary_only(5)?;
//! let cancel = CancellationToken::new();
//! let idn: String = registry
//!     .execute(address, |session| Box::pin(async move { session.query::<String>("*IDN?") }), &cancel)
//!     .await?;
//! println!("Instrument ID: {}", idn);
//!
//! registry.dispose().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::address::InstrumentAddress;
use crate::bus::RawBusInterface;
use crate::config::GpibConfig;
use crate::error::{GpibError, GpibResult};
use crate::session::DeviceSession;

/// Default idle time after which a cached session is evicted.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Default period of the idle sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type SessionFactory = dyn Fn(InstrumentAddress) -> GpibResult<DeviceSession> + Send + Sync;

/// Timing of the idle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Minimum idle time before an entry is evicted.
    pub idle_threshold: Duration,
    /// Period of the background sweep. Zero disables it.
    pub sweep_interval: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Cached slot for one address
struct DeviceEntry {
    /// The session behind its capacity-one lock; `None` until the factory
    /// has run for this entry
    session: AsyncMutex<Option<DeviceSession>>,
    /// Last time an operation started or finished
    last_used: Mutex<Instant>,
}

impl DeviceEntry {
    fn vacant() -> Self {
        Self {
            session: AsyncMutex::new(None),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }
}

struct RegistryInner {
    entries: DashMap<InstrumentAddress, Arc<DeviceEntry>>,
    factory: Box<SessionFactory>,
    options: RegistryOptions,
    disposed: AtomicBool,
}

impl RegistryInner {
    fn ensure_active(&self) -> GpibResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(GpibError::UseAfterClose("session registry"));
        }
        Ok(())
    }

    /// Cached entry for `address`, inserting a vacant one if needed. Only
    /// this cheap insert happens under the shard lock.
    fn resolve(&self, address: InstrumentAddress) -> Arc<DeviceEntry> {
        if let Some(entry) = self.entries.get(&address) {
            return Arc::clone(entry.value());
        }
        let entry = self.entries.entry(address).or_insert_with(|| {
            trace!(%address, "Inserting vacant device entry");
            Arc::new(DeviceEntry::vacant())
        });
        Arc::clone(entry.value())
    }

    /// Whether `entry` is still the one cached for `address`.
    fn is_current(&self, address: InstrumentAddress, entry: &Arc<DeviceEntry>) -> bool {
        self.entries
            .get(&address)
            .is_some_and(|cached| Arc::ptr_eq(cached.value(), entry))
    }

    fn forget(&self, address: InstrumentAddress, entry: &Arc<DeviceEntry>) {
        self.entries
            .remove_if(&address, |_, cached| Arc::ptr_eq(cached, entry));
    }

    /// Run the factory. The raw open blocks, so on a multi-threaded runtime
    /// the worker hands its other tasks off while it waits.
    fn create(&self, address: InstrumentAddress) -> GpibResult<DeviceSession> {
        debug!(%address, "Opening device session");
        let open = || (self.factory)(address);
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(open),
            _ => open(),
        }
    }

    fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<(InstrumentAddress, Arc<DeviceEntry>)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        let mut evicted = 0;
        for (address, entry) in candidates {
            let Ok(mut slot) = entry.session.try_lock() else {
                trace!(%address, "Entry busy, skipping idle check");
                continue;
            };
            let idle = entry.idle_for(now);
            if idle < self.options.idle_threshold {
                continue;
            }
            // Unreachable from lookups before the session is torn down
            self.forget(address, &entry);
            if let Some(mut session) = slot.take() {
                session.close();
            }
            evicted += 1;
            debug!(%address, idle_secs = idle.as_secs(), "Evicted idle device session");
        }
        evicted
    }
}

/// Registry of device sessions keyed by instrument address.
///
/// The idle sweep runs as a tokio task. A registry built outside a runtime
/// starts it on the first [`execute`](Self::execute).
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
    sweep_stop: CancellationToken,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Registry with the default five minute idle threshold and one minute sweep.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(InstrumentAddress) -> GpibResult<DeviceSession> + Send + Sync + 'static,
    {
        Self::with_options(factory, RegistryOptions::default())
    }

    /// Registry with custom sweep timing.
    pub fn with_options<F>(factory: F, options: RegistryOptions) -> Self
    where
        F: Fn(InstrumentAddress) -> GpibResult<DeviceSession> + Send + Sync + 'static,
    {
        let inner = Arc::new(RegistryInner {
            entries: DashMap::new(),
            factory: Box::new(factory),
            options,
            disposed: AtomicBool::new(false),
        });
        let registry = Self {
            inner,
            sweep_stop: CancellationToken::new(),
            sweep_task: Mutex::new(None),
        };
        if Handle::try_current().is_err() && !options.sweep_interval.is_zero() {
            warn!("No tokio runtime found; idle sweep starts on first use");
        }
        registry.start_sweep();
        registry
    }

    /// Spawn the idle sweep if it is enabled, not yet running, and a runtime
    /// is available. A zero interval leaves eviction to `evict_idle`.
    fn start_sweep(&self) {
        let period = self.inner.options.sweep_interval;
        if period.is_zero() || self.is_disposed() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let mut task = self.sweep_task.lock();
        if task.is_none() {
            *task = Some(handle.spawn(Self::run_idle_sweep(
                Arc::downgrade(&self.inner),
                period,
                self.sweep_stop.clone(),
            )));
        }
    }

    /// Registry whose factory opens sessions on `bus` with the configured
    /// session options, and whose sweep follows the configured timing.
    pub fn from_config(bus: Arc<dyn RawBusInterface>, config: &GpibConfig) -> Self {
        let session_options = config.session_options();
        Self::with_options(
            move |address| DeviceSession::open(Arc::clone(&bus), address, &session_options),
            config.registry_options(),
        )
    }

    /// Run `action` with exclusive access to the session for `address`.
    ///
    /// Calls for the same address never overlap; calls for different
    /// addresses run in parallel. The lock is released however `action` ends.
    ///
    /// # Errors
    /// - `UseAfterClose` once the registry is disposed
    /// - `Cancelled` if `cancel` fires while waiting for the lock
    /// - whatever the factory or `action` return
    pub async fn execute<T, F>(
        &self,
        address: InstrumentAddress,
        action: F,
        cancel: &CancellationToken,
    ) -> GpibResult<T>
    where
        F: for<'s> FnOnce(&'s mut DeviceSession) -> BoxFuture<'s, GpibResult<T>>,
    {
        self.start_sweep();
        loop {
            self.inner.ensure_active()?;
            let entry = self.inner.resolve(address);

            let mut slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(GpibError::Cancelled {
                        operation: format!("lock {address}"),
                    });
                }
                guard = entry.session.lock() => guard,
            };

            if let Err(err) = self.inner.ensure_active() {
                // Inserted after disposal drained the cache
                if let Some(mut session) = slot.take() {
                    session.close();
                }
                self.inner.forget(address, &entry);
                return Err(err);
            }
            if !self.inner.is_current(address, &entry) {
                trace!(%address, "Entry was evicted while waiting, resolving again");
                continue;
            }

            // An action may have closed the session itself; reopen in place
            let session = match slot.take().filter(|session| !session.is_closed()) {
                Some(session) => slot.insert(session),
                None => match self.inner.create(address) {
                    Ok(session) => slot.insert(session),
                    Err(err) => {
                        // Queued callers see the entry gone and retry the factory
                        self.inner.forget(address, &entry);
                        return Err(err);
                    }
                },
            };

            entry.touch();
            let result = action(session).await;
            entry.touch();
            return result;
        }
    }

    /// [`execute`](Self::execute) for actions whose value is not needed.
    ///
    /// # Errors
    /// As [`execute`](Self::execute).
    pub async fn run<T, F>(
        &self,
        address: InstrumentAddress,
        action: F,
        cancel: &CancellationToken,
    ) -> GpibResult<()>
    where
        F: for<'s> FnOnce(&'s mut DeviceSession) -> BoxFuture<'s, GpibResult<T>>,
    {
        self.execute(address, action, cancel).await.map(|_| ())
    }

    /// Number of cached entries, including one whose session is being opened.
    pub fn session_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether a session for `address` is cached.
    pub fn contains(&self, address: InstrumentAddress) -> bool {
        self.inner.entries.contains_key(&address)
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Run one idle sweep now and return how many sessions were evicted.
    pub fn evict_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Stop the sweep, wait for every in-flight operation, close all sessions.
    /// Later calls are no-ops.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sweep_stop.cancel();
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }

        let entries: Vec<(InstrumentAddress, Arc<DeviceEntry>)> = self
            .inner
            .entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        for (address, entry) in entries {
            let mut slot = entry.session.lock().await;
            if let Some(mut session) = slot.take() {
                session.close();
            }
            trace!(%address, "Closed session during registry disposal");
        }
        self.inner.entries.clear();
        debug!("Session registry disposed");
    }

    async fn run_idle_sweep(
        inner: Weak<RegistryInner>,
        period: Duration,
        stop: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(inner) = inner.upgrade() else { break };
            if inner.disposed.load(Ordering::Acquire) {
                break;
            }
            let evicted = inner.sweep_idle();
            if evicted > 0 {
                debug!(evicted, remaining = inner.entries.len(), "Idle sweep finished");
            }
        }

        trace!("Idle sweep task ended");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.sweep_stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{SimulatedBus, SimulatedInstrument};
    use crate::session::SessionOptions;
    use std::sync::atomic::AtomicUsize;

    fn registry_on(bus: Arc<SimulatedBus>, created: Arc<AtomicUsize>) -> SessionRegistry {
        SessionRegistry::with_options(
            move |address| {
                created.fetch_add(1, Ordering::SeqCst);
                DeviceSession::open(bus.clone(), address, &SessionOptions::default())
            },
            RegistryOptions {
                idle_threshold: Duration::from_secs(1),
                sweep_interval: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_waiter_re_resolves_evicted_entry() {
        let address = InstrumentAddress::primary_only(4).unwrap();
        let bus = Arc::new(SimulatedBus::new().with_instrument(address, SimulatedInstrument::new()));
        let created = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(registry_on(bus.clone(), created.clone()));

        let cancel = CancellationToken::new();
        let first = registry
            .execute(
                address,
                |s| Box::pin(async move { Ok::<_, GpibError>(s.descriptor()) }),
                &cancel,
            )
            .await
            .unwrap();
        let entry = registry.inner.resolve(address);
        let mut guard = entry.session.lock().await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                registry
                    .execute(
                        address,
                        |s| Box::pin(async move { Ok::<_, GpibError>(s.descriptor()) }),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        // Evict the way the sweep does: unreachable first, then closed
        registry.inner.forget(address, &entry);
        guard.take().unwrap().close();
        drop(guard);

        let second = waiter.await.unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(bus.offline_count(first), 1);
        registry.dispose().await;
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_spawns_no_task() {
        let bus = Arc::new(SimulatedBus::new());
        let registry = registry_on(bus, Arc::new(AtomicUsize::new(0)));
        assert!(registry.sweep_task.lock().is_none());
    }

    #[test]
    fn test_registry_outside_runtime_defers_sweep() {
        let bus = Arc::new(SimulatedBus::new());
        bus.set_fail_open(true);
        let registry = SessionRegistry::new(move |address| {
            DeviceSession::open(bus.clone(), address, &SessionOptions::default())
        });
        assert!(registry.sweep_task.lock().is_none());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let address = InstrumentAddress::primary_only(4).unwrap();
            let cancel = CancellationToken::new();
            let err = registry
                .run(address, |s| Box::pin(async move { s.clear() }), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, GpibError::OpenFailure { .. }));
            assert!(registry.sweep_task.lock().is_some());
            registry.dispose().await;
        });
    }

    #[test]
    fn test_vacant_entry_is_not_current_after_forget() {
        let bus = Arc::new(SimulatedBus::new());
        let registry = registry_on(bus, Arc::new(AtomicUsize::new(0)));
        let address = InstrumentAddress::primary_only(4).unwrap();

        let entry = registry.inner.resolve(address);
        assert!(Arc::ptr_eq(&entry, &registry.inner.resolve(address)));
        assert!(registry.inner.is_current(address, &entry));
        registry.inner.forget(address, &entry);
        assert!(!registry.inner.is_current(address, &entry));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_for_tracks_touch() {
        let entry = DeviceEntry::vacant();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(entry.idle_for(Instant::now()), Duration::from_secs(5));
        entry.touch();
        assert_eq!(entry.idle_for(Instant::now()), Duration::ZERO);
    }
}
