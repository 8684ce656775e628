//! On-demand module loading with request coalescing, reference counting, and LRU eviction.
//!
//! The cache maps each descriptor id to either an in-flight fetch or a ready module. Concurrent
//! `load` calls for the same id await one shared fetch, so the module source is hit at most once
//! per id until the module is evicted. The loader needs a tokio runtime with timers enabled for
//! retry backoff.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
    time::Duration,
};

use desktop_app_contract::{AppModule, ApplicationId};
use futures::future::{join_all, FutureExt, LocalBoxFuture, Shared};
use platform_host::ModuleSource;
use tokio::time::Instant;

use crate::{
    config::RuntimeConfig,
    error::{DesktopError, ModuleLoadError},
    event_bus::EventBus,
    events::{ModuleEvictedPayload, MODULE_EVICTED},
    model::ApplicationDescriptor,
    registry::AppRegistry,
};

/// A failed fetch is retried once before surfacing [`ModuleLoadError`].
pub const MAX_FETCH_ATTEMPTS: u32 = 2;

type FetchFuture = Shared<LocalBoxFuture<'static, Result<AppModule, ModuleLoadError>>>;

enum Slot {
    Loading(FetchFuture),
    Ready(AppModule),
}

struct CacheEntry {
    slot: Slot,
    reference_count: usize,
    last_used_at: Instant,
}

impl CacheEntry {
    fn is_ready(&self) -> bool {
        matches!(self.slot, Slot::Ready(_))
    }
}

#[derive(Default)]
struct LoaderState {
    entries: HashMap<ApplicationId, CacheEntry>,
    fetches_started: usize,
}

impl LoaderState {
    /// Runs once per fetch, from inside the shared future, so every waiter observes the same
    /// cache transition.
    fn settle(&mut self, app_id: &ApplicationId, result: &Result<AppModule, ModuleLoadError>) {
        let Some(entry) = self.entries.get_mut(app_id) else {
            return;
        };
        if entry.is_ready() {
            return;
        }
        match result {
            Ok(module) => {
                entry.slot = Slot::Ready(module.clone());
                entry.last_used_at = Instant::now();
            }
            Err(_) => {
                self.entries.remove(app_id);
            }
        }
    }

    fn ready_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_ready()).count()
    }
}

#[derive(Debug, Clone)]
/// Snapshot of a ready cache entry.
pub struct LoadedModule {
    pub descriptor_id: ApplicationId,
    pub factory: AppModule,
    pub reference_count: usize,
    pub last_used_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Host memory-pressure signal.
pub enum MemoryPressure {
    /// Trim eligible modules until the cache is at its soft limit.
    Moderate,
    /// Drop every eligible module.
    Critical,
}

#[derive(Clone)]
/// Shared handle to the module cache. The loader exclusively owns cache entries.
pub struct ModuleLoader {
    inner: Rc<RefCell<LoaderState>>,
    registry: AppRegistry,
    source: Rc<dyn ModuleSource>,
    bus: EventBus,
    retry_backoff: Duration,
    grace_period: Duration,
    soft_limit: usize,
}

impl ModuleLoader {
    pub fn new(
        registry: AppRegistry,
        source: Rc<dyn ModuleSource>,
        bus: EventBus,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(LoaderState::default())),
            registry,
            source,
            bus,
            retry_backoff: config.load_retry_backoff(),
            grace_period: config.module_grace_period(),
            soft_limit: config.module_cache_soft_limit,
        }
    }

    /// Resolves `app_id` to its module and takes one reference on it.
    ///
    /// Cache hits return without awaiting anything. Misses start (or join) the single in-flight
    /// fetch for the id. Every successful call must be paired with [`ModuleLoader::release`].
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::NotFound`] before any fetch when the id is not registered, and
    /// [`DesktopError::ModuleLoad`] when the fetch and its retry both fail.
    pub async fn load(&self, app_id: &str) -> Result<LoadedModule, DesktopError> {
        let descriptor = self.registry.get(app_id)?;
        let id = descriptor.id.clone();
        let pending = {
            let mut state = self.inner.borrow_mut();
            let now = Instant::now();
            match state.entries.get_mut(&id) {
                Some(entry) => {
                    entry.reference_count += 1;
                    entry.last_used_at = now;
                    match &entry.slot {
                        Slot::Ready(module) => {
                            return Ok(LoadedModule {
                                descriptor_id: id,
                                factory: module.clone(),
                                reference_count: entry.reference_count,
                                last_used_at: now,
                            });
                        }
                        Slot::Loading(fetch) => fetch.clone(),
                    }
                }
                None => {
                    let fetch = self.start_fetch(&descriptor);
                    state.fetches_started += 1;
                    state.entries.insert(
                        id.clone(),
                        CacheEntry {
                            slot: Slot::Loading(fetch.clone()),
                            reference_count: 1,
                            last_used_at: now,
                        },
                    );
                    fetch
                }
            }
        };

        let factory = pending.await?;
        let state = self.inner.borrow();
        let (reference_count, last_used_at) = state
            .entries
            .get(&id)
            .map(|entry| (entry.reference_count, entry.last_used_at))
            .unwrap_or_else(|| (0, Instant::now()));
        Ok(LoadedModule {
            descriptor_id: id,
            factory,
            reference_count,
            last_used_at,
        })
    }

    /// Warms the cache without taking a reference.
    ///
    /// # Errors
    ///
    /// Same as [`ModuleLoader::load`].
    pub async fn preload(&self, app_id: &str) -> Result<(), DesktopError> {
        let descriptor = self.registry.get(app_id)?;
        let pending = {
            let mut state = self.inner.borrow_mut();
            match state.entries.get(&descriptor.id) {
                Some(CacheEntry {
                    slot: Slot::Ready(_),
                    ..
                }) => return Ok(()),
                Some(CacheEntry {
                    slot: Slot::Loading(fetch),
                    ..
                }) => fetch.clone(),
                None => {
                    let fetch = self.start_fetch(&descriptor);
                    state.fetches_started += 1;
                    state.entries.insert(
                        descriptor.id.clone(),
                        CacheEntry {
                            slot: Slot::Loading(fetch.clone()),
                            reference_count: 0,
                            last_used_at: Instant::now(),
                        },
                    );
                    fetch
                }
            }
        };
        pending.await?;
        Ok(())
    }

    /// Preloads every critical descriptor concurrently and returns the failures.
    pub async fn preload_critical(&self) -> Vec<(ApplicationId, DesktopError)> {
        let critical = self.registry.critical_apps();
        let results = join_all(critical.iter().map(|id| self.preload(id.as_str()))).await;
        critical
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.err().map(|err| (id, err)))
            .inspect(|(id, err)| tracing::warn!("preload of `{id}` failed: {err}"))
            .collect()
    }

    /// Drops one reference. At zero the module becomes eviction-eligible once its grace period
    /// has passed.
    pub fn release(&self, app_id: &ApplicationId) {
        let mut state = self.inner.borrow_mut();
        if let Some(entry) = state.entries.get_mut(app_id) {
            entry.reference_count = entry.reference_count.saturating_sub(1);
            entry.last_used_at = Instant::now();
        }
    }

    /// Evicts idle modules, least recently used first, and returns the evicted ids.
    ///
    /// Modules with live references, modules still loading, and modules idle for less than the
    /// grace period are never evicted.
    pub fn handle_memory_pressure(&self, pressure: MemoryPressure) -> Vec<ApplicationId> {
        let now = Instant::now();
        let evicted: Vec<ApplicationId> = {
            let mut state = self.inner.borrow_mut();
            let mut eligible: Vec<(Instant, ApplicationId)> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.is_ready()
                        && entry.reference_count == 0
                        && now.duration_since(entry.last_used_at) >= self.grace_period
                })
                .map(|(id, entry)| (entry.last_used_at, id.clone()))
                .collect();
            eligible.sort();
            let budget = match pressure {
                MemoryPressure::Moderate => state.ready_count().saturating_sub(self.soft_limit),
                MemoryPressure::Critical => eligible.len(),
            };
            eligible.truncate(budget);
            for (_, id) in &eligible {
                state.entries.remove(id);
            }
            eligible.into_iter().map(|(_, id)| id).collect()
        };

        for app_id in &evicted {
            tracing::debug!("evicted module `{app_id}` under {pressure:?} memory pressure");
            self.bus.publish_typed(
                MODULE_EVICTED,
                &ModuleEvictedPayload {
                    app_id: app_id.clone(),
                },
            );
        }
        evicted
    }

    /// Explicitly evicts a ready module regardless of its grace period.
    ///
    /// Returns `false` when nothing ready was cached for the id.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::ModuleInUse`] while windows still reference the module.
    pub fn unload(&self, app_id: &str) -> Result<bool, DesktopError> {
        let removed = {
            let mut state = self.inner.borrow_mut();
            let Some((id, entry)) = state.entries.get_key_value(app_id) else {
                return Ok(false);
            };
            if entry.reference_count > 0 {
                return Err(DesktopError::ModuleInUse {
                    app_id: id.clone(),
                    references: entry.reference_count,
                });
            }
            if !entry.is_ready() {
                return Ok(false);
            }
            let id = id.clone();
            state.entries.remove(&id);
            id
        };
        self.bus.publish_typed(
            MODULE_EVICTED,
            &ModuleEvictedPayload { app_id: removed },
        );
        Ok(true)
    }

    /// Number of coalesced fetch operations started (each may retry once).
    pub fn fetch_count(&self) -> usize {
        self.inner.borrow().fetches_started
    }

    pub fn reference_count(&self, app_id: &str) -> Option<usize> {
        self.inner
            .borrow()
            .entries
            .get(app_id)
            .map(|entry| entry.reference_count)
    }

    pub fn is_loading(&self, app_id: &str) -> bool {
        self.inner
            .borrow()
            .entries
            .get(app_id)
            .is_some_and(|entry| !entry.is_ready())
    }

    /// Ready module ids, sorted.
    pub fn cached_ids(&self) -> Vec<ApplicationId> {
        let state = self.inner.borrow();
        let mut ids: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_ready())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn entry(&self, app_id: &str) -> Option<LoadedModule> {
        let state = self.inner.borrow();
        let (id, entry) = state.entries.get_key_value(app_id)?;
        match &entry.slot {
            Slot::Ready(module) => Some(LoadedModule {
                descriptor_id: id.clone(),
                factory: module.clone(),
                reference_count: entry.reference_count,
                last_used_at: entry.last_used_at,
            }),
            Slot::Loading(_) => None,
        }
    }

    fn start_fetch(&self, descriptor: &ApplicationDescriptor) -> FetchFuture {
        let state: Weak<RefCell<LoaderState>> = Rc::downgrade(&self.inner);
        let source = self.source.clone();
        let app_id = descriptor.id.clone();
        let module_ref = descriptor.module_ref.clone();
        let backoff = self.retry_backoff;
        async move {
            let result = fetch_with_retry(source.as_ref(), &app_id, &module_ref, backoff).await;
            if let Some(state) = state.upgrade() {
                state.borrow_mut().settle(&app_id, &result);
            }
            result
        }
        .boxed_local()
        .shared()
    }
}

async fn fetch_with_retry(
    source: &dyn ModuleSource,
    app_id: &ApplicationId,
    module_ref: &str,
    backoff: Duration,
) -> Result<AppModule, ModuleLoadError> {
    let mut attempt = 1;
    loop {
        match source.fetch(module_ref).await {
            Ok(module) => {
                tracing::debug!("fetched module `{module_ref}` for `{app_id}` (attempt {attempt})");
                return Ok(module);
            }
            Err(message) if attempt < MAX_FETCH_ATTEMPTS => {
                tracing::warn!(
                    "fetch of `{module_ref}` for `{app_id}` failed: {message}; retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(message) => {
                return Err(ModuleLoadError {
                    app_id: app_id.clone(),
                    attempts: attempt,
                    message,
                });
            }
        }
    }
}
