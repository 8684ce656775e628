//! Layout persistence: cold-start seed loading and debounced best-effort autosave.

use std::{cell::RefCell, future::Future, rc::Rc, time::Duration};

use platform_host::{DesktopLayout, LayoutStore, DESKTOP_LAYOUT_SCHEMA_VERSION};
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};

use crate::{
    config::RuntimeConfig,
    event_bus::EventBus,
    events::{LayoutSaveFailedPayload, LAYOUT_SAVE_FAILED},
};

fn migrate_layout(layout: DesktopLayout) -> Option<DesktopLayout> {
    match layout.schema_version {
        // Schema zero predates the version field and shares the record shape.
        0 => Some(DesktopLayout::new(layout.windows)),
        DESKTOP_LAYOUT_SCHEMA_VERSION => Some(layout),
        _ => None,
    }
}

/// Loads the persisted layout seed. Backend failures and unknown schemas yield `None`.
pub async fn load_layout_seed(store: &dyn LayoutStore) -> Option<DesktopLayout> {
    match store.load_layout().await {
        Ok(Some(layout)) => {
            let version = layout.schema_version;
            let migrated = migrate_layout(layout);
            if migrated.is_none() {
                tracing::warn!("ignoring persisted layout with unsupported schema {version}");
            }
            migrated
        }
        Ok(None) => None,
        Err(err) => {
            tracing::warn!("layout load failed: {err}");
            None
        }
    }
}

struct AutosaveState {
    pending: Option<DesktopLayout>,
    last_marked_at: Instant,
    drivers: usize,
    warned_detached: bool,
    saves_completed: usize,
}

struct AutosaveShared {
    store: Rc<dyn LayoutStore>,
    bus: EventBus,
    debounce: Duration,
    max_attempts: u32,
    state: RefCell<AutosaveState>,
    wake: Notify,
    /// Held for the whole of a save so writes reach the backend in snapshot order.
    writer: Mutex<()>,
}

impl AutosaveShared {
    /// Saves the newest pending snapshot, if any, once no other save is in flight.
    async fn save_pending(&self) -> bool {
        let _writer = self.writer.lock().await;
        let next = self.state.borrow_mut().pending.take();
        match next {
            Some(layout) => self.save_with_retry(&layout).await,
            None => true,
        }
    }

    async fn save_with_retry(&self, layout: &DesktopLayout) -> bool {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.store.save_layout(layout).await {
                Ok(()) => {
                    self.state.borrow_mut().saves_completed += 1;
                    tracing::debug!(
                        "saved layout with {} window(s) (attempt {attempt})",
                        layout.windows.len()
                    );
                    return true;
                }
                Err(err) => {
                    tracing::warn!("layout save attempt {attempt} failed: {err}");
                    last_error = err;
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.debounce).await;
                    }
                }
            }
        }
        self.bus.publish_typed(
            LAYOUT_SAVE_FAILED,
            &LayoutSaveFailedPayload {
                attempts: self.max_attempts,
                message: last_error,
            },
        );
        false
    }
}

struct DriverGuard(Rc<AutosaveShared>);

impl DriverGuard {
    fn attach(shared: Rc<AutosaveShared>) -> Self {
        shared.state.borrow_mut().drivers += 1;
        Self(shared)
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.state.borrow_mut().drivers -= 1;
    }
}

async fn run_autosave(shared: Rc<AutosaveShared>) {
    let guard = DriverGuard::attach(shared);
    let shared = &guard.0;
    loop {
        while shared.state.borrow().pending.is_none() {
            shared.wake.notified().await;
        }
        loop {
            let deadline = shared.state.borrow().last_marked_at + shared.debounce;
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
        shared.save_pending().await;
    }
}

#[derive(Clone)]
/// Debounced layout sink.
///
/// Every [`LayoutAutosave::mark`] replaces the pending snapshot and restarts the quiet period;
/// only the newest snapshot is written. Debounced saves happen while the future returned by
/// [`LayoutAutosave::run`] is being driven; without it, changes stay pending until
/// [`LayoutAutosave::flush`].
pub struct LayoutAutosave {
    shared: Rc<AutosaveShared>,
}

impl LayoutAutosave {
    pub fn new(store: Rc<dyn LayoutStore>, bus: EventBus, config: &RuntimeConfig) -> Self {
        Self {
            shared: Rc::new(AutosaveShared {
                store,
                bus,
                debounce: config.autosave_debounce(),
                max_attempts: config.autosave_max_attempts.max(1),
                state: RefCell::new(AutosaveState {
                    pending: None,
                    last_marked_at: Instant::now(),
                    drivers: 0,
                    warned_detached: false,
                    saves_completed: 0,
                }),
                wake: Notify::new(),
                writer: Mutex::new(()),
            }),
        }
    }

    /// Background saver. Never completes; spawn it on a local task or drop it to stop saving.
    pub fn run(&self) -> impl Future<Output = ()> + 'static {
        run_autosave(self.shared.clone())
    }

    /// Queues `layout` for saving after the debounce window.
    pub fn mark(&self, layout: DesktopLayout) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.pending = Some(layout);
            state.last_marked_at = Instant::now();
            if state.drivers == 0 && !state.warned_detached {
                state.warned_detached = true;
                tracing::warn!("layout autosave is not running; changes stay pending until flush");
            }
        }
        self.shared.wake.notify_one();
    }

    /// Writes the pending snapshot now, bypassing the debounce. A save already in flight finishes
    /// first. Returns `false` when every attempt failed.
    pub async fn flush(&self) -> bool {
        self.shared.save_pending().await
    }

    pub fn has_pending(&self) -> bool {
        self.shared.state.borrow().pending.is_some()
    }

    /// Whether a [`LayoutAutosave::run`] future is currently alive.
    pub fn is_running(&self) -> bool {
        self.shared.state.borrow().drivers > 0
    }

    /// Successful saves so far.
    pub fn saves_completed(&self) -> usize {
        self.shared.state.borrow().saves_completed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use desktop_app_contract::WindowRect;
    use platform_host::{
        LayoutStoreFuture, MemoryLayoutStore, PersistedWindow, PersistedWindowState,
    };
    use pretty_assertions::assert_eq;
    use tokio::task::LocalSet;

    use super::*;

    fn layout_with(descriptor_id: &str) -> DesktopLayout {
        DesktopLayout::new(vec![PersistedWindow {
            descriptor_id: descriptor_id.to_string(),
            geometry: WindowRect::default(),
            state: PersistedWindowState::Normal,
        }])
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            autosave_debounce_ms: 100,
            autosave_max_attempts: 2,
            ..RuntimeConfig::default()
        }
    }

    fn autosave(store: &MemoryLayoutStore, bus: &EventBus) -> LayoutAutosave {
        LayoutAutosave::new(Rc::new(store.clone()), bus.clone(), &config())
    }

    /// Store whose saves take the next queued latency to land.
    #[derive(Default)]
    struct LaggyStore {
        latencies: RefCell<VecDeque<Duration>>,
        written: RefCell<Vec<DesktopLayout>>,
    }

    impl LayoutStore for LaggyStore {
        fn load_layout(&self) -> LayoutStoreFuture<'_, Result<Option<DesktopLayout>, String>> {
            Box::pin(async { Ok(None) })
        }

        fn save_layout<'a>(
            &'a self,
            layout: &'a DesktopLayout,
        ) -> LayoutStoreFuture<'a, Result<(), String>> {
            Box::pin(async move {
                let latency = self.latencies.borrow_mut().pop_front().unwrap_or_default();
                tokio::time::sleep(latency).await;
                self.written.borrow_mut().push(layout.clone());
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_of_changes_collapse_into_one_save_of_the_newest_layout() {
        let store = MemoryLayoutStore::default();
        let bus = EventBus::new(8);
        let autosave = autosave(&store, &bus);

        LocalSet::new()
            .run_until(async {
                tokio::task::spawn_local(autosave.run());
                tokio::task::yield_now().await;
                assert!(autosave.is_running());

                autosave.mark(layout_with("calc"));
                tokio::time::sleep(Duration::from_millis(60)).await;
                autosave.mark(layout_with("notes"));
                tokio::time::sleep(Duration::from_millis(60)).await;
                assert_eq!(store.save_attempts(), 0, "debounce restarted by second mark");

                tokio::time::sleep(Duration::from_millis(100)).await;
            })
            .await;

        assert_eq!(store.save_attempts(), 1);
        assert_eq!(store.current(), Some(layout_with("notes")));
        assert_eq!(autosave.saves_completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_publish_layout_save_failed() {
        let store = MemoryLayoutStore::default();
        store.fail_next_saves(5);
        let bus = EventBus::new(8);
        let failures = Rc::new(RefCell::new(Vec::new()));
        {
            let failures = failures.clone();
            bus.subscribe(LAYOUT_SAVE_FAILED, None, move |event| {
                failures
                    .borrow_mut()
                    .push(event.payload_as::<LayoutSaveFailedPayload>()?);
                Ok(())
            });
        }
        let autosave = autosave(&store, &bus);

        LocalSet::new()
            .run_until(async {
                tokio::task::spawn_local(autosave.run());
                autosave.mark(layout_with("calc"));
                tokio::time::sleep(Duration::from_secs(1)).await;
            })
            .await;

        assert_eq!(store.save_attempts(), 2);
        assert_eq!(
            *failures.borrow(),
            vec![LayoutSaveFailedPayload {
                attempts: 2,
                message: "layout backend unavailable".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_saves_immediately() {
        let store = MemoryLayoutStore::default();
        let autosave = autosave(&store, &EventBus::new(8));

        LocalSet::new()
            .run_until(async {
                tokio::task::spawn_local(autosave.run());
                autosave.mark(layout_with("calc"));
                assert!(autosave.flush().await);
                assert!(!autosave.has_pending());
            })
            .await;

        assert_eq!(store.current(), Some(layout_with("calc")));
    }

    #[tokio::test(start_paused = true)]
    async fn marks_without_a_running_saver_stay_pending_until_flush() {
        let store = MemoryLayoutStore::default();
        let autosave = autosave(&store, &EventBus::new(8));
        assert!(!autosave.is_running());

        autosave.mark(layout_with("calc"));
        autosave.mark(layout_with("notes"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.save_attempts(), 0);
        assert!(autosave.has_pending());

        assert!(autosave.flush().await);
        assert_eq!(store.current(), Some(layout_with("notes")));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_during_a_slow_debounced_save_lands_last() {
        let store = Rc::new(LaggyStore::default());
        store
            .latencies
            .borrow_mut()
            .extend([Duration::from_millis(50), Duration::ZERO]);
        let autosave = LayoutAutosave::new(store.clone(), EventBus::new(8), &config());

        LocalSet::new()
            .run_until(async {
                tokio::task::spawn_local(autosave.run());
                autosave.mark(layout_with("calc"));
                // Past the debounce: the saver is now waiting on the slow write.
                tokio::time::sleep(Duration::from_millis(120)).await;
                autosave.mark(layout_with("notes"));
                assert!(autosave.flush().await);
                tokio::time::sleep(Duration::from_secs(1)).await;
            })
            .await;

        assert_eq!(
            *store.written.borrow(),
            vec![layout_with("calc"), layout_with("notes")]
        );
        assert_eq!(autosave.saves_completed(), 2);
    }

    #[tokio::test]
    async fn seed_loading_migrates_schema_zero_and_drops_unknown_versions() {
        let mut legacy = layout_with("calc");
        legacy.schema_version = 0;
        let store = MemoryLayoutStore::seeded(legacy);
        assert_eq!(
            load_layout_seed(&store).await,
            Some(layout_with("calc"))
        );

        let mut future = layout_with("calc");
        future.schema_version = 99;
        assert_eq!(load_layout_seed(&MemoryLayoutStore::seeded(future)).await, None);
        assert_eq!(load_layout_seed(&MemoryLayoutStore::default()).await, None);
    }
}
