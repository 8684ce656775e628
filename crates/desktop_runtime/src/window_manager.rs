//! Window lifecycle, stacking order, and focus.
//!
//! Windows live in a vector in stacking order (bottom first) and `z_index` is always the 1-based
//! position, so compaction after a close keeps relative order. The manager is the only writer of
//! window records and of the focused-window cell.

use std::{
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
    time::Duration,
};

use desktop_app_contract::{
    AppInstance, AppMountContext, ApplicationId, OptionalHooks, TeamContext, WindowFrame,
    WindowId, WindowRect,
};
use futures::{future::join_all, FutureExt};
use platform_host::{unix_time_ms_now, DesktopLayout, PersistedWindow, PersistedWindowState};

use crate::{
    config::RuntimeConfig,
    error::DesktopError,
    event_bus::EventBus,
    events::{
        LaunchFailedPayload, TeamSwitchedPayload, TeardownOutcome, WindowClosedPayload,
        WindowCreatedPayload, WindowFocusedPayload, WindowGeometryChangedPayload,
        WindowStateChangedPayload, APP_LAUNCH_FAILED, TEAM_SWITCHED, WINDOW_CLOSED,
        WINDOW_CREATED, WINDOW_FOCUSED, WINDOW_GEOMETRY_CHANGED, WINDOW_STATE_CHANGED,
    },
    loader::ModuleLoader,
    model::{LaunchId, PendingLaunch, WindowInstance, WindowOptions, WindowState},
    persistence::LayoutAutosave,
    registry::AppRegistry,
};

/// Cascade step for windows opened without an explicit position.
pub const CASCADE_STEP: i32 = 20;
const CASCADE_SLOTS: u64 = 8;

type InstanceCell = Rc<RefCell<Box<dyn AppInstance>>>;

struct ManagedWindow {
    record: WindowInstance,
    instance: InstanceCell,
    hooks: OptionalHooks,
}

struct ManagerState {
    windows: Vec<ManagedWindow>,
    next_window_id: u64,
    next_launch_id: u64,
    pending: Vec<PendingLaunch>,
    team: TeamContext,
    /// Incoming context while a team switch is tearing windows down.
    switching_to: Option<TeamContext>,
    viewport: WindowRect,
}

impl ManagerState {
    fn index_of(&self, window_id: WindowId) -> Option<usize> {
        self.windows
            .iter()
            .position(|w| w.record.window_id == window_id)
    }

    fn find(&self, window_id: WindowId) -> Option<&ManagedWindow> {
        self.windows
            .iter()
            .find(|w| w.record.window_id == window_id)
    }

    /// Context new launches are checked against.
    fn launch_team(&self) -> &TeamContext {
        self.switching_to.as_ref().unwrap_or(&self.team)
    }

    fn focused_id(&self) -> Option<WindowId> {
        self.windows
            .iter()
            .find(|w| w.record.focused)
            .map(|w| w.record.window_id)
    }
}

/// Renumbers z-indices from stack position and enforces the single-focus rule.
fn normalize_window_stack(windows: &mut [ManagedWindow]) {
    let mut has_focused = false;
    for (idx, window) in windows.iter_mut().enumerate() {
        let record = &mut window.record;
        record.z_index = (idx + 1) as u32;
        if record.state == WindowState::Minimized || !record.state.accepts_transitions() {
            record.focused = false;
        }
        if record.focused {
            if has_focused {
                record.focused = false;
            } else {
                has_focused = true;
            }
        }
    }
}

/// Hands focus to the topmost visible window when nothing holds it.
fn focus_topmost(windows: &mut [ManagedWindow]) {
    if windows.iter().any(|w| w.record.focused) {
        return;
    }
    if let Some(top) = windows.iter_mut().rev().find(|w| {
        matches!(
            w.record.state,
            WindowState::Normal | WindowState::Maximized
        )
    }) {
        top.record.focused = true;
    }
}

/// Raises the window at `index` to the top of the stack and focuses it.
fn focus_window_internal(windows: &mut Vec<ManagedWindow>, index: usize) {
    for window in windows.iter_mut() {
        window.record.focused = false;
    }
    let mut window = windows.remove(index);
    window.record.focused = true;
    windows.push(window);
    normalize_window_stack(windows);
}

fn dispatch_hook<F>(window_id: WindowId, instance: &InstanceCell, hook: &'static str, call: F)
where
    F: FnOnce(&mut dyn AppInstance),
{
    let Ok(mut app) = instance.try_borrow_mut() else {
        tracing::warn!("skipping {hook} for window {window_id}: instance is busy");
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| call(&mut **app))).is_err() {
        tracing::warn!("{hook} hook for window {window_id} panicked");
    }
}

enum Outcome {
    Unchanged,
    Changed { raise: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of a completed close.
pub struct CloseReport {
    pub window_id: WindowId,
    pub app_id: ApplicationId,
    pub teardown: TeardownOutcome,
}

#[derive(Clone)]
/// Shared handle to the set of live windows.
pub struct WindowManager {
    inner: Rc<RefCell<ManagerState>>,
    bus: EventBus,
    registry: AppRegistry,
    loader: ModuleLoader,
    teardown_timeout: Duration,
    max_restore_windows: usize,
    autosave: Option<LayoutAutosave>,
}

impl WindowManager {
    pub fn new(
        bus: EventBus,
        registry: AppRegistry,
        loader: ModuleLoader,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ManagerState {
                windows: Vec::new(),
                next_window_id: 1,
                next_launch_id: 1,
                pending: Vec::new(),
                team: TeamContext::default(),
                switching_to: None,
                viewport: config.viewport,
            })),
            bus,
            registry,
            loader,
            teardown_timeout: config.teardown_timeout(),
            max_restore_windows: config.max_restore_windows,
            autosave: None,
        }
    }

    /// Routes every layout change to `autosave`.
    pub fn with_autosave(mut self, autosave: LayoutAutosave) -> Self {
        self.autosave = Some(autosave);
        self
    }

    /// Opens a window for `app_id` and returns its id.
    ///
    /// Singleton descriptors with a live window focus that window instead and return its id.
    /// Every failure except an aborted launch is also published as `app:launch-failed`; no window
    /// is registered unless mount succeeded.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotPermitted`, `ModuleLoad`, `MountFailed`, `LaunchAborted`, or
    /// `InvalidTransition` when a singleton's only window is closing.
    pub async fn create_window(
        &self,
        app_id: &str,
        options: WindowOptions,
    ) -> Result<WindowId, DesktopError> {
        let result = self.try_create_window(app_id, options).await;
        if let Err(err) = &result {
            if !matches!(err, DesktopError::LaunchAborted(_)) {
                self.report_launch_failure(app_id, err);
            }
        }
        result
    }

    async fn try_create_window(
        &self,
        app_id: &str,
        options: WindowOptions,
    ) -> Result<WindowId, DesktopError> {
        let descriptor = self.registry.get(app_id)?;
        if !self
            .registry
            .is_available_for(&descriptor, &self.launch_team())
        {
            return Err(DesktopError::NotPermitted(descriptor.id.clone()));
        }
        if descriptor.single_instance {
            if let Some(existing) = self.live_window_for(&descriptor.id) {
                self.focus(existing)?;
                return Ok(existing);
            }
        }

        let launch_id = self.begin_launch(&descriptor.id);
        let loaded = self.loader.load(descriptor.id.as_str()).await;
        if self.finish_launch(launch_id) {
            // abort_launch already gave the reference back.
            return Err(DesktopError::LaunchAborted(descriptor.id.clone()));
        }
        let loaded = loaded?;

        // The team or a sibling launch may have changed things while the module loaded.
        let team = self.launch_team();
        if !self.registry.is_available_for(&descriptor, &team) {
            self.loader.release(&descriptor.id);
            return Err(DesktopError::NotPermitted(descriptor.id.clone()));
        }
        if descriptor.single_instance {
            if let Some(existing) = self.live_window_for(&descriptor.id) {
                self.loader.release(&descriptor.id);
                self.focus(existing)?;
                return Ok(existing);
            }
        }

        let window_id = {
            let mut state = self.inner.borrow_mut();
            let id = WindowId(state.next_window_id);
            state.next_window_id += 1;
            id
        };
        let defaults = descriptor.default_window;
        let min_size = defaults.min_size();
        let cascade = ((window_id.0 - 1) % CASCADE_SLOTS) as i32 * CASCADE_STEP;
        let geometry = options
            .merged_rect(defaults.rect, cascade)
            .clamped_min(min_size.0, min_size.1);
        let title = options
            .title
            .unwrap_or_else(|| descriptor.display_name.clone());

        let frame = WindowFrame {
            window_id,
            app_id: descriptor.id.clone(),
            title: title.clone(),
            rect: geometry,
        };
        let context = AppMountContext {
            app_id: descriptor.id.clone(),
            window_id,
            launch_params: options.launch_params,
            team: team.clone(),
        };
        let mut instance = loaded.factory.instantiate();
        let mounted = catch_unwind(AssertUnwindSafe(|| instance.on_mount(&frame, &context)));
        let mount_error = match mounted {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.message),
            Err(_) => Some("on_mount panicked".to_string()),
        };
        if let Some(message) = mount_error {
            self.loader.release(&descriptor.id);
            return Err(DesktopError::MountFailed {
                app_id: descriptor.id.clone(),
                message,
            });
        }
        let hooks = instance.optional_hooks();

        let (previous, z_index) = {
            let mut state = self.inner.borrow_mut();
            let previous = state.focused_id();
            for window in state.windows.iter_mut() {
                window.record.focused = false;
            }
            state.windows.push(ManagedWindow {
                record: WindowInstance {
                    window_id,
                    descriptor_id: descriptor.id.clone(),
                    owner_team_id: if descriptor.team_scoped {
                        team.team_id.clone()
                    } else {
                        None
                    },
                    title: title.clone(),
                    z_index: 0,
                    geometry,
                    restore_geometry: None,
                    state: WindowState::Normal,
                    pre_minimize_state: WindowState::Normal,
                    focused: true,
                    resizable: defaults.resizable,
                    min_size,
                    created_at_unix_ms: unix_time_ms_now(),
                },
                instance: Rc::new(RefCell::new(instance)),
                hooks,
            });
            normalize_window_stack(&mut state.windows);
            (previous, state.windows.len() as u32)
        };

        tracing::debug!("created window {window_id} for `{}`", descriptor.id);
        self.bus.publish_typed(
            WINDOW_CREATED,
            &WindowCreatedPayload {
                window_id,
                app_id: descriptor.id.clone(),
                title,
                z_index,
            },
        );
        self.settle_focus(previous);
        self.mark_layout_dirty();
        Ok(window_id)
    }

    fn report_launch_failure(&self, app_id: &str, err: &DesktopError) {
        let display_name = self
            .registry
            .get(app_id)
            .map(|descriptor| descriptor.display_name.clone())
            .unwrap_or_else(|_| app_id.to_string());
        tracing::warn!("launch of `{app_id}` failed: {err}");
        self.bus.publish_typed(
            APP_LAUNCH_FAILED,
            &LaunchFailedPayload {
                app_id: app_id.to_string(),
                display_name,
                kind: err.kind().to_string(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            },
        );
    }

    fn live_window_for(&self, app_id: &ApplicationId) -> Option<WindowId> {
        self.inner
            .borrow()
            .windows
            .iter()
            .find(|w| &w.record.descriptor_id == app_id)
            .map(|w| w.record.window_id)
    }

    fn begin_launch(&self, app_id: &ApplicationId) -> LaunchId {
        let mut state = self.inner.borrow_mut();
        let launch_id = LaunchId(state.next_launch_id);
        state.next_launch_id += 1;
        state.pending.push(PendingLaunch {
            launch_id,
            app_id: app_id.clone(),
            aborted: false,
        });
        launch_id
    }

    /// Drops the pending entry and reports whether it was aborted meanwhile.
    fn finish_launch(&self, launch_id: LaunchId) -> bool {
        let mut state = self.inner.borrow_mut();
        match state.pending.iter().position(|p| p.launch_id == launch_id) {
            Some(index) => state.pending.remove(index).aborted,
            None => false,
        }
    }

    /// Launches still waiting on their module.
    pub fn pending_launches(&self) -> Vec<PendingLaunch> {
        self.inner
            .borrow()
            .pending
            .iter()
            .filter(|p| !p.aborted)
            .cloned()
            .collect()
    }

    /// Abandons a pending launch: its module reference is released now and the loaded module is
    /// discarded instead of mounted. Returns `false` for unknown or already aborted launches.
    pub fn abort_launch(&self, launch_id: LaunchId) -> bool {
        let app_id = {
            let mut state = self.inner.borrow_mut();
            let Some(pending) = state
                .pending
                .iter_mut()
                .find(|p| p.launch_id == launch_id && !p.aborted)
            else {
                return false;
            };
            pending.aborted = true;
            pending.app_id.clone()
        };
        tracing::debug!("aborted pending launch {launch_id:?} of `{app_id}`");
        self.loader.release(&app_id);
        true
    }

    /// Raises `window_id` above every other window and focuses it, restoring it when minimized.
    ///
    /// # Errors
    ///
    /// `WindowNotFound`, or `InvalidTransition` for a closing window.
    pub fn focus(&self, window_id: WindowId) -> Result<(), DesktopError> {
        let (previous, restored, raised) = {
            let mut state = self.inner.borrow_mut();
            let index = state
                .index_of(window_id)
                .ok_or(DesktopError::WindowNotFound(window_id))?;
            let top = state.windows.len() == index + 1;
            let record = &mut state.windows[index].record;
            if !record.state.accepts_transitions() {
                return Err(DesktopError::InvalidTransition {
                    window_id,
                    from: record.state,
                    action: "focus",
                });
            }
            if top && record.focused {
                return Ok(());
            }
            let restored = (record.state == WindowState::Minimized).then(|| {
                let to = record.pre_minimize_state;
                record.state = to;
                record.pre_minimize_state = WindowState::Normal;
                to
            });
            let previous = state.focused_id();
            focus_window_internal(&mut state.windows, index);
            (previous, restored, !top)
        };

        if let Some(to) = restored {
            self.publish_state_change(window_id, WindowState::Minimized, to);
        }
        self.settle_focus(previous);
        // The persisted layout records stacking order.
        if raised || restored.is_some() {
            self.mark_layout_dirty();
        }
        Ok(())
    }

    /// Gives focus to the desktop itself: no window is focused afterwards.
    pub fn focus_desktop(&self) {
        let previous = {
            let mut state = self.inner.borrow_mut();
            let previous = state.focused_id();
            for window in state.windows.iter_mut() {
                window.record.focused = false;
            }
            previous
        };
        self.settle_focus(previous);
    }

    /// # Errors
    ///
    /// `WindowNotFound`, or `InvalidTransition` for a closing window.
    pub fn minimize(&self, window_id: WindowId) -> Result<(), DesktopError> {
        self.transition(window_id, "minimize", |window, _| match window.state {
            WindowState::Minimized => Ok(Outcome::Unchanged),
            from => {
                window.pre_minimize_state = from;
                window.state = WindowState::Minimized;
                Ok(Outcome::Changed { raise: false })
            }
        })
    }

    /// Fills the viewport, remembering the current rect for [`WindowManager::restore`].
    ///
    /// # Errors
    ///
    /// `WindowNotFound`, or `InvalidTransition` for closing or non-resizable windows.
    pub fn maximize(&self, window_id: WindowId) -> Result<(), DesktopError> {
        self.transition(window_id, "maximize", |window, viewport| {
            if !window.resizable {
                return Err(());
            }
            let filled = viewport.clamped_min(window.min_size.0, window.min_size.1);
            match window.state {
                WindowState::Maximized => Ok(Outcome::Unchanged),
                WindowState::Normal => {
                    window.restore_geometry = Some(window.geometry);
                    window.geometry = filled;
                    window.state = WindowState::Maximized;
                    Ok(Outcome::Changed { raise: true })
                }
                WindowState::Minimized => {
                    if window.pre_minimize_state == WindowState::Normal {
                        window.restore_geometry = Some(window.geometry);
                    }
                    window.geometry = filled;
                    window.state = WindowState::Maximized;
                    window.pre_minimize_state = WindowState::Normal;
                    Ok(Outcome::Changed { raise: true })
                }
                WindowState::Closing | WindowState::Closed => Err(()),
            }
        })
    }

    /// Leaves the minimized or maximized state.
    ///
    /// A minimized window returns to the state it was minimized from; a maximized one gets its
    /// stored pre-maximize rect back.
    ///
    /// # Errors
    ///
    /// `WindowNotFound`, or `InvalidTransition` for a closing window.
    pub fn restore(&self, window_id: WindowId) -> Result<(), DesktopError> {
        self.transition(window_id, "restore", |window, _| match window.state {
            WindowState::Normal => Ok(Outcome::Unchanged),
            WindowState::Maximized => {
                window.geometry = window.restore_geometry.take().unwrap_or(window.geometry);
                window.state = WindowState::Normal;
                Ok(Outcome::Changed { raise: false })
            }
            WindowState::Minimized => {
                window.state = window.pre_minimize_state;
                window.pre_minimize_state = WindowState::Normal;
                Ok(Outcome::Changed { raise: true })
            }
            WindowState::Closing | WindowState::Closed => Err(()),
        })
    }

    /// Moves and resizes a normal window. Size is clamped to the window's minimum; non-resizable
    /// windows only move.
    ///
    /// # Errors
    ///
    /// `WindowNotFound`, or `InvalidTransition` unless the window is in the normal state.
    pub fn set_geometry(&self, window_id: WindowId, rect: WindowRect) -> Result<(), DesktopError> {
        self.transition(window_id, "set geometry", |window, _| {
            if window.state != WindowState::Normal {
                return Err(());
            }
            let next = if window.resizable {
                rect.clamped_min(window.min_size.0, window.min_size.1)
            } else {
                WindowRect {
                    w: window.geometry.w,
                    h: window.geometry.h,
                    ..rect
                }
            };
            if next == window.geometry {
                return Ok(Outcome::Unchanged);
            }
            window.geometry = next;
            Ok(Outcome::Changed { raise: false })
        })
    }

    fn transition<F>(
        &self,
        window_id: WindowId,
        action: &'static str,
        apply: F,
    ) -> Result<(), DesktopError>
    where
        F: FnOnce(&mut WindowInstance, WindowRect) -> Result<Outcome, ()>,
    {
        let (previous, from, to, geometry) = {
            let mut state = self.inner.borrow_mut();
            let viewport = state.viewport;
            let previous = state.focused_id();
            let index = state
                .index_of(window_id)
                .ok_or(DesktopError::WindowNotFound(window_id))?;
            let record = &mut state.windows[index].record;
            let from = record.state;
            if !from.accepts_transitions() {
                return Err(DesktopError::InvalidTransition {
                    window_id,
                    from,
                    action,
                });
            }
            let was_focused = record.focused;
            let before = record.geometry;
            let outcome = apply(record, viewport).map_err(|()| DesktopError::InvalidTransition {
                window_id,
                from,
                action,
            })?;
            let to = record.state;
            let geometry = (record.geometry != before).then_some(record.geometry);
            match outcome {
                Outcome::Unchanged => return Ok(()),
                Outcome::Changed { raise: true } => {
                    focus_window_internal(&mut state.windows, index);
                }
                Outcome::Changed { raise: false } => {
                    normalize_window_stack(&mut state.windows);
                    if was_focused {
                        focus_topmost(&mut state.windows);
                    }
                }
            }
            (previous, from, to, geometry)
        };

        if from != to {
            self.publish_state_change(window_id, from, to);
        }
        if let Some(geometry) = geometry {
            self.bus.publish_typed(
                WINDOW_GEOMETRY_CHANGED,
                &WindowGeometryChangedPayload {
                    window_id,
                    geometry,
                },
            );
        }
        self.settle_focus(previous);
        self.mark_layout_dirty();
        Ok(())
    }

    fn publish_state_change(&self, window_id: WindowId, from: WindowState, to: WindowState) {
        self.bus.publish_typed(
            WINDOW_STATE_CHANGED,
            &WindowStateChangedPayload {
                window_id,
                from,
                to,
            },
        );
    }

    /// Runs blur/focus hooks and publishes `window:focused` when the holder changed.
    fn settle_focus(&self, previous: Option<WindowId>) {
        let (current, blur, focus, z_index) = {
            let state = self.inner.borrow();
            let current = state.focused_id();
            if current == previous {
                return;
            }
            let blur = previous
                .and_then(|id| state.find(id))
                .filter(|w| w.hooks.blur && w.record.state.accepts_transitions())
                .map(|w| w.instance.clone());
            let focused = current.and_then(|id| state.find(id));
            let focus = focused
                .filter(|w| w.hooks.focus)
                .map(|w| w.instance.clone());
            let z_index = focused.map_or(0, |w| w.record.z_index);
            (current, blur, focus, z_index)
        };

        if let (Some(previous), Some(instance)) = (previous, blur) {
            dispatch_hook(previous, &instance, "on_blur", |app| app.on_blur());
        }
        if let Some(window_id) = current {
            if let Some(instance) = focus {
                dispatch_hook(window_id, &instance, "on_focus", |app| app.on_focus());
            }
            self.bus.publish_typed(
                WINDOW_FOCUSED,
                &WindowFocusedPayload {
                    window_id,
                    previous,
                    z_index,
                },
            );
        }
    }

    /// Closes a window: teardown (bounded by the configured timeout), subscription cleanup,
    /// removal, and z-order compaction. Teardown failures and timeouts are logged and reported in
    /// the [`CloseReport`], never returned as errors.
    ///
    /// # Errors
    ///
    /// `WindowNotFound`, or `InvalidTransition` when the window is already closing.
    pub async fn close(&self, window_id: WindowId) -> Result<CloseReport, DesktopError> {
        let (previous, from, app_id, instance) = {
            let mut state = self.inner.borrow_mut();
            let previous = state.focused_id();
            let index = state
                .index_of(window_id)
                .ok_or(DesktopError::WindowNotFound(window_id))?;
            let managed = &mut state.windows[index];
            let from = managed.record.state;
            if !from.accepts_transitions() {
                return Err(DesktopError::InvalidTransition {
                    window_id,
                    from,
                    action: "close",
                });
            }
            let was_focused = managed.record.focused;
            managed.record.state = WindowState::Closing;
            managed.record.focused = false;
            let app_id = managed.record.descriptor_id.clone();
            let instance = managed.instance.clone();
            normalize_window_stack(&mut state.windows);
            if was_focused {
                focus_topmost(&mut state.windows);
            }
            (previous, from, app_id, instance)
        };
        self.publish_state_change(window_id, from, WindowState::Closing);
        self.settle_focus(previous);

        let teardown = self.run_teardown(window_id, &instance).await;
        drop(instance);

        let dropped = self.bus.unsubscribe_owner(window_id);
        {
            let mut state = self.inner.borrow_mut();
            state.windows.retain(|w| w.record.window_id != window_id);
            normalize_window_stack(&mut state.windows);
        }
        self.loader.release(&app_id);

        tracing::debug!(
            "closed window {window_id} (`{app_id}`, teardown {teardown:?}, {dropped} subscription(s) dropped)"
        );
        self.bus.publish_typed(
            WINDOW_CLOSED,
            &WindowClosedPayload {
                window_id,
                app_id: app_id.clone(),
                teardown,
            },
        );
        self.mark_layout_dirty();
        Ok(CloseReport {
            window_id,
            app_id,
            teardown,
        })
    }

    async fn run_teardown(&self, window_id: WindowId, instance: &InstanceCell) -> TeardownOutcome {
        let unmount = match instance.try_borrow_mut() {
            Ok(mut app) => catch_unwind(AssertUnwindSafe(|| app.on_unmount())),
            Err(_) => {
                tracing::warn!("window {window_id} instance is busy; skipping on_unmount");
                return TeardownOutcome::Failed;
            }
        };
        let Ok(unmount) = unmount else {
            tracing::warn!("on_unmount for window {window_id} panicked");
            return TeardownOutcome::Failed;
        };

        let bounded = tokio::time::timeout(
            self.teardown_timeout,
            AssertUnwindSafe(unmount).catch_unwind(),
        );
        match bounded.await {
            Ok(Ok(Ok(()))) => TeardownOutcome::Completed,
            Ok(Ok(Err(err))) => {
                tracing::warn!("on_unmount for window {window_id} failed: {err}");
                TeardownOutcome::Failed
            }
            Ok(Err(_)) => {
                tracing::warn!("on_unmount for window {window_id} panicked");
                TeardownOutcome::Failed
            }
            Err(_) => {
                let err = DesktopError::TeardownTimeout {
                    window_id,
                    timeout_ms: self.teardown_timeout.as_millis() as u64,
                };
                tracing::warn!("{err}; forcing close");
                TeardownOutcome::TimedOut
            }
        }
    }

    /// Applies a new team context.
    ///
    /// Team-scoped windows that are not valid for `context` are closed through the normal close
    /// path before the context changes. Launches that land during the teardown are checked
    /// against `context`, and anything still invalid afterwards is closed before the switch is
    /// announced. Surviving windows that declared the hook are notified.
    pub async fn switch_team(&self, context: TeamContext) -> Vec<CloseReport> {
        let previous_team = {
            let mut state = self.inner.borrow_mut();
            state.switching_to = Some(context.clone());
            state.team.team_id.clone()
        };

        let mut reports: Vec<CloseReport> = Vec::new();
        loop {
            let doomed = self.invalid_windows_for(&context);
            if doomed.is_empty() {
                break;
            }
            reports.extend(
                join_all(doomed.iter().map(|id| self.close(*id)))
                    .await
                    .into_iter()
                    .filter_map(Result::ok),
            );
        }

        let survivors: Vec<(WindowId, InstanceCell)> = {
            let mut state = self.inner.borrow_mut();
            state.team = context.clone();
            // A later switch may have started while this one was closing windows.
            if state.switching_to.as_ref() == Some(&context) {
                state.switching_to = None;
            }
            state
                .windows
                .iter()
                .filter(|w| w.hooks.team_context && w.record.state.accepts_transitions())
                .map(|w| (w.record.window_id, w.instance.clone()))
                .collect()
        };
        for (window_id, instance) in survivors {
            dispatch_hook(window_id, &instance, "on_team_context_changed", |app| {
                app.on_team_context_changed(&context)
            });
        }

        tracing::debug!(
            "switched team {:?} -> {:?}, closed {} window(s)",
            previous_team,
            context.team_id,
            reports.len()
        );
        self.bus.publish_typed(
            TEAM_SWITCHED,
            &TeamSwitchedPayload {
                previous_team,
                team: context.team_id.clone(),
                closed_windows: reports.iter().map(|r| r.window_id).collect(),
            },
        );
        reports
    }

    /// Open team-scoped windows that `context` does not permit.
    fn invalid_windows_for(&self, context: &TeamContext) -> Vec<WindowId> {
        let candidates: Vec<(WindowId, ApplicationId)> = self
            .inner
            .borrow()
            .windows
            .iter()
            .filter(|w| w.record.state.accepts_transitions())
            .map(|w| (w.record.window_id, w.record.descriptor_id.clone()))
            .collect();
        candidates
            .into_iter()
            .filter(|(_, app_id)| {
                self.registry
                    .get(app_id.as_str())
                    .is_ok_and(|d| d.team_scoped && !self.registry.is_valid_for_team(&d, context))
            })
            .map(|(window_id, _)| window_id)
            .collect()
    }

    /// Sets the context without closing anything. Used before any window exists.
    pub(crate) fn set_team_context(&self, context: TeamContext) {
        self.inner.borrow_mut().team = context;
    }

    pub fn team_context(&self) -> TeamContext {
        self.inner.borrow().team.clone()
    }

    fn launch_team(&self) -> TeamContext {
        self.inner.borrow().launch_team().clone()
    }

    pub fn viewport(&self) -> WindowRect {
        self.inner.borrow().viewport
    }

    /// Updates the maximize area and refits maximized windows.
    pub fn set_viewport(&self, viewport: WindowRect) {
        let refit: Vec<(WindowId, WindowRect)> = {
            let mut state = self.inner.borrow_mut();
            state.viewport = viewport;
            state
                .windows
                .iter_mut()
                .filter(|w| w.record.state == WindowState::Maximized)
                .map(|w| {
                    let (min_w, min_h) = w.record.min_size;
                    w.record.geometry = viewport.clamped_min(min_w, min_h);
                    (w.record.window_id, w.record.geometry)
                })
                .collect()
        };
        for (window_id, geometry) in refit {
            self.bus.publish_typed(
                WINDOW_GEOMETRY_CHANGED,
                &WindowGeometryChangedPayload {
                    window_id,
                    geometry,
                },
            );
        }
    }

    /// Live windows in stacking order, bottom first.
    pub fn windows(&self) -> Vec<WindowInstance> {
        self.inner
            .borrow()
            .windows
            .iter()
            .map(|w| w.record.clone())
            .collect()
    }

    pub fn window(&self, window_id: WindowId) -> Option<WindowInstance> {
        self.inner
            .borrow()
            .find(window_id)
            .map(|w| w.record.clone())
    }

    pub fn focused_window(&self) -> Option<WindowId> {
        self.inner.borrow().focused_id()
    }

    /// Persistable view of the desktop; closing windows are left out.
    pub fn layout_snapshot(&self) -> DesktopLayout {
        let state = self.inner.borrow();
        DesktopLayout::new(
            state
                .windows
                .iter()
                .filter_map(|w| {
                    w.record.state.persisted().map(|persisted| PersistedWindow {
                        descriptor_id: w.record.descriptor_id.to_string(),
                        geometry: w.record.resting_geometry(),
                        state: persisted,
                    })
                })
                .collect(),
        )
    }

    /// Reopens windows from a persisted layout, bottom-most first.
    ///
    /// Entries whose descriptor is gone or not available in the current context are skipped, and
    /// at most `max_restore_windows` windows are opened. Returns the restored window ids.
    pub async fn restore_layout(&self, layout: &DesktopLayout) -> Vec<WindowId> {
        let team = self.launch_team();
        let mut restored = Vec::new();
        for entry in &layout.windows {
            if restored.len() >= self.max_restore_windows {
                tracing::debug!("restore limit of {} window(s) reached", self.max_restore_windows);
                break;
            }
            let available = self
                .registry
                .get(&entry.descriptor_id)
                .is_ok_and(|d| self.registry.is_available_for(&d, &team));
            if !available {
                tracing::debug!("skipping persisted window for `{}`", entry.descriptor_id);
                continue;
            }
            let options = WindowOptions::default().with_rect(entry.geometry);
            let window_id = match self.create_window(&entry.descriptor_id, options).await {
                Ok(window_id) => window_id,
                Err(err) => {
                    tracing::warn!("could not restore `{}`: {err}", entry.descriptor_id);
                    continue;
                }
            };
            let applied = match entry.state {
                PersistedWindowState::Normal => Ok(()),
                PersistedWindowState::Minimized => self.minimize(window_id),
                PersistedWindowState::Maximized => self.maximize(window_id),
            };
            if let Err(err) = applied {
                tracing::warn!("could not reapply {:?} to {window_id}: {err}", entry.state);
            }
            if !restored.contains(&window_id) {
                restored.push(window_id);
            }
        }
        restored
    }

    fn mark_layout_dirty(&self) {
        if let Some(autosave) = &self.autosave {
            autosave.mark(self.layout_snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use desktop_app_contract::{unmount_ready, AppHookError, AppModule, UnmountFuture};
    use platform_host::StaticModuleSource;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{ApplicationDescriptor, DefaultWindowOptions};

    #[derive(Default)]
    struct Quiet;

    impl AppInstance for Quiet {
        fn on_mount(
            &mut self,
            _frame: &WindowFrame,
            _context: &AppMountContext,
        ) -> Result<(), AppHookError> {
            Ok(())
        }

        fn on_unmount(&mut self) -> UnmountFuture {
            unmount_ready(Ok(()))
        }
    }

    struct Broken;

    impl AppInstance for Broken {
        fn on_mount(
            &mut self,
            _frame: &WindowFrame,
            _context: &AppMountContext,
        ) -> Result<(), AppHookError> {
            Err(AppHookError::new("no canvas"))
        }

        fn on_unmount(&mut self) -> UnmountFuture {
            unmount_ready(Ok(()))
        }
    }

    fn manager() -> (WindowManager, EventBus, ModuleLoader) {
        let config = RuntimeConfig::default();
        let bus = EventBus::new(64);
        let registry = AppRegistry::default();
        let source = StaticModuleSource::default();
        for (id, singleton) in [("calc", false), ("notes", false), ("settings", true)] {
            let mut descriptor = ApplicationDescriptor::new(
                ApplicationId::trusted(id),
                id.to_uppercase(),
                format!("apps/{id}"),
            );
            descriptor.single_instance = singleton;
            registry.register(descriptor).expect("register");
            source.insert(format!("apps/{id}"), AppModule::new(|| Box::new(Quiet)));
        }
        registry
            .register(
                ApplicationDescriptor::new(ApplicationId::trusted("kiosk"), "Kiosk", "apps/kiosk")
                    .with_default_window(DefaultWindowOptions {
                        resizable: false,
                        ..DefaultWindowOptions::default()
                    }),
            )
            .expect("kiosk");
        source.insert("apps/kiosk", AppModule::new(|| Box::new(Quiet)));
        registry
            .register(ApplicationDescriptor::new(
                ApplicationId::trusted("broken"),
                "Broken",
                "apps/broken",
            ))
            .expect("broken");
        source.insert("apps/broken", AppModule::new(|| Box::new(Broken)));

        let loader = ModuleLoader::new(registry.clone(), Rc::new(source), bus.clone(), &config);
        let manager = WindowManager::new(bus.clone(), registry, loader.clone(), &config);
        (manager, bus, loader)
    }

    async fn open(manager: &WindowManager, app_id: &str) -> WindowId {
        manager
            .create_window(app_id, WindowOptions::default())
            .await
            .expect("create window")
    }

    fn z_order(manager: &WindowManager) -> Vec<(WindowId, u32)> {
        manager
            .windows()
            .iter()
            .map(|w| (w.window_id, w.z_index))
            .collect()
    }

    #[tokio::test]
    async fn new_windows_cascade_and_take_focus_on_top() {
        let (manager, _, _) = manager();
        let w1 = open(&manager, "calc").await;
        let w2 = open(&manager, "calc").await;

        assert_ne!(w1, w2);
        assert_eq!(z_order(&manager), vec![(w1, 1), (w2, 2)]);
        assert_eq!(manager.focused_window(), Some(w2));

        let first = manager.window(w1).expect("w1");
        let second = manager.window(w2).expect("w2");
        assert_eq!(second.geometry.x - first.geometry.x, CASCADE_STEP);
        assert_eq!(second.geometry.y - first.geometry.y, CASCADE_STEP);
    }

    #[tokio::test]
    async fn focus_raises_without_duplicating_z_indices() {
        let (manager, _, _) = manager();
        let w1 = open(&manager, "calc").await;
        let w2 = open(&manager, "notes").await;
        let w3 = open(&manager, "calc").await;

        manager.focus(w1).expect("focus");
        assert_eq!(z_order(&manager), vec![(w2, 1), (w3, 2), (w1, 3)]);
        assert_eq!(manager.focused_window(), Some(w1));
        assert_eq!(
            manager.windows().iter().filter(|w| w.focused).count(),
            1
        );
    }

    #[tokio::test]
    async fn minimize_hands_focus_to_topmost_visible_window() {
        let (manager, _, _) = manager();
        let w1 = open(&manager, "calc").await;
        let w2 = open(&manager, "notes").await;

        manager.minimize(w2).expect("minimize");
        assert_eq!(manager.focused_window(), Some(w1));
        assert_eq!(
            manager.window(w2).expect("w2").state,
            WindowState::Minimized
        );

        manager.focus(w2).expect("focus restores");
        assert_eq!(manager.window(w2).expect("w2").state, WindowState::Normal);
        assert_eq!(manager.focused_window(), Some(w2));
    }

    #[tokio::test]
    async fn maximize_then_restore_reapplies_the_stored_rect() {
        let (manager, _, _) = manager();
        let w1 = open(&manager, "calc").await;
        let original = manager.window(w1).expect("w1").geometry;

        manager.maximize(w1).expect("maximize");
        let maximized = manager.window(w1).expect("w1");
        assert_eq!(maximized.geometry, manager.viewport());
        assert_eq!(maximized.restore_geometry, Some(original));

        manager.minimize(w1).expect("minimize");
        manager.restore(w1).expect("back to maximized");
        assert_eq!(
            manager.window(w1).expect("w1").state,
            WindowState::Maximized
        );

        manager.restore(w1).expect("back to normal");
        let restored = manager.window(w1).expect("w1");
        assert_eq!(restored.state, WindowState::Normal);
        assert_eq!(restored.geometry, original);
    }

    #[tokio::test]
    async fn geometry_is_clamped_and_refused_while_maximized() {
        let (manager, _, _) = manager();
        let w1 = open(&manager, "calc").await;
        manager
            .set_geometry(
                w1,
                WindowRect {
                    x: 5,
                    y: 6,
                    w: 10,
                    h: 10,
                },
            )
            .expect("set geometry");
        let window = manager.window(w1).expect("w1");
        assert_eq!(
            window.geometry,
            WindowRect {
                x: 5,
                y: 6,
                w: window.min_size.0,
                h: window.min_size.1
            }
        );

        manager.maximize(w1).expect("maximize");
        assert!(matches!(
            manager.set_geometry(w1, WindowRect::default()),
            Err(DesktopError::InvalidTransition {
                from: WindowState::Maximized,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn non_resizable_windows_only_move_and_never_maximize() {
        let (manager, _, _) = manager();
        let kiosk = open(&manager, "kiosk").await;
        let size = manager.window(kiosk).expect("kiosk").geometry;

        manager
            .set_geometry(
                kiosk,
                WindowRect {
                    x: 300,
                    y: 200,
                    w: 900,
                    h: 900,
                },
            )
            .expect("move");
        let moved = manager.window(kiosk).expect("kiosk").geometry;
        assert_eq!((moved.x, moved.y, moved.w, moved.h), (300, 200, size.w, size.h));
        assert!(manager.maximize(kiosk).is_err());
    }

    #[tokio::test]
    async fn focus_desktop_leaves_no_window_focused() {
        let (manager, _, _) = manager();
        open(&manager, "calc").await;
        manager.focus_desktop();
        assert_eq!(manager.focused_window(), None);
    }

    #[tokio::test]
    async fn singleton_relaunch_focuses_the_existing_window() {
        let (manager, _, loader) = manager();
        let first = open(&manager, "settings").await;
        let other = open(&manager, "calc").await;
        assert_eq!(manager.focused_window(), Some(other));

        let second = open(&manager, "settings").await;
        assert_eq!(first, second);
        assert_eq!(manager.windows().len(), 2);
        assert_eq!(manager.focused_window(), Some(first));
        assert_eq!(loader.reference_count("settings"), Some(1));
    }

    #[tokio::test]
    async fn mount_failure_registers_nothing_and_reports_once() {
        let (manager, bus, loader) = manager();
        let failures = Rc::new(RefCell::new(Vec::new()));
        {
            let failures = failures.clone();
            bus.subscribe(APP_LAUNCH_FAILED, None, move |event| {
                failures
                    .borrow_mut()
                    .push(event.payload_as::<LaunchFailedPayload>()?);
                Ok(())
            });
        }

        let err = manager
            .create_window("broken", WindowOptions::default())
            .await
            .expect_err("mount fails");
        assert!(matches!(err, DesktopError::MountFailed { .. }));
        assert!(manager.windows().is_empty());
        assert_eq!(loader.reference_count("broken"), Some(0));

        let failures = failures.borrow();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].display_name, "Broken");
        assert_eq!(failures[0].kind, "mount-failed");
        assert!(failures[0].retryable);
    }

    #[tokio::test]
    async fn close_compacts_z_order_and_releases_the_module() {
        let (manager, _, loader) = manager();
        let w1 = open(&manager, "calc").await;
        let w2 = open(&manager, "notes").await;
        let w3 = open(&manager, "calc").await;

        let report = manager.close(w2).await.expect("close");
        assert_eq!(report.teardown, TeardownOutcome::Completed);
        assert_eq!(z_order(&manager), vec![(w1, 1), (w3, 2)]);
        assert_eq!(loader.reference_count("notes"), Some(0));
        assert!(matches!(
            manager.close(w2).await,
            Err(DesktopError::WindowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn layout_snapshot_persists_resting_geometry() {
        let (manager, _, _) = manager();
        let w1 = open(&manager, "calc").await;
        let original = manager.window(w1).expect("w1").geometry;
        manager.maximize(w1).expect("maximize");

        let layout = manager.layout_snapshot();
        assert_eq!(
            layout.windows,
            vec![PersistedWindow {
                descriptor_id: "calc".to_string(),
                geometry: original,
                state: PersistedWindowState::Maximized,
            }]
        );
    }
}
