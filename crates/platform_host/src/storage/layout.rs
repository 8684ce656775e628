//! Desktop layout persistence contracts and adapters.
//!
//! The backend treats the layout as a cold-start seed and a best-effort sink, so the records here
//! are plain data with no behavior attached.

use std::{cell::Cell, cell::RefCell, future::Future, pin::Pin, rc::Rc};

use desktop_app_contract::WindowRect;
use serde::{Deserialize, Serialize};

/// Schema version written into every [`DesktopLayout`].
pub const DESKTOP_LAYOUT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Window display state as persisted by the backend.
pub enum PersistedWindowState {
    /// Regular floating window.
    Normal,
    /// Hidden to the taskbar.
    Minimized,
    /// Filling the desktop viewport.
    Maximized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One persisted window entry.
pub struct PersistedWindow {
    /// Descriptor the window hosted.
    pub descriptor_id: String,
    /// Last known geometry (the pre-maximize rect for maximized windows).
    pub geometry: WindowRect,
    /// Last known display state.
    pub state: PersistedWindowState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Persisted desktop layout, bottom-most window first.
pub struct DesktopLayout {
    /// Layout schema version.
    pub schema_version: u32,
    /// Windows in stacking order.
    pub windows: Vec<PersistedWindow>,
}

impl DesktopLayout {
    /// Creates a layout at the current schema version.
    pub fn new(windows: Vec<PersistedWindow>) -> Self {
        Self {
            schema_version: DESKTOP_LAYOUT_SCHEMA_VERSION,
            windows,
        }
    }
}

impl Default for DesktopLayout {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Object-safe boxed future used by [`LayoutStore`] async methods.
pub type LayoutStoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Backend preference/window persistence service.
pub trait LayoutStore {
    /// Loads the last saved layout, if any.
    fn load_layout(&self) -> LayoutStoreFuture<'_, Result<Option<DesktopLayout>, String>>;

    /// Saves a full layout, replacing the previous one.
    fn save_layout<'a>(
        &'a self,
        layout: &'a DesktopLayout,
    ) -> LayoutStoreFuture<'a, Result<(), String>>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Layout store that persists nothing.
pub struct NoopLayoutStore;

impl LayoutStore for NoopLayoutStore {
    fn load_layout(&self) -> LayoutStoreFuture<'_, Result<Option<DesktopLayout>, String>> {
        Box::pin(async { Ok(None) })
    }

    fn save_layout<'a>(
        &'a self,
        _layout: &'a DesktopLayout,
    ) -> LayoutStoreFuture<'a, Result<(), String>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, Default)]
/// In-memory layout store.
///
/// `fail_next_saves` makes the next `n` saves fail, which lets callers exercise retry paths.
pub struct MemoryLayoutStore {
    layout: Rc<RefCell<Option<DesktopLayout>>>,
    saves: Rc<Cell<usize>>,
    failures_left: Rc<Cell<usize>>,
}

impl MemoryLayoutStore {
    /// Creates a store pre-seeded with `layout`.
    pub fn seeded(layout: DesktopLayout) -> Self {
        let store = Self::default();
        *store.layout.borrow_mut() = Some(layout);
        store
    }

    /// Returns the currently stored layout.
    pub fn current(&self) -> Option<DesktopLayout> {
        self.layout.borrow().clone()
    }

    /// Number of save attempts received, failed ones included.
    pub fn save_attempts(&self) -> usize {
        self.saves.get()
    }

    /// Makes the next `count` saves fail.
    pub fn fail_next_saves(&self, count: usize) {
        self.failures_left.set(count);
    }
}

impl LayoutStore for MemoryLayoutStore {
    fn load_layout(&self) -> LayoutStoreFuture<'_, Result<Option<DesktopLayout>, String>> {
        Box::pin(async move { Ok(self.layout.borrow().clone()) })
    }

    fn save_layout<'a>(
        &'a self,
        layout: &'a DesktopLayout,
    ) -> LayoutStoreFuture<'a, Result<(), String>> {
        Box::pin(async move {
            self.saves.set(self.saves.get() + 1);
            let failures_left = self.failures_left.get();
            if failures_left > 0 {
                self.failures_left.set(failures_left - 1);
                return Err("layout backend unavailable".to_string());
            }
            *self.layout.borrow_mut() = Some(layout.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sample_layout() -> DesktopLayout {
        DesktopLayout::new(vec![PersistedWindow {
            descriptor_id: "calc".to_string(),
            geometry: WindowRect {
                x: 10,
                y: 20,
                w: 300,
                h: 200,
            },
            state: PersistedWindowState::Maximized,
        }])
    }

    #[test]
    fn layout_serialization_shape_is_plain_records() {
        let value = serde_json::to_value(sample_layout()).expect("serialize layout");
        assert_eq!(
            value,
            json!({
                "schema_version": 1,
                "windows": [{
                    "descriptor_id": "calc",
                    "geometry": {"x": 10, "y": 20, "w": 300, "h": 200},
                    "state": "maximized"
                }]
            })
        );
    }

    #[test]
    fn memory_store_saves_and_recovers_after_injected_failures() {
        let store = MemoryLayoutStore::default();
        let store_obj: &dyn LayoutStore = &store;
        let layout = sample_layout();

        store.fail_next_saves(1);
        assert!(block_on(store_obj.save_layout(&layout)).is_err());
        assert_eq!(block_on(store_obj.load_layout()).expect("load"), None);

        block_on(store_obj.save_layout(&layout)).expect("second save");
        assert_eq!(
            block_on(store_obj.load_layout()).expect("load"),
            Some(layout)
        );
        assert_eq!(store.save_attempts(), 2);
    }

    #[test]
    fn noop_store_is_empty_and_successful() {
        let store = NoopLayoutStore;
        assert_eq!(block_on(store.load_layout()).expect("load"), None);
        block_on(store.save_layout(&DesktopLayout::default())).expect("save");
    }
}
