//! Client-side desktop application runtime.
//!
//! [`DesktopRuntime`] composes an [`EventBus`], an [`AppRegistry`], a lazy [`ModuleLoader`], and a
//! [`WindowManager`]. Everything runs on one thread; the only suspension points are module fetches
//! and window teardown.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod loader;
pub mod manifest;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod window_manager;

pub use config::{ConfigError, RuntimeConfig};
pub use error::{DesktopError, ModuleLoadError};
pub use event_bus::{BusEvent, EventBus, SubscriptionToken};
pub use loader::{LoadedModule, MemoryPressure, ModuleLoader};
pub use manifest::{parse_catalog, seed_registry, ManifestError};
pub use model::*;
pub use persistence::{load_layout_seed, LayoutAutosave};
pub use registry::{AppRegistry, RegisterMode};
pub use runtime::{BootstrapReport, DesktopRuntime};
pub use window_manager::{CloseReport, WindowManager};
