//! Composition root wiring the bus, registry, loader, and window manager to host services.

use std::{future::Future, rc::Rc};

use desktop_app_contract::{ApplicationId, TeamContext, WindowId};
use platform_host::{LayoutStore, ModuleSource, TeamContextProvider};

use crate::{
    config::RuntimeConfig,
    error::DesktopError,
    event_bus::EventBus,
    loader::{MemoryPressure, ModuleLoader},
    manifest::{seed_registry, ManifestError},
    model::{ApplicationDescriptor, WindowOptions},
    persistence::{load_layout_seed, LayoutAutosave},
    registry::AppRegistry,
    window_manager::{CloseReport, WindowManager},
};

#[derive(Debug, Default)]
/// What `bootstrap` did.
pub struct BootstrapReport {
    pub team: TeamContext,
    pub preload_failures: Vec<(ApplicationId, DesktopError)>,
    pub restored_windows: Vec<WindowId>,
}

/// One desktop session.
///
/// Builder methods must run before any handle is cloned out. With a layout store attached, debounced
/// saves happen only while [`DesktopRuntime::autosave_task`] is being driven, typically on a
/// `tokio::task::LocalSet`; [`DesktopRuntime::flush_layout`] works either way.
pub struct DesktopRuntime {
    bus: EventBus,
    registry: AppRegistry,
    loader: ModuleLoader,
    windows: WindowManager,
    autosave: Option<LayoutAutosave>,
    layout_store: Option<Rc<dyn LayoutStore>>,
    team_provider: Option<Rc<dyn TeamContextProvider>>,
    config: RuntimeConfig,
}

impl DesktopRuntime {
    pub fn new(config: RuntimeConfig, module_source: Rc<dyn ModuleSource>) -> Self {
        let bus = EventBus::new(config.event_history_capacity);
        let registry = AppRegistry::default();
        let loader = ModuleLoader::new(registry.clone(), module_source, bus.clone(), &config);
        let windows = WindowManager::new(bus.clone(), registry.clone(), loader.clone(), &config);
        Self {
            bus,
            registry,
            loader,
            windows,
            autosave: None,
            layout_store: None,
            team_provider: None,
            config,
        }
    }

    /// Uses `store` as the bootstrap layout seed and the autosave sink.
    pub fn with_layout_store(mut self, store: Rc<dyn LayoutStore>) -> Self {
        let autosave = LayoutAutosave::new(store.clone(), self.bus.clone(), &self.config);
        self.windows = self.windows.with_autosave(autosave.clone());
        self.autosave = Some(autosave);
        self.layout_store = Some(store);
        self
    }

    pub fn with_team_provider(mut self, provider: Rc<dyn TeamContextProvider>) -> Self {
        self.team_provider = Some(provider);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Background layout saver, or `None` without a layout store.
    pub fn autosave_task(&self) -> Option<impl Future<Output = ()> + 'static> {
        self.autosave.as_ref().map(LayoutAutosave::run)
    }

    /// Registers every entry of a TOML manifest catalog.
    ///
    /// # Errors
    ///
    /// See [`seed_registry`].
    pub fn seed_catalog(&self, raw: &str) -> Result<usize, ManifestError> {
        seed_registry(&self.registry, raw)
    }

    /// Adopts the provider's team context, warms critical modules, and restores the persisted
    /// layout. Nothing here is fatal: failures are logged and reported.
    pub async fn bootstrap(&self) -> BootstrapReport {
        let team = self
            .team_provider
            .as_ref()
            .map(|provider| provider.current_context())
            .unwrap_or_default();
        self.windows.set_team_context(team.clone());

        let preload_failures = self.loader.preload_critical().await;

        let restored_windows = match &self.layout_store {
            Some(store) => match load_layout_seed(store.as_ref()).await {
                Some(layout) => self.windows.restore_layout(&layout).await,
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        tracing::debug!(
            "bootstrapped desktop for team {:?}: {} preload failure(s), {} window(s) restored",
            team.team_id,
            preload_failures.len(),
            restored_windows.len()
        );
        BootstrapReport {
            team,
            preload_failures,
            restored_windows,
        }
    }

    /// Re-queries the team provider and switches when the context changed.
    ///
    /// Returns `None` when there is no provider or nothing changed.
    pub async fn refresh_team_context(&self) -> Option<Vec<CloseReport>> {
        let next = self.team_provider.as_ref()?.current_context();
        if next == self.windows.team_context() {
            return None;
        }
        Some(self.windows.switch_team(next).await)
    }

    /// Descriptors the current context may launch.
    pub fn available_apps(&self) -> Vec<Rc<ApplicationDescriptor>> {
        self.registry
            .resolve_available(&self.windows.team_context())
    }

    /// # Errors
    ///
    /// See [`WindowManager::create_window`].
    pub async fn launch(&self, app_id: &str) -> Result<WindowId, DesktopError> {
        self.launch_with(app_id, WindowOptions::default()).await
    }

    /// # Errors
    ///
    /// See [`WindowManager::create_window`].
    pub async fn launch_with(
        &self,
        app_id: &str,
        options: WindowOptions,
    ) -> Result<WindowId, DesktopError> {
        self.windows.create_window(app_id, options).await
    }

    pub fn handle_memory_pressure(&self, pressure: MemoryPressure) -> Vec<ApplicationId> {
        self.loader.handle_memory_pressure(pressure)
    }

    /// Writes any pending layout change immediately. Returns `false` when the save failed.
    pub async fn flush_layout(&self) -> bool {
        match &self.autosave {
            Some(autosave) => autosave.flush().await,
            None => true,
        }
    }
}
