//! Module source contract: the boundary where app code is fetched on demand.

use std::{cell::Cell, cell::RefCell, collections::HashMap, future::Future, pin::Pin, rc::Rc};

use desktop_app_contract::AppModule;

/// Object-safe boxed future used by [`ModuleSource`].
///
/// Fetch futures are `'static` because the loader shares one in-flight fetch between every
/// concurrent caller.
pub type ModuleSourceFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

/// Host service that resolves a descriptor's module reference to an executable [`AppModule`].
pub trait ModuleSource {
    /// Fetches the module behind `module_ref`.
    fn fetch(&self, module_ref: &str) -> ModuleSourceFuture<Result<AppModule, String>>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Module source that never resolves anything.
pub struct NoopModuleSource;

impl ModuleSource for NoopModuleSource {
    fn fetch(&self, module_ref: &str) -> ModuleSourceFuture<Result<AppModule, String>> {
        let message = format!("no module source configured for `{module_ref}`");
        Box::pin(async move { Err(message) })
    }
}

#[derive(Debug, Clone, Default)]
/// Module source backed by modules linked into the binary.
///
/// Counts every fetch so callers can observe cache effectiveness.
pub struct StaticModuleSource {
    modules: Rc<RefCell<HashMap<String, AppModule>>>,
    fetches: Rc<Cell<usize>>,
}

impl StaticModuleSource {
    /// Registers (or replaces) the module served for `module_ref`.
    pub fn insert(&self, module_ref: impl Into<String>, module: AppModule) {
        self.modules.borrow_mut().insert(module_ref.into(), module);
    }

    /// Removes the module served for `module_ref`.
    pub fn remove(&self, module_ref: &str) -> Option<AppModule> {
        self.modules.borrow_mut().remove(module_ref)
    }

    /// Number of fetch calls served so far, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }
}

impl ModuleSource for StaticModuleSource {
    fn fetch(&self, module_ref: &str) -> ModuleSourceFuture<Result<AppModule, String>> {
        self.fetches.set(self.fetches.get() + 1);
        let found = self
            .modules
            .borrow()
            .get(module_ref)
            .cloned()
            .ok_or_else(|| format!("module `{module_ref}` is not linked"));
        Box::pin(async move { found })
    }
}
