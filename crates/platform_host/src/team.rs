//! Tenant/team context provider contract.

use std::{cell::RefCell, rc::Rc};

use desktop_app_contract::TeamContext;

/// Host service supplying the active `{team, tenant features, user capabilities}` context.
pub trait TeamContextProvider {
    /// Returns the context the runtime should currently honor.
    fn current_context(&self) -> TeamContext;
}

#[derive(Debug, Clone, Default)]
/// Provider backed by a replaceable in-memory context.
pub struct MemoryTeamContextProvider {
    context: Rc<RefCell<TeamContext>>,
}

impl MemoryTeamContextProvider {
    /// Creates a provider returning `context` until replaced.
    pub fn new(context: TeamContext) -> Self {
        Self {
            context: Rc::new(RefCell::new(context)),
        }
    }

    /// Replaces the provided context.
    pub fn set(&self, context: TeamContext) {
        *self.context.borrow_mut() = context;
    }
}

impl TeamContextProvider for MemoryTeamContextProvider {
    fn current_context(&self) -> TeamContext {
        self.context.borrow().clone()
    }
}
