//! Runtime error taxonomy.

use desktop_app_contract::{ApplicationId, WindowId};
use thiserror::Error;

use crate::model::WindowState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// A fetch failure that survived the automatic retry.
#[error("module for `{app_id}` failed to load after {attempts} attempts: {message}")]
pub struct ModuleLoadError {
    /// App whose module could not be fetched.
    pub app_id: ApplicationId,
    /// Fetch attempts made.
    pub attempts: u32,
    /// Last error reported by the module source.
    pub message: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors raised by the registry, loader, and window manager.
pub enum DesktopError {
    /// A descriptor with this id is already registered.
    #[error("application `{0}` is already registered")]
    DuplicateId(ApplicationId),
    /// No descriptor is registered under this id.
    #[error("application `{0}` is not registered")]
    NotFound(String),
    /// A descriptor failed validation.
    #[error("invalid descriptor field `{field}`: {reason}")]
    InvalidDescriptor {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// The module could not be fetched.
    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),
    /// The app's `on_mount` hook failed.
    #[error("application `{app_id}` failed to mount: {message}")]
    MountFailed {
        /// App that failed to mount.
        app_id: ApplicationId,
        /// Hook error message.
        message: String,
    },
    /// The current context may not launch this app.
    #[error("application `{0}` is not available in the current team context")]
    NotPermitted(ApplicationId),
    /// The pending launch was aborted before its module finished loading.
    #[error("launch of `{0}` was aborted")]
    LaunchAborted(ApplicationId),
    /// The module is referenced by live windows and cannot be unloaded.
    #[error("module for `{app_id}` is still referenced by {references} window(s)")]
    ModuleInUse {
        /// App whose module was targeted.
        app_id: ApplicationId,
        /// Live references.
        references: usize,
    },
    /// The target window does not exist (or already closed).
    #[error("window {0} not found")]
    WindowNotFound(WindowId),
    /// The requested transition is not allowed from the window's current state.
    #[error("window {window_id} cannot {action} while {from:?}")]
    InvalidTransition {
        /// Target window.
        window_id: WindowId,
        /// State the window was in.
        from: WindowState,
        /// Attempted operation.
        action: &'static str,
    },
    /// A window's teardown exceeded its bound; the window was closed anyway.
    #[error("window {window_id} teardown exceeded {timeout_ms}ms")]
    TeardownTimeout {
        /// Window that was force-closed.
        window_id: WindowId,
        /// Bound that elapsed.
        timeout_ms: u64,
    },
}

impl DesktopError {
    /// Stable classification token used in `app:launch-failed` payloads.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateId(_) => "duplicate-id",
            Self::NotFound(_) => "not-found",
            Self::InvalidDescriptor { .. } => "invalid-descriptor",
            Self::ModuleLoad(_) => "module-load",
            Self::MountFailed { .. } => "mount-failed",
            Self::NotPermitted(_) => "not-permitted",
            Self::LaunchAborted(_) => "launch-aborted",
            Self::ModuleInUse { .. } => "module-in-use",
            Self::WindowNotFound(_) => "window-not-found",
            Self::InvalidTransition { .. } => "invalid-transition",
            Self::TeardownTimeout { .. } => "teardown-timeout",
        }
    }

    /// Whether retrying the same launch could succeed without changing the registry.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ModuleLoad(_) | Self::MountFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failures_are_classified_and_retryable() {
        let err = DesktopError::from(ModuleLoadError {
            app_id: ApplicationId::trusted("calc"),
            attempts: 2,
            message: "offline".to_string(),
        });
        assert_eq!(err.kind(), "module-load");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "module for `calc` failed to load after 2 attempts: offline"
        );
    }

    #[test]
    fn registry_failures_are_not_retryable() {
        let err = DesktopError::NotFound("missing".to_string());
        assert_eq!(err.kind(), "not-found");
        assert!(!err.is_retryable());
    }
}
