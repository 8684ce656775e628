//! Shared contract types between the desktop window manager runtime and hosted apps.
//!
//! An app is any type implementing [`AppInstance`]. The runtime only ever talks to apps through
//! these hooks: `on_mount`/`on_unmount` are mandatory, the focus, blur, and team-context hooks are
//! opt-in and declared through [`AppInstance::optional_hooks`].

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

use std::{borrow::Borrow, collections::BTreeSet, fmt, rc::Rc};

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable identifier for an installable application descriptor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationId(String);

impl ApplicationId {
    /// Returns an app identifier when `raw` conforms to the dotted lowercase segment policy.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated rule when `raw` is not a valid identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        if is_valid_application_id(&raw) {
            Ok(Self(raw))
        } else {
            Err(format!(
                "invalid application id `{raw}`; expected lowercase dotted segments"
            ))
        }
    }

    /// Creates an id without validation for trusted constants.
    pub fn trusted(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the string form of the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ApplicationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

fn is_valid_application_id(raw: &str) -> bool {
    if raw.is_empty() || raw.len() > 120 {
        return false;
    }

    raw.split('.').all(|part| {
        let bytes = part.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= 32
            && bytes[0].is_ascii_lowercase()
            && !part.ends_with('-')
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
    })
}

/// Stable identifier for an organizational team (tenant sub-scope).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(String);

impl TeamId {
    /// Wraps a raw team identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the string form of the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Tenant/team context supplied by the host and handed to apps on mount.
pub struct TeamContext {
    /// Active team, if the actor is currently inside one.
    pub team_id: Option<TeamId>,
    /// Feature flags enabled for the tenant.
    pub tenant_features: BTreeSet<String>,
    /// Permission strings granted to the current user.
    pub user_capabilities: BTreeSet<String>,
}

impl TeamContext {
    /// Creates a context scoped to `team_id` with no features or capabilities.
    pub fn for_team(team_id: impl Into<String>) -> Self {
        Self {
            team_id: Some(TeamId::new(team_id)),
            ..Self::default()
        }
    }

    /// Adds user capabilities to the context.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Adds tenant feature flags to the context.
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tenant_features
            .extend(features.into_iter().map(Into::into));
        self
    }

    /// Returns whether every capability in `required` has been granted.
    pub fn grants_all(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.user_capabilities)
    }
}

/// Stable identifier for a runtime-managed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Window geometry in desktop pixels.
pub struct WindowRect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width.
    pub w: i32,
    /// Height.
    pub h: i32,
}

impl WindowRect {
    /// Returns the rect translated by `dx`/`dy`.
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..self
        }
    }

    /// Returns the rect grown to at least `min_w` x `min_h`.
    pub fn clamped_min(self, min_w: i32, min_h: i32) -> Self {
        Self {
            w: self.w.max(min_w),
            h: self.h.max(min_h),
            ..self
        }
    }
}

impl Default for WindowRect {
    fn default() -> Self {
        Self {
            x: 48,
            y: 48,
            w: 420,
            h: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Frame the window manager created for an app instance to mount into.
pub struct WindowFrame {
    /// Window that owns the frame.
    pub window_id: WindowId,
    /// App hosted in the frame.
    pub app_id: ApplicationId,
    /// Title bar text.
    pub title: String,
    /// Initial frame geometry.
    pub rect: WindowRect,
}

#[derive(Debug, Clone, PartialEq)]
/// Per-window context injected by the runtime at mount time.
pub struct AppMountContext {
    /// App id from the registry.
    pub app_id: ApplicationId,
    /// Runtime window id.
    pub window_id: WindowId,
    /// Launch params supplied at window-open time.
    pub launch_params: Value,
    /// Team context active when the window was created.
    pub team: TeamContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Lifecycle stages a window passes through, as reported to observers.
pub enum AppLifecycleEvent {
    /// App content has been mounted into its frame.
    Mounted,
    /// Window became focused.
    Focused,
    /// Window lost focus.
    Blurred,
    /// Window was minimized.
    Minimized,
    /// Window was maximized.
    Maximized,
    /// Window was restored from minimized or maximized state.
    Restored,
    /// Close sequence started; teardown is running.
    Closing,
    /// Close sequence completed.
    Closed,
}

impl AppLifecycleEvent {
    /// Returns a stable string token for event payloads and logs.
    pub const fn token(self) -> &'static str {
        match self {
            Self::Mounted => "mounted",
            Self::Focused => "focused",
            Self::Blurred => "blurred",
            Self::Minimized => "minimized",
            Self::Maximized => "maximized",
            Self::Restored => "restored",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
/// Failure reported by an app hook.
pub struct AppHookError {
    /// Human-readable failure description.
    pub message: String,
}

impl AppHookError {
    /// Creates a hook error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Future returned by [`AppInstance::on_unmount`].
///
/// The future must not borrow the instance: the runtime awaits it after releasing its own borrow
/// so that teardown can run while other windows keep working.
pub type UnmountFuture = LocalBoxFuture<'static, Result<(), AppHookError>>;

/// Returns an already-completed [`UnmountFuture`] for apps with synchronous teardown.
pub fn unmount_ready(result: Result<(), AppHookError>) -> UnmountFuture {
    Box::pin(async move { result })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Declares which optional hooks an app implements.
///
/// The runtime skips hooks that are not declared, so apps never pay for dispatch they ignore.
pub struct OptionalHooks {
    /// `on_focus` is implemented.
    pub focus: bool,
    /// `on_blur` is implemented.
    pub blur: bool,
    /// `on_team_context_changed` is implemented.
    pub team_context: bool,
}

impl OptionalHooks {
    /// No optional hooks.
    pub const NONE: Self = Self {
        focus: false,
        blur: false,
        team_context: false,
    };

    /// Every optional hook.
    pub const ALL: Self = Self {
        focus: true,
        blur: true,
        team_context: true,
    };
}

/// Hooks every hosted app implements.
///
/// The window manager calls `on_mount` exactly once per instance and `on_unmount` exactly once
/// when the window closes. Errors from `on_unmount` are logged and never block window removal.
pub trait AppInstance {
    /// Mounts app content into `frame`.
    ///
    /// # Errors
    ///
    /// Returns an error when the app cannot render; the runtime then discards the instance and
    /// reports a launch failure.
    fn on_mount(&mut self, frame: &WindowFrame, context: &AppMountContext)
        -> Result<(), AppHookError>;

    /// Releases app resources. The returned future is awaited up to the teardown timeout.
    fn on_unmount(&mut self) -> UnmountFuture;

    /// Reports which optional hooks this instance implements.
    fn optional_hooks(&self) -> OptionalHooks {
        OptionalHooks::NONE
    }

    /// Called when the window gains focus.
    fn on_focus(&mut self) {}

    /// Called when the window loses focus.
    fn on_blur(&mut self) {}

    /// Called when the active team changes and the window survives the switch.
    fn on_team_context_changed(&mut self, _context: &TeamContext) {}
}

/// Constructor for fresh [`AppInstance`] values.
pub type AppFactoryFn = dyn Fn() -> Box<dyn AppInstance>;

#[derive(Clone)]
/// Loaded, executable unit backing a descriptor.
///
/// Cloning is cheap and keeps the same underlying factory. Instance state is created per window,
/// never per module.
pub struct AppModule {
    factory: Rc<AppFactoryFn>,
}

impl AppModule {
    /// Creates a module from an instance constructor.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn AppInstance> + 'static,
    {
        Self {
            factory: Rc::new(factory),
        }
    }

    /// Creates a fresh app instance.
    pub fn instantiate(&self) -> Box<dyn AppInstance> {
        (self.factory)()
    }

    /// Returns whether both handles share one factory.
    pub fn same_module(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.factory, &other.factory)
    }
}

impl fmt::Debug for AppModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppModule")
            .field("factory", &Rc::as_ptr(&self.factory))
            .finish()
    }
}
