//! Event names and payload shapes exposed to external observers (taskbar, notifications, search).
//!
//! Payload shapes are stable within a major version.

use desktop_app_contract::{ApplicationId, TeamId, WindowId, WindowRect};
use serde::{Deserialize, Serialize};

use crate::model::WindowState;

pub const WINDOW_CREATED: &str = "window:created";
pub const WINDOW_FOCUSED: &str = "window:focused";
pub const WINDOW_CLOSED: &str = "window:closed";
pub const WINDOW_STATE_CHANGED: &str = "window:state-changed";
pub const WINDOW_GEOMETRY_CHANGED: &str = "window:geometry-changed";
pub const APP_LAUNCH_FAILED: &str = "app:launch-failed";
pub const TEAM_SWITCHED: &str = "team:switched";
pub const LAYOUT_SAVE_FAILED: &str = "layout:save-failed";
pub const MODULE_EVICTED: &str = "module:evicted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCreatedPayload {
    pub window_id: WindowId,
    pub app_id: ApplicationId,
    pub title: String,
    pub z_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFocusedPayload {
    pub window_id: WindowId,
    pub previous: Option<WindowId>,
    pub z_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// How a window's teardown hook finished.
pub enum TeardownOutcome {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowClosedPayload {
    pub window_id: WindowId,
    pub app_id: ApplicationId,
    pub teardown: TeardownOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStateChangedPayload {
    pub window_id: WindowId,
    pub from: WindowState,
    pub to: WindowState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometryChangedPayload {
    pub window_id: WindowId,
    pub geometry: WindowRect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Launch failure notice: enough for a toast naming the app with a retry button.
pub struct LaunchFailedPayload {
    pub app_id: String,
    /// Display name when the descriptor exists, otherwise the raw id.
    pub display_name: String,
    /// Classification token from [`crate::DesktopError::kind`].
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSwitchedPayload {
    pub previous_team: Option<TeamId>,
    pub team: Option<TeamId>,
    pub closed_windows: Vec<WindowId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSaveFailedPayload {
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEvictedPayload {
    pub app_id: ApplicationId,
}
