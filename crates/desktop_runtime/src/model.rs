use std::collections::BTreeSet;

use desktop_app_contract::{ApplicationId, TeamId, WindowId, WindowRect};
use platform_host::PersistedWindowState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_WINDOW_WIDTH: i32 = 420;
pub const DEFAULT_WINDOW_HEIGHT: i32 = 300;
/// Smallest size any managed window may take, whatever its descriptor says.
pub const MIN_WINDOW_WIDTH: i32 = 220;
pub const MIN_WINDOW_HEIGHT: i32 = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowState {
    Normal,
    Minimized,
    Maximized,
    Closing,
    Closed,
}

impl WindowState {
    pub const fn token(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Minimized => "minimized",
            Self::Maximized => "maximized",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Closing and Closed windows accept no further transitions.
    pub const fn accepts_transitions(self) -> bool {
        matches!(self, Self::Normal | Self::Minimized | Self::Maximized)
    }

    pub const fn persisted(self) -> Option<PersistedWindowState> {
        match self {
            Self::Normal => Some(PersistedWindowState::Normal),
            Self::Minimized => Some(PersistedWindowState::Minimized),
            Self::Maximized => Some(PersistedWindowState::Maximized),
            Self::Closing | Self::Closed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Geometry defaults a descriptor hands to every new window.
pub struct DefaultWindowOptions {
    pub rect: WindowRect,
    pub resizable: bool,
    pub min_width: i32,
    pub min_height: i32,
}

impl Default for DefaultWindowOptions {
    fn default() -> Self {
        Self {
            rect: WindowRect {
                x: 40,
                y: 48,
                w: DEFAULT_WINDOW_WIDTH,
                h: DEFAULT_WINDOW_HEIGHT,
            },
            resizable: true,
            min_width: MIN_WINDOW_WIDTH,
            min_height: MIN_WINDOW_HEIGHT,
        }
    }
}

impl DefaultWindowOptions {
    /// Effective minimum size, never below the global floor.
    pub fn min_size(&self) -> (i32, i32) {
        (
            self.min_width.max(MIN_WINDOW_WIDTH),
            self.min_height.max(MIN_WINDOW_HEIGHT),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Static catalog entry describing an installable application.
///
/// Entries are immutable once registered; re-registration replaces the whole entry.
pub struct ApplicationDescriptor {
    pub id: ApplicationId,
    pub display_name: String,
    /// Opaque key handed to the module source.
    pub module_ref: String,
    pub category: String,
    /// At most one live window.
    pub single_instance: bool,
    /// Visible only to teams the descriptor is installed for.
    pub team_scoped: bool,
    pub required_capabilities: BTreeSet<String>,
    pub default_window: DefaultWindowOptions,
    /// Preloaded at bootstrap.
    pub critical: bool,
}

impl ApplicationDescriptor {
    pub fn new(
        id: ApplicationId,
        display_name: impl Into<String>,
        module_ref: impl Into<String>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            module_ref: module_ref.into(),
            category: "general".to_string(),
            single_instance: false,
            team_scoped: false,
            required_capabilities: BTreeSet::new(),
            default_window: DefaultWindowOptions::default(),
            critical: false,
        }
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn singleton(mut self) -> Self {
        self.single_instance = true;
        self
    }

    pub fn team_scoped(mut self) -> Self {
        self.team_scoped = true;
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_default_window(mut self, default_window: DefaultWindowOptions) -> Self {
        self.default_window = default_window;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
/// Caller-supplied overrides merged field by field over a descriptor's window defaults.
///
/// An explicit position disables the cascade offset.
pub struct WindowOptions {
    pub title: Option<String>,
    pub position: Option<(i32, i32)>,
    pub size: Option<(i32, i32)>,
    pub launch_params: Value,
}

impl WindowOptions {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_position(mut self, x: i32, y: i32) -> Self {
        self.position = Some((x, y));
        self
    }

    pub fn with_size(mut self, w: i32, h: i32) -> Self {
        self.size = Some((w, h));
        self
    }

    /// Overrides position and size together.
    pub fn with_rect(self, rect: WindowRect) -> Self {
        self.with_position(rect.x, rect.y).with_size(rect.w, rect.h)
    }

    /// Resolves the initial geometry against `defaults`, offsetting by `cascade` unless a
    /// position was given.
    pub(crate) fn merged_rect(&self, defaults: WindowRect, cascade: i32) -> WindowRect {
        let cascaded = defaults.offset(cascade, cascade);
        let (x, y) = self.position.unwrap_or((cascaded.x, cascaded.y));
        let (w, h) = self.size.unwrap_or((defaults.w, defaults.h));
        WindowRect { x, y, w, h }
    }

    pub fn with_launch_params(mut self, launch_params: Value) -> Self {
        self.launch_params = launch_params;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One live window, as owned by the window manager.
pub struct WindowInstance {
    pub window_id: WindowId,
    pub descriptor_id: ApplicationId,
    pub owner_team_id: Option<TeamId>,
    pub title: String,
    /// 1-based stacking position; the topmost window has the largest value.
    pub z_index: u32,
    pub geometry: WindowRect,
    /// Geometry to reapply when leaving the maximized state.
    pub restore_geometry: Option<WindowRect>,
    pub state: WindowState,
    /// State to return to when a minimized window is restored.
    pub pre_minimize_state: WindowState,
    pub focused: bool,
    pub resizable: bool,
    pub min_size: (i32, i32),
    pub created_at_unix_ms: u64,
}

impl WindowInstance {
    /// Geometry worth persisting: the pre-maximize rect for maximized windows.
    pub fn resting_geometry(&self) -> WindowRect {
        match self.state {
            WindowState::Maximized => self.restore_geometry.unwrap_or(self.geometry),
            WindowState::Minimized if self.pre_minimize_state == WindowState::Maximized => {
                self.restore_geometry.unwrap_or(self.geometry)
            }
            _ => self.geometry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LaunchId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
/// A `create_window` call still waiting on its module.
pub struct PendingLaunch {
    pub launch_id: LaunchId,
    pub app_id: ApplicationId,
    pub aborted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_min_size_never_drops_below_floor() {
        let options = DefaultWindowOptions {
            min_width: 10,
            min_height: 400,
            ..DefaultWindowOptions::default()
        };
        assert_eq!(options.min_size(), (MIN_WINDOW_WIDTH, 400));
    }

    #[test]
    fn only_live_states_persist() {
        assert_eq!(
            WindowState::Maximized.persisted(),
            Some(PersistedWindowState::Maximized)
        );
        assert_eq!(WindowState::Closing.persisted(), None);
        assert!(!WindowState::Closing.accepts_transitions());
    }

    #[test]
    fn window_options_merge_position_and_size_independently() {
        let defaults = WindowRect {
            x: 100,
            y: 80,
            w: 720,
            h: 480,
        };

        let sized = WindowOptions::default().with_size(300, 200);
        assert_eq!(
            sized.merged_rect(defaults, 40),
            WindowRect {
                x: 140,
                y: 120,
                w: 300,
                h: 200
            }
        );

        let placed = WindowOptions::default().with_position(5, 6);
        assert_eq!(
            placed.merged_rect(defaults, 40),
            WindowRect {
                x: 5,
                y: 6,
                w: 720,
                h: 480
            }
        );
    }
}
