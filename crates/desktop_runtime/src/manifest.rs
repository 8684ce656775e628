//! TOML app manifest catalog used to seed the registry at bootstrap.
//!
//! ```toml
//! schema_version = 1
//!
//! [[apps]]
//! id = "calc"
//! display_name = "Calculator"
//! module_ref = "apps/calculator"
//! category = "tools"
//! single_instance = true
//!
//! [apps.window]
//! width = 560
//! height = 420
//! ```

use desktop_app_contract::{ApplicationId, WindowRect};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    error::DesktopError,
    model::{ApplicationDescriptor, DefaultWindowOptions},
    registry::AppRegistry,
};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("failed to parse app manifest catalog: {0}")]
    Parse(String),
    #[error("manifest schema mismatch: expected {expected} found {found}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error(transparent)]
    Registry(#[from] DesktopError),
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestCatalog {
    schema_version: u32,
    #[serde(default)]
    apps: Vec<AppManifest>,
}

#[derive(Debug, Clone, Deserialize)]
struct AppManifest {
    id: String,
    display_name: String,
    module_ref: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    single_instance: bool,
    #[serde(default)]
    team_scoped: bool,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    window: Option<WindowDefaults>,
}

#[derive(Debug, Clone, Deserialize)]
struct WindowDefaults {
    x: Option<i32>,
    y: Option<i32>,
    width: i32,
    height: i32,
    #[serde(default = "default_true")]
    resizable: bool,
    min_width: Option<i32>,
    min_height: Option<i32>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_true() -> bool {
    true
}

impl AppManifest {
    fn into_descriptor(self) -> Result<ApplicationDescriptor, DesktopError> {
        let id = ApplicationId::new(self.id).map_err(|reason| DesktopError::InvalidDescriptor {
            field: "id",
            reason,
        })?;
        let mut descriptor = ApplicationDescriptor::new(id, self.display_name, self.module_ref)
            .in_category(self.category);
        descriptor.single_instance = self.single_instance;
        descriptor.team_scoped = self.team_scoped;
        descriptor.critical = self.critical;
        descriptor.required_capabilities = self.required_capabilities.into_iter().collect();
        if let Some(window) = self.window {
            let defaults = DefaultWindowOptions::default();
            descriptor.default_window = DefaultWindowOptions {
                rect: WindowRect {
                    x: window.x.unwrap_or(defaults.rect.x),
                    y: window.y.unwrap_or(defaults.rect.y),
                    w: window.width,
                    h: window.height,
                },
                resizable: window.resizable,
                min_width: window
                    .min_width
                    .unwrap_or(defaults.min_width.min(window.width)),
                min_height: window
                    .min_height
                    .unwrap_or(defaults.min_height.min(window.height)),
            };
        }
        Ok(descriptor)
    }
}

/// Parses a manifest catalog into descriptors, sorted by id.
///
/// # Errors
///
/// Returns [`ManifestError::Parse`] for malformed TOML, [`ManifestError::SchemaMismatch`] for an
/// unsupported schema, and [`ManifestError::Registry`] when an entry has an invalid id.
pub fn parse_catalog(raw: &str) -> Result<Vec<ApplicationDescriptor>, ManifestError> {
    let catalog: ManifestCatalog =
        toml::from_str(raw).map_err(|e| ManifestError::Parse(e.to_string()))?;
    if catalog.schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(ManifestError::SchemaMismatch {
            expected: MANIFEST_SCHEMA_VERSION,
            found: catalog.schema_version,
        });
    }
    let mut descriptors = catalog
        .apps
        .into_iter()
        .map(AppManifest::into_descriptor)
        .collect::<Result<Vec<_>, _>>()?;
    descriptors.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(descriptors)
}

/// Registers every catalog entry and returns how many were added.
///
/// Registration stops at the first failing entry; earlier entries stay registered.
///
/// # Errors
///
/// Returns parse errors from [`parse_catalog`] and registry validation or duplicate errors.
pub fn seed_registry(registry: &AppRegistry, raw: &str) -> Result<usize, ManifestError> {
    let descriptors = parse_catalog(raw)?;
    let count = descriptors.len();
    for descriptor in descriptors {
        registry.register(descriptor)?;
    }
    tracing::debug!("seeded {count} descriptor(s) from manifest catalog");
    Ok(count)
}
