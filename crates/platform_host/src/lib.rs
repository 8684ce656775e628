//! Typed host-boundary contracts consumed by the desktop runtime.
//!
//! The runtime never reaches the backend directly. Module fetching, layout persistence, and the
//! tenant/team context all arrive through the object-safe traits in this crate, each with a
//! `Noop*` adapter for headless use and an in-memory adapter for tests and static builds.

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod modules;
pub mod storage;
pub mod team;
pub mod time;

pub use modules::{ModuleSource, ModuleSourceFuture, NoopModuleSource, StaticModuleSource};
pub use storage::layout::{
    DesktopLayout, LayoutStore, LayoutStoreFuture, MemoryLayoutStore, NoopLayoutStore,
    PersistedWindow, PersistedWindowState, DESKTOP_LAYOUT_SCHEMA_VERSION,
};
pub use team::{MemoryTeamContextProvider, TeamContextProvider};
pub use time::{next_monotonic_timestamp_ms, unix_time_ms_now};
