//! bookmarks library: Exposes the CLI's modules for testing.
//!
//! This is a thin library layer over the command-line components,
//! allowing tests to access internal types.

pub mod config;
pub mod gist;
pub mod persistence;

// Re-export key types for convenience
pub use config::{Config, ConfigError, DEFAULT_API_BASE};
pub use gist::{GistStore, GIST_FILE};
pub use persistence::LocalState;
