//! Plugin version parsing and ordering.

pub mod comparable;

pub use comparable::PluginVersion;
