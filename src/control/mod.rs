//! Control layer exposing endpoint state to external tooling.

/// High-level control API over an [`EndpointRegistry`](crate::EndpointRegistry).
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
