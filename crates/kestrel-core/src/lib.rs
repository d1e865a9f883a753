//! Core types and configuration for the Kestrel renderer.
//!
//! This crate provides the pieces shared by every other crate:
//! - Frame pacing constants
//! - Configuration records and their TOML loading
//! - The configuration error type

pub mod config;
pub mod error;

pub use config::{AppConfig, PresentModePreference, RendererConfig, WindowConfig};
pub use error::{Error, Result};

/// Renderer-wide constants
pub mod constants {
    /// Number of frame slots allocated at startup. The in-flight count can
    /// never exceed this.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
    /// In-flight count used when none is configured.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
}
