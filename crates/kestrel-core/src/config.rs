//! Configuration records and TOML loading.
//!
//! Every record is plain data with documented defaults. Files only need to
//! name the fields they override:
//!
//! ```toml
//! [window]
//! title = "Kestrel"
//! width = 1600
//!
//! [renderer]
//! frames_in_flight = 3
//! present_mode = "fifo"
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT};
use crate::error::{Error, Result};

/// Which present mode the swapchain should prefer.
///
/// The preferred mode falls back to FIFO when the surface does not offer it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// Lowest latency, may tear.
    #[default]
    Immediate,
    /// Triple-buffered without tearing.
    Mailbox,
    /// Vertical sync.
    Fifo,
}

/// Window settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Kestrel".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

/// Renderer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Number of frame slots used in rotation, `1..=MAX_FRAMES_IN_FLIGHT`.
    pub frames_in_flight: usize,
    pub present_mode: PresentModePreference,
    /// Fence wait timeout in milliseconds. `None` waits forever.
    pub fence_timeout_ms: Option<u64>,
    /// Image acquire timeout in milliseconds. `None` waits forever.
    pub acquire_timeout_ms: Option<u64>,
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "Kestrel".to_string(),
            validation: cfg!(debug_assertions),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            present_mode: PresentModePreference::default(),
            fence_timeout_ms: None,
            acquire_timeout_ms: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub window: WindowConfig,
    pub renderer: RendererConfig,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
}

impl AppConfig {
    /// Create a new config with the given window title.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            renderer: RendererConfig {
                app_name: title.clone(),
                ..Default::default()
            },
            window: WindowConfig {
                title,
                ..Default::default()
            },
            target_fps: None,
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.window.width = width;
        self.window.height = height;
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.renderer.validation = validation;
        self
    }

    #[must_use]
    pub fn with_frames_in_flight(mut self, count: usize) -> Self {
        self.renderer.frames_in_flight = count;
        self
    }

    #[must_use]
    pub fn with_present_mode(mut self, mode: PresentModePreference) -> Self {
        self.renderer.present_mode = mode;
        self
    }

    /// Parse a config from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file. A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;

        info!("Loaded configuration from {}", path.display());
        debug!("Config: {config:?}");

        Ok(config)
    }

    /// Load a config file, falling back to defaults on any error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            warn!("Failed to load {}: {e}. Using defaults.", path.display());
            Self::default()
        })
    }

    /// Check every field that has a bounded range.
    pub fn validate(&self) -> Result<()> {
        let frames = self.renderer.frames_in_flight;
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&frames) {
            return Err(Error::InvalidValue(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {frames}"
            )));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::InvalidValue(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        Ok(())
    }
}

/// Convert an optional millisecond timeout to nanoseconds, `u64::MAX` meaning
/// "wait forever".
pub const fn timeout_ns(ms: Option<u64>) -> u64 {
    match ms {
        Some(ms) => ms.saturating_mul(1_000_000),
        None => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.renderer.frames_in_flight, DEFAULT_FRAMES_IN_FLIGHT);
        assert_eq!(config.renderer.present_mode, PresentModePreference::Immediate);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = AppConfig::from_toml_str(
            r#"
            target_fps = 144

            [window]
            width = 1600

            [renderer]
            frames_in_flight = 3
            present_mode = "fifo"
            fence_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1600);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.renderer.frames_in_flight, 3);
        assert_eq!(config.renderer.present_mode, PresentModePreference::Fifo);
        assert_eq!(config.renderer.fence_timeout_ms, Some(250));
        assert_eq!(config.renderer.acquire_timeout_ms, None);
        assert_eq!(config.target_fps, Some(144));
    }

    #[test]
    fn out_of_range_frames_in_flight_is_rejected() {
        let zero = AppConfig::from_toml_str("[renderer]\nframes_in_flight = 0");
        assert!(matches!(zero, Err(Error::InvalidValue(_))));

        let too_many = AppConfig::default().with_frames_in_flight(MAX_FRAMES_IN_FLIGHT + 1);
        assert!(matches!(too_many.validate(), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn zero_window_size_is_rejected() {
        let config = AppConfig::default().with_size(0, 720);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_present_mode_is_a_parse_error() {
        let result = AppConfig::from_toml_str("[renderer]\npresent_mode = \"sometimes\"");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from_path("does/not/exist/kestrel.toml").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn new_sets_title_and_app_name() {
        let config = AppConfig::new("Viewer").with_size(800, 600);
        assert_eq!(config.window.title, "Viewer");
        assert_eq!(config.renderer.app_name, "Viewer");
        assert_eq!((config.window.width, config.window.height), (800, 600));
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_ns(None), u64::MAX);
        assert_eq!(timeout_ns(Some(2)), 2_000_000);
        assert_eq!(timeout_ns(Some(u64::MAX)), u64::MAX);
    }
}
