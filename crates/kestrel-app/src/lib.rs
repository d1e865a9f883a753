//! Application framework for the Kestrel renderer.
//!
//! This crate handles the boilerplate around the renderer:
//! - Logging setup
//! - Window creation and event polling
//! - GPU context and swapchain initialization, with a validation fallback
//! - The frame loop, resize notification and frame pacing
//!
//! # Example
//!
//! ```no_run
//! use kestrel_app::{run_app, AppConfig, AppContext, FrameContext, GpuContext, KestrelApp};
//!
//! struct MyApp;
//!
//! impl KestrelApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) {}
//!
//!     fn record(&mut self, _gpu: &GpuContext, _frame: &FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::new("My App"))
//! }
//! ```

mod app;
mod context;
mod runner;

pub use app::KestrelApp;
pub use context::AppContext;
pub use runner::{init_logging, run_app};

// Re-export commonly used types for convenience
pub use kestrel_core::{AppConfig, PresentModePreference};
pub use kestrel_gpu::{FrameContext, GpuContext};
pub use winit::event::WindowEvent;
