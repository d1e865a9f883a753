//! Platform window for the Kestrel renderer.
//!
//! Wraps a winit window driven by `pump_app_events`, so the caller owns the
//! frame loop. Implements the surface and drawable-size seams of
//! `kestrel-gpu`.

use std::ffi::CStr;
use std::time::Duration;

use ash::vk;
use kestrel_core::WindowConfig;
use kestrel_gpu::{DrawableTarget, GpuError, SurfaceSource};
use raw_window_handle::{HandleError, HasDisplayHandle, HasWindowHandle};
use thiserror::Error;
use tracing::{debug, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::error::EventLoopError;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowAttributes, WindowId};

pub use winit::event::{ElementState, KeyEvent};
pub use winit::keyboard::{Key, KeyCode, NamedKey, PhysicalKey};

/// Pumps allowed before giving up on the window being created.
const STARTUP_PUMPS: usize = 64;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(#[from] EventLoopError),
    #[error("Window handle unavailable: {0}")]
    Handle(#[from] HandleError),
    #[error("Event loop exited before the window was created")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Build winit window attributes from the window config.
pub fn window_attributes(config: &WindowConfig) -> WindowAttributes {
    Window::default_attributes()
        .with_title(&config.title)
        .with_inner_size(PhysicalSize::new(config.width, config.height))
        .with_resizable(config.resizable)
}

/// Event-loop side of the window.
struct WindowState {
    attributes: WindowAttributes,
    window: Option<Window>,
    events: Vec<WindowEvent>,
    close_requested: bool,
    resized: bool,
    creation_error: Option<String>,
}

impl WindowState {
    fn new(attributes: WindowAttributes) -> Self {
        Self {
            attributes,
            window: None,
            events: Vec::new(),
            close_requested: false,
            resized: false,
            creation_error: None,
        }
    }

    /// Update the close and resize flags for `event` and queue it.
    fn record(&mut self, event: WindowEvent) {
        match &event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                debug!("Window resized to {}x{}", size.width, size.height);
                self.resized = true;
            }
            WindowEvent::ScaleFactorChanged { .. } => self.resized = true,
            _ => {}
        }
        self.events.push(event);
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                let size = window.inner_size();
                info!("Window created: {}x{}", size.width, size.height);
                self.window = Some(window);
            }
            Err(e) => {
                self.creation_error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        self.record(event);
    }
}

/// A window plus the event loop that feeds it.
pub struct PlatformWindow {
    // The window must drop before its event loop.
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl PlatformWindow {
    /// Create the event loop and pump it until the window exists.
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        let mut platform = Self {
            state: WindowState::new(window_attributes(config)),
            event_loop,
        };

        for _ in 0..STARTUP_PUMPS {
            let status = platform.pump(Some(Duration::ZERO));
            if let Some(message) = platform.state.creation_error.take() {
                return Err(PlatformError::WindowCreation(message));
            }
            if platform.state.window.is_some() {
                return Ok(platform);
            }
            if let PumpStatus::Exit(_) = status {
                return Err(PlatformError::Closed);
            }
        }
        Err(PlatformError::WindowCreation(
            "window was not created during startup".into(),
        ))
    }

    fn pump(&mut self, timeout: Option<Duration>) -> PumpStatus {
        let status = self.event_loop.pump_app_events(timeout, &mut self.state);
        if let PumpStatus::Exit(_) = status {
            self.state.close_requested = true;
        }
        status
    }

    /// Process pending events without blocking.
    pub fn poll_events(&mut self) -> PumpStatus {
        self.pump(Some(Duration::ZERO))
    }

    /// Take the events queued since the last call.
    pub fn drain_events(&mut self) -> Vec<WindowEvent> {
        std::mem::take(&mut self.state.events)
    }

    pub const fn should_close(&self) -> bool {
        self.state.close_requested
    }

    /// Whether the window was resized since the last call.
    pub fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    pub fn window(&self) -> Option<&Window> {
        self.state.window.as_ref()
    }

    pub fn request_close(&mut self) {
        self.state.close_requested = true;
    }

    fn window_or_err(&self) -> kestrel_gpu::Result<&Window> {
        self.window()
            .ok_or_else(|| GpuError::SurfaceCreation("window has been closed".into()))
    }
}

impl DrawableTarget for PlatformWindow {
    fn drawable_size(&self) -> (u32, u32) {
        self.window().map_or((0, 0), |window| {
            let size = window.inner_size();
            (size.width, size.height)
        })
    }

    fn wait_for_events(&mut self) -> bool {
        if self.should_close() {
            return false;
        }
        self.pump(None);
        !self.should_close()
    }
}

impl SurfaceSource for PlatformWindow {
    fn required_extensions(&self) -> kestrel_gpu::Result<Vec<&'static CStr>> {
        let display = self
            .window_or_err()?
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        let names = ash_window::enumerate_required_extensions(display.as_raw())?;
        // SAFETY: ash-window returns pointers to static, nul-terminated
        // extension name constants.
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect())
    }

    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> kestrel_gpu::Result<vk::SurfaceKHR> {
        let window = self.window_or_err()?;
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        let handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        // SAFETY: the caller guarantees the instance has the platform
        // extensions enabled and outlives the surface.
        unsafe {
            ash_window::create_surface(entry, instance, display.as_raw(), handle.as_raw(), None)
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::Size;

    #[test]
    fn attributes_follow_config() {
        let config = WindowConfig {
            title: "Viewer".into(),
            width: 800,
            height: 600,
            resizable: false,
        };
        let attributes = window_attributes(&config);
        assert_eq!(attributes.title, "Viewer");
        assert!(!attributes.resizable);
        assert_eq!(
            attributes.inner_size,
            Some(Size::Physical(PhysicalSize::new(800, 600)))
        );
    }

    #[test]
    fn close_and_resize_events_set_flags() {
        let mut state = WindowState::new(Window::default_attributes());
        state.record(WindowEvent::Resized(PhysicalSize::new(640, 480)));
        assert!(state.resized);
        assert!(!state.close_requested);

        state.record(WindowEvent::CloseRequested);
        assert!(state.close_requested);
        assert_eq!(state.events.len(), 2);
    }
}
