//! Viewer application: clear color plus an optional vertex-buffer quad.

use std::fs::File;
use std::path::{Path, PathBuf};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use tracing::{info, warn};
use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use kestrel_app::{AppContext, FrameContext, GpuContext, KestrelApp, WindowEvent};
use kestrel_gpu::{
    full_viewport, GpuBuffer, GraphicsPipeline, GraphicsPipelineConfig, MemoryResidency,
};

const DEFAULT_CONFIG_PATH: &str = "kestrel.toml";
const VERTEX_SHADER: &str = "quad.vert.spv";
const FRAGMENT_SHADER: &str = "quad.frag.spv";

/// Seconds between frame-rate log lines.
const REPORT_INTERVAL: f32 = 5.0;

/// Quad vertex: position in clip space and a packed `0xAABBGGRR` color.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    pos: Vec2,
    color: u32,
}

impl Vertex {
    const fn new(x: f32, y: f32, color: u32) -> Self {
        Self {
            pos: Vec2::new(x, y),
            color,
        }
    }

    fn binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Self, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R8G8B8A8_UNORM,
                offset: std::mem::offset_of!(Self, color) as u32,
            },
        ]
    }
}

/// Two triangles covering the middle of the screen.
const QUAD: [Vertex; 6] = [
    Vertex::new(0.5, 0.5, 0xFFFF_FFFF),
    Vertex::new(-0.5, 0.5, 0xFFFF_FFFF),
    Vertex::new(-0.5, -0.5, 0xFFFF_FFFF),
    Vertex::new(-0.5, -0.5, 0xFFFF_FFFF),
    Vertex::new(0.5, -0.5, 0xFFFF_FFFF),
    Vertex::new(0.5, 0.5, 0xFFFF_FFFF),
];

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerArgs {
    pub config_path: PathBuf,
    pub shader_dir: Option<PathBuf>,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            shader_dir: None,
        }
    }
}

impl ViewerArgs {
    /// Parse options from the process arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        parsed.config_path = PathBuf::from(path);
                    }
                }
                "--shaders" => parsed.shader_dir = args.next().map(PathBuf::from),
                other => warn!("Ignoring unknown argument: {other}"),
            }
        }

        parsed
    }
}

/// What a key press asks the viewer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    FramesInFlight(usize),
    RebuildSwapchain,
    Quit,
}

fn key_action(code: KeyCode) -> Option<KeyAction> {
    match code {
        KeyCode::Digit1 | KeyCode::Numpad1 => Some(KeyAction::FramesInFlight(1)),
        KeyCode::Digit2 | KeyCode::Numpad2 => Some(KeyAction::FramesInFlight(2)),
        KeyCode::Digit3 | KeyCode::Numpad3 => Some(KeyAction::FramesInFlight(3)),
        KeyCode::KeyR => Some(KeyAction::RebuildSwapchain),
        KeyCode::Escape => Some(KeyAction::Quit),
        _ => None,
    }
}

/// GPU objects needed to draw the quad.
struct QuadPass {
    pipeline: GraphicsPipeline,
    vertices: GpuBuffer,
}

impl QuadPass {
    fn new(gpu: &GpuContext, shader_dir: &Path, color_format: vk::Format) -> anyhow::Result<Self> {
        let config = GraphicsPipelineConfig {
            vertex_shader: read_shader(&shader_dir.join(VERTEX_SHADER))?,
            fragment_shader: read_shader(&shader_dir.join(FRAGMENT_SHADER))?,
            vertex_bindings: vec![Vertex::binding()],
            vertex_attributes: Vertex::attributes(),
            color_format,
            ..Default::default()
        };
        let pipeline = GraphicsPipeline::new(gpu.device(), &config, &[])?;

        let size = std::mem::size_of_val(&QUAD) as u64;
        let vertices = match gpu.allocate_buffer(
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryResidency::CpuToGpu,
            "quad vertices",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                // SAFETY: the pipeline was never used.
                unsafe { pipeline.destroy(gpu.device()) };
                return Err(e.into());
            }
        };
        let pass = Self { pipeline, vertices };
        // Written once: in-flight frames read this buffer.
        if let Err(e) = pass.vertices.write(&QUAD) {
            pass.destroy(gpu);
            return Err(e.into());
        }

        Ok(pass)
    }

    fn record(&self, gpu: &GpuContext, frame: &FrameContext) {
        let device = gpu.device();
        let cmd = frame.command_buffer;
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: frame.extent,
        };

        // SAFETY: `cmd` is recording inside a pass whose color format matches
        // the pipeline.
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_set_viewport(cmd, 0, &[full_viewport(frame.extent)]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertices.buffer], &[0]);
            device.cmd_draw(cmd, QUAD.len() as u32, 1, 0, 0);
        }
    }

    /// The GPU must be idle.
    fn destroy(mut self, gpu: &GpuContext) {
        // SAFETY: caller guarantees the GPU is idle.
        unsafe { self.pipeline.destroy(gpu.device()) };
        if let Err(e) = gpu.free_buffer(&mut self.vertices) {
            warn!("Failed to free quad vertices: {e}");
        }
    }
}

fn read_shader(path: &Path) -> anyhow::Result<Vec<u32>> {
    let mut file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
    Ok(ash::util::read_spv(&mut file)?)
}

/// Viewer application state.
pub struct Viewer {
    shader_dir: Option<PathBuf>,
    quad: Option<QuadPass>,
    elapsed: f32,
    frames_at_report: u64,
}

impl Viewer {
    fn build_quad(&mut self, ctx: &AppContext) {
        let Some(dir) = &self.shader_dir else {
            return;
        };
        match QuadPass::new(ctx.gpu(), dir, ctx.swapchain_format()) {
            Ok(quad) => {
                info!("Quad pipeline created from {}", dir.display());
                self.quad = Some(quad);
            }
            Err(e) => warn!("Quad disabled: {e:#}"),
        }
    }
}

impl KestrelApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let args = ViewerArgs::from_args();
        let mut viewer = Self {
            shader_dir: args.shader_dir,
            quad: None,
            elapsed: 0.0,
            frames_at_report: 0,
        };
        viewer.build_quad(ctx);

        info!(
            "Viewer ready: {}x{}, {} frames in flight. Keys: 1-3 frames in flight, R rebuild, Esc quit",
            ctx.width(),
            ctx.height(),
            ctx.frames_in_flight()
        );
        Ok(viewer)
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) {
        self.elapsed += dt;
        if self.elapsed >= REPORT_INTERVAL {
            let frames = ctx.frame_count() - self.frames_at_report;
            info!(
                "{:.1} fps over the last {:.1}s ({} in flight)",
                frames as f32 / self.elapsed,
                self.elapsed,
                ctx.frames_in_flight()
            );
            self.elapsed = 0.0;
            self.frames_at_report = ctx.frame_count();
        }
    }

    fn record(&mut self, gpu: &GpuContext, frame: &FrameContext) -> anyhow::Result<()> {
        if let Some(quad) = &self.quad {
            quad.record(gpu, frame);
        }
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, _width: u32, _height: u32) -> anyhow::Result<()> {
        // Viewport and scissor are dynamic, only a format change needs a new
        // pipeline.
        let stale = self
            .quad
            .as_ref()
            .is_some_and(|quad| quad.pipeline.color_format != ctx.swapchain_format());
        if stale {
            ctx.renderer.wait_idle()?;
            if let Some(quad) = self.quad.take() {
                quad.destroy(ctx.gpu());
            }
            self.build_quad(ctx);
        }
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) {
        let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(code),
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
            ..
        } = event
        else {
            return;
        };

        match key_action(*code) {
            Some(KeyAction::FramesInFlight(count)) => {
                ctx.set_frames_in_flight(count);
            }
            Some(KeyAction::RebuildSwapchain) => ctx.request_resize(),
            Some(KeyAction::Quit) => ctx.request_exit(),
            None => {}
        }
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(quad) = self.quad.take() {
            quad.destroy(ctx.gpu());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> ViewerArgs {
        ViewerArgs::parse(list.iter().map(ToString::to_string))
    }

    #[test]
    fn parses_config_and_shader_dir() {
        let parsed = args(&["--config", "custom.toml", "--shaders", "shaders/out"]);
        assert_eq!(parsed.config_path, PathBuf::from("custom.toml"));
        assert_eq!(parsed.shader_dir, Some(PathBuf::from("shaders/out")));
    }

    #[test]
    fn defaults_without_arguments() {
        assert_eq!(args(&[]), ViewerArgs::default());
        assert_eq!(args(&["--bogus"]).config_path, PathBuf::from("kestrel.toml"));
    }

    #[test]
    fn number_keys_pick_frames_in_flight() {
        assert_eq!(key_action(KeyCode::Digit1), Some(KeyAction::FramesInFlight(1)));
        assert_eq!(key_action(KeyCode::Numpad3), Some(KeyAction::FramesInFlight(3)));
        assert_eq!(key_action(KeyCode::KeyR), Some(KeyAction::RebuildSwapchain));
        assert_eq!(key_action(KeyCode::Escape), Some(KeyAction::Quit));
        assert_eq!(key_action(KeyCode::KeyW), None);
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 12);
        let attributes = Vertex::attributes();
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 8);
        assert_eq!(Vertex::binding().stride, 12);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&QUAD).len(), 72);
    }
}
