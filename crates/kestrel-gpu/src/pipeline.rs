//! Graphics pipelines for dynamic rendering.

use ash::vk;
use tracing::debug;

use crate::error::{GpuError, Result};

/// Immutable graphics pipeline description.
///
/// Defaults: triangle list, filled polygons, no culling, clockwise front
/// faces, no depth attachment, one `B8G8R8A8_SRGB` color attachment without
/// blending.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineConfig {
    /// SPIR-V words of the vertex stage.
    pub vertex_shader: Vec<u32>,
    /// SPIR-V words of the fragment stage.
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    pub blend: bool,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: None,
            blend: false,
        }
    }
}

impl GraphicsPipelineConfig {
    fn color_blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        let attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        if self.blend {
            attachment
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
        } else {
            attachment.blend_enable(false)
        }
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    /// Color format the pipeline was built for.
    pub color_format: vk::Format,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline with dynamic viewport and scissor.
    pub fn new(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        if config.vertex_shader.is_empty() || config.fragment_shader.is_empty() {
            return Err(GpuError::InvalidArgument(
                "pipeline needs vertex and fragment SPIR-V".into(),
            ));
        }

        let vert_module = create_shader_module(device, &config.vertex_shader, "vertex")?;
        let frag_module = match create_shader_module(device, &config.fragment_shader, "fragment") {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };

        let built = build_pipeline(
            device,
            config,
            vert_module,
            frag_module,
            push_constant_ranges,
        );

        // SAFETY: modules are only referenced during pipeline creation.
        unsafe {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
        }

        let (pipeline, layout) = built?;
        debug!("Graphics pipeline created for {:?}", config.color_format);

        Ok(Self {
            pipeline,
            layout,
            color_format: config.color_format,
        })
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The pipeline must not be in use by the GPU.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn create_shader_module(device: &ash::Device, code: &[u32], stage: &str) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    // SAFETY: `code` outlives the call. Validity of the SPIR-V is checked by
    // the driver.
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| GpuError::PipelineCreation(format!("{stage} shader module: {e}")))
}

fn build_pipeline(
    device: &ash::Device,
    config: &GraphicsPipelineConfig,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(c"main"),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&config.vertex_bindings)
        .vertex_attribute_descriptions(&config.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(config.topology)
        .primitive_restart_enable(false);

    // Viewport (dynamic)
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(config.polygon_mode)
        .cull_mode(config.cull_mode)
        .front_face(config.front_face)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_enabled = config.depth_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth_enabled)
        .depth_write_enable(depth_enabled)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [config.color_blend_attachment()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let layout_info =
        vk::PipelineLayoutCreateInfo::default().push_constant_ranges(push_constant_ranges);
    // SAFETY: create infos reference locals that outlive the calls below.
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

    let color_formats = [config.color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if let Some(depth_format) = config.depth_format {
        rendering_info = rendering_info.depth_attachment_format(depth_format);
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    match pipelines {
        Ok(pipelines) => Ok((pipelines[0], layout)),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_an_unculled_color_only_pipeline() {
        let config = GraphicsPipelineConfig::default();
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(config.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(config.front_face, vk::FrontFace::CLOCKWISE);
        assert!(config.depth_format.is_none());
        assert_eq!(
            config.color_blend_attachment().blend_enable,
            vk::FALSE
        );
    }

    #[test]
    fn blending_uses_source_alpha() {
        let config = GraphicsPipelineConfig {
            blend: true,
            ..Default::default()
        };
        let attachment = config.color_blend_attachment();
        assert_eq!(attachment.blend_enable, vk::TRUE);
        assert_eq!(attachment.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            attachment.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
    }
}
