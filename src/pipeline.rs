use std::path::{Path, PathBuf};

use ash::vk;

use crate::{
    descriptors::Technique,
    error::{RenderError, RenderResult},
    image::take_handle,
};

use super::context::Context;

/// Everything needed to build one graphics pipeline.
///
/// Shader paths are relative to [`crate::RenderSettings::shader_dir`]. Viewport and scissor are
/// always dynamic; `extent` only seeds the static viewport for pipelines that opt out of that with
/// an empty `dynamic_states`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub name: &'static str,
    pub vertex_shader: PathBuf,
    pub fragment_shader: Option<PathBuf>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub extent: vk::Extent2D,
    pub cull_mode: vk::CullModeFlags,
    pub blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub set_layouts: Vec<Technique>,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub push_constant_size: u32,
    pub colour_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    /// Constant factor, clamp, slope factor. `None` disables depth bias.
    pub depth_bias: Option<[f32; 3]>,
}

pub fn opaque_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

impl PipelineConfig {
    /// A screen-covering triangle with no vertex input, writing one colour attachment.
    pub fn fullscreen(
        name: &'static str,
        fragment_shader: impl Into<PathBuf>,
        technique: Technique,
        colour_format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            name,
            vertex_shader: "fullscreen.vert.spv".into(),
            fragment_shader: Some(fragment_shader.into()),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            extent,
            cull_mode: vk::CullModeFlags::NONE,
            blend_attachments: vec![opaque_attachment()],
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            set_layouts: vec![technique],
            push_constant_stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            push_constant_size: 2 * std::mem::size_of::<glam::Vec4>() as u32,
            colour_formats: vec![colour_format],
            depth_format: None,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::ALWAYS,
            depth_bias: None,
        }
    }

    /// Layout problems that would otherwise only show up as a validation error.
    pub fn validate(&self) -> RenderResult<()> {
        if self.blend_attachments.len() != self.colour_formats.len() {
            return Err(RenderError::PipelineCreationFailed(format!(
                "{}: {} blend attachments for {} colour attachments",
                self.name,
                self.blend_attachments.len(),
                self.colour_formats.len()
            )));
        }
        if (self.depth_test || self.depth_write) && self.depth_format.is_none() {
            return Err(RenderError::PipelineCreationFailed(format!(
                "{}: depth test without a depth attachment",
                self.name
            )));
        }
        if self.push_constant_size % 4 != 0 {
            return Err(RenderError::PipelineCreationFailed(format!(
                "{}: push constant size {} is not a multiple of 4",
                self.name, self.push_constant_size
            )));
        }
        Ok(())
    }
}

/// One pipeline and its layout.
pub struct Pipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_constant_stages: vk::ShaderStageFlags,
}

impl Pipeline {
    pub fn build(context: &Context, shader_dir: &Path, config: &PipelineConfig) -> RenderResult<Self> {
        config.validate()?;
        let device = &context.device;
        let layout = create_layout(
            context,
            &config.set_layouts,
            config.push_constant_stages,
            config.push_constant_size,
        )?;

        let vertex_module = load_module(shader_dir.join(&config.vertex_shader), context)?;
        let fragment_module = match &config.fragment_shader {
            Some(path) => match load_module(shader_dir.join(path), context) {
                Ok(module) => Some(module),
                Err(e) => {
                    unsafe {
                        device.destroy_shader_module(vertex_module, None);
                        device.destroy_pipeline_layout(layout, None);
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
            .name(c"main")
            .module(vertex_module)
            .stage(vk::ShaderStageFlags::VERTEX)];
        if let Some(module) = fragment_module {
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .name(c"main")
                    .module(module)
                    .stage(vk::ShaderStageFlags::FRAGMENT),
            );
        }

        let viewports = [vk::Viewport::default()
            .width(config.extent.width as _)
            .height(config.extent.height as _)
            .max_depth(1.)];
        let scissors = [vk::Rect2D::from(config.extent)];
        let viewport_state = if config.dynamic_states.is_empty() {
            vk::PipelineViewportStateCreateInfo::default()
                .viewports(&viewports)
                .scissors(&scissors)
        } else {
            vk::PipelineViewportStateCreateInfo::default()
                .scissor_count(1)
                .viewport_count(1)
        };

        let [bias_constant, bias_clamp, bias_slope] = config.depth_bias.unwrap_or_default();

        let result = unsafe {
            device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[vk::GraphicsPipelineCreateInfo::default()
                    .stages(&stages)
                    .vertex_input_state(
                        &vk::PipelineVertexInputStateCreateInfo::default()
                            .vertex_binding_descriptions(&config.vertex_bindings)
                            .vertex_attribute_descriptions(&config.vertex_attributes),
                    )
                    .input_assembly_state(
                        &vk::PipelineInputAssemblyStateCreateInfo::default()
                            .topology(vk::PrimitiveTopology::TRIANGLE_LIST),
                    )
                    .viewport_state(&viewport_state)
                    .dynamic_state(
                        &vk::PipelineDynamicStateCreateInfo::default()
                            .dynamic_states(&config.dynamic_states),
                    )
                    .rasterization_state(
                        &vk::PipelineRasterizationStateCreateInfo::default()
                            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
                            .cull_mode(config.cull_mode)
                            .polygon_mode(vk::PolygonMode::FILL)
                            .depth_bias_enable(config.depth_bias.is_some())
                            .depth_bias_constant_factor(bias_constant)
                            .depth_bias_clamp(bias_clamp)
                            .depth_bias_slope_factor(bias_slope)
                            .line_width(1.0),
                    )
                    .depth_stencil_state(
                        &vk::PipelineDepthStencilStateCreateInfo::default()
                            .depth_write_enable(config.depth_write)
                            .depth_test_enable(config.depth_test)
                            .depth_compare_op(config.depth_compare)
                            .stencil_test_enable(false)
                            .depth_bounds_test_enable(false)
                            .max_depth_bounds(1.),
                    )
                    .color_blend_state(
                        &vk::PipelineColorBlendStateCreateInfo::default()
                            .attachments(&config.blend_attachments),
                    )
                    .multisample_state(
                        &vk::PipelineMultisampleStateCreateInfo::default()
                            .rasterization_samples(vk::SampleCountFlags::TYPE_1),
                    )
                    .layout(layout)
                    .push_next(
                        &mut vk::PipelineRenderingCreateInfo::default()
                            .depth_attachment_format(
                                config.depth_format.unwrap_or(vk::Format::UNDEFINED),
                            )
                            .color_attachment_formats(&config.colour_formats),
                    )],
                None,
            )
        };

        // The modules are baked into the pipeline either way.
        unsafe {
            device.destroy_shader_module(vertex_module, None);
            if let Some(module) = fragment_module {
                device.destroy_shader_module(module, None);
            }
        }

        let handle = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(RenderError::PipelineCreationFailed(format!(
                    "{}: {e:?}",
                    config.name
                )));
            }
        };
        context.set_debug_label(handle, config.name);
        log::debug!("Built pipeline {}", config.name);

        Ok(Self {
            handle,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_constant_stages: config.push_constant_stages,
        })
    }

    pub fn build_compute(
        context: &Context,
        shader_dir: &Path,
        name: &'static str,
        shader: impl AsRef<Path>,
        set_layouts: &[Technique],
    ) -> RenderResult<Self> {
        let device = &context.device;
        let layout = create_layout(context, set_layouts, vk::ShaderStageFlags::COMPUTE, 0)?;
        let module = match load_module(shader_dir.join(shader), context) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        let result = unsafe {
            device.create_compute_pipelines(
                vk::PipelineCache::null(),
                &[vk::ComputePipelineCreateInfo::default()
                    .stage(
                        vk::PipelineShaderStageCreateInfo::default()
                            .name(c"main")
                            .module(module)
                            .stage(vk::ShaderStageFlags::COMPUTE),
                    )
                    .layout(layout)],
                None,
            )
        };
        unsafe { device.destroy_shader_module(module, None) };

        let handle = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(RenderError::PipelineCreationFailed(format!("{name}: {e:?}")));
            }
        };
        context.set_debug_label(handle, name);

        Ok(Self {
            handle,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_constant_stages: vk::ShaderStageFlags::empty(),
        })
    }

    pub fn bind(&self, context: &Context, command_buffer: vk::CommandBuffer) {
        unsafe {
            context
                .device
                .cmd_bind_pipeline(command_buffer, self.bind_point, self.handle)
        };
    }

    pub fn bind_descriptor_sets(
        &self,
        context: &Context,
        command_buffer: vk::CommandBuffer,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            context.device.cmd_bind_descriptor_sets(
                command_buffer,
                self.bind_point,
                self.layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    pub fn update_registers<Registers: bytemuck::Pod>(
        &self,
        context: &Context,
        command_buffer: vk::CommandBuffer,
        registers: &Registers,
    ) {
        unsafe {
            context.device.cmd_push_constants(
                command_buffer,
                self.layout,
                self.push_constant_stages,
                0,
                bytemuck::bytes_of(registers),
            )
        };
    }

    /// Safe to call more than once.
    pub fn destroy(&mut self, context: &Context) {
        unsafe {
            if let Some(handle) = take_handle(&mut self.handle) {
                context.device.destroy_pipeline(handle, None);
            }
            if let Some(layout) = take_handle(&mut self.layout) {
                context.device.destroy_pipeline_layout(layout, None);
            }
        }
    }
}

fn create_layout(
    context: &Context,
    techniques: &[Technique],
    push_constant_stages: vk::ShaderStageFlags,
    push_constant_size: u32,
) -> RenderResult<vk::PipelineLayout> {
    let set_layouts = techniques
        .iter()
        .map(|&technique| context.descriptor_set_layout(technique))
        .collect::<RenderResult<Vec<_>>>()?;

    let push_constant_ranges = if push_constant_size > 0 {
        vec![vk::PushConstantRange::default()
            .size(push_constant_size)
            .stage_flags(push_constant_stages)]
    } else {
        Vec::new()
    };

    Ok(unsafe {
        context.device.create_pipeline_layout(
            &vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&set_layouts)
                .push_constant_ranges(&push_constant_ranges),
            None,
        )
    }?)
}

pub fn load_module(path: impl AsRef<Path>, context: &Context) -> RenderResult<vk::ShaderModule> {
    let path = path.as_ref();
    let failed = |reason: String| RenderError::ShaderCreationFailed {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = std::fs::File::open(path).map_err(|e| failed(e.to_string()))?;
    let words = ash::util::read_spv(&mut file).map_err(|e| failed(e.to_string()))?;

    unsafe {
        context
            .device
            .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&words), None)
    }
    .map_err(|e| failed(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::fullscreen(
            "fxaa",
            "fxaa.frag.spv",
            Technique::Fxaa,
            vk::Format::B8G8R8A8_UNORM,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        )
    }

    #[test]
    fn fullscreen_config_is_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert!(config.vertex_bindings.is_empty());
        assert_eq!(config.set_layouts, vec![Technique::Fxaa]);
        assert_eq!(config.push_constant_size, 32);
    }

    #[test]
    fn blend_states_must_match_attachments() {
        let mut config = config();
        config.colour_formats.push(vk::Format::R8G8B8A8_UNORM);
        assert!(matches!(
            config.validate(),
            Err(RenderError::PipelineCreationFailed(_))
        ));
    }

    #[test]
    fn depth_test_needs_depth_format() {
        let mut config = config();
        config.depth_test = true;
        assert!(config.validate().is_err());
        config.depth_format = Some(vk::Format::D32_SFLOAT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn destroyed_handles_are_not_taken_again() {
        let mut pipeline = Pipeline {
            handle: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_constant_stages: vk::ShaderStageFlags::VERTEX,
        };
        assert!(take_handle(&mut pipeline.handle).is_none());
        assert!(take_handle(&mut pipeline.layout).is_none());
    }
}
