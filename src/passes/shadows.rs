use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::{BindingContext, FrameContext, Pass, UpdateContext};
use crate::{
    allocator::{Allocator, UniformSlice},
    descriptors::{write_descriptor_set, Technique},
    error::RenderResult,
    image::{take_handle, AttachmentState},
    pipeline::{Pipeline, PipelineConfig},
    render_targets::{shadow_map_name, SHADOW_MAP_FORMAT},
    scene::Vertex,
    settings::RenderSettings,
};

/// Exactly one uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ShadowsUbo {
    pub projection: Mat4,
    pub view: Mat4,
    pub model: Mat4,
    pub cast_shadows: f32,
    pub _pad: [f32; 15],
}

const _: () = assert!(std::mem::size_of::<ShadowsUbo>() == 256);

impl Default for ShadowsUbo {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            model: Mat4::IDENTITY,
            cast_shadows: 0.0,
            _pad: [0.0; 15],
        }
    }
}

/// Depth-only render of the scene from one light into `shadowMap<light>`. Each light gets its
/// own instance and its own command buffer.
pub struct ShadowPass {
    light: usize,
    target: String,
    pipeline: Pipeline,
    descriptor_set: vk::DescriptorSet,
    uniforms: Option<UniformSlice>,
}

impl ShadowPass {
    pub fn new(allocator: &mut Allocator, settings: &RenderSettings, light: usize) -> RenderResult<Self> {
        let context = allocator.context.clone();
        let name = format!("Shadows {light}");
        let config = PipelineConfig {
            name: "shadows",
            vertex_shader: "shadows.vert.spv".into(),
            fragment_shader: None,
            vertex_bindings: Vertex::bindings(),
            vertex_attributes: Vertex::attributes(),
            extent: vk::Extent2D::default(),
            cull_mode: vk::CullModeFlags::NONE,
            blend_attachments: Vec::new(),
            dynamic_states: vec![
                vk::DynamicState::VIEWPORT,
                vk::DynamicState::SCISSOR,
                vk::DynamicState::DEPTH_BIAS,
            ],
            set_layouts: vec![Technique::Shadows, Technique::Mesh],
            push_constant_stages: vk::ShaderStageFlags::empty(),
            push_constant_size: 0,
            colour_formats: Vec::new(),
            depth_format: Some(SHADOW_MAP_FORMAT),
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            depth_bias: Some(settings.shadows.depth_bias),
        };

        let pipeline = Pipeline::build(&context, &settings.shader_dir, &config)?;
        let descriptor_set = context.allocate_descriptor_set(Technique::Shadows)?;
        context.set_debug_label(descriptor_set, &name);
        let uniforms = allocator.uniforms.allocate_for::<ShadowsUbo>()?;

        Ok(Self {
            light,
            target: shadow_map_name(light),
            pipeline,
            descriptor_set,
            uniforms: Some(uniforms),
        })
    }

    pub fn light(&self) -> usize {
        self.light
    }
}

impl Pass for ShadowPass {
    fn update(&mut self, frame: &UpdateContext) {
        let Some(uniforms) = &self.uniforms else {
            return;
        };
        let ubo = match frame.state.shadow_lights().nth(self.light) {
            Some(light) => ShadowsUbo {
                projection: light.projection,
                view: light.view,
                model: Mat4::IDENTITY,
                cast_shadows: frame.settings.shadow_cast as u32 as f32,
                ..Default::default()
            },
            None => ShadowsUbo::default(),
        };
        frame.uniforms.write(uniforms, &ubo);
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.transition(&self.target, AttachmentState::DepthOutput)?;
        let depth = frame.attachment(&self.target, vk::AttachmentLoadOp::CLEAR)?;
        let extent = frame.targets.image(&self.target)?.extent;

        frame.begin_rendering(extent.into(), &[], Some(&depth));

        let context = frame.context;
        let command_buffer = frame.command_buffer;
        let [constant, clamp, slope] = frame.settings.shadows.depth_bias;
        self.pipeline.bind(context, command_buffer);
        unsafe {
            context
                .device
                .cmd_set_depth_bias(command_buffer, constant, clamp, slope)
        };
        self.pipeline
            .bind_descriptor_sets(context, command_buffer, 0, &[self.descriptor_set]);
        frame.geometry.bind(context, command_buffer);

        for model in &frame.scene.models {
            if !model.render || !model.is_resident() {
                continue;
            }
            let Some(gpu) = &model.gpu else {
                continue;
            };
            for call in model.draw_calls() {
                self.pipeline.bind_descriptor_sets(
                    context,
                    command_buffer,
                    1,
                    &[gpu.meshes[call.mesh].descriptor_set],
                );
                unsafe {
                    context.device.cmd_draw_indexed(
                        command_buffer,
                        call.index_count,
                        1,
                        call.first_index,
                        call.vertex_offset,
                        0,
                    );
                }
            }
        }

        frame.end_rendering();
        frame.transition(&self.target, AttachmentState::Sampled)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        let Some(uniforms) = &self.uniforms else {
            return Ok(());
        };
        unsafe {
            write_descriptor_set(
                &bindings.context.device,
                Technique::Shadows,
                self.descriptor_set,
                &[bindings.uniforms.descriptor(uniforms)],
            )
        }
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        let context = allocator.context.clone();
        self.pipeline.destroy(&context);
        if let Some(set) = take_handle(&mut self.descriptor_set) {
            context.free_descriptor_sets(&[set]);
        }
        allocator.uniforms.release(&mut self.uniforms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::UNIFORM_ALIGNMENT;

    #[test]
    fn ubo_is_one_uniform_block() {
        assert_eq!(std::mem::size_of::<ShadowsUbo>() as u64, UNIFORM_ALIGNMENT);
        assert_eq!(bytemuck::offset_of!(ShadowsUbo, cast_shadows), 192);
    }

    #[test]
    fn lights_without_data_do_not_cast() {
        assert_eq!(ShadowsUbo::default().cast_shadows, 0.0);
    }
}
