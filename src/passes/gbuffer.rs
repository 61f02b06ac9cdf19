use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::{BindingContext, FrameContext, Pass, UpdateContext};
use crate::{
    allocator::Allocator,
    descriptors::Technique,
    error::RenderResult,
    image::AttachmentState,
    pipeline::{opaque_attachment, Pipeline, PipelineConfig},
    render_targets::{gbuffer_formats, GBUFFER_DEPTH, GBUFFER_DEPTH_FORMAT, GBUFFER_OUTPUTS},
    scene::Vertex,
    settings::RenderSettings,
    Context,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GeometryRegisters {
    pub view_projection: Mat4,
    pub previous_view_projection: Mat4,
}

/// Fills the G-buffer with every resident, render-enabled primitive.
///
/// Runs even with an empty scene so the G-buffer is always cleared before composition reads it.
pub struct GeometryPass {
    pipeline: Pipeline,
    registers: GeometryRegisters,
}

impl GeometryPass {
    pub fn new(context: &Context, settings: &RenderSettings) -> RenderResult<Self> {
        let colour_formats = gbuffer_formats();
        let config = PipelineConfig {
            name: "gbuffer",
            vertex_shader: "gbuffer.vert.spv".into(),
            fragment_shader: Some("gbuffer.frag.spv".into()),
            vertex_bindings: Vertex::bindings(),
            vertex_attributes: Vertex::attributes(),
            extent: vk::Extent2D::default(),
            cull_mode: vk::CullModeFlags::BACK,
            blend_attachments: vec![opaque_attachment(); colour_formats.len()],
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            set_layouts: vec![Technique::Mesh],
            push_constant_stages: vk::ShaderStageFlags::VERTEX,
            push_constant_size: std::mem::size_of::<GeometryRegisters>() as u32,
            colour_formats,
            depth_format: Some(GBUFFER_DEPTH_FORMAT),
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            depth_bias: None,
        };

        Ok(Self {
            pipeline: Pipeline::build(context, &settings.shader_dir, &config)?,
            registers: GeometryRegisters::default(),
        })
    }
}

impl Pass for GeometryPass {
    fn update(&mut self, frame: &UpdateContext) {
        self.registers = GeometryRegisters {
            view_projection: frame.state.view_projection(),
            previous_view_projection: frame.previous_view_projection,
        };
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.transition_all(GBUFFER_OUTPUTS, AttachmentState::ColourOutput)?;
        frame.transition(GBUFFER_DEPTH, AttachmentState::DepthOutput)?;

        let colour = GBUFFER_OUTPUTS
            .iter()
            .map(|name| frame.attachment(name, vk::AttachmentLoadOp::CLEAR))
            .collect::<RenderResult<Vec<_>>>()?;
        let depth = frame.attachment(GBUFFER_DEPTH, vk::AttachmentLoadOp::CLEAR)?;
        let extent = frame.targets.extent();

        frame.begin_rendering(frame.render_rect(extent), &colour, Some(&depth));

        let context = frame.context;
        let command_buffer = frame.command_buffer;
        let mut models = frame
            .scene
            .models
            .iter()
            .filter(|model| model.render && model.is_resident())
            .peekable();

        if models.peek().is_some() {
            self.pipeline.bind(context, command_buffer);
            self.pipeline
                .update_registers(context, command_buffer, &self.registers);
            frame.geometry.bind(context, command_buffer);

            for model in models {
                let Some(gpu) = &model.gpu else {
                    continue;
                };
                for call in model.draw_calls() {
                    self.pipeline.bind_descriptor_sets(
                        context,
                        command_buffer,
                        0,
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
        }

        frame.end_rendering();
        Ok(())
    }

    /// Mesh descriptor sets are written once at upload and never point at render targets.
    fn update_descriptor_sets(&mut self, _bindings: &BindingContext) -> RenderResult<()> {
        Ok(())
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        self.pipeline.destroy(&allocator.context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_fit_the_minimum_push_constant_budget() {
        assert!(std::mem::size_of::<GeometryRegisters>() <= 128);
    }

    #[test]
    fn one_blend_state_per_gbuffer_output() {
        assert_eq!(gbuffer_formats().len(), GBUFFER_OUTPUTS.len());
    }
}
