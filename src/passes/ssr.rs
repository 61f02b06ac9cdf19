use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::{BindingContext, FrameContext, FullscreenPass, Pass, UpdateContext};
use crate::{
    allocator::{Allocator, UniformSlice},
    descriptors::Technique,
    error::RenderResult,
    frame_plan::PassKind,
    image::AttachmentState,
    render_targets::{ALBEDO, DEPTH, NORMAL, SRM, SSR},
    settings::RenderSettings,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SsrUbo {
    /// Projection, view, inverse projection, inverse view.
    pub matrices: [Mat4; 4],
    /// Max distance, step count, thickness, unused.
    pub params: Vec4,
}

impl SsrUbo {
    pub fn new(projection: Mat4, view: Mat4, max_distance: f32) -> Self {
        Self {
            matrices: [projection, view, projection.inverse(), view.inverse()],
            params: Vec4::new(max_distance, 64.0, 0.1, 0.0),
        }
    }
}

/// Screen space reflections into `ssr`.
pub struct SsrPass {
    ssr: FullscreenPass,
    uniforms: Option<UniformSlice>,
}

impl SsrPass {
    pub fn new(allocator: &mut Allocator, settings: &RenderSettings) -> RenderResult<Self> {
        let context = allocator.context.clone();
        Ok(Self {
            ssr: FullscreenPass::new(&context, settings, Technique::Ssr, vk::Format::R8G8B8A8_UNORM)?,
            uniforms: Some(allocator.uniforms.allocate_for::<SsrUbo>()?),
        })
    }
}

impl Pass for SsrPass {
    fn update(&mut self, frame: &UpdateContext) {
        if let Some(uniforms) = &self.uniforms {
            frame.uniforms.write(
                uniforms,
                &SsrUbo::new(
                    frame.state.projection,
                    frame.state.view,
                    frame.settings.ssr_max_distance,
                ),
            );
        }
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.transition_all(PassKind::Ssr.reads(frame.settings), AttachmentState::Sampled)?;
        frame.transition(SSR, AttachmentState::ColourOutput)?;
        self.ssr
            .record(frame, SSR, vk::AttachmentLoadOp::CLEAR, Vec4::ZERO)?;
        frame.transition(SSR, AttachmentState::Sampled)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        let Some(uniforms) = &self.uniforms else {
            return Ok(());
        };
        let targets = bindings.targets;
        self.ssr.write(
            bindings.context,
            &[
                targets.descriptor(ALBEDO)?,
                targets.descriptor(DEPTH)?,
                targets.descriptor(NORMAL)?,
                targets.descriptor(SRM)?,
                bindings.uniforms.descriptor(uniforms),
            ],
        )
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        self.ssr.destroy(&allocator.context);
        allocator.uniforms.release(&mut self.uniforms);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    #[test]
    fn inverse_matrices_undo_the_forward_ones() {
        let projection = Mat4::perspective_rh(1.0, 1.5, 0.1, 50.0);
        let view = Mat4::look_at_rh(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, Vec3::Y);
        let ubo = SsrUbo::new(projection, view, 8.0);
        assert!((ubo.matrices[0] * ubo.matrices[2]).abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert!((ubo.matrices[1] * ubo.matrices[3]).abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert_eq!(ubo.params.x, 8.0);
    }
}
