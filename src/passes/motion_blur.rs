use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::{BindingContext, FrameContext, FrameState, FullscreenPass, Pass, UpdateContext};
use crate::{
    allocator::{Allocator, UniformSlice},
    descriptors::Technique,
    error::RenderResult,
    frame_plan::{PassKind, SWAPCHAIN},
    image::AttachmentState,
    render_targets::{COMPOSITION, DEPTH, VELOCITY},
    settings::RenderSettings,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct MotionBlurUbo {
    pub inverse_view_projection: Mat4,
    pub previous_view_projection: Mat4,
    /// Strength, frame rate scale, unused, unused.
    pub params: Vec4,
}

/// Blur strength is scaled so the same motion looks the same at any frame rate.
const REFERENCE_FPS: f32 = 60.0;

impl MotionBlurUbo {
    pub fn new(state: &FrameState, previous_view_projection: Mat4, strength: f32) -> Self {
        let fps = if state.delta_time > 0.0 {
            1.0 / state.delta_time
        } else {
            REFERENCE_FPS
        };
        Self {
            inverse_view_projection: state.view_projection().inverse(),
            previous_view_projection,
            params: Vec4::new(strength, fps / REFERENCE_FPS, 0.0, 0.0),
        }
    }
}

pub struct MotionBlurPass {
    motion_blur: FullscreenPass,
    uniforms: Option<UniformSlice>,
}

impl MotionBlurPass {
    pub fn new(
        allocator: &mut Allocator,
        settings: &RenderSettings,
        surface_format: vk::Format,
    ) -> RenderResult<Self> {
        let context = allocator.context.clone();
        Ok(Self {
            motion_blur: FullscreenPass::new(&context, settings, Technique::MotionBlur, surface_format)?,
            uniforms: Some(allocator.uniforms.allocate_for::<MotionBlurUbo>()?),
        })
    }
}

impl Pass for MotionBlurPass {
    fn update(&mut self, frame: &UpdateContext) {
        if let Some(uniforms) = &self.uniforms {
            frame.uniforms.write(
                uniforms,
                &MotionBlurUbo::new(
                    frame.state,
                    frame.previous_view_projection,
                    frame.settings.motion_blur_strength,
                ),
            );
        }
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.copy_swapchain_to_composition()?;
        frame.transition_all(
            PassKind::MotionBlur.reads(frame.settings),
            AttachmentState::Sampled,
        )?;
        self.motion_blur
            .record(frame, SWAPCHAIN, vk::AttachmentLoadOp::LOAD, Vec4::ZERO)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        let Some(uniforms) = &self.uniforms else {
            return Ok(());
        };
        let targets = bindings.targets;
        self.motion_blur.write(
            bindings.context,
            &[
                targets.descriptor(COMPOSITION)?,
                targets.descriptor(DEPTH)?,
                targets.descriptor(VELOCITY)?,
                bindings.uniforms.descriptor(uniforms),
            ],
        )
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        self.motion_blur.destroy(&allocator.context);
        allocator.uniforms.release(&mut self.uniforms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_is_scaled_by_frame_rate() {
        let state = FrameState {
            delta_time: 1.0 / 120.0,
            ..Default::default()
        };
        let ubo = MotionBlurUbo::new(&state, Mat4::IDENTITY, 0.5);
        assert_eq!(ubo.params.x, 0.5);
        assert!((ubo.params.y - 2.0).abs() < 1e-4);
    }

    #[test]
    fn paused_frame_uses_the_reference_rate() {
        let state = FrameState {
            delta_time: 0.0,
            ..Default::default()
        };
        assert_eq!(MotionBlurUbo::new(&state, Mat4::IDENTITY, 1.0).params.y, 1.0);
    }
}
