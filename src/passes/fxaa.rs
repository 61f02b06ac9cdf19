use ash::vk;
use glam::Vec4;

use super::{BindingContext, FrameContext, FullscreenPass, Pass, UpdateContext};
use crate::{
    allocator::Allocator,
    descriptors::Technique,
    error::RenderResult,
    frame_plan::SWAPCHAIN,
    render_targets::COMPOSITION,
    settings::RenderSettings,
};

/// Anti-aliases whatever is in the swapchain image, in place.
pub struct FxaaPass {
    fxaa: FullscreenPass,
    texel_size: Vec4,
}

impl FxaaPass {
    pub fn new(
        allocator: &mut Allocator,
        settings: &RenderSettings,
        surface_format: vk::Format,
    ) -> RenderResult<Self> {
        Ok(Self {
            fxaa: FullscreenPass::new(&allocator.context, settings, Technique::Fxaa, surface_format)?,
            texel_size: Vec4::ZERO,
        })
    }
}

impl Pass for FxaaPass {
    fn update(&mut self, frame: &UpdateContext) {
        self.texel_size = Vec4::new(
            1.0 / frame.extent.width.max(1) as f32,
            1.0 / frame.extent.height.max(1) as f32,
            0.0,
            0.0,
        );
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.copy_swapchain_to_composition()?;
        self.fxaa
            .record(frame, SWAPCHAIN, vk::AttachmentLoadOp::LOAD, self.texel_size)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        self.fxaa
            .write(bindings.context, &[bindings.targets.descriptor(COMPOSITION)?])
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        self.fxaa.destroy(&allocator.context);
    }
}
