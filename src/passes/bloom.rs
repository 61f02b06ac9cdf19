use ash::vk;
use glam::Vec4;

use super::{BindingContext, FrameContext, FullscreenPass, Pass, UpdateContext};
use crate::{
    allocator::Allocator,
    descriptors::Technique,
    error::RenderResult,
    frame_plan::SWAPCHAIN,
    image::AttachmentState,
    render_targets::{BLOOM, BLOOM_BLUR_H, BLOOM_BLUR_V, COMPOSITION},
    settings::RenderSettings,
};

/// Bright filter, separable Gaussian blur, then an additive combine over the swapchain image.
pub struct BloomPass {
    bright_filter: FullscreenPass,
    blur_h: FullscreenPass,
    blur_v: FullscreenPass,
    combine: FullscreenPass,
    params: BloomParams,
}

/// Push constant payloads for the four sub-passes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BloomParams {
    pub bright_filter: Vec4,
    pub blur_h: Vec4,
    pub blur_v: Vec4,
    pub combine: Vec4,
}

impl BloomParams {
    pub fn new(settings: &RenderSettings, extent: vk::Extent2D) -> Self {
        let texel = Vec4::new(
            1.0 / extent.width.max(1) as f32,
            1.0 / extent.height.max(1) as f32,
            0.0,
            0.0,
        );
        Self {
            bright_filter: Vec4::new(settings.bloom_threshold, 0.0, 0.0, 0.0),
            blur_h: Vec4::new(texel.x, 0.0, settings.bloom_range, 0.0),
            blur_v: Vec4::new(0.0, texel.y, settings.bloom_range, 0.0),
            combine: Vec4::new(settings.bloom_strength, 0.0, 0.0, 0.0),
        }
    }
}

impl BloomPass {
    pub fn new(
        allocator: &mut Allocator,
        settings: &RenderSettings,
        surface_format: vk::Format,
    ) -> RenderResult<Self> {
        let context = &allocator.context;
        let intermediate = vk::Format::R8G8B8A8_UNORM;
        Ok(Self {
            bright_filter: FullscreenPass::new(context, settings, Technique::BrightFilter, intermediate)?,
            blur_h: FullscreenPass::new(context, settings, Technique::GaussianBlurH, intermediate)?,
            blur_v: FullscreenPass::new(context, settings, Technique::GaussianBlurV, intermediate)?,
            combine: FullscreenPass::new(context, settings, Technique::Combine, surface_format)?,
            params: BloomParams::default(),
        })
    }

    fn filter(
        frame: &mut FrameContext,
        pass: &FullscreenPass,
        target: &str,
        params: Vec4,
    ) -> RenderResult<()> {
        frame.transition(target, AttachmentState::ColourOutput)?;
        pass.record(frame, target, vk::AttachmentLoadOp::CLEAR, params)?;
        frame.transition(target, AttachmentState::Sampled)
    }
}

impl Pass for BloomPass {
    fn update(&mut self, frame: &UpdateContext) {
        self.params = BloomParams::new(frame.settings, frame.extent);
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.copy_swapchain_to_composition()?;

        Self::filter(frame, &self.bright_filter, BLOOM, self.params.bright_filter)?;
        Self::filter(frame, &self.blur_h, BLOOM_BLUR_H, self.params.blur_h)?;
        Self::filter(frame, &self.blur_v, BLOOM_BLUR_V, self.params.blur_v)?;

        frame.transition(SWAPCHAIN, AttachmentState::ColourOutput)?;
        self.combine
            .record(frame, SWAPCHAIN, vk::AttachmentLoadOp::LOAD, self.params.combine)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        let context = bindings.context;
        let targets = bindings.targets;
        self.bright_filter
            .write(context, &[targets.descriptor(COMPOSITION)?])?;
        self.blur_h.write(context, &[targets.descriptor(BLOOM)?])?;
        self.blur_v
            .write(context, &[targets.descriptor(BLOOM_BLUR_H)?])?;
        self.combine.write(
            context,
            &[
                targets.descriptor(COMPOSITION)?,
                targets.descriptor(BLOOM_BLUR_V)?,
            ],
        )
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        let context = &allocator.context;
        self.bright_filter.destroy(context);
        self.blur_h.destroy(context);
        self.blur_v.destroy(context);
        self.combine.destroy(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blur_directions_are_separable() {
        let settings = RenderSettings::default();
        let params = BloomParams::new(
            &settings,
            vk::Extent2D {
                width: 200,
                height: 100,
            },
        );
        assert_eq!(params.blur_h.x, 1.0 / 200.0);
        assert_eq!(params.blur_h.y, 0.0);
        assert_eq!(params.blur_v.x, 0.0);
        assert_eq!(params.blur_v.y, 1.0 / 100.0);
        assert_eq!(params.bright_filter.x, settings.bloom_threshold);
        assert_eq!(params.combine.x, settings.bloom_strength);
    }

    #[test]
    fn zero_extent_does_not_divide_by_zero() {
        let params = BloomParams::new(&RenderSettings::default(), vk::Extent2D::default());
        assert!(params.blur_h.x.is_finite());
        assert!(params.blur_v.y.is_finite());
    }
}
