use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::{BindingContext, FrameContext, FrameState, FullscreenPass, Light, Pass, UpdateContext};
use crate::{
    allocator::{Allocator, UniformSlice},
    descriptors::Technique,
    error::RenderResult,
    frame_plan::{PassKind, SWAPCHAIN},
    image::AttachmentState,
    render_targets::{ALBEDO, DEPTH, EMISSIVE, NORMAL, SKY, SRM, SSAO_BLUR, SSR},
    settings::{RenderSettings, MAX_SHADOW_LIGHTS},
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct LightUniform {
    pub position: Vec4,
    /// Colour premultiplied by intensity.
    pub colour: Vec4,
    pub view_projection: Mat4,
}

impl From<&Light> for LightUniform {
    fn from(light: &Light) -> Self {
        Self {
            position: light.position.extend(1.0),
            colour: (light.colour * light.intensity).extend(light.intensity),
            view_projection: light.view_projection(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct CompositionUbo {
    pub inverse_view_projection: Mat4,
    pub view: Mat4,
    pub camera_position: Vec4,
    pub lights: [LightUniform; MAX_SHADOW_LIGHTS],
    /// AO on, reflections on, shadows on, light count.
    pub flags: Vec4,
}

impl CompositionUbo {
    pub fn new(state: &FrameState, settings: &RenderSettings) -> Self {
        let mut lights = [LightUniform::default(); MAX_SHADOW_LIGHTS];
        let mut count = 0;
        for (slot, light) in lights.iter_mut().zip(state.shadow_lights()) {
            *slot = light.into();
            count += 1;
        }

        Self {
            inverse_view_projection: state.view_projection().inverse(),
            view: state.view,
            camera_position: state.camera_position.extend(1.0),
            lights,
            flags: Vec4::new(
                settings.ssao as u32 as f32,
                settings.ssr as u32 as f32,
                settings.shadow_cast as u32 as f32,
                count as f32,
            ),
        }
    }
}

/// Lights the G-buffer into the swapchain image.
pub struct CompositionPass {
    composition: FullscreenPass,
    uniforms: Option<UniformSlice>,
}

impl CompositionPass {
    pub fn new(
        allocator: &mut Allocator,
        settings: &RenderSettings,
        surface_format: vk::Format,
    ) -> RenderResult<Self> {
        let context = allocator.context.clone();
        Ok(Self {
            composition: FullscreenPass::new(&context, settings, Technique::Composition, surface_format)?,
            uniforms: Some(allocator.uniforms.allocate_for::<CompositionUbo>()?),
        })
    }
}

impl Pass for CompositionPass {
    fn update(&mut self, frame: &UpdateContext) {
        if let Some(uniforms) = &self.uniforms {
            frame
                .uniforms
                .write(uniforms, &CompositionUbo::new(frame.state, frame.settings));
        }
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.transition_all(
            PassKind::Composition.reads(frame.settings),
            AttachmentState::Sampled,
        )?;
        frame.transition(SWAPCHAIN, AttachmentState::ColourOutput)?;
        self.composition
            .record(frame, SWAPCHAIN, vk::AttachmentLoadOp::CLEAR, Vec4::ZERO)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        let Some(uniforms) = &self.uniforms else {
            return Ok(());
        };
        let targets = bindings.targets;
        let settings = bindings.settings;
        self.composition.write(
            bindings.context,
            &[
                targets.descriptor(ALBEDO)?,
                targets.descriptor(DEPTH)?,
                targets.descriptor(NORMAL)?,
                targets.descriptor(SRM)?,
                bindings.uniforms.descriptor(uniforms),
                targets.descriptor_or_blank(SSAO_BLUR, settings.ssao)?,
                targets.descriptor_or_blank(SSR, settings.ssr)?,
                targets.descriptor(EMISSIVE)?,
                targets.descriptor(SKY)?,
                targets.shadow_map_descriptors()?,
            ],
        )
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        self.composition.destroy(&allocator.context);
        allocator.uniforms.release(&mut self.uniforms);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    #[test]
    fn lights_are_packed_and_counted() {
        let light = Light::directional(Vec3::new(5.0, 10.0, 0.0), Vec3::ZERO, Vec3::ONE, 2.0, 20.0);
        let state = FrameState {
            lights: vec![light; 2],
            ..Default::default()
        };
        let settings = RenderSettings::default().with_ssao(false);

        let ubo = CompositionUbo::new(&state, &settings);
        assert_eq!(ubo.flags, Vec4::new(0.0, 1.0, 1.0, 2.0));
        assert_eq!(ubo.lights[0].colour, Vec4::new(2.0, 2.0, 2.0, 2.0));
        assert_eq!(ubo.lights[2].colour, Vec4::ZERO);
    }

    #[test]
    fn extra_lights_are_ignored() {
        let light = Light::directional(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO, Vec3::ONE, 1.0, 20.0);
        let state = FrameState {
            lights: vec![light; 7],
            ..Default::default()
        };
        let ubo = CompositionUbo::new(&state, &RenderSettings::default());
        assert_eq!(ubo.flags.w, MAX_SHADOW_LIGHTS as f32);
    }
}
