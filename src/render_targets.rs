use std::collections::HashMap;

use ash::vk;

use crate::{
    allocator::Allocator,
    descriptors::DescriptorResource,
    error::{RenderError, RenderResult},
    image::{AttachmentState, Image, ImageDesc, SamplerKind},
    settings::MAX_SHADOW_LIGHTS,
    Context, FULL_IMAGE,
};

pub const ALBEDO: &str = "albedo";
pub const DEPTH: &str = "depth";
pub const NORMAL: &str = "normal";
pub const SRM: &str = "srm";
pub const VELOCITY: &str = "velocity";
pub const EMISSIVE: &str = "emissive";
pub const SSAO: &str = "ssao";
pub const SSAO_BLUR: &str = "ssaoBlur";
pub const SSR: &str = "ssr";
pub const SKY: &str = "sky";
pub const COMPOSITION: &str = "composition";
pub const BLOOM: &str = "bloom";
pub const BLOOM_BLUR_H: &str = "bloomBlurH";
pub const BLOOM_BLUR_V: &str = "bloomBlurV";
pub const GBUFFER_DEPTH: &str = "gbufferDepth";
/// 1x1 white. Bound wherever a disabled effect's output would otherwise be sampled.
pub const BLANK: &str = "blank";

pub const GBUFFER_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const SHADOW_MAP_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const COLOUR: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::SAMPLED.as_raw(),
);

/// Screen sized targets, recreated on every resize. `None` format means "same as the swapchain".
const SCREEN_TARGETS: &[(&str, Option<vk::Format>)] = &[
    (ALBEDO, Some(vk::Format::R8G8B8A8_UNORM)),
    (DEPTH, Some(vk::Format::R32_SFLOAT)),
    (NORMAL, Some(vk::Format::R16G16B16A16_SFLOAT)),
    (SRM, Some(vk::Format::R8G8B8A8_UNORM)),
    (VELOCITY, Some(vk::Format::R16G16_SFLOAT)),
    (EMISSIVE, Some(vk::Format::R8G8B8A8_UNORM)),
    (SSAO, Some(vk::Format::R8_UNORM)),
    (SSAO_BLUR, Some(vk::Format::R8_UNORM)),
    (SSR, Some(vk::Format::R8G8B8A8_UNORM)),
    (SKY, Some(vk::Format::R8G8B8A8_UNORM)),
    (COMPOSITION, None),
    (BLOOM, Some(vk::Format::R8G8B8A8_UNORM)),
    (BLOOM_BLUR_H, Some(vk::Format::R8G8B8A8_UNORM)),
    (BLOOM_BLUR_V, Some(vk::Format::R8G8B8A8_UNORM)),
    (GBUFFER_DEPTH, Some(GBUFFER_DEPTH_FORMAT)),
];

pub fn shadow_map_name(light: usize) -> String {
    format!("shadowMap{light}")
}

/// The G-buffer attachments in the order the geometry pipeline writes them.
pub const GBUFFER_OUTPUTS: [&str; 6] = [ALBEDO, DEPTH, NORMAL, SRM, VELOCITY, EMISSIVE];

pub fn gbuffer_formats() -> Vec<vk::Format> {
    GBUFFER_OUTPUTS
        .iter()
        .filter_map(|name| {
            SCREEN_TARGETS
                .iter()
                .find(|(target, _)| target == name)
                .and_then(|(_, format)| *format)
        })
        .collect()
}

#[derive(Debug)]
pub struct RenderTarget {
    pub image: Image,
    /// Bumped every time the target is recreated. Anything holding a descriptor to the target must
    /// have been rewritten against the current generation.
    pub generation: u32,
}

/// Every named image that is produced by one pass and consumed by another.
pub struct RenderTargets {
    targets: HashMap<String, RenderTarget>,
    extent: vk::Extent2D,
    surface_format: vk::Format,
    blank_needs_clear: bool,
}

impl RenderTargets {
    pub fn new(
        allocator: &mut Allocator,
        extent: vk::Extent2D,
        surface_format: vk::Format,
        shadow_map_size: u32,
    ) -> RenderResult<Self> {
        let mut targets = Self::empty(extent, surface_format);

        targets.create_screen_targets(allocator)?;
        targets.create_shadow_maps(allocator, shadow_map_size)?;

        let blank = Image::new(
            allocator,
            &ImageDesc::new(
                BLANK,
                vk::Format::R8G8B8A8_UNORM,
                vk::Extent2D {
                    width: 1,
                    height: 1,
                },
            )
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST),
        )?;
        targets.register(BLANK, blank);
        targets.blank_needs_clear = true;

        log::info!(
            "Created {} render targets at {}x{}",
            targets.targets.len(),
            extent.width,
            extent.height
        );

        Ok(targets)
    }

    pub(crate) fn empty(extent: vk::Extent2D, surface_format: vk::Format) -> Self {
        Self {
            targets: HashMap::new(),
            extent,
            surface_format,
            blank_needs_clear: false,
        }
    }

    fn create_screen_targets(&mut self, allocator: &mut Allocator) -> RenderResult<()> {
        for (name, format) in SCREEN_TARGETS {
            let format = format.unwrap_or(self.surface_format);
            let usage = match *name {
                GBUFFER_DEPTH => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                COMPOSITION => COLOUR | vk::ImageUsageFlags::TRANSFER_DST,
                _ => COLOUR,
            };
            let image = Image::new(
                allocator,
                &ImageDesc::new(name, format, self.extent).usage(usage),
            )?;
            if let Some(mut previous) = self.register(name, image) {
                previous.destroy(allocator);
            }
        }
        Ok(())
    }

    fn create_shadow_maps(&mut self, allocator: &mut Allocator, size: u32) -> RenderResult<()> {
        let extent = vk::Extent2D {
            width: size,
            height: size,
        };
        // Composition binds a fixed-size array, so every slot exists even with fewer lights.
        for light in 0..MAX_SHADOW_LIGHTS {
            let name = shadow_map_name(light);
            let image = Image::new(
                allocator,
                &ImageDesc::new(&name, SHADOW_MAP_FORMAT, extent)
                    .usage(
                        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                            | vk::ImageUsageFlags::SAMPLED,
                    )
                    .sampler(SamplerKind::Shadow),
            )?;
            if let Some(mut previous) = self.register(&name, image) {
                previous.destroy(allocator);
            }
        }
        Ok(())
    }

    /// Insert `image` under `name`, handing back whatever was registered there before.
    pub fn register(&mut self, name: &str, image: Image) -> Option<Image> {
        match self.targets.get_mut(name) {
            Some(target) => {
                target.generation += 1;
                Some(std::mem::replace(&mut target.image, image))
            }
            None => {
                self.targets.insert(
                    name.to_string(),
                    RenderTarget {
                        image,
                        generation: 0,
                    },
                );
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> RenderResult<&RenderTarget> {
        self.targets
            .get(name)
            .ok_or_else(|| RenderError::NotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> RenderResult<&mut RenderTarget> {
        self.targets
            .get_mut(name)
            .ok_or_else(|| RenderError::NotFound(name.to_string()))
    }

    pub fn image(&self, name: &str) -> RenderResult<&Image> {
        Ok(&self.get(name)?.image)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn surface_format(&self) -> vk::Format {
        self.surface_format
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// The sampled-image descriptor for `name`.
    pub fn descriptor(&self, name: &str) -> RenderResult<DescriptorResource> {
        let image = self.image(name)?;
        Ok(DescriptorResource::Image {
            view: image.view,
            sampler: image.sampler,
        })
    }

    /// `name` when `enabled`, the blank target otherwise.
    pub fn descriptor_or_blank(&self, name: &str, enabled: bool) -> RenderResult<DescriptorResource> {
        self.descriptor(if enabled { name } else { BLANK })
    }

    pub fn shadow_map_descriptors(&self) -> RenderResult<DescriptorResource> {
        (0..MAX_SHADOW_LIGHTS)
            .map(|light| {
                let image = self.image(&shadow_map_name(light))?;
                Ok((image.view, image.sampler))
            })
            .collect::<RenderResult<Vec<_>>>()
            .map(DescriptorResource::ImageArray)
    }

    /// Record a barrier moving `name` into `state`.
    pub fn transition(
        &mut self,
        context: &Context,
        command_buffer: vk::CommandBuffer,
        name: &str,
        state: AttachmentState,
    ) -> RenderResult<()> {
        self.get_mut(name)?
            .image
            .transition(context, command_buffer, state);
        Ok(())
    }

    /// Recreate every screen sized target at `extent`. Fixed size targets are left alone.
    pub fn resize(
        &mut self,
        allocator: &mut Allocator,
        extent: vk::Extent2D,
        surface_format: vk::Format,
    ) -> RenderResult<()> {
        log::debug!(
            "Resizing render targets {}x{} -> {}x{}",
            self.extent.width,
            self.extent.height,
            extent.width,
            extent.height
        );
        self.extent = extent;
        self.surface_format = surface_format;
        self.create_screen_targets(allocator)
    }

    pub fn resize_shadow_maps(&mut self, allocator: &mut Allocator, size: u32) -> RenderResult<()> {
        self.create_shadow_maps(allocator, size)
    }

    /// Forget every tracked layout, e.g. after the device went idle for a rebuild.
    pub fn reset_layouts(&mut self) {
        for target in self.targets.values_mut() {
            target.image.reset_state();
        }
        self.blank_needs_clear = self.targets.contains_key(BLANK);
    }

    /// Clears that have to happen once after (re)creation. Recorded before any pass runs.
    pub fn record_pending_clears(
        &mut self,
        context: &Context,
        command_buffer: vk::CommandBuffer,
    ) -> RenderResult<()> {
        if !self.blank_needs_clear {
            return Ok(());
        }

        let blank = &mut self.get_mut(BLANK)?.image;
        blank.transition(context, command_buffer, AttachmentState::TransferDst);
        unsafe {
            context.device.cmd_clear_color_image(
                command_buffer,
                blank.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue {
                    float32: [1.0, 1.0, 1.0, 1.0],
                },
                &[FULL_IMAGE],
            );
        }
        blank.transition(context, command_buffer, AttachmentState::Sampled);
        self.blank_needs_clear = false;
        Ok(())
    }

    /// Safe to call more than once.
    pub fn destroy(&mut self, allocator: &mut Allocator) {
        for (_, mut target) in self.targets.drain() {
            target.image.destroy(allocator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 640,
            height: 480,
        }
    }

    fn registry() -> RenderTargets {
        let mut targets = RenderTargets::empty(extent(), vk::Format::B8G8R8A8_UNORM);
        for (name, format) in SCREEN_TARGETS {
            let format = format.unwrap_or(vk::Format::B8G8R8A8_UNORM);
            targets.register(name, Image::placeholder(format, extent()));
        }
        targets
    }

    #[test]
    fn every_named_target_is_registered() {
        let targets = registry();
        for name in [
            "albedo",
            "depth",
            "normal",
            "srm",
            "velocity",
            "emissive",
            "ssao",
            "ssaoBlur",
            "ssr",
            "sky",
            "composition",
            "bloom",
            "bloomBlurH",
            "bloomBlurV",
            "gbufferDepth",
        ] {
            assert!(targets.get(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn unknown_name_is_not_found() {
        let targets = registry();
        match targets.get("velocityBuffer") {
            Err(RenderError::NotFound(name)) => assert_eq!(name, "velocityBuffer"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn same_name_same_target_until_recreated() {
        let mut targets = registry();
        let first = targets.image(ALBEDO).unwrap().handle;
        assert_eq!(targets.image(ALBEDO).unwrap().handle, first);
        assert_eq!(targets.get(ALBEDO).unwrap().generation, 0);

        let previous = targets.register(ALBEDO, Image::placeholder(vk::Format::R8G8B8A8_UNORM, extent()));
        assert_eq!(previous.map(|image| image.handle), Some(first));
        assert_eq!(targets.get(ALBEDO).unwrap().generation, 1);
    }

    #[test]
    fn composition_follows_surface_format() {
        let targets = registry();
        assert_eq!(
            targets.image(COMPOSITION).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );
    }

    #[test]
    fn gbuffer_formats_cover_every_output() {
        let formats = gbuffer_formats();
        assert_eq!(formats.len(), GBUFFER_OUTPUTS.len());
        assert_eq!(formats[0], vk::Format::R8G8B8A8_UNORM);
        assert_eq!(formats[1], vk::Format::R32_SFLOAT);
    }

    #[test]
    fn disabled_effects_fall_back_to_blank() {
        let mut targets = registry();
        let blank = Image::placeholder(vk::Format::R8G8B8A8_UNORM, vk::Extent2D { width: 1, height: 1 });
        let blank_view = blank.view;
        targets.register(BLANK, blank);
        match targets.descriptor_or_blank(SSAO_BLUR, false).unwrap() {
            DescriptorResource::Image { view, .. } => assert_eq!(view, blank_view),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reset_layouts_forgets_state() {
        let mut targets = registry();
        targets
            .get_mut(NORMAL)
            .unwrap()
            .image
            .assume_state(AttachmentState::Sampled);
        targets.reset_layouts();
        assert_eq!(
            targets.image(NORMAL).unwrap().state(),
            AttachmentState::Undefined
        );
    }

    #[test]
    fn shadow_maps_missing_is_an_error() {
        let targets = registry();
        assert!(targets.shadow_map_descriptors().is_err());
    }
}
