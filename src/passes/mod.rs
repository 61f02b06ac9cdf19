//! One module per technique. Every pass owns its pipeline(s), descriptor sets and uniform slices;
//! render targets are borrowed from [`RenderTargets`] for the duration of a call.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::{
    allocator::{Allocator, UniformArena},
    descriptors::{write_descriptor_set, DescriptorResource, Technique},
    error::RenderResult,
    frame_plan::SWAPCHAIN,
    image::{take_handle, transition_barrier, AttachmentState},
    pipeline::{Pipeline, PipelineConfig},
    render_targets::{RenderTargets, COMPOSITION},
    scene::{Scene, SceneGeometry},
    settings::{RenderSettings, MAX_SHADOW_LIGHTS},
    swapchain::Drawable,
    Context,
};

pub mod bloom;
pub mod composition;
pub mod compute;
pub mod fxaa;
pub mod gbuffer;
pub mod motion_blur;
pub mod shadows;
pub mod skybox;
pub mod ssao;
pub mod ssr;
pub mod ui;

/// A light as seen by the lighting and shadow passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub position: Vec3,
    pub colour: Vec3,
    pub intensity: f32,
    pub view: Mat4,
    pub projection: Mat4,
}

impl Light {
    /// A light at `position` looking at `target`, casting shadows over a `size` wide square.
    pub fn directional(position: Vec3, target: Vec3, colour: Vec3, intensity: f32, size: f32) -> Self {
        let half = size * 0.5;
        let direction = (target - position).normalize_or_zero();
        let up = if direction.dot(Vec3::Y).abs() > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        Self {
            position,
            colour,
            intensity,
            view: Mat4::look_at_rh(position, target, up),
            projection: Mat4::orthographic_rh(-half, half, -half, half, 0.1, position.distance(target) * 2.0),
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// Per-frame input from the application.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub view: Mat4,
    pub projection: Mat4,
    pub camera_position: Vec3,
    /// Only the first [`MAX_SHADOW_LIGHTS`] are used.
    pub lights: Vec<Light>,
    /// Seconds since the last frame.
    pub delta_time: f32,
    pub time: f32,
}

impl Default for FrameState {
    fn default() -> Self {
        Self {
            view: Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y),
            projection: Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0),
            camera_position: Vec3::new(0.0, 2.0, 5.0),
            lights: Vec::new(),
            delta_time: 1.0 / 60.0,
            time: 0.0,
        }
    }
}

impl FrameState {
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    pub fn shadow_lights(&self) -> impl Iterator<Item = &Light> {
        self.lights.iter().take(MAX_SHADOW_LIGHTS)
    }
}

/// Everything [`Pass::update`] may look at.
pub struct UpdateContext<'a> {
    pub uniforms: &'a UniformArena,
    pub state: &'a FrameState,
    pub settings: &'a RenderSettings,
    pub extent: vk::Extent2D,
    pub previous_view_projection: Mat4,
}

/// Everything [`Pass::update_descriptor_sets`] may bind.
pub struct BindingContext<'a> {
    pub context: &'a Context,
    pub targets: &'a RenderTargets,
    pub uniforms: &'a UniformArena,
    pub settings: &'a RenderSettings,
}

/// The command buffer being recorded and the resources a pass may touch while recording.
pub struct FrameContext<'a> {
    pub context: &'a Context,
    pub command_buffer: vk::CommandBuffer,
    pub targets: &'a mut RenderTargets,
    pub drawable: Drawable,
    pub swapchain_state: AttachmentState,
    pub settings: &'a RenderSettings,
    pub scene: &'a Scene,
    pub geometry: &'a SceneGeometry,
}

impl FrameContext<'_> {
    /// Move a target, or the swapchain image, into `state`.
    pub fn transition(&mut self, name: &str, state: AttachmentState) -> RenderResult<()> {
        if name != SWAPCHAIN {
            return self
                .targets
                .transition(self.context, self.command_buffer, name, state);
        }
        if let Some(barrier) = transition_barrier(
            self.drawable.image,
            vk::ImageAspectFlags::COLOR,
            self.swapchain_state,
            state,
        ) {
            self.context.cmd_pipeline_barrier2(
                self.command_buffer,
                &vk::DependencyInfo::default().image_memory_barriers(&[barrier]),
            );
        }
        self.swapchain_state = state;
        Ok(())
    }

    pub fn transition_all<S: AsRef<str>>(
        &mut self,
        names: impl IntoIterator<Item = S>,
        state: AttachmentState,
    ) -> RenderResult<()> {
        for name in names {
            self.transition(name.as_ref(), state)?;
        }
        Ok(())
    }

    pub fn attachment(
        &self,
        name: &str,
        load_op: vk::AttachmentLoadOp,
    ) -> RenderResult<vk::RenderingAttachmentInfo<'static>> {
        if name == SWAPCHAIN {
            let [r, g, b, a] = self.settings.clear_color;
            return Ok(vk::RenderingAttachmentInfo::default()
                .image_view(self.drawable.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [r, g, b, a],
                    },
                }));
        }
        Ok(self.targets.image(name)?.rendering_attachment(load_op))
    }

    /// The part of `extent` covered by the configured render area.
    pub fn render_rect(&self, extent: vk::Extent2D) -> vk::Rect2D {
        render_rect(self.settings.render_area, extent)
    }

    /// UV offset and scale matching [`FrameContext::render_rect`].
    pub fn uv_area(&self) -> Vec4 {
        Vec4::from_array(self.settings.render_area)
    }

    pub fn begin_rendering(
        &self,
        area: vk::Rect2D,
        colour: &[vk::RenderingAttachmentInfo],
        depth: Option<&vk::RenderingAttachmentInfo>,
    ) {
        let device = &self.context.device;
        let mut info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(colour);
        if let Some(depth) = depth {
            info = info.depth_attachment(depth);
        }

        unsafe {
            device.cmd_begin_rendering(self.command_buffer, &info);

            // Set the dynamic state
            device.cmd_set_scissor(self.command_buffer, 0, &[area]);
            device.cmd_set_viewport(
                self.command_buffer,
                0,
                &[vk::Viewport::default()
                    .x(area.offset.x as _)
                    .y(area.offset.y as _)
                    .width(area.extent.width as _)
                    .height(area.extent.height as _)
                    .max_depth(1.)],
            );
        }
    }

    pub fn end_rendering(&self) {
        unsafe { self.context.device.cmd_end_rendering(self.command_buffer) };
    }

    /// Copy what has been rendered to the swapchain image so far into the composition target, so
    /// a post pass can sample it while rendering over the swapchain image.
    pub fn copy_swapchain_to_composition(&mut self) -> RenderResult<()> {
        self.transition(SWAPCHAIN, AttachmentState::TransferSrc)?;
        self.transition(COMPOSITION, AttachmentState::TransferDst)?;

        let extent = self.drawable.extent;
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.context.device.cmd_copy_image(
                self.command_buffer,
                self.drawable.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.targets.image(COMPOSITION)?.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::ImageCopy {
                    src_subresource: layers,
                    dst_subresource: layers,
                    extent: vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                    ..Default::default()
                }],
            );
        }

        self.transition(COMPOSITION, AttachmentState::Sampled)?;
        self.transition(SWAPCHAIN, AttachmentState::ColourOutput)
    }
}

pub fn render_rect(area: [f32; 4], extent: vk::Extent2D) -> vk::Rect2D {
    let [x, y, w, h] = area.map(|v| v.clamp(0.0, 1.0));
    let width = extent.width as f32;
    let height = extent.height as f32;
    let offset = vk::Offset2D {
        x: (x * width) as i32,
        y: (y * height) as i32,
    };
    vk::Rect2D {
        offset,
        extent: vk::Extent2D {
            width: ((w * width) as u32).min(extent.width - offset.x as u32).max(1),
            height: ((h * height) as u32).min(extent.height - offset.y as u32).max(1),
        },
    }
}

/// The capabilities every technique module has.
pub trait Pass {
    /// Write this frame's uniforms. Records nothing.
    fn update(&mut self, frame: &UpdateContext);

    /// Record transitions, rendering and draws into `frame.command_buffer`. Never submits.
    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()>;

    /// Point every descriptor set at the current render targets. The device must be idle.
    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()>;

    /// Safe to call more than once.
    fn destroy(&mut self, allocator: &mut Allocator);
}

/// Push constants shared by every fullscreen pipeline.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FullscreenRegisters {
    /// UV offset in xy, UV scale in zw.
    pub uv_area: Vec4,
    /// Technique specific.
    pub params: Vec4,
}

/// A screen covering triangle sampling one descriptor set, the building block of every post pass.
pub struct FullscreenPass {
    pub technique: Technique,
    pipeline: Pipeline,
    pub descriptor_set: vk::DescriptorSet,
}

impl FullscreenPass {
    /// Uses `<technique>.frag.spv` from the shader directory.
    pub fn new(
        context: &Context,
        settings: &RenderSettings,
        technique: Technique,
        colour_format: vk::Format,
    ) -> RenderResult<Self> {
        let config = PipelineConfig::fullscreen(
            technique.name(),
            format!("{}.frag.spv", technique.name()),
            technique,
            colour_format,
            vk::Extent2D::default(),
        );
        let mut pipeline = Pipeline::build(context, &settings.shader_dir, &config)?;
        let descriptor_set = match context.allocate_descriptor_set(technique) {
            Ok(set) => set,
            Err(e) => {
                pipeline.destroy(context);
                return Err(e);
            }
        };
        context.set_debug_label(descriptor_set, technique.name());

        Ok(Self {
            technique,
            pipeline,
            descriptor_set,
        })
    }

    pub fn write(&self, context: &Context, resources: &[DescriptorResource]) -> RenderResult<()> {
        unsafe {
            write_descriptor_set(&context.device, self.technique, self.descriptor_set, resources)
        }
    }

    /// Draw into `target`, which has to be in [`AttachmentState::ColourOutput`] already.
    pub fn record(
        &self,
        frame: &FrameContext,
        target: &str,
        load_op: vk::AttachmentLoadOp,
        params: Vec4,
    ) -> RenderResult<()> {
        let extent = if target == SWAPCHAIN {
            frame.drawable.extent
        } else {
            frame.targets.image(target)?.extent
        };
        let attachment = frame.attachment(target, load_op)?;
        let context = frame.context;
        let command_buffer = frame.command_buffer;

        frame.begin_rendering(frame.render_rect(extent), &[attachment], None);
        self.pipeline.bind(context, command_buffer);
        self.pipeline
            .bind_descriptor_sets(context, command_buffer, 0, &[self.descriptor_set]);
        self.pipeline.update_registers(
            context,
            command_buffer,
            &FullscreenRegisters {
                uv_area: frame.uv_area(),
                params,
            },
        );
        unsafe { context.device.cmd_draw(command_buffer, 3, 1, 0, 0) };
        frame.end_rendering();
        Ok(())
    }

    pub fn destroy(&mut self, context: &Context) {
        self.pipeline.destroy(context);
        if let Some(set) = take_handle(&mut self.descriptor_set) {
            context.free_descriptor_sets(&[set]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn full_render_area_covers_the_extent() {
        let rect = render_rect([0.0, 0.0, 1.0, 1.0], extent(1280, 720));
        assert_eq!(rect.offset, vk::Offset2D { x: 0, y: 0 });
        assert_eq!(rect.extent, extent(1280, 720));
    }

    #[test]
    fn partial_render_area_is_scaled() {
        let rect = render_rect([0.5, 0.25, 0.5, 0.5], extent(1000, 800));
        assert_eq!(rect.offset, vk::Offset2D { x: 500, y: 200 });
        assert_eq!(rect.extent, extent(500, 400));
    }

    #[test]
    fn render_area_never_leaves_the_extent() {
        let rect = render_rect([0.75, 0.0, 2.0, -1.0], extent(100, 100));
        assert_eq!(rect.offset.x, 75);
        assert_eq!(rect.extent, extent(25, 1));
    }

    #[test]
    fn fullscreen_registers_fit_the_push_constant_range() {
        assert_eq!(std::mem::size_of::<FullscreenRegisters>(), 32);
    }

    #[test]
    fn only_shadow_lights_are_iterated() {
        let light = Light::directional(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO, Vec3::ONE, 1.0, 20.0);
        let state = FrameState {
            lights: vec![light; 5],
            ..Default::default()
        };
        assert_eq!(state.shadow_lights().count(), MAX_SHADOW_LIGHTS);
    }
}
