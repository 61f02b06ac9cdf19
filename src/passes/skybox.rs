use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3};

use super::{BindingContext, FrameContext, Pass, UpdateContext};
use crate::{
    allocator::{Allocator, UniformSlice},
    descriptors::{write_descriptor_set, DescriptorResource, Technique},
    error::RenderResult,
    image::{take_handle, AttachmentState, Image, ImageDesc},
    pipeline::{opaque_attachment, Pipeline, PipelineConfig},
    render_targets::SKY,
    settings::RenderSettings,
    Context,
};

/// Width and height of each cube face.
pub const SKY_FACE_SIZE: u32 = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SkyboxUbo {
    pub projection: Mat4,
    /// Camera rotation only, so the sky never moves with the camera.
    pub view: Mat4,
}

impl SkyboxUbo {
    pub fn new(projection: Mat4, view: Mat4) -> Self {
        Self {
            projection,
            view: Mat4::from_mat3(Mat3::from_mat4(view)),
        }
    }
}

/// Colours of a procedural gradient sky.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPalette {
    pub zenith: Vec3,
    pub horizon: Vec3,
    pub ground: Vec3,
}

pub const DAY_SKY: SkyPalette = SkyPalette {
    zenith: Vec3::new(0.18, 0.42, 0.85),
    horizon: Vec3::new(0.75, 0.85, 0.95),
    ground: Vec3::new(0.35, 0.32, 0.28),
};

pub const NIGHT_SKY: SkyPalette = SkyPalette {
    zenith: Vec3::new(0.01, 0.01, 0.04),
    horizon: Vec3::new(0.06, 0.07, 0.14),
    ground: Vec3::new(0.02, 0.02, 0.02),
};

/// Direction through texel (`u`, `v`) of cube face `face`, in `+X -X +Y -Y +Z -Z` order.
/// `u` and `v` are in -1..1.
fn face_direction(face: usize, u: f32, v: f32) -> Vec3 {
    match face {
        0 => Vec3::new(1.0, -v, -u),
        1 => Vec3::new(-1.0, -v, u),
        2 => Vec3::new(u, 1.0, v),
        3 => Vec3::new(u, -1.0, -v),
        4 => Vec3::new(u, -v, 1.0),
        _ => Vec3::new(-u, -v, -1.0),
    }
    .normalize()
}

/// RGBA8 texels for one face of `palette`'s sky.
pub fn sky_face(palette: &SkyPalette, face: usize, size: u32) -> Vec<u8> {
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let u = (x as f32 + 0.5) / size as f32 * 2.0 - 1.0;
            let v = (y as f32 + 0.5) / size as f32 * 2.0 - 1.0;
            let elevation = face_direction(face, u, v).y;
            let colour = if elevation >= 0.0 {
                palette.horizon.lerp(palette.zenith, elevation.sqrt())
            } else {
                palette.horizon.lerp(palette.ground, (-elevation).sqrt())
            };
            let [r, g, b] = colour.to_array().map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
            texels.extend_from_slice(&[r, g, b, 255]);
        }
    }
    texels
}

/// All six faces, ready to be staged as one cube image.
pub fn sky_cube(palette: &SkyPalette, size: u32) -> Vec<u8> {
    (0..6).flat_map(|face| sky_face(palette, face, size)).collect()
}

struct SkyCube {
    image: Image,
    descriptor_set: vk::DescriptorSet,
}

impl SkyCube {
    fn new(allocator: &mut Allocator, name: &str, palette: &SkyPalette) -> RenderResult<Self> {
        let extent = vk::Extent2D {
            width: SKY_FACE_SIZE,
            height: SKY_FACE_SIZE,
        };
        let mut image = Image::new(
            allocator,
            &ImageDesc::new(name, vk::Format::R8G8B8A8_UNORM, extent)
                .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
                .cube(),
        )?;
        allocator.stage_image_transfer(&sky_cube(palette, SKY_FACE_SIZE), image.handle, extent, 6)?;
        image.assume_state(AttachmentState::Sampled);

        let context = &allocator.context;
        let descriptor_set = context.allocate_descriptor_set(Technique::Skybox)?;
        context.set_debug_label(descriptor_set, name);
        Ok(Self {
            image,
            descriptor_set,
        })
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        if let Some(set) = take_handle(&mut self.descriptor_set) {
            allocator.context.free_descriptor_sets(&[set]);
        }
        self.image.destroy(allocator);
    }
}

/// Renders the sky cube into `sky`. The day sky is used while shadows are cast, the night sky
/// otherwise.
pub struct SkyboxPass {
    pipeline: Pipeline,
    day: SkyCube,
    night: SkyCube,
    uniforms: Option<UniformSlice>,
}

impl SkyboxPass {
    pub fn new(allocator: &mut Allocator, settings: &RenderSettings) -> RenderResult<Self> {
        let context = allocator.context.clone();
        let pipeline = Pipeline::build(&context, &settings.shader_dir, &skybox_config())?;
        Ok(Self {
            pipeline,
            day: SkyCube::new(allocator, "Day Sky", &DAY_SKY)?,
            night: SkyCube::new(allocator, "Night Sky", &NIGHT_SKY)?,
            uniforms: Some(allocator.uniforms.allocate_for::<SkyboxUbo>()?),
        })
    }

    fn cube(&self, settings: &RenderSettings) -> &SkyCube {
        if settings.shadow_cast {
            &self.day
        } else {
            &self.night
        }
    }
}

fn skybox_config() -> PipelineConfig {
    PipelineConfig {
        name: "skybox",
        vertex_shader: "skybox.vert.spv".into(),
        fragment_shader: Some("skybox.frag.spv".into()),
        vertex_bindings: Vec::new(),
        vertex_attributes: Vec::new(),
        extent: vk::Extent2D::default(),
        cull_mode: vk::CullModeFlags::NONE,
        blend_attachments: vec![opaque_attachment()],
        dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
        set_layouts: vec![Technique::Skybox],
        push_constant_stages: vk::ShaderStageFlags::empty(),
        push_constant_size: 0,
        colour_formats: vec![vk::Format::R8G8B8A8_UNORM],
        depth_format: None,
        depth_test: false,
        depth_write: false,
        depth_compare: vk::CompareOp::ALWAYS,
        depth_bias: None,
    }
}

impl Pass for SkyboxPass {
    fn update(&mut self, frame: &UpdateContext) {
        if let Some(uniforms) = &self.uniforms {
            frame.uniforms.write(
                uniforms,
                &SkyboxUbo::new(frame.state.projection, frame.state.view),
            );
        }
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.transition(SKY, AttachmentState::ColourOutput)?;
        let attachment = frame.attachment(SKY, vk::AttachmentLoadOp::CLEAR)?;
        let extent = frame.targets.extent();
        frame.begin_rendering(frame.render_rect(extent), &[attachment], None);

        let context = frame.context;
        let command_buffer = frame.command_buffer;
        self.pipeline.bind(context, command_buffer);
        self.pipeline.bind_descriptor_sets(
            context,
            command_buffer,
            0,
            &[self.cube(frame.settings).descriptor_set],
        );
        // The cube is generated in the vertex shader.
        unsafe { context.device.cmd_draw(command_buffer, 36, 1, 0, 0) };

        frame.end_rendering();
        frame.transition(SKY, AttachmentState::Sampled)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        let Some(uniforms) = &self.uniforms else {
            return Ok(());
        };
        for cube in [&self.day, &self.night] {
            write_cube_set(bindings.context, cube, bindings.uniforms.descriptor(uniforms))?;
        }
        Ok(())
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        self.pipeline.destroy(&allocator.context);
        self.day.destroy(allocator);
        self.night.destroy(allocator);
        allocator.uniforms.release(&mut self.uniforms);
    }
}

fn write_cube_set(
    context: &Context,
    cube: &SkyCube,
    uniforms: DescriptorResource,
) -> RenderResult<()> {
    unsafe {
        write_descriptor_set(
            &context.device,
            Technique::Skybox,
            cube.descriptor_set,
            &[
                uniforms,
                DescriptorResource::Image {
                    view: cube.image.view,
                    sampler: cube.image.sampler,
                },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_translation_is_dropped() {
        let view = Mat4::look_at_rh(Vec3::new(10.0, 5.0, -3.0), Vec3::ZERO, Vec3::Y);
        let ubo = SkyboxUbo::new(Mat4::IDENTITY, view);
        assert_eq!(ubo.view.w_axis, glam::Vec4::W);
        assert_eq!(ubo.view.x_axis.truncate(), view.x_axis.truncate());
    }

    #[test]
    fn cube_holds_six_rgba_faces() {
        assert_eq!(sky_cube(&DAY_SKY, 8).len(), 6 * 8 * 8 * 4);
    }

    #[test]
    fn top_face_is_zenith_and_bottom_face_is_ground() {
        let size = 16;
        let top = sky_face(&DAY_SKY, 2, size);
        let bottom = sky_face(&DAY_SKY, 3, size);
        let centre = ((size / 2 * size + size / 2) * 4) as usize;
        // Blue dominates straight up, the ground is warmer.
        assert!(top[centre + 2] > top[centre]);
        assert!(bottom[centre] > bottom[centre + 2]);
        assert_eq!(top[centre + 3], 255);
    }

    #[test]
    fn night_is_darker_than_day() {
        let brightness = |palette: &SkyPalette| -> u32 {
            sky_cube(palette, 4).iter().map(|&b| b as u32).sum()
        };
        assert!(brightness(&NIGHT_SKY) < brightness(&DAY_SKY));
    }

    #[test]
    fn face_directions_point_outwards() {
        let axes = [Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y, Vec3::Z, -Vec3::Z];
        for (face, axis) in axes.into_iter().enumerate() {
            assert!(face_direction(face, 0.0, 0.0).abs_diff_eq(axis, 1e-6), "{face}");
        }
    }
}
