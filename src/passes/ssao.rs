use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use rand::Rng;

use super::{BindingContext, FrameContext, FullscreenPass, Pass, UpdateContext};
use crate::{
    allocator::{Allocator, UniformSlice},
    descriptors::{DescriptorResource, Technique},
    error::RenderResult,
    frame_plan::PassKind,
    image::{AttachmentState, Image, ImageDesc, SamplerKind},
    render_targets::{DEPTH, NORMAL, SSAO, SSAO_BLUR},
    settings::RenderSettings,
};

pub const KERNEL_SIZE: usize = 16;
pub const NOISE_DIM: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SsaoKernel {
    pub samples: [Vec4; KERNEL_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SsaoUbo {
    pub projection: Mat4,
    pub inverse_projection: Mat4,
    pub view: Mat4,
    /// Radius, bias, noise scale x, noise scale y.
    pub params: Vec4,
}

/// Sample points in the +Z hemisphere, pulled towards the origin so nearby occluders count more.
pub fn ssao_kernel(rng: &mut impl Rng) -> SsaoKernel {
    let mut samples = [Vec4::ZERO; KERNEL_SIZE];
    for (i, sample) in samples.iter_mut().enumerate() {
        let direction = Vec3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(0.0..1.0),
        )
        .normalize_or(Vec3::Z);
        let scale = i as f32 / KERNEL_SIZE as f32;
        let scale = 0.1 + 0.9 * scale * scale;
        *sample = (direction * rng.gen_range(0.0..1.0f32) * scale).extend(0.0);
    }
    SsaoKernel { samples }
}

/// Random rotations around Z, tiled over the screen.
pub fn ssao_noise(rng: &mut impl Rng) -> Vec<Vec4> {
    (0..NOISE_DIM * NOISE_DIM)
        .map(|_| Vec4::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), 0.0, 0.0))
        .collect()
}

/// Ambient occlusion from depth and normals, then a blur into `ssaoBlur`.
pub struct SsaoPass {
    ssao: FullscreenPass,
    blur: FullscreenPass,
    noise: Image,
    kernel: Option<UniformSlice>,
    uniforms: Option<UniformSlice>,
}

impl SsaoPass {
    pub fn new(allocator: &mut Allocator, settings: &RenderSettings) -> RenderResult<Self> {
        let context = allocator.context.clone();
        let ssao = FullscreenPass::new(&context, settings, Technique::Ssao, vk::Format::R8_UNORM)?;
        let blur = FullscreenPass::new(&context, settings, Technique::SsaoBlur, vk::Format::R8_UNORM)?;

        let mut rng = rand::thread_rng();
        let extent = vk::Extent2D {
            width: NOISE_DIM,
            height: NOISE_DIM,
        };
        let mut noise = Image::new(
            allocator,
            &ImageDesc::new("SSAO Noise", vk::Format::R32G32B32A32_SFLOAT, extent)
                .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
                .sampler(SamplerKind::Tiled),
        )?;
        allocator.stage_image_transfer(
            bytemuck::cast_slice(&ssao_noise(&mut rng)),
            noise.handle,
            extent,
            1,
        )?;
        noise.assume_state(AttachmentState::Sampled);

        let kernel = allocator.uniforms.allocate_for::<SsaoKernel>()?;
        allocator.uniforms.write(&kernel, &ssao_kernel(&mut rng));
        let uniforms = allocator.uniforms.allocate_for::<SsaoUbo>()?;

        Ok(Self {
            ssao,
            blur,
            noise,
            kernel: Some(kernel),
            uniforms: Some(uniforms),
        })
    }
}

impl Pass for SsaoPass {
    fn update(&mut self, frame: &UpdateContext) {
        let Some(uniforms) = &self.uniforms else {
            return;
        };
        let projection = frame.state.projection;
        frame.uniforms.write(
            uniforms,
            &SsaoUbo {
                projection,
                inverse_projection: projection.inverse(),
                view: frame.state.view,
                params: Vec4::new(
                    frame.settings.ssao_radius,
                    0.025,
                    frame.extent.width as f32 / NOISE_DIM as f32,
                    frame.extent.height as f32 / NOISE_DIM as f32,
                ),
            },
        );
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        frame.transition_all(PassKind::Ssao.reads(frame.settings), AttachmentState::Sampled)?;

        frame.transition(SSAO, AttachmentState::ColourOutput)?;
        self.ssao
            .record(frame, SSAO, vk::AttachmentLoadOp::CLEAR, Vec4::ZERO)?;
        frame.transition(SSAO, AttachmentState::Sampled)?;

        frame.transition(SSAO_BLUR, AttachmentState::ColourOutput)?;
        self.blur
            .record(frame, SSAO_BLUR, vk::AttachmentLoadOp::CLEAR, Vec4::ZERO)?;
        frame.transition(SSAO_BLUR, AttachmentState::Sampled)
    }

    fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        let (Some(kernel), Some(uniforms)) = (&self.kernel, &self.uniforms) else {
            return Ok(());
        };
        let targets = bindings.targets;
        self.ssao.write(
            bindings.context,
            &[
                targets.descriptor(DEPTH)?,
                targets.descriptor(NORMAL)?,
                DescriptorResource::Image {
                    view: self.noise.view,
                    sampler: self.noise.sampler,
                },
                bindings.uniforms.descriptor(kernel),
                bindings.uniforms.descriptor(uniforms),
            ],
        )?;
        self.blur
            .write(bindings.context, &[targets.descriptor(SSAO)?])
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        let context = allocator.context.clone();
        self.ssao.destroy(&context);
        self.blur.destroy(&context);
        self.noise.destroy(allocator);
        allocator.uniforms.release(&mut self.kernel);
        allocator.uniforms.release(&mut self.uniforms);
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn kernel_fills_one_uniform_block() {
        assert_eq!(std::mem::size_of::<SsaoKernel>(), 256);
    }

    #[test]
    fn kernel_samples_lie_in_the_unit_hemisphere() {
        let kernel = ssao_kernel(&mut StdRng::seed_from_u64(7));
        for sample in kernel.samples {
            assert!(sample.z >= 0.0, "{sample}");
            assert!(sample.truncate().length() <= 1.0 + 1e-5, "{sample}");
            assert_eq!(sample.w, 0.0);
        }
    }

    #[test]
    fn noise_rotates_around_z() {
        let noise = ssao_noise(&mut StdRng::seed_from_u64(7));
        assert_eq!(noise.len(), (NOISE_DIM * NOISE_DIM) as usize);
        assert!(noise.iter().all(|n| n.z == 0.0 && n.w == 0.0));
        // 16 texels of RGBA32F
        assert_eq!(bytemuck::cast_slice::<Vec4, u8>(&noise).len(), 256);
    }
}
