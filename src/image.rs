use ash::vk::{self, Handle};

use crate::{
    allocator::{Allocator, MemoryAllocation},
    error::RenderResult,
    Context,
};

/// What an image is being used for right now. Every pass declares the state it needs and the
/// tracked state is moved there with an explicit barrier before the pass records anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Undefined,
    ColourOutput,
    DepthOutput,
    Sampled,
    TransferSrc,
    TransferDst,
    Swapchain,
}

/// The layout, stages and access an image is in while in a given [`AttachmentState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierInfo {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl AttachmentState {
    pub fn barrier_info(self) -> BarrierInfo {
        let (layout, stage, access) = match self {
            AttachmentState::Undefined => (
                vk::ImageLayout::UNDEFINED,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
            AttachmentState::ColourOutput => (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            AttachmentState::DepthOutput => (
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            AttachmentState::Sampled => (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
            AttachmentState::TransferSrc => (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            AttachmentState::TransferDst => (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            AttachmentState::Swapchain => (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
        };
        BarrierInfo {
            layout,
            stage,
            access,
        }
    }
}

/// The barrier that moves an image from `from` to `to`, or `None` when nothing has to happen.
///
/// Read-only states are left alone when they already match. Write states always get a barrier,
/// since two passes writing the same attachment back to back still need the first write to land.
pub fn transition_barrier(
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    from: AttachmentState,
    to: AttachmentState,
) -> Option<vk::ImageMemoryBarrier2<'static>> {
    if from == to && matches!(to, AttachmentState::Sampled | AttachmentState::Swapchain) {
        return None;
    }

    let src = from.barrier_info();
    let dst = to.barrier_info();
    Some(
        vk::ImageMemoryBarrier2::default()
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .image(image)
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .old_layout(src.layout)
            .new_layout(dst.layout),
    )
}

/// Null `handle` and hand back what it held, once. Lets every `destroy` be called twice.
pub fn take_handle<T: Handle + Copy>(handle: &mut T) -> Option<T> {
    if handle.is_null() {
        return None;
    }
    let taken = *handle;
    *handle = T::from_raw(0);
    Some(taken)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Linear filtering, clamped. Every screen-sized target uses this.
    Clamp,
    /// Nearest filtering, repeated. SSAO noise tiles across the screen.
    Tiled,
    /// Anisotropic, repeated. Model textures.
    Material,
    /// Depth comparison sampler for shadow maps.
    Shadow,
}

#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    /// Six layers makes a cube map.
    pub layers: u32,
    pub sampler: SamplerKind,
}

impl<'a> ImageDesc<'a> {
    pub fn new(name: &'a str, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            name,
            format,
            extent,
            usage: vk::ImageUsageFlags::SAMPLED,
            layers: 1,
            sampler: SamplerKind::Clamp,
        }
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn cube(mut self) -> Self {
        self.layers = 6;
        self
    }

    pub fn sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// A GPU image with its view, sampler and tracked layout.
#[derive(Debug)]
pub struct Image {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect_mask: vk::ImageAspectFlags,
    pub layers: u32,
    state: AttachmentState,
    allocation: Option<MemoryAllocation>,
}

impl Image {
    pub fn new(allocator: &mut Allocator, desc: &ImageDesc) -> RenderResult<Self> {
        let context = allocator.context.clone();
        let device = &context.device;
        let cube = desc.layers == 6;

        let handle = unsafe {
            device.create_image(
                &vk::ImageCreateInfo::default()
                    .flags(if cube {
                        vk::ImageCreateFlags::CUBE_COMPATIBLE
                    } else {
                        vk::ImageCreateFlags::empty()
                    })
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(desc.format)
                    .extent(desc.extent.into())
                    .mip_levels(1)
                    .array_layers(desc.layers)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(desc.usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                None,
            )
        }?;
        context.set_debug_label(handle, desc.name);

        let allocation = match allocator.bind_image(handle) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(handle, None) };
                return Err(e);
            }
        };

        // If the image is in a depth format, then set the depth flags
        let aspect_mask = if is_depth_format(desc.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let view = unsafe {
            device.create_image_view(
                &vk::ImageViewCreateInfo::default()
                    .image(handle)
                    .view_type(if cube {
                        vk::ImageViewType::CUBE
                    } else {
                        vk::ImageViewType::TYPE_2D
                    })
                    .format(desc.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: desc.layers,
                    }),
                None,
            )
        }?;

        let sampler = if desc.usage.contains(vk::ImageUsageFlags::SAMPLED) {
            create_sampler(&context, desc.sampler)?
        } else {
            vk::Sampler::null()
        };

        Ok(Self {
            handle,
            view,
            sampler,
            format: desc.format,
            extent: desc.extent,
            aspect_mask,
            layers: desc.layers,
            state: AttachmentState::Undefined,
            allocation: Some(allocation),
        })
    }

    pub fn state(&self) -> AttachmentState {
        self.state
    }

    /// Forget the tracked layout, e.g. after the contents were discarded by a recreation.
    pub fn reset_state(&mut self) {
        self.state = AttachmentState::Undefined;
    }

    /// Used when a transition happened as a side effect of some other command (uploads finish
    /// in `Sampled`).
    pub fn assume_state(&mut self, state: AttachmentState) {
        self.state = state;
    }

    /// Record the barrier into `to`, if one is needed.
    pub fn transition(
        &mut self,
        context: &Context,
        command_buffer: vk::CommandBuffer,
        to: AttachmentState,
    ) {
        if let Some(barrier) = transition_barrier(self.handle, self.aspect_mask, self.state, to) {
            context.cmd_pipeline_barrier2(
                command_buffer,
                &vk::DependencyInfo::default().image_memory_barriers(&[barrier]),
            );
        }
        self.state = to;
    }

    pub fn rendering_attachment(&self, load_op: vk::AttachmentLoadOp) -> vk::RenderingAttachmentInfo<'static> {
        let clear_value = if self.aspect_mask == vk::ImageAspectFlags::DEPTH {
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            }
        } else {
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 0.0],
                },
            }
        };

        vk::RenderingAttachmentInfo::default()
            .image_view(self.view)
            .image_layout(self.state.barrier_info().layout)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_value)
    }

    /// Safe to call more than once.
    pub fn destroy(&mut self, allocator: &mut Allocator) {
        let device = &allocator.context.device;
        unsafe {
            if let Some(sampler) = take_handle(&mut self.sampler) {
                device.destroy_sampler(sampler, None);
            }
            if let Some(view) = take_handle(&mut self.view) {
                device.destroy_image_view(view, None);
            }
            if let Some(image) = take_handle(&mut self.handle) {
                device.destroy_image(image, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation);
        }
    }

    #[cfg(test)]
    pub(crate) fn placeholder(format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            handle: vk::Image::from_raw(0xdead),
            view: vk::ImageView::from_raw(0xbeef),
            sampler: vk::Sampler::null(),
            format,
            extent,
            aspect_mask: if is_depth_format(format) {
                vk::ImageAspectFlags::DEPTH
            } else {
                vk::ImageAspectFlags::COLOR
            },
            layers: 1,
            state: AttachmentState::Undefined,
            allocation: None,
        }
    }
}

fn create_sampler(context: &Context, kind: SamplerKind) -> RenderResult<vk::Sampler> {
    let mut info = vk::SamplerCreateInfo::default()
        .min_filter(vk::Filter::LINEAR)
        .mag_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_lod(1.0);

    match kind {
        SamplerKind::Clamp => {}
        SamplerKind::Tiled => {
            info = info
                .min_filter(vk::Filter::NEAREST)
                .mag_filter(vk::Filter::NEAREST)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT);
        }
        SamplerKind::Material => {
            info = info
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .anisotropy_enable(true)
                .max_anisotropy(context.device_properties.limits.max_sampler_anisotropy);
        }
        SamplerKind::Shadow => {
            info = info
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
                .compare_enable(true)
                .compare_op(vk::CompareOp::LESS_OR_EQUAL);
        }
    }

    Ok(unsafe { context.device.create_sampler(&info, None) }?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampled_to_sampled_is_free() {
        let image = vk::Image::from_raw(1);
        assert!(transition_barrier(
            image,
            vk::ImageAspectFlags::COLOR,
            AttachmentState::Sampled,
            AttachmentState::Sampled
        )
        .is_none());
    }

    #[test]
    fn write_after_write_still_gets_a_barrier() {
        let image = vk::Image::from_raw(1);
        let barrier = transition_barrier(
            image,
            vk::ImageAspectFlags::COLOR,
            AttachmentState::ColourOutput,
            AttachmentState::ColourOutput,
        )
        .unwrap();
        assert_eq!(barrier.old_layout, barrier.new_layout);
        assert!(barrier
            .src_access_mask
            .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn colour_to_sampled_matches_access_modes() {
        let image = vk::Image::from_raw(1);
        let barrier = transition_barrier(
            image,
            vk::ImageAspectFlags::COLOR,
            AttachmentState::ColourOutput,
            AttachmentState::Sampled,
        )
        .unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(
            barrier.src_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn depth_aspect_is_carried_through() {
        let image = vk::Image::from_raw(1);
        let barrier = transition_barrier(
            image,
            vk::ImageAspectFlags::DEPTH,
            AttachmentState::Undefined,
            AttachmentState::DepthOutput,
        )
        .unwrap();
        assert_eq!(
            barrier.subresource_range.aspect_mask,
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(barrier.new_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn every_state_has_a_distinct_layout() {
        let states = [
            AttachmentState::Undefined,
            AttachmentState::ColourOutput,
            AttachmentState::DepthOutput,
            AttachmentState::Sampled,
            AttachmentState::TransferSrc,
            AttachmentState::TransferDst,
            AttachmentState::Swapchain,
        ];
        let mut layouts: Vec<_> = states.iter().map(|s| s.barrier_info().layout).collect();
        layouts.sort_by_key(|l| l.as_raw());
        layouts.dedup();
        assert_eq!(layouts.len(), states.len());
    }

    #[test]
    fn take_handle_only_yields_once() {
        let mut sampler = vk::Sampler::from_raw(42);
        assert_eq!(take_handle(&mut sampler), Some(vk::Sampler::from_raw(42)));
        assert!(sampler.is_null());
        assert_eq!(take_handle(&mut sampler), None);
    }

    #[test]
    fn transition_tracks_state_on_placeholder() {
        let mut image = Image::placeholder(
            vk::Format::D32_SFLOAT,
            vk::Extent2D {
                width: 4,
                height: 4,
            },
        );
        assert_eq!(image.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(image.state(), AttachmentState::Undefined);
        image.assume_state(AttachmentState::Sampled);
        assert_eq!(image.state(), AttachmentState::Sampled);
        image.reset_state();
        assert_eq!(image.state(), AttachmentState::Undefined);
    }
}
