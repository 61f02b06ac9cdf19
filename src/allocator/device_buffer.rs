use ash::vk;

use crate::{
    error::{RenderError, RenderResult},
    Context,
};

use super::{staging_buffer::StagingBuffer, PendingTransfer, GLOBAL_MEMORY_SIZE};

/// The one big device-local allocation every image and buffer is bound into.
pub struct DeviceBlock {
    pub device_memory: vk::DeviceMemory,
    pub memory_type_index: u32,
}

impl DeviceBlock {
    pub fn new(context: &Context) -> RenderResult<DeviceBlock> {
        let device = &context.device;
        let memory_properties = &context.memory_properties;

        // Search through the available memory types to find the one we want
        let mut memory_type_index = None;
        let mut memory_heap_index = None;
        for (index, memory_type) in memory_properties.memory_types_as_slice().iter().enumerate() {
            if memory_type
                .property_flags
                .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            {
                memory_type_index = Some(index as u32);
                memory_heap_index = Some(memory_type.heap_index);
                break;
            }
        }

        let (Some(memory_type_index), Some(memory_heap_index)) =
            (memory_type_index, memory_heap_index)
        else {
            return Err(RenderError::Unsupported("device local memory type"));
        };

        let device_memory = unsafe {
            log::debug!("Allocating {GLOBAL_MEMORY_SIZE} from memory type / heap : {memory_type_index}, {memory_heap_index}");
            device.allocate_memory(
                &vk::MemoryAllocateInfo::default()
                    .memory_type_index(memory_type_index)
                    .allocation_size(GLOBAL_MEMORY_SIZE),
                None,
            )
        }?;

        Ok(Self {
            device_memory,
            memory_type_index,
        })
    }

    pub fn buffer_transfer(
        &self,
        context: &Context,
        pending: &PendingTransfer,
        destination: vk::Buffer,
        destination_offset: vk::DeviceSize,
        staging_buffer: &StagingBuffer,
        command_buffer: vk::CommandBuffer,
    ) {
        let device = &context.device;
        let transfer_size = pending.transfer_size;

        log::trace!(
            "TRANSFER: {transfer_size} [src: {}] -> [dst: {destination_offset}]",
            pending.staging_buffer_offset
        );

        // Issue the transfer
        unsafe {
            device.cmd_copy_buffer(
                command_buffer,
                staging_buffer.handle,
                destination,
                &[vk::BufferCopy::default()
                    .src_offset(pending.staging_buffer_offset as _)
                    .dst_offset(destination_offset)
                    .size(transfer_size)],
            );
        }

        // Vertex and index fetch happen before any shader stage reads.
        context.cmd_pipeline_barrier2(
            command_buffer,
            &vk::DependencyInfo::default().buffer_memory_barriers(&[
                vk::BufferMemoryBarrier2::default()
                    .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                    .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                    .dst_access_mask(
                        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ
                            | vk::AccessFlags2::INDEX_READ
                            | vk::AccessFlags2::SHADER_READ,
                    )
                    .dst_stage_mask(
                        vk::PipelineStageFlags2::VERTEX_INPUT
                            | vk::PipelineStageFlags2::VERTEX_SHADER,
                    )
                    .buffer(destination)
                    .offset(destination_offset)
                    .size(transfer_size),
            ]),
        );
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.free_memory(self.device_memory, None);
    }
}

pub fn image_transfer(
    context: &Context,
    staging_buffer: &StagingBuffer,
    command_buffer: vk::CommandBuffer,
    pending: &PendingTransfer,
    image: vk::Image,
    extent: vk::Extent2D,
    layers: u32,
) {
    let device = &context.device;
    let range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: layers,
    };

    // Transition the image into the TRANSFER DST layout
    context.cmd_pipeline_barrier2(
        command_buffer,
        &vk::DependencyInfo::default().image_memory_barriers(&[
            vk::ImageMemoryBarrier2::default()
                .subresource_range(range)
                .image(image)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        ]),
    );

    // Copy data from our buffer to the target image
    unsafe {
        device.cmd_copy_buffer_to_image(
            command_buffer,
            staging_buffer.handle,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[vk::BufferImageCopy::default()
                .buffer_offset(pending.staging_buffer_offset as _)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .layer_count(layers),
                )
                .image_extent(extent.into())],
        );
    }

    context.cmd_pipeline_barrier2(
        command_buffer,
        &vk::DependencyInfo::default().image_memory_barriers(&[
            vk::ImageMemoryBarrier2::default()
                .subresource_range(range)
                .image(image)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .dst_access_mask(vk::AccessFlags2::SHADER_READ)
                .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        ]),
    );
}
