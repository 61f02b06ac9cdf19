use std::ptr::NonNull;

use ash::vk;

use crate::{
    allocator::{align_up, STAGING_MEMORY_SIZE},
    error::{RenderError, RenderResult},
    Context,
};

const STAGING_ALIGNMENT: u64 = 16;

/// Host-visible ring that uploads are copied into before the GPU pulls them into device memory.
///
/// It is only ever reset as a whole, once every transfer recorded out of it has retired.
pub struct StagingBuffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub ptr: NonNull<u8>,
    size: vk::DeviceSize,
}

// The mapped pointer is only written through `&mut self`.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    pub fn new(context: &Context) -> RenderResult<StagingBuffer> {
        let device = &context.device;
        let memory_properties = &context.memory_properties;

        // Search through the available memory types to find the one we want
        let mut memory_type_index = None;
        let mut memory_heap_index = None;
        for (index, memory_type) in memory_properties.memory_types_as_slice().iter().enumerate() {
            if memory_type.property_flags.contains(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ) {
                memory_type_index = Some(index as u32);
                memory_heap_index = Some(memory_type.heap_index);
                break;
            }
        }

        let (Some(memory_type_index), Some(memory_heap_index)) =
            (memory_type_index, memory_heap_index)
        else {
            return Err(RenderError::Unsupported("host visible memory type"));
        };

        // Allocate our staging memory
        let memory = unsafe {
            log::debug!("[STAGING BUFFER] Allocating {STAGING_MEMORY_SIZE} from memory type / heap : {memory_type_index}, {memory_heap_index}");
            device.allocate_memory(
                &vk::MemoryAllocateInfo::default()
                    .memory_type_index(memory_type_index)
                    .allocation_size(STAGING_MEMORY_SIZE),
                None,
            )
        }?;

        // Create a staging buffer
        let handle = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(STAGING_MEMORY_SIZE)
                    .usage(vk::BufferUsageFlags::TRANSFER_SRC),
                None,
            )
        }?;

        context.set_debug_label(handle, "[deferred_vulkan] Staging Buffer");

        // Bind and map it
        let mapped = unsafe {
            device.bind_buffer_memory(handle, memory, 0)?;
            device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        let ptr = NonNull::new(mapped as *mut u8)
            .ok_or(RenderError::Unsupported("mappable staging memory"))?;

        Ok(StagingBuffer {
            handle,
            memory,
            ptr,
            size: 0,
        })
    }

    /// Copy `data` in and return the offset it landed at.
    pub fn stage(&mut self, data: &[u8]) -> RenderResult<usize> {
        // Image copies need the source offset aligned to the texel size.
        let staging_buffer_offset = align_up(self.size, STAGING_ALIGNMENT) as usize;
        let transfer_size = data.len();

        if (staging_buffer_offset + transfer_size) > STAGING_MEMORY_SIZE as usize {
            return Err(RenderError::StagingOverflow {
                requested: transfer_size as u64,
                available: STAGING_MEMORY_SIZE.saturating_sub(staging_buffer_offset as u64),
            });
        }

        // We get the staging pointer by taking the base address and adding the current size of
        // the buffer.
        unsafe {
            let staging_ptr = self.ptr.add(staging_buffer_offset).as_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), staging_ptr, transfer_size);
        };

        self.size = (staging_buffer_offset + transfer_size) as vk::DeviceSize;

        Ok(staging_buffer_offset)
    }

    pub fn clear(&mut self) {
        self.size = 0;
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_buffer(self.handle, None);
        device.unmap_memory(self.memory);
        device.free_memory(self.memory, None);
    }
}
