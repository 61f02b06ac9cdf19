use ash::vk;

use crate::{
    allocator::{Allocator, MemoryAllocation, TransferToken},
    error::{RenderError, RenderResult},
    image::take_handle,
};

/// A device-local buffer filled through the staging path.
#[derive(Debug)]
pub struct Buffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<MemoryAllocation>,
}

impl Buffer {
    pub fn new(
        allocator: &mut Allocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        label: &str,
    ) -> RenderResult<Self> {
        let (handle, allocation) = allocator.allocate_buffer(size, usage, label)?;
        Ok(Self {
            handle,
            size,
            allocation: Some(allocation),
        })
    }

    /// Schedule a copy of `data` to `offset` bytes into the buffer. The copy is recorded at the
    /// start of the next frame.
    pub fn upload<T: bytemuck::Pod>(
        &self,
        allocator: &mut Allocator,
        data: &[T],
        offset: vk::DeviceSize,
    ) -> RenderResult<TransferToken> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if offset + bytes.len() as vk::DeviceSize > self.size {
            return Err(RenderError::DeviceMemoryExhausted {
                requested: offset + bytes.len() as vk::DeviceSize,
            });
        }
        allocator.stage_buffer_transfer(bytes, self.handle, offset)
    }

    /// Safe to call more than once.
    pub fn destroy(&mut self, allocator: &mut Allocator) {
        if let Some(handle) = take_handle(&mut self.handle) {
            unsafe { allocator.context.device.destroy_buffer(handle, None) };
        }
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation);
        }
    }
}
