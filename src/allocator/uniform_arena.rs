use std::ptr::NonNull;

use ash::vk;

use crate::{
    descriptors::DescriptorResource,
    error::{RenderError, RenderResult},
    Context,
};

/// Granularity of every uniform sub-allocation, both size and offset. 256 is the largest
/// `minUniformBufferOffsetAlignment` any desktop driver reports.
pub const UNIFORM_ALIGNMENT: u64 = 256;

/// One aligned region of the uniform arena.
#[derive(Clone, Copy)]
pub struct UniformSlice {
    raw: offset_allocator::Allocation,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

// `offset_allocator::Allocation` does not implement `Debug`, so it is skipped here.
impl std::fmt::Debug for UniformSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniformSlice")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Block bookkeeping for the arena, counted in [`UNIFORM_ALIGNMENT`] sized units so that every
/// offset the allocator hands out is aligned by construction.
pub struct UniformBlocks {
    allocator: offset_allocator::Allocator,
    in_use: vk::DeviceSize,
}

impl UniformBlocks {
    pub fn new(capacity: vk::DeviceSize) -> Self {
        Self {
            allocator: offset_allocator::Allocator::new((capacity / UNIFORM_ALIGNMENT) as u32),
            in_use: 0,
        }
    }

    pub fn allocate(&mut self, size: vk::DeviceSize) -> RenderResult<UniformSlice> {
        let blocks = size.div_ceil(UNIFORM_ALIGNMENT).max(1);
        let raw = self
            .allocator
            .allocate(blocks as u32)
            .ok_or(RenderError::UniformArenaExhausted { requested: size })?;

        self.in_use += blocks * UNIFORM_ALIGNMENT;
        Ok(UniformSlice {
            raw,
            offset: raw.offset as vk::DeviceSize * UNIFORM_ALIGNMENT,
            size: blocks * UNIFORM_ALIGNMENT,
        })
    }

    pub fn free(&mut self, slice: UniformSlice) {
        debug_assert!(self.in_use >= slice.size, "uniform slice freed twice");
        self.in_use -= slice.size.min(self.in_use);
        self.allocator.free(slice.raw);
    }

    /// Free the slice held in `slot`, if any. Calling it again is a no-op.
    pub fn release(&mut self, slot: &mut Option<UniformSlice>) {
        if let Some(slice) = slot.take() {
            self.free(slice);
        }
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> vk::DeviceSize {
        self.in_use
    }
}

/// A persistently mapped, host-coherent uniform buffer that passes carve their UBOs out of.
///
/// `update` writes straight into the mapping, so a pass must only write a slice while the frame
/// that last read it has retired.
pub struct UniformArena {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    ptr: NonNull<u8>,
    blocks: UniformBlocks,
}

// Writes go through `&self` but never overlap: each slice has exactly one owning pass.
unsafe impl Send for UniformArena {}
unsafe impl Sync for UniformArena {}

impl UniformArena {
    pub fn new(context: &Context, size: vk::DeviceSize) -> RenderResult<Self> {
        let device = &context.device;

        let buffer = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(size)
                    .usage(vk::BufferUsageFlags::UNIFORM_BUFFER),
                None,
            )
        }?;
        context.set_debug_label(buffer, "[deferred_vulkan] Uniform Arena");

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = context
            .find_memory_type_index(
                &requirements,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or(RenderError::Unsupported("host visible memory type"))?;

        let memory = unsafe {
            log::debug!("[UNIFORM ARENA] Allocating {size} from memory type {memory_type_index}");
            device.allocate_memory(
                &vk::MemoryAllocateInfo::default()
                    .memory_type_index(memory_type_index)
                    .allocation_size(requirements.size),
                None,
            )
        }?;

        let mapped = unsafe {
            device.bind_buffer_memory(buffer, memory, 0)?;
            device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        let ptr = NonNull::new(mapped as *mut u8)
            .ok_or(RenderError::Unsupported("mappable uniform memory"))?;

        Ok(Self {
            buffer,
            memory,
            ptr,
            blocks: UniformBlocks::new(size),
        })
    }

    pub fn allocate(&mut self, size: vk::DeviceSize) -> RenderResult<UniformSlice> {
        self.blocks.allocate(size)
    }

    /// Allocate a slice sized for `T`.
    pub fn allocate_for<T>(&mut self) -> RenderResult<UniformSlice> {
        self.allocate(std::mem::size_of::<T>() as _)
    }

    pub fn free(&mut self, slice: UniformSlice) {
        self.blocks.free(slice);
    }

    pub fn release(&mut self, slot: &mut Option<UniformSlice>) {
        self.blocks.release(slot);
    }

    pub fn write<T: bytemuck::Pod>(&self, slice: &UniformSlice, value: &T) {
        self.write_bytes(slice, bytemuck::bytes_of(value));
    }

    pub fn write_bytes(&self, slice: &UniformSlice, bytes: &[u8]) {
        debug_assert!(bytes.len() as u64 <= slice.size);
        let len = bytes.len().min(slice.size as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.add(slice.offset as usize).as_ptr(),
                len,
            );
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// The descriptor that binds `slice` as a uniform buffer.
    pub fn descriptor(&self, slice: &UniformSlice) -> DescriptorResource {
        DescriptorResource::Uniform {
            buffer: self.buffer,
            offset: slice.offset,
            range: slice.size,
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.unmap_memory(self.memory);
        device.free_memory(self.memory, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_aligned_in_size_and_offset() {
        let mut blocks = UniformBlocks::new(64 * 1024);
        for size in [1, 64, 255, 256, 257, 1000, 4096] {
            let slice = blocks.allocate(size).unwrap();
            assert_eq!(slice.offset % UNIFORM_ALIGNMENT, 0);
            assert_eq!(slice.size % UNIFORM_ALIGNMENT, 0);
            assert!(slice.size >= size);
        }
    }

    #[test]
    fn zero_sized_request_still_gets_a_block() {
        let mut blocks = UniformBlocks::new(1024);
        let slice = blocks.allocate(0).unwrap();
        assert_eq!(slice.size, UNIFORM_ALIGNMENT);
    }

    #[test]
    fn slices_never_overlap() {
        let mut blocks = UniformBlocks::new(16 * 1024);
        let mut slices: Vec<_> = [300, 256, 10, 700]
            .into_iter()
            .map(|size| blocks.allocate(size).unwrap())
            .collect();
        slices.sort_by_key(|s| s.offset);
        for pair in slices.windows(2) {
            assert!(pair[0].offset + pair[0].size <= pair[1].offset);
        }
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut blocks = UniformBlocks::new(512);
        blocks.allocate(512).unwrap();
        assert!(matches!(
            blocks.allocate(1),
            Err(RenderError::UniformArenaExhausted { requested: 1 })
        ));
    }

    #[test]
    fn releasing_twice_frees_once() {
        let mut blocks = UniformBlocks::new(1024);
        let baseline = blocks.in_use();
        let mut uniforms = Some(blocks.allocate(300).unwrap());
        let mut kernel = Some(blocks.allocate(256).unwrap());
        assert_eq!(blocks.in_use(), baseline + 768);

        for _ in 0..2 {
            for slot in [&mut kernel, &mut uniforms] {
                blocks.release(slot);
            }
        }
        assert!(uniforms.is_none() && kernel.is_none());
        assert_eq!(blocks.in_use(), baseline);

        // A double free would hand the same blocks out twice.
        blocks.allocate(1024).unwrap();
        assert!(blocks.allocate(1).is_err());
    }

    #[test]
    fn freed_blocks_are_reused() {
        let mut blocks = UniformBlocks::new(512);
        let slice = blocks.allocate(512).unwrap();
        blocks.free(slice);
        assert!(blocks.allocate(512).is_ok());
    }
}
