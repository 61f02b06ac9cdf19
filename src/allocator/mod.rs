mod device_buffer;
mod staging_buffer;
mod uniform_arena;

use device_buffer::{image_transfer, DeviceBlock};
use staging_buffer::StagingBuffer;
pub use uniform_arena::{UniformArena, UniformBlocks, UniformSlice, UNIFORM_ALIGNMENT};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use ash::vk;

use crate::error::{RenderError, RenderResult};

use super::context::Context;

pub const GLOBAL_MEMORY_SIZE: u64 = 1u64 << 30; // 1GB
pub const STAGING_MEMORY_SIZE: u64 = 100u64 << 20; // 100MB
pub const UNIFORM_MEMORY_SIZE: u64 = 4u64 << 20; // 4MB

/// A region of the device-local block bound to one image or buffer.
#[derive(Clone, Copy)]
pub struct MemoryAllocation {
    raw: offset_allocator::Allocation,
    /// Aligned offset the resource is actually bound at.
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

// `offset_allocator::Allocation` does not implement `Debug`, so it is skipped here.
impl std::fmt::Debug for MemoryAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocation")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Owns all device-local memory and the upload path into it.
///
/// Resource memory is sub-allocated from one large block. Uploads are staged into a host-visible
/// buffer and recorded into the frame's command buffer by [`Allocator::execute_transfers`]; they
/// only count as complete once the frame fence has signalled ([`Allocator::retire_transfers`]).
pub struct Allocator {
    pub context: Arc<Context>,
    pub pending_transfers: Vec<PendingTransfer>,
    in_flight: Vec<TransferToken>,
    offset_allocator: offset_allocator::Allocator,
    backend: DeviceBlock,
    staging_buffer: StagingBuffer,
    pub uniforms: UniformArena,
}

impl Allocator {
    pub fn new(context: Arc<Context>) -> RenderResult<Self> {
        let backend = DeviceBlock::new(&context)?;
        let staging_buffer = StagingBuffer::new(&context)?;
        let uniforms = UniformArena::new(&context, UNIFORM_MEMORY_SIZE)?;
        let offset_allocator = offset_allocator::Allocator::new(GLOBAL_MEMORY_SIZE as u32);

        Ok(Self {
            backend,
            context,
            offset_allocator,
            pending_transfers: Default::default(),
            in_flight: Default::default(),
            staging_buffer,
            uniforms,
        })
    }

    fn allocate(
        &mut self,
        requirements: vk::MemoryRequirements,
    ) -> RenderResult<MemoryAllocation> {
        if requirements.memory_type_bits & (1 << self.backend.memory_type_index) == 0 {
            return Err(RenderError::Unsupported(
                "device local memory type for this resource",
            ));
        }

        // Over-allocate so the bind offset can be rounded up to the required alignment.
        let padded = requirements.size + requirements.alignment.max(1) - 1;
        let raw = self
            .offset_allocator
            .allocate(padded as u32)
            .ok_or(RenderError::DeviceMemoryExhausted { requested: padded })?;

        Ok(MemoryAllocation {
            raw,
            offset: align_up(raw.offset as u64, requirements.alignment.max(1)),
            size: requirements.size,
        })
    }

    pub fn bind_image(&mut self, image: vk::Image) -> RenderResult<MemoryAllocation> {
        let device = &self.context.device;
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = self.allocate(requirements)?;
        unsafe {
            self.context.device.bind_image_memory(
                image,
                self.backend.device_memory,
                allocation.offset,
            )
        }?;
        Ok(allocation)
    }

    pub fn allocate_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage_flags: vk::BufferUsageFlags,
        label: &str,
    ) -> RenderResult<(vk::Buffer, MemoryAllocation)> {
        let device = &self.context.device;

        let handle = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(size)
                    .usage(usage_flags | vk::BufferUsageFlags::TRANSFER_DST),
                None,
            )
        }?;
        self.context.set_debug_label(handle, label);

        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let allocation = match self.allocate(requirements) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.context.device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        unsafe {
            self.context.device.bind_buffer_memory(
                handle,
                self.backend.device_memory,
                allocation.offset,
            )
        }?;

        log::debug!(
            "[ALLOCATOR] {label}: {size} bytes at offset {}",
            allocation.offset
        );

        Ok((handle, allocation))
    }

    pub fn free(&mut self, allocation: MemoryAllocation) {
        self.offset_allocator.free(allocation.raw);
    }

    pub fn stage_buffer_transfer(
        &mut self,
        data: &[u8],
        buffer: vk::Buffer,
        destination_offset: vk::DeviceSize,
    ) -> RenderResult<TransferToken> {
        if data.is_empty() {
            return Ok(TransferToken::completed());
        }
        let staging_buffer_offset = self.staging_buffer.stage(data)?;
        let (ours, theirs) = TransferToken::create_pair();

        self.pending_transfers.push(PendingTransfer {
            destination: TransferDestination::Buffer(buffer, destination_offset),
            staging_buffer_offset,
            transfer_size: data.len() as _,
            transfer_token: ours,
        });

        Ok(theirs)
    }

    /// Stage `data` to be copied into `image`, one tightly packed slice per array layer. The image
    /// ends up in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn stage_image_transfer(
        &mut self,
        data: &[u8],
        image: vk::Image,
        extent: vk::Extent2D,
        layers: u32,
    ) -> RenderResult<TransferToken> {
        let staging_buffer_offset = self.staging_buffer.stage(data)?;
        let (ours, theirs) = TransferToken::create_pair();

        self.pending_transfers.push(PendingTransfer {
            destination: TransferDestination::Image(image, extent, layers),
            staging_buffer_offset,
            transfer_size: data.len() as _,
            transfer_token: ours,
        });

        Ok(theirs)
    }

    /// Record every pending copy into `command_buffer`.
    pub fn execute_transfers(&mut self, command_buffer: vk::CommandBuffer) {
        if self.pending_transfers.is_empty() {
            return;
        }

        self.context
            .begin_marker(command_buffer, "Transfers", glam::vec4(0., 1., 1., 1.));
        for pending in std::mem::take(&mut self.pending_transfers) {
            match pending.destination {
                TransferDestination::Buffer(buffer, offset) => self.backend.buffer_transfer(
                    &self.context,
                    &pending,
                    buffer,
                    offset,
                    &self.staging_buffer,
                    command_buffer,
                ),
                TransferDestination::Image(image, extent, layers) => image_transfer(
                    &self.context,
                    &self.staging_buffer,
                    command_buffer,
                    &pending,
                    image,
                    extent,
                    layers,
                ),
            }
            self.in_flight.push(pending.transfer_token);
        }
        self.context.end_marker(command_buffer);
    }

    /// Drop copies that were staged but not recorded yet, for resources released before the next
    /// frame. Returns how many were dropped.
    pub fn cancel_transfers(&mut self, tokens: &[TransferToken]) -> usize {
        drop_cancelled(&mut self.pending_transfers, tokens)
    }

    /// Called once the fence of the frame that recorded the transfers has signalled.
    pub fn retire_transfers(&mut self) {
        for token in self.in_flight.drain(..) {
            token.mark_completed();
        }
        if self.pending_transfers.is_empty() {
            self.staging_buffer.clear();
        }
    }

    pub unsafe fn destroy(&mut self) {
        let device = &self.context.device;
        self.uniforms.destroy(device);
        self.staging_buffer.destroy(device);
        self.backend.destroy(device);
    }
}

#[derive(Clone, Debug)]
pub struct TransferToken {
    complete: Arc<AtomicBool>,
}

impl TransferToken {
    /// True once the GPU has finished the copy.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// A token for a transfer that had nothing to copy.
    pub fn completed() -> TransferToken {
        TransferToken {
            complete: Arc::new(AtomicBool::new(true)),
        }
    }

    fn create_pair() -> (TransferToken, TransferToken) {
        let complete = Arc::new(AtomicBool::new(false));
        (
            TransferToken {
                complete: complete.clone(),
            },
            TransferToken { complete },
        )
    }

    fn mark_completed(&self) {
        self.complete.store(true, Ordering::Release);
    }

    /// Both tokens track the same copy.
    pub fn same_transfer(&self, other: &TransferToken) -> bool {
        Arc::ptr_eq(&self.complete, &other.complete)
    }
}

fn drop_cancelled(pending: &mut Vec<PendingTransfer>, tokens: &[TransferToken]) -> usize {
    let before = pending.len();
    pending.retain(|transfer| {
        !tokens
            .iter()
            .any(|token| token.same_transfer(&transfer.transfer_token))
    });
    before - pending.len()
}

pub struct PendingTransfer {
    destination: TransferDestination,
    staging_buffer_offset: usize,
    transfer_size: vk::DeviceSize,
    transfer_token: TransferToken,
}

enum TransferDestination {
    Buffer(vk::Buffer, vk::DeviceSize),
    Image(vk::Image, vk::Extent2D, u32),
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn tokens_share_completion() {
        let (ours, theirs) = TransferToken::create_pair();
        assert!(!theirs.is_complete());
        ours.mark_completed();
        assert!(theirs.is_complete());
    }

    fn pending_buffer_copy(offset: vk::DeviceSize) -> (PendingTransfer, TransferToken) {
        let (ours, theirs) = TransferToken::create_pair();
        let pending = PendingTransfer {
            destination: TransferDestination::Buffer(vk::Buffer::null(), offset),
            staging_buffer_offset: 0,
            transfer_size: 64,
            transfer_token: ours,
        };
        (pending, theirs)
    }

    #[test]
    fn cancelled_copies_are_not_recorded() {
        let (first, first_token) = pending_buffer_copy(0);
        let (second, _) = pending_buffer_copy(64);
        let (third, third_token) = pending_buffer_copy(128);
        let mut pending = vec![first, second, third];

        assert_eq!(drop_cancelled(&mut pending, &[first_token, third_token.clone()]), 2);
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].destination, TransferDestination::Buffer(_, 64)));
        assert_eq!(drop_cancelled(&mut pending, &[third_token]), 0);
    }

    #[test]
    fn empty_transfers_are_already_complete() {
        assert!(TransferToken::completed().is_complete());
    }
}
