use ash::vk;
use glam::Vec4;

use super::BindingContext;
use crate::{
    allocator::Allocator,
    buffer::Buffer,
    descriptors::{write_descriptor_set, DescriptorResource, Technique},
    error::RenderResult,
    image::take_handle,
    pipeline::Pipeline,
    settings::RenderSettings,
    Context,
};

/// Elements in the storage buffer the compute shader works on.
pub const COMPUTE_ELEMENTS: u64 = 1024;
pub const WORKGROUPS: [u32; 3] = [2, 2, 1];

/// A standalone compute dispatch over one storage buffer, recorded into its own command buffer
/// and submitted on the compute queue ahead of the graphics work.
pub struct ComputePass {
    pipeline: Pipeline,
    descriptor_set: vk::DescriptorSet,
    storage: Buffer,
    cleared: bool,
}

impl ComputePass {
    pub fn new(allocator: &mut Allocator, settings: &RenderSettings) -> RenderResult<Self> {
        let context = allocator.context.clone();
        let pipeline = Pipeline::build_compute(
            &context,
            &settings.shader_dir,
            "compute",
            "compute.comp.spv",
            &[Technique::Compute],
        )?;
        let descriptor_set = context.allocate_descriptor_set(Technique::Compute)?;
        context.set_debug_label(descriptor_set, "Compute");
        let storage = Buffer::new(
            allocator,
            storage_size(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "Compute Storage",
        )?;

        Ok(Self {
            pipeline,
            descriptor_set,
            storage,
            cleared: false,
        })
    }

    /// Record the dispatch. The buffer is zeroed the first time round.
    pub fn dispatch(&mut self, context: &Context, command_buffer: vk::CommandBuffer) {
        let device = &context.device;
        if !self.cleared {
            unsafe {
                device.cmd_fill_buffer(command_buffer, self.storage.handle, 0, vk::WHOLE_SIZE, 0);
            }
            context.cmd_pipeline_barrier2(
                command_buffer,
                &vk::DependencyInfo::default().buffer_memory_barriers(&[
                    vk::BufferMemoryBarrier2::default()
                        .buffer(self.storage.handle)
                        .size(vk::WHOLE_SIZE)
                        .src_stage_mask(vk::PipelineStageFlags2::CLEAR)
                        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                        .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                        .dst_access_mask(
                            vk::AccessFlags2::SHADER_STORAGE_READ
                                | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                        ),
                ]),
            );
            self.cleared = true;
        }

        self.pipeline.bind(context, command_buffer);
        self.pipeline
            .bind_descriptor_sets(context, command_buffer, 0, &[self.descriptor_set]);
        let [x, y, z] = WORKGROUPS;
        unsafe { device.cmd_dispatch(command_buffer, x, y, z) };
    }

    pub fn update_descriptor_sets(&mut self, bindings: &BindingContext) -> RenderResult<()> {
        unsafe {
            write_descriptor_set(
                &bindings.context.device,
                Technique::Compute,
                self.descriptor_set,
                &[DescriptorResource::Storage {
                    buffer: self.storage.handle,
                    range: self.storage.size,
                }],
            )
        }
    }

    /// Safe to call more than once.
    pub fn destroy(&mut self, allocator: &mut Allocator) {
        let context = allocator.context.clone();
        self.pipeline.destroy(&context);
        if let Some(set) = take_handle(&mut self.descriptor_set) {
            context.free_descriptor_sets(&[set]);
        }
        self.storage.destroy(allocator);
    }
}

fn storage_size() -> vk::DeviceSize {
    COMPUTE_ELEMENTS * std::mem::size_of::<Vec4>() as vk::DeviceSize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_holds_one_vec4_per_element() {
        assert_eq!(storage_size(), 16 * 1024);
    }
}
