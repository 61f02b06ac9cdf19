use ash::vk::{self, Handle, MemoryRequirements};
use parking_lot::Mutex;

use crate::{
    descriptors::{DescriptorLayouts, Technique},
    error::RenderResult,
};

use super::core::{Core, QueueFamilies};

/// The shared device handle every GPU-owning object is handed at construction time.
///
/// Nothing in the crate owns the `Context` except the top level [`crate::DeferredVulkan`]; passes,
/// pipelines and render targets borrow it (or hold an `Arc`) and must be destroyed before it is.
pub struct Context {
    pub device: ash::Device,
    pub command_pool: vk::CommandPool,
    /// Separate pool for the compute family. Same as `command_pool` when compute shares the
    /// graphics queue.
    pub compute_command_pool: vk::CommandPool,
    pub graphics_queue: vk::Queue,
    /// Presentation happens on the graphics family.
    pub present_queue: vk::Queue,
    pub compute_queue: vk::Queue,
    pub queue_families: QueueFamilies,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device_properties: vk::PhysicalDeviceProperties,
    pub descriptor_pool: vk::DescriptorPool,
    descriptor_layouts: Mutex<DescriptorLayouts>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl Context {
    pub(crate) fn new(core: &Core) -> RenderResult<Self> {
        let instance = &core.instance;
        let physical_device = core.physical_device;
        let queue_families = core.queue_families;

        #[allow(unused_mut)]
        let mut enabled_extension_names = vec![ash::khr::swapchain::NAME.as_ptr()];

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        enabled_extension_names.push(ash::khr::portability_subset::NAME.as_ptr());

        let priorities = [1.0];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_families.graphics)
            .queue_priorities(&priorities)];
        if let Some(compute) = queue_families.compute {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(compute)
                    .queue_priorities(&priorities),
            );
        }

        let device = unsafe {
            instance.create_device(
                physical_device,
                &vk::DeviceCreateInfo::default()
                    .enabled_extension_names(&enabled_extension_names)
                    .queue_create_infos(&queue_create_infos)
                    .enabled_features(
                        &vk::PhysicalDeviceFeatures::default()
                            .fill_mode_non_solid(true)
                            .sampler_anisotropy(true),
                    )
                    .push_next(
                        &mut vk::PhysicalDeviceVulkan13Features::default()
                            .dynamic_rendering(true)
                            .synchronization2(true),
                    ),
                None,
            )
        }?;

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(queue_families.graphics)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )
        }?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };

        let (compute_command_pool, compute_queue) = match queue_families.compute {
            Some(family) => unsafe {
                let pool = device.create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(family)
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                    None,
                )?;
                (pool, device.get_device_queue(family, 0))
            },
            None => (command_pool, graphics_queue),
        };

        let descriptor_pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(1024)
                    .pool_sizes(&[
                        vk::DescriptorPoolSize {
                            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                            descriptor_count: 4096,
                        },
                        vk::DescriptorPoolSize {
                            ty: vk::DescriptorType::UNIFORM_BUFFER,
                            descriptor_count: 1024,
                        },
                        vk::DescriptorPoolSize {
                            ty: vk::DescriptorType::STORAGE_BUFFER,
                            descriptor_count: 64,
                        },
                    ])
                    .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET),
                None,
            )
        }?;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };

        let debug_utils = core
            .debug_utils
            .then(|| ash::ext::debug_utils::Device::new(instance, &device));

        Ok(Self {
            device,
            command_pool,
            compute_command_pool,
            graphics_queue,
            present_queue: graphics_queue,
            compute_queue,
            queue_families,
            memory_properties,
            device_properties,
            descriptor_pool,
            descriptor_layouts: Mutex::new(DescriptorLayouts::default()),
            debug_utils,
        })
    }

    pub fn find_memory_type_index(
        &self,
        requirements: &MemoryRequirements,
        required_properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let mem_props = self.memory_properties;
        for i in 0..mem_props.memory_type_count {
            if (requirements.memory_type_bits & (1 << i)) != 0
                && mem_props.memory_types[i as usize]
                    .property_flags
                    .contains(required_properties)
            {
                return Some(i);
            }
        }
        None
    }

    /// The shared set layout for `technique`, created on first use.
    pub fn descriptor_set_layout(
        &self,
        technique: Technique,
    ) -> RenderResult<vk::DescriptorSetLayout> {
        self.descriptor_layouts
            .lock()
            .get_or_create(&self.device, technique)
    }

    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        Ok(unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(count),
            )
        }?)
    }

    pub fn allocate_descriptor_set(
        &self,
        technique: Technique,
    ) -> RenderResult<vk::DescriptorSet> {
        let layout = self.descriptor_set_layout(technique)?;
        Ok(unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(self.descriptor_pool)
                    .set_layouts(std::slice::from_ref(&layout)),
            )
        }?[0])
    }

    pub fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) {
        let sets: Vec<_> = sets.iter().copied().filter(|s| !s.is_null()).collect();
        if sets.is_empty() {
            return;
        }
        if let Err(e) = unsafe {
            self.device
                .free_descriptor_sets(self.descriptor_pool, &sets)
        } {
            log::warn!("Failed to free {} descriptor sets: {e:?}", sets.len());
        }
    }

    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    pub fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo,
    ) {
        unsafe {
            self.device
                .cmd_pipeline_barrier2(command_buffer, dependency_info)
        };
    }

    pub fn set_debug_label<T: Handle>(&self, object: T, label: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(label) else {
            return;
        };
        unsafe {
            let _ = debug_utils.set_debug_utils_object_name(
                &vk::DebugUtilsObjectNameInfoEXT::default()
                    .object_handle(object)
                    .object_name(&name),
            );
        }
    }

    pub fn begin_marker(&self, command_buffer: vk::CommandBuffer, label: &str, colour: glam::Vec4) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(label) else {
            return;
        };
        unsafe {
            debug_utils.cmd_begin_debug_utils_label(
                command_buffer,
                &vk::DebugUtilsLabelEXT::default()
                    .label_name(&name)
                    .color(colour.to_array()),
            );
        }
    }

    pub fn end_marker(&self, command_buffer: vk::CommandBuffer) {
        if let Some(debug_utils) = &self.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(command_buffer) };
        }
    }

    /// Tear down the objects the context itself owns. Everything created *from* the context must
    /// already be gone.
    pub(crate) unsafe fn destroy(&self) {
        self.descriptor_layouts.lock().destroy_all(&self.device);
        self.device
            .destroy_descriptor_pool(self.descriptor_pool, None);
        if self.compute_command_pool != self.command_pool {
            self.device
                .destroy_command_pool(self.compute_command_pool, None);
        }
        self.device.destroy_command_pool(self.command_pool, None);
        self.device.destroy_device(None);
    }
}
