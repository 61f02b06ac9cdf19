use ash::vk;
use winit::raw_window_handle::HasDisplayHandle;

use crate::error::{RenderError, RenderResult};

/// Queue family indices we settled on.
///
/// Presentation is always done from the graphics family. The compute family is only set when the
/// device exposes a compute queue in a *different* family; otherwise compute work shares the
/// graphics queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: Option<u32>,
}

impl QueueFamilies {
    pub(crate) fn select(families: &[vk::QueueFamilyProperties]) -> Option<Self> {
        let graphics = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;

        // Prefer a family that does compute but not graphics: that's the async compute queue.
        let compute = families
            .iter()
            .enumerate()
            .find(|(_, f)| {
                f.queue_flags.contains(vk::QueueFlags::COMPUTE)
                    && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(index, _)| index as u32);

        Some(Self { graphics, compute })
    }
}

pub struct Core {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilies,
    pub debug_utils: bool,
}

impl Core {
    pub(crate) fn new(window: &winit::window::Window) -> RenderResult<Self> {
        let entry = ash::Entry::linked();

        let display_handle = window
            .display_handle()
            .map_err(|_| RenderError::Unsupported("display handle"))?
            .as_raw();

        #[allow(unused_mut)]
        let mut instance_extensions =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();

        let available = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        let debug_utils = available.iter().any(|e| {
            e.extension_name_as_c_str()
                .is_ok_and(|name| name == ash::ext::debug_utils::NAME)
        });
        if debug_utils {
            instance_extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let version;
        let instance_create_flags;

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            instance_extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            instance_extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
            version = vk::API_VERSION_1_2;
            instance_create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        {
            version = vk::API_VERSION_1_3;
            instance_create_flags = vk::InstanceCreateFlags::default();
        }

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::default()
                    .flags(instance_create_flags)
                    .enabled_extension_names(&instance_extensions)
                    .application_info(
                        &vk::ApplicationInfo::default()
                            .application_name(c"deferred_vulkan")
                            .api_version(version),
                    ),
                None,
            )?
        };

        // Discrete first, then whatever supports graphics.
        let mut candidates = unsafe { instance.enumerate_physical_devices() }?;
        candidates.sort_by_key(|&pd| {
            let properties = unsafe { instance.get_physical_device_properties(pd) };
            match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                _ => 2,
            }
        });

        let (physical_device, queue_families) = candidates
            .into_iter()
            .find_map(|pd| {
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(pd) };
                QueueFamilies::select(&families).map(|q| (pd, q))
            })
            .ok_or(RenderError::Unsupported("graphics capable physical device"))?;

        log::info!(
            "Using physical device {:?} with queue families {queue_families:?}",
            unsafe { instance.get_physical_device_properties(physical_device) }
                .device_name_as_c_str()
                .unwrap_or(c"unknown")
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            queue_families,
            debug_utils,
        })
    }

    /// The device and every surface must already be gone.
    pub(crate) unsafe fn destroy(&self) {
        self.instance.destroy_instance(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn picks_dedicated_compute_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let selected = QueueFamilies::select(&families).unwrap();
        assert_eq!(selected.graphics, 0);
        assert_eq!(selected.compute, Some(2));
    }

    #[test]
    fn compute_falls_back_to_graphics_queue() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let selected = QueueFamilies::select(&families).unwrap();
        assert_eq!(selected.compute, None);
    }

    #[test]
    fn no_graphics_no_device() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(QueueFamilies::select(&families).is_none());
    }
}
