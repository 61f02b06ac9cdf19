use ash::vk;
use winit::raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::{
    core::Core,
    error::{RenderError, RenderResult},
    Context,
};

pub struct Swapchain {
    pub surface_handle: vk::SurfaceKHR,
    pub surface_fn: ash::khr::surface::Instance,
    pub swapchain_handle: vk::SwapchainKHR,
    pub swapchain_fn: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub needs_update: bool,
    physical_device: vk::PhysicalDevice,
    present_family: u32,
}

/// Post passes copy out of the swapchain image, so it has to be a transfer source as well.
const SWAPCHAIN_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
);

impl Swapchain {
    pub(crate) fn new(
        context: &Context,
        core: &Core,
        window: &winit::window::Window,
    ) -> RenderResult<Self> {
        let entry = &core.entry;
        let instance = &core.instance;
        let window_handle = window
            .window_handle()
            .map_err(|_| RenderError::Unsupported("window handle"))?
            .as_raw();
        let display_handle = window
            .display_handle()
            .map_err(|_| RenderError::Unsupported("display handle"))?
            .as_raw();
        let extent = vk::Extent2D {
            width: window.inner_size().width,
            height: window.inner_size().height,
        };

        let surface_handle = unsafe {
            ash_window::create_surface(entry, instance, display_handle, window_handle, None)
        }?;

        let surface_fn = ash::khr::surface::Instance::new(entry, instance);
        let present_family = context.queue_families.graphics;
        let supported = unsafe {
            surface_fn.get_physical_device_surface_support(
                core.physical_device,
                present_family,
                surface_handle,
            )
        }?;
        if !supported {
            unsafe { surface_fn.destroy_surface(surface_handle, None) };
            return Err(RenderError::Unsupported("presentation from the graphics queue"));
        }

        let surface_formats = unsafe {
            surface_fn.get_physical_device_surface_formats(core.physical_device, surface_handle)
        }?;
        let format = choose_format(&surface_formats).ok_or(RenderError::Unsupported("swapchain format"))?;

        let swapchain_fn = ash::khr::swapchain::Device::new(instance, &context.device);

        let mut swapchain = Self {
            surface_handle,
            surface_fn,
            swapchain_handle: vk::SwapchainKHR::null(),
            swapchain_fn,
            images: Vec::new(),
            image_views: Vec::new(),
            extent,
            format,
            needs_update: false,
            physical_device: core.physical_device,
            present_family,
        };
        swapchain.build(context)?;
        log::info!(
            "Created swapchain {}x{} with {} images in {:?}",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            swapchain.format
        );
        Ok(swapchain)
    }

    /// Acquire the next image, signalling `image_acquired` when it is ready to be rendered to.
    pub fn get_drawable(&mut self, image_acquired: vk::Semaphore) -> RenderResult<Drawable> {
        let (index, suboptimal) = match unsafe {
            self.swapchain_fn.acquire_next_image(
                self.swapchain_handle,
                u64::MAX,
                image_acquired,
                vk::Fence::null(),
            )
        } {
            Ok(x) => x,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_update = true;
                return Err(RenderError::SwapchainOutOfDate);
            }
            Err(e @ (vk::Result::ERROR_DEVICE_LOST
            | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)) => return Err(e.into()),
            Err(e) => return Err(RenderError::AcquireImageFailed(e)),
        };

        // The semaphore is signalled either way, so a suboptimal image is still rendered and
        // presented. The swapchain is rebuilt before the next frame.
        if suboptimal {
            self.needs_update = true;
        }

        Ok(Drawable {
            image: self.images[index as usize],
            view: self.image_views[index as usize],
            index,
            extent: self.extent,
        })
    }

    pub fn resize(&mut self, context: &Context, extent: vk::Extent2D) -> RenderResult<()> {
        self.extent = extent;
        self.build(context)?;
        self.needs_update = false;
        log::info!("Resized swapchain to {}x{}", self.extent.width, self.extent.height);
        Ok(())
    }

    pub fn present(
        &mut self,
        drawable: &Drawable,
        queue: vk::Queue,
        render_done: vk::Semaphore,
    ) -> RenderResult<()> {
        let result = unsafe {
            self.swapchain_fn.queue_present(
                queue,
                &vk::PresentInfoKHR::default()
                    .wait_semaphores(&[render_done])
                    .image_indices(&[drawable.index])
                    .swapchains(&[self.swapchain_handle]),
            )
        };
        match result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_update = true;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build a new swapchain, retiring the current one if there is one.
    fn build(&mut self, context: &Context) -> RenderResult<()> {
        let device = &context.device;
        let capabilities = unsafe {
            self.surface_fn.get_physical_device_surface_capabilities(
                self.physical_device,
                self.surface_handle,
            )
        }?;
        self.extent = clamp_extent(self.extent, &capabilities);

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let old_swapchain = self.swapchain_handle;
        let swapchain_handle = unsafe {
            self.swapchain_fn.create_swapchain(
                &vk::SwapchainCreateInfoKHR::default()
                    .surface(self.surface_handle)
                    .min_image_count(image_count)
                    .image_format(self.format)
                    .image_extent(self.extent)
                    .image_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
                    .image_array_layers(1)
                    .image_usage(SWAPCHAIN_USAGE)
                    .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .queue_family_indices(&[self.present_family])
                    .clipped(true)
                    .present_mode(vk::PresentModeKHR::FIFO)
                    .pre_transform(capabilities.current_transform)
                    .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                    .old_swapchain(old_swapchain),
                None,
            )
        }?;

        // Destroy the old one
        self.destroy_views(device);
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_fn.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain_handle = swapchain_handle;

        self.images = unsafe { self.swapchain_fn.get_swapchain_images(swapchain_handle) }?;
        for (i, &image) in self.images.iter().enumerate() {
            let view = unsafe {
                device.create_image_view(
                    &vk::ImageViewCreateInfo::default()
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .image(image)
                        .format(self.format)
                        .subresource_range(crate::FULL_IMAGE),
                    None,
                )
            }?;
            context.set_debug_label(image, &format!("Swapchain Image {i}"));
            self.image_views.push(view);
        }
        Ok(())
    }

    fn destroy_views(&mut self, device: &ash::Device) {
        for image_view in self.image_views.drain(..) {
            unsafe { device.destroy_image_view(image_view, None) };
        }
    }

    /// The swapchain images themselves belong to the swapchain, only the views are ours.
    pub fn destroy(&mut self, context: &Context) {
        self.destroy_views(&context.device);
        self.images.clear();
        unsafe {
            if self.swapchain_handle != vk::SwapchainKHR::null() {
                self.swapchain_fn
                    .destroy_swapchain(self.swapchain_handle, None);
                self.swapchain_handle = vk::SwapchainKHR::null();
            }
            if self.surface_handle != vk::SurfaceKHR::null() {
                self.surface_fn.destroy_surface(self.surface_handle, None);
                self.surface_handle = vk::SurfaceKHR::null();
            }
        }
    }
}

fn choose_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::Format> {
    let format_preferences = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];
    format_preferences
        .into_iter()
        .find(|&f| available.iter().any(|sf| sf.format == f))
        .or_else(|| available.first().map(|sf| sf.format))
}

/// Surfaces that report a fixed extent have to be used at exactly that size.
fn clamp_extent(requested: vk::Extent2D, capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Drawable {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub index: u32,
    pub extent: vk::Extent2D,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_srgb_formats() {
        let available = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::R8G8B8A8_SRGB),
        ];
        assert_eq!(choose_format(&available), Some(vk::Format::R8G8B8A8_SRGB));
    }

    #[test]
    fn falls_back_to_first_format() {
        let available = [surface_format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert_eq!(
            choose_format(&available),
            Some(vk::Format::A2B10G10R10_UNORM_PACK32)
        );
        assert_eq!(choose_format(&[]), None);
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let requested = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert_eq!(clamp_extent(requested, &capabilities).width, 800);
    }

    #[test]
    fn free_extent_is_clamped() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        let requested = vk::Extent2D {
            width: 5000,
            height: 0,
        };
        let extent = clamp_extent(requested, &capabilities);
        assert_eq!((extent.width, extent.height), (4096, 1));
    }
}
