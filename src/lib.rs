pub use allocator::Allocator;
pub use ash;
pub use context::Context;
pub use descriptors::Technique;
pub use draw_params::DrawParams;
pub use error::{LoadError, RenderError, RenderResult};
pub use frame_plan::{FramePlan, PassKind};
pub use load_queue::{LoadTicket, ModelLoader};
pub use metrics::{FrameTimings, GpuMetrics, MetricSlot};
pub use passes::{FrameState, Light};
pub use pipeline::{alpha_blend_attachment, opaque_attachment, Pipeline, PipelineConfig};
pub use renderer::Renderer;
pub use scene::{MeshData, ModelData, Primitive, Scene, TextureData, Vertex};
pub use settings::{RenderSettings, ShadowSettings, MAX_SHADOW_LIGHTS};
pub use sub_renderer::SubRenderer;

use core::Core;
use std::{path::PathBuf, sync::Arc};

use ash::vk;
use swapchain::Swapchain;

mod allocator;
mod buffer;
mod context;
mod core;
mod descriptors;
mod draw_params;
mod error;
pub mod frame_plan;
mod image;
mod load_queue;
mod metrics;
pub mod passes;
mod pipeline;
mod render_targets;
mod renderer;
mod scene;
mod settings;
mod sub_renderer;
mod swapchain;
mod sync;

/// A deferred renderer drawing into a window.
///
/// Fatal errors (device loss, running out of memory, rejected pipelines) are logged and abort the
/// process from [`DeferredVulkan::draw`]; use [`DeferredVulkan::try_draw`] to handle them yourself.
pub struct DeferredVulkan {
    renderer: Renderer,
    context: Arc<Context>,
    core: Core,
    pub window: winit::window::Window,
}

impl DeferredVulkan {
    pub fn new(
        window: winit::window::Window,
        settings: RenderSettings,
        loader: impl ModelLoader<ModelData> + 'static,
    ) -> RenderResult<Self> {
        let core = Core::new(&window)?;
        let context = Arc::new(Context::new(&core)?);
        let swapchain = Swapchain::new(&context, &core, &window)?;
        let renderer = Renderer::new(context.clone(), swapchain, settings, loader)?;

        Ok(DeferredVulkan {
            renderer,
            context,
            core,
            window,
        })
    }

    /// Render one frame, aborting on fatal errors.
    pub fn draw(&mut self, state: &FrameState) {
        if let Err(e) = self.try_draw(state) {
            if e.is_fatal() {
                log::error!("Fatal render error: {e}");
                std::process::abort();
            }
            log::warn!("Frame dropped: {e}");
        }
    }

    pub fn try_draw(&mut self, state: &FrameState) -> RenderResult<()> {
        self.renderer.draw(state)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.renderer.resize(vk::Extent2D { width, height });
    }

    pub fn set_settings(&mut self, settings: RenderSettings) -> RenderResult<()> {
        self.renderer.set_settings(settings)
    }

    pub fn settings(&self) -> &RenderSettings {
        self.renderer.settings()
    }

    /// Load `name` from `folder` on a worker thread. The model shows up in [`Self::scene`] on
    /// some later frame, or never if loading fails.
    pub fn load_model(&mut self, folder: impl Into<PathBuf>, name: &str) -> LoadTicket {
        self.renderer.load_model(folder, name)
    }

    pub fn cancel_load(&mut self, ticket: LoadTicket) -> bool {
        self.renderer.cancel_load(ticket)
    }

    /// Remove the model at `index` before the next frame. Later models move down one index.
    pub fn unload_model(&mut self, index: usize) {
        self.renderer.unload_model(index);
    }

    pub fn cancel_unload(&mut self, index: usize) -> bool {
        self.renderer.cancel_unload(index)
    }

    pub fn add_sub_renderer(&mut self, sub_renderer: Box<dyn SubRenderer>) {
        self.renderer.add_sub_renderer(sub_renderer);
    }

    pub fn scene(&self) -> &Scene {
        &self.renderer.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.renderer.scene
    }

    pub fn metrics(&self) -> &GpuMetrics {
        &self.renderer.metrics
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }
}

impl Drop for DeferredVulkan {
    fn drop(&mut self) {
        self.renderer.destroy();
        unsafe {
            self.context.destroy();
            self.core.destroy();
        }
    }
}

const FULL_IMAGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: vk::REMAINING_MIP_LEVELS,
    base_array_layer: 0,
    layer_count: vk::REMAINING_ARRAY_LAYERS,
};
