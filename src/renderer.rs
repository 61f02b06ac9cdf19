use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ash::vk;
use glam::{Mat4, Vec4};

use crate::{
    allocator::Allocator,
    error::RenderResult,
    frame_plan::{FramePlan, FrameStage, FrameUpkeep, PassKind, SWAPCHAIN},
    image::AttachmentState,
    load_queue::{LoadQueue, LoadTicket, ModelLoader},
    metrics::{GpuMetrics, MetricSlot},
    passes::{
        bloom::BloomPass, composition::CompositionPass, compute::ComputePass, fxaa::FxaaPass,
        gbuffer::GeometryPass, motion_blur::MotionBlurPass, shadows::ShadowPass,
        skybox::SkyboxPass, ssao::SsaoPass, ssr::SsrPass, ui::UiPass, BindingContext,
        FrameContext, FrameState, Pass, UpdateContext,
    },
    render_targets::RenderTargets,
    scene::{
        release_model, restage_moved, update_model_uniforms, upload_model, ModelData, Scene,
        SceneGeometry,
    },
    settings::{FramePacer, RenderSettings, MAX_SHADOW_LIGHTS},
    sub_renderer::SubRenderer,
    swapchain::{Drawable, Swapchain},
    sync::{FenceRole, FrameSync, SyncPlan},
    Context,
};

/// Every pass recorded into the deferred command buffer, built once up front. Disabled passes
/// keep their pipelines so toggling them is only a descriptor rewrite.
pub struct Passes {
    pub skybox: SkyboxPass,
    pub geometry: GeometryPass,
    pub ssao: SsaoPass,
    pub ssr: SsrPass,
    pub composition: CompositionPass,
    pub fxaa: FxaaPass,
    pub bloom: BloomPass,
    pub motion_blur: MotionBlurPass,
    pub ui: UiPass,
}

impl Passes {
    fn new(
        allocator: &mut Allocator,
        settings: &RenderSettings,
        surface_format: vk::Format,
    ) -> RenderResult<Self> {
        let context = allocator.context.clone();
        Ok(Self {
            skybox: SkyboxPass::new(allocator, settings)?,
            geometry: GeometryPass::new(&context, settings)?,
            ssao: SsaoPass::new(allocator, settings)?,
            ssr: SsrPass::new(allocator, settings)?,
            composition: CompositionPass::new(allocator, settings, surface_format)?,
            fxaa: FxaaPass::new(allocator, settings, surface_format)?,
            bloom: BloomPass::new(allocator, settings, surface_format)?,
            motion_blur: MotionBlurPass::new(allocator, settings, surface_format)?,
            ui: UiPass::default(),
        })
    }

    pub fn get_mut(&mut self, kind: PassKind) -> &mut dyn Pass {
        match kind {
            PassKind::Skybox => &mut self.skybox,
            PassKind::Geometry => &mut self.geometry,
            PassKind::Ssao => &mut self.ssao,
            PassKind::Ssr => &mut self.ssr,
            PassKind::Composition => &mut self.composition,
            PassKind::Fxaa => &mut self.fxaa,
            PassKind::Bloom => &mut self.bloom,
            PassKind::MotionBlur => &mut self.motion_blur,
            PassKind::Ui => &mut self.ui,
        }
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        for kind in PassKind::ORDER {
            self.get_mut(kind).destroy(allocator);
        }
    }
}

/// Command buffers recorded against one swapchain image.
struct FrameCommandBuffers {
    deferred: vk::CommandBuffer,
    shadows: Vec<vk::CommandBuffer>,
}

fn allocate_frame_command_buffers(
    context: &Context,
    images: usize,
) -> RenderResult<Vec<FrameCommandBuffers>> {
    (0..images)
        .map(|image| {
            let mut buffers =
                context.allocate_command_buffers(context.command_pool, 1 + MAX_SHADOW_LIGHTS as u32)?;
            let shadows = buffers.split_off(1);
            let deferred = buffers[0];
            context.set_debug_label(deferred, &format!("Deferred {image}"));
            for (light, buffer) in shadows.iter().enumerate() {
                context.set_debug_label(*buffer, &format!("Shadows {light} ({image})"));
            }
            Ok(FrameCommandBuffers { deferred, shadows })
        })
        .collect()
}

/// Marker colours, one per pass family, so captures are easy to scan.
fn marker_colour(kind: PassKind) -> Vec4 {
    match kind {
        PassKind::Skybox => glam::vec4(0.3, 0.6, 1.0, 1.0),
        PassKind::Geometry => glam::vec4(0.2, 0.8, 0.2, 1.0),
        PassKind::Ssao | PassKind::Ssr => glam::vec4(0.7, 0.7, 0.7, 1.0),
        PassKind::Composition => glam::vec4(1.0, 0.8, 0.2, 1.0),
        PassKind::Fxaa | PassKind::Bloom | PassKind::MotionBlur => glam::vec4(0.9, 0.4, 0.9, 1.0),
        PassKind::Ui => glam::vec4(1.0, 1.0, 1.0, 1.0),
    }
}

/// Drives one frame at a time through acquire, compute, shadows, the deferred passes and present.
pub struct Renderer {
    pub context: Arc<Context>,
    pub allocator: Allocator,
    pub swapchain: Swapchain,
    pub targets: RenderTargets,
    pub metrics: GpuMetrics,
    pub scene: Scene,
    pub passes: Passes,
    geometry: SceneGeometry,
    load_queue: LoadQueue<ModelData>,
    shadows: Vec<ShadowPass>,
    compute: ComputePass,
    sync: FrameSync,
    command_buffers: Vec<FrameCommandBuffers>,
    compute_command_buffer: vk::CommandBuffer,
    settings: RenderSettings,
    upkeep: FrameUpkeep,
    previous_view_projection: Mat4,
    pacer: FramePacer,
}

impl Renderer {
    pub(crate) fn new(
        context: Arc<Context>,
        swapchain: Swapchain,
        settings: RenderSettings,
        loader: impl ModelLoader<ModelData> + 'static,
    ) -> RenderResult<Self> {
        let mut allocator = Allocator::new(context.clone())?;
        let targets = RenderTargets::new(
            &mut allocator,
            swapchain.extent,
            swapchain.format,
            settings.shadows.map_size,
        )?;
        let passes = Passes::new(&mut allocator, &settings, swapchain.format)?;
        let shadows = (0..MAX_SHADOW_LIGHTS)
            .map(|light| ShadowPass::new(&mut allocator, &settings, light))
            .collect::<RenderResult<Vec<_>>>()?;
        let compute = ComputePass::new(&mut allocator, &settings)?;
        let geometry = SceneGeometry::new(&mut allocator, settings.geometry_capacity)?;

        let command_buffers = allocate_frame_command_buffers(&context, swapchain.images.len())?;
        let compute_command_buffer =
            context.allocate_command_buffers(context.compute_command_pool, 1)?[0];
        context.set_debug_label(compute_command_buffer, "Compute");

        log::info!(
            "Renderer ready: {} render targets, {} swapchain images",
            targets.len(),
            swapchain.images.len()
        );

        Ok(Self {
            sync: FrameSync::new(&context)?,
            metrics: GpuMetrics::new(&context)?,
            scene: Scene::new(settings.geometry_capacity),
            load_queue: LoadQueue::new(loader),
            context,
            allocator,
            swapchain,
            targets,
            passes,
            geometry,
            shadows,
            compute,
            command_buffers,
            compute_command_buffer,
            settings,
            upkeep: FrameUpkeep::default(),
            previous_view_projection: Mat4::IDENTITY,
            pacer: FramePacer::default(),
        })
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Apply new settings. Descriptor sets and shadow maps are rebuilt before the next frame when
    /// the change requires it.
    pub fn set_settings(&mut self, settings: RenderSettings) -> RenderResult<()> {
        let changes = settings.binding_changes(&self.settings);
        if changes.shadow_maps_stale {
            self.context.wait_idle()?;
            self.targets
                .resize_shadow_maps(&mut self.allocator, settings.shadows.map_size)?;
        }
        self.upkeep.settings_changed(changes);
        self.settings = settings;
        Ok(())
    }

    pub fn add_sub_renderer(&mut self, sub_renderer: Box<dyn SubRenderer>) {
        self.passes.ui.push(sub_renderer);
    }

    pub fn load_model(&mut self, folder: impl Into<std::path::PathBuf>, name: &str) -> LoadTicket {
        self.load_queue.enqueue(folder, name)
    }

    pub fn cancel_load(&mut self, ticket: LoadTicket) -> bool {
        self.load_queue.cancel(ticket)
    }

    pub fn unload_model(&mut self, index: usize) {
        self.load_queue.enqueue_unload(index);
    }

    pub fn cancel_unload(&mut self, index: usize) -> bool {
        self.load_queue.cancel_unload(index)
    }

    /// Ask for the swapchain to be rebuilt at `extent` before the next frame.
    pub fn resize(&mut self, extent: vk::Extent2D) {
        self.swapchain.extent = extent;
        self.swapchain.needs_update = true;
    }

    /// Render and present one frame.
    pub fn draw(&mut self, state: &FrameState) -> RenderResult<()> {
        let frame_start = Instant::now();

        self.check_queue()?;
        if std::mem::take(&mut self.swapchain.needs_update) {
            self.upkeep.request_rebuild();
        }
        let steps = self.upkeep.take();
        if steps.rebuild {
            self.rebuild()?;
        }
        if steps.rewrite_descriptors {
            self.update_descriptor_sets()?;
        }

        let plan = FramePlan::new(&self.settings);
        let sync_plan = SyncPlan::new(&plan);

        let drawable = match self
            .swapchain
            .get_drawable(self.sync.semaphore(sync_plan.acquire_signals))
        {
            Ok(drawable) => drawable,
            Err(e) => {
                log::debug!("Skipping frame: {e}");
                return self.upkeep.acquire_failed(e);
            }
        };

        self.update(state, &plan, drawable.extent)?;

        let presented = self.submit_stages(&plan, &sync_plan, drawable).and_then(|()| {
            self.swapchain.present(
                &drawable,
                self.context.present_queue,
                self.sync.semaphore(sync_plan.present_waits),
            )
        });
        let cpu = frame_start.elapsed();

        let wait_start = Instant::now();
        self.sync.finish_frame(
            &self.context,
            self.context.present_queue,
            self.settings.overloaded_gpu,
        )?;
        presented?;
        let gpu_wait = wait_start.elapsed();

        self.allocator.retire_transfers();
        self.metrics.collect(&self.context);
        self.metrics.timings.cpu = cpu;
        self.metrics.timings.gpu_wait = gpu_wait;
        self.previous_view_projection = state.view_projection();

        log::trace!(
            "Frame {}: cpu {:?}, waited {:?}, gpu {:.2}ms",
            drawable.index,
            cpu,
            gpu_wait,
            self.metrics.get(MetricSlot::Frame)
        );

        self.pacer.end_frame(self.settings.fps_cap);
        Ok(())
    }

    /// Record and submit every stage of `sync_plan`.
    fn submit_stages(
        &mut self,
        plan: &FramePlan,
        sync_plan: &SyncPlan,
        drawable: Drawable,
    ) -> RenderResult<()> {
        for submission in &sync_plan.submissions {
            let wait = submission.waits.map(|role| self.sync.semaphore(role));
            let signal = submission.signals.map(|role| self.sync.semaphore(role));
            let fence = submission
                .fence
                .map_or(vk::Fence::null(), |role| self.sync.fence(role));

            match submission.stage {
                FrameStage::ComputeDispatch => {
                    let command_buffer = self.compute_command_buffer;
                    self.record_compute(command_buffer)?;
                    submit(
                        &self.context,
                        self.context.compute_queue,
                        &[command_buffer],
                        wait,
                        signal,
                        fence,
                    )?;
                    self.sync.wait_and_reset(&self.context, FenceRole::Compute)?;
                }
                FrameStage::ShadowPass => {
                    let command_buffers = self.record_shadows(drawable, plan.shadow_lights as usize)?;
                    submit(
                        &self.context,
                        self.context.graphics_queue,
                        &command_buffers,
                        wait,
                        signal,
                        fence,
                    )?;
                }
                FrameStage::DeferredPasses => {
                    let command_buffer = self.record_deferred(drawable, plan)?;
                    submit(
                        &self.context,
                        self.context.graphics_queue,
                        &[command_buffer],
                        wait,
                        signal,
                        fence,
                    )?;
                    self.sync.frame_submitted();
                }
                FrameStage::Idle | FrameStage::AcquireImage | FrameStage::Present => {}
            }
        }
        Ok(())
    }

    /// Apply finished loads and requested unloads to the scene. A model that can't be uploaded is
    /// dropped like any other failed load; only losing the device is an error here.
    fn check_queue(&mut self) -> RenderResult<()> {
        if self.load_queue.has_unloads() {
            // Nothing may still be reading the geometry or descriptor sets being released.
            self.context.wait_idle()?;
            for index in self.load_queue.drain_unloads() {
                let Some((mut model, _)) = self.scene.remove(index) else {
                    log::warn!(
                        "Ignoring unload of model {index}, only {} loaded",
                        self.scene.len()
                    );
                    continue;
                };
                release_model(&mut self.allocator, &mut model);
                log::info!("Unloaded {}", model.name);
            }
        }

        // Moved models stay hidden until this goes through, so running out of staging space just
        // defers it to the next frame.
        if let Err(e) = restage_moved(&mut self.allocator, &self.geometry, &mut self.scene) {
            if e.is_device_failure() {
                return Err(e);
            }
            log::warn!("Deferring geometry moves to the next frame: {e}");
        }

        self.load_queue.start_pending();
        for loaded in self.load_queue.poll() {
            let index = match self.scene.push(Arc::new(loaded.model)) {
                Ok(index) => index,
                Err(e) => {
                    log::warn!("No room for {}: {e}", loaded.name);
                    continue;
                }
            };
            match upload_model(
                &mut self.allocator,
                &self.geometry,
                &self.targets,
                &mut self.scene.models[index],
            ) {
                Ok(()) => log::info!("Loaded {} as model {index}", loaded.name),
                Err(e) if e.is_device_failure() => return Err(e),
                Err(e) => {
                    log::warn!("Dropping model {}: {e}", loaded.name);
                    // Nothing recorded has seen the model yet.
                    if let Some((mut model, _)) = self.scene.remove(index) {
                        release_model(&mut self.allocator, &mut model);
                    }
                }
            }
        }
        Ok(())
    }

    /// Rebuild everything that depends on the surface.
    fn rebuild(&mut self) -> RenderResult<()> {
        self.context.wait_idle()?;
        let extent = self.swapchain.extent;
        self.swapchain.resize(&self.context, extent)?;
        self.targets.resize(
            &mut self.allocator,
            self.swapchain.extent,
            self.swapchain.format,
        )?;
        self.targets.reset_layouts();

        if self.command_buffers.len() != self.swapchain.images.len() {
            self.free_command_buffers();
            self.command_buffers =
                allocate_frame_command_buffers(&self.context, self.swapchain.images.len())?;
        }

        Ok(())
    }

    fn update_descriptor_sets(&mut self) -> RenderResult<()> {
        self.context.wait_idle()?;
        let bindings = BindingContext {
            context: &self.context,
            targets: &self.targets,
            uniforms: &self.allocator.uniforms,
            settings: &self.settings,
        };
        for kind in PassKind::ORDER {
            self.passes.get_mut(kind).update_descriptor_sets(&bindings)?;
        }
        for shadow in &mut self.shadows {
            shadow.update_descriptor_sets(&bindings)?;
        }
        self.compute.update_descriptor_sets(&bindings)?;

        log::debug!("Rewrote descriptor sets");
        Ok(())
    }

    /// Write this frame's uniforms and stage this frame's uploads.
    fn update(&mut self, state: &FrameState, plan: &FramePlan, extent: vk::Extent2D) -> RenderResult<()> {
        for model in &mut self.scene.models {
            update_model_uniforms(&self.allocator, model);
        }

        let frame = UpdateContext {
            uniforms: &self.allocator.uniforms,
            state,
            settings: &self.settings,
            extent,
            previous_view_projection: self.previous_view_projection,
        };
        for kind in &plan.passes {
            self.passes.get_mut(*kind).update(&frame);
        }
        for shadow in self.shadows.iter_mut().take(plan.shadow_lights as usize) {
            shadow.update(&frame);
        }

        self.passes.ui.stage_transfers(&mut self.allocator)
    }

    fn record_compute(&mut self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        let context = &self.context;
        begin_command_buffer(context, command_buffer)?;
        context.begin_marker(command_buffer, "Compute", glam::vec4(1.0, 0.5, 0.0, 1.0));
        self.metrics.start(context, command_buffer, MetricSlot::Compute);
        self.compute.dispatch(context, command_buffer);
        self.metrics.end(context, command_buffer, MetricSlot::Compute);
        context.end_marker(command_buffer);
        unsafe { context.device.end_command_buffer(command_buffer) }?;
        Ok(())
    }

    /// One command buffer per light, submitted together.
    fn record_shadows(
        &mut self,
        drawable: Drawable,
        lights: usize,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let Self {
            context,
            targets,
            metrics,
            scene,
            geometry,
            shadows,
            command_buffers,
            settings,
            ..
        } = self;
        let frame_buffers = &command_buffers[drawable.index as usize];

        let mut recorded = Vec::with_capacity(lights);
        for (shadow, &command_buffer) in shadows.iter_mut().zip(&frame_buffers.shadows).take(lights) {
            begin_command_buffer(context, command_buffer)?;
            context.begin_marker(
                command_buffer,
                &format!("Shadows {}", shadow.light()),
                glam::vec4(0.4, 0.4, 0.4, 1.0),
            );
            let slot = MetricSlot::Shadow(shadow.light());
            metrics.start(context, command_buffer, slot);

            let mut frame = FrameContext {
                context,
                command_buffer,
                targets: &mut *targets,
                drawable,
                swapchain_state: AttachmentState::Undefined,
                settings,
                scene,
                geometry,
            };
            shadow.draw(&mut frame)?;

            metrics.end(context, command_buffer, slot);
            context.end_marker(command_buffer);
            unsafe { context.device.end_command_buffer(command_buffer) }?;
            recorded.push(command_buffer);
        }
        Ok(recorded)
    }

    fn record_deferred(
        &mut self,
        drawable: Drawable,
        plan: &FramePlan,
    ) -> RenderResult<vk::CommandBuffer> {
        let Self {
            context,
            allocator,
            targets,
            metrics,
            scene,
            geometry,
            passes,
            command_buffers,
            settings,
            ..
        } = self;
        let command_buffer = command_buffers[drawable.index as usize].deferred;

        begin_command_buffer(context, command_buffer)?;
        metrics.start(context, command_buffer, MetricSlot::Frame);
        allocator.execute_transfers(command_buffer);
        targets.record_pending_clears(context, command_buffer)?;

        let mut frame = FrameContext {
            context,
            command_buffer,
            targets,
            drawable,
            swapchain_state: AttachmentState::Undefined,
            settings,
            scene,
            geometry,
        };

        for kind in &plan.passes {
            let slot = MetricSlot::Pass(*kind);
            context.begin_marker(command_buffer, kind.name(), marker_colour(*kind));
            metrics.start(context, command_buffer, slot);
            passes.get_mut(*kind).draw(&mut frame)?;
            metrics.end(context, command_buffer, slot);
            context.end_marker(command_buffer);
        }

        frame.transition(SWAPCHAIN, AttachmentState::Swapchain)?;
        metrics.end(context, command_buffer, MetricSlot::Frame);
        unsafe { context.device.end_command_buffer(command_buffer) }?;
        Ok(command_buffer)
    }

    fn free_command_buffers(&mut self) {
        let buffers: Vec<_> = self
            .command_buffers
            .drain(..)
            .flat_map(|frame| std::iter::once(frame.deferred).chain(frame.shadows))
            .collect();
        if !buffers.is_empty() {
            unsafe {
                self.context
                    .device
                    .free_command_buffers(self.context.command_pool, &buffers)
            };
        }
    }

    /// Release every GPU object the renderer owns. The context itself is left alone.
    pub(crate) fn destroy(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::warn!("Device didn't go idle before teardown: {e}");
        }

        let allocator = &mut self.allocator;
        self.passes.destroy(allocator);
        for shadow in &mut self.shadows {
            shadow.destroy(allocator);
        }
        self.compute.destroy(allocator);
        for model in &mut self.scene.models {
            release_model(allocator, model);
        }
        self.scene.models.clear();
        self.geometry.destroy(allocator);
        self.targets.destroy(allocator);

        self.metrics.destroy(&self.context);
        self.sync.destroy(&self.context);
        self.free_command_buffers();
        self.swapchain.destroy(&self.context);
        unsafe { self.allocator.destroy() };
        log::info!("Renderer destroyed");
    }

    pub fn gpu_time(&self, slot: MetricSlot) -> Duration {
        Duration::from_secs_f32(self.metrics.get(slot).max(0.0) / 1000.0)
    }
}

fn begin_command_buffer(context: &Context, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
    unsafe {
        context.device.begin_command_buffer(
            command_buffer,
            &vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
        )
    }?;
    Ok(())
}

fn submit(
    context: &Context,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait: Option<vk::Semaphore>,
    signal: Option<vk::Semaphore>,
    fence: vk::Fence,
) -> RenderResult<()> {
    let command_buffer_infos: Vec<_> = command_buffers
        .iter()
        .map(|&command_buffer| vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer))
        .collect();
    let waits: Vec<_> = wait
        .into_iter()
        .map(|semaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        })
        .collect();
    let signals: Vec<_> = signal
        .into_iter()
        .map(|semaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        })
        .collect();

    unsafe {
        context.device.queue_submit2(
            queue,
            &[vk::SubmitInfo2::default()
                .command_buffer_infos(&command_buffer_infos)
                .wait_semaphore_infos(&waits)
                .signal_semaphore_infos(&signals)],
            fence,
        )
    }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pass_has_a_marker_colour() {
        for kind in PassKind::ORDER {
            assert_eq!(marker_colour(kind).w, 1.0, "{}", kind.name());
        }
    }
}
