use ash::vk;

use crate::{
    error::RenderResult,
    frame_plan::{FramePlan, FrameStage},
    image::take_handle,
    Context,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreRole {
    ImageAcquired,
    ShadowDone,
    RenderDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceRole {
    Frame,
    Compute,
}

/// CPU side waits after present, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    WaitFrameFence,
    PresentQueueIdle,
}

impl FrameEnd {
    pub fn steps(overloaded_gpu: bool) -> &'static [FrameEnd] {
        if overloaded_gpu {
            &[FrameEnd::WaitFrameFence, FrameEnd::PresentQueueIdle]
        } else {
            &[FrameEnd::WaitFrameFence]
        }
    }
}

/// Tracks whether a fence has a submission behind it that still has to be waited on and reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceLatch {
    armed: bool,
}

impl FenceLatch {
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// True exactly once per [`FenceLatch::arm`].
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }
}

/// One queue submission and the primitives it is chained with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub stage: FrameStage,
    pub waits: Option<SemaphoreRole>,
    pub signals: Option<SemaphoreRole>,
    pub fence: Option<FenceRole>,
}

/// How a frame's submissions are chained together on the GPU.
///
/// Acquire signals `ImageAcquired`. With shadows on, the shadow submission consumes it and
/// signals `ShadowDone`, which the deferred submission waits on; otherwise deferred waits on the
/// acquire directly. Present always waits on what deferred signals. Compute runs on its own
/// fence and is waited on by the CPU before anything else is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub acquire_signals: SemaphoreRole,
    pub submissions: Vec<Submission>,
    pub present_waits: SemaphoreRole,
}

impl SyncPlan {
    pub fn new(plan: &FramePlan) -> Self {
        let mut submissions = Vec::new();

        if plan.has_stage(FrameStage::ComputeDispatch) {
            submissions.push(Submission {
                stage: FrameStage::ComputeDispatch,
                waits: None,
                signals: None,
                fence: Some(FenceRole::Compute),
            });
        }

        let deferred_waits = if plan.has_stage(FrameStage::ShadowPass) {
            submissions.push(Submission {
                stage: FrameStage::ShadowPass,
                waits: Some(SemaphoreRole::ImageAcquired),
                signals: Some(SemaphoreRole::ShadowDone),
                fence: None,
            });
            SemaphoreRole::ShadowDone
        } else {
            SemaphoreRole::ImageAcquired
        };

        submissions.push(Submission {
            stage: FrameStage::DeferredPasses,
            waits: Some(deferred_waits),
            signals: Some(SemaphoreRole::RenderDone),
            fence: Some(FenceRole::Frame),
        });

        Self {
            acquire_signals: SemaphoreRole::ImageAcquired,
            submissions,
            present_waits: SemaphoreRole::RenderDone,
        }
    }

    pub fn submission(&self, stage: FrameStage) -> Option<&Submission> {
        self.submissions.iter().find(|s| s.stage == stage)
    }
}

/// The fences and semaphores behind [`SyncPlan`]'s roles.
pub struct FrameSync {
    image_acquired: vk::Semaphore,
    shadow_done: vk::Semaphore,
    render_done: vk::Semaphore,
    frame_fence: vk::Fence,
    compute_fence: vk::Fence,
    frame_in_flight: FenceLatch,
}

impl FrameSync {
    pub fn new(context: &Context) -> RenderResult<Self> {
        let device = &context.device;
        let semaphore = || unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) };
        let fence = || unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) };

        let sync = Self {
            image_acquired: semaphore()?,
            shadow_done: semaphore()?,
            render_done: semaphore()?,
            frame_fence: fence()?,
            compute_fence: fence()?,
            frame_in_flight: FenceLatch::default(),
        };
        context.set_debug_label(sync.image_acquired, "Image Acquired");
        context.set_debug_label(sync.shadow_done, "Shadow Pass Done");
        context.set_debug_label(sync.render_done, "Render Done");
        context.set_debug_label(sync.frame_fence, "Frame Fence");
        context.set_debug_label(sync.compute_fence, "Compute Fence");
        Ok(sync)
    }

    pub fn semaphore(&self, role: SemaphoreRole) -> vk::Semaphore {
        match role {
            SemaphoreRole::ImageAcquired => self.image_acquired,
            SemaphoreRole::ShadowDone => self.shadow_done,
            SemaphoreRole::RenderDone => self.render_done,
        }
    }

    pub fn fence(&self, role: FenceRole) -> vk::Fence {
        match role {
            FenceRole::Frame => self.frame_fence,
            FenceRole::Compute => self.compute_fence,
        }
    }

    /// Block until `role` signals, then reset it for the next submission.
    pub fn wait_and_reset(&self, context: &Context, role: FenceRole) -> RenderResult<()> {
        let fence = self.fence(role);
        unsafe {
            context.device.wait_for_fences(&[fence], true, u64::MAX)?;
            context.device.reset_fences(&[fence])?;
        }
        Ok(())
    }

    /// The deferred submission carrying the frame fence went in.
    pub fn frame_submitted(&mut self) {
        self.frame_in_flight.arm();
    }

    /// Settle the frame after present, whether or not present succeeded. The frame fence is only
    /// waited on when a submission signals it, and is always reset afterwards.
    pub fn finish_frame(
        &mut self,
        context: &Context,
        present_queue: vk::Queue,
        overloaded_gpu: bool,
    ) -> RenderResult<()> {
        for step in FrameEnd::steps(overloaded_gpu) {
            match step {
                FrameEnd::WaitFrameFence => {
                    if self.frame_in_flight.take() {
                        self.wait_and_reset(context, FenceRole::Frame)?;
                    }
                }
                FrameEnd::PresentQueueIdle => unsafe {
                    context.device.queue_wait_idle(present_queue)?;
                },
            }
        }
        Ok(())
    }

    /// Safe to call more than once.
    pub fn destroy(&mut self, context: &Context) {
        let device = &context.device;
        unsafe {
            for semaphore in [
                &mut self.image_acquired,
                &mut self.shadow_done,
                &mut self.render_done,
            ] {
                if let Some(semaphore) = take_handle(semaphore) {
                    device.destroy_semaphore(semaphore, None);
                }
            }
            for fence in [&mut self.frame_fence, &mut self.compute_fence] {
                if let Some(fence) = take_handle(fence) {
                    device.destroy_fence(fence, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RenderSettings;

    fn plan(shadows: bool, compute: bool) -> SyncPlan {
        SyncPlan::new(&FramePlan::new(
            &RenderSettings::default()
                .with_shadows(shadows)
                .with_compute(compute),
        ))
    }

    #[test]
    fn present_waits_on_what_deferred_signals() {
        for (shadows, compute) in [(false, false), (true, false), (false, true), (true, true)] {
            let plan = plan(shadows, compute);
            let deferred = plan.submission(FrameStage::DeferredPasses).unwrap();
            assert_eq!(deferred.signals, Some(plan.present_waits));
            assert_eq!(deferred.fence, Some(FenceRole::Frame));
        }
    }

    #[test]
    fn shadows_sit_between_acquire_and_deferred() {
        let plan = plan(true, false);
        let shadows = plan.submission(FrameStage::ShadowPass).unwrap();
        let deferred = plan.submission(FrameStage::DeferredPasses).unwrap();
        assert_eq!(shadows.waits, Some(plan.acquire_signals));
        assert_eq!(deferred.waits, shadows.signals);
    }

    #[test]
    fn without_shadows_deferred_waits_on_acquire() {
        let plan = plan(false, false);
        assert!(plan.submission(FrameStage::ShadowPass).is_none());
        let deferred = plan.submission(FrameStage::DeferredPasses).unwrap();
        assert_eq!(deferred.waits, Some(SemaphoreRole::ImageAcquired));
    }

    #[test]
    fn every_wait_has_an_earlier_signal() {
        let plan = plan(true, true);
        let mut signalled = vec![plan.acquire_signals];
        for submission in &plan.submissions {
            if let Some(wait) = submission.waits {
                assert!(signalled.contains(&wait), "{submission:?}");
                signalled.retain(|s| *s != wait);
            }
            signalled.extend(submission.signals);
        }
        assert_eq!(signalled, vec![plan.present_waits]);
    }

    #[test]
    fn frame_fence_is_waited_before_idling_the_present_queue() {
        assert_eq!(FrameEnd::steps(false), &[FrameEnd::WaitFrameFence]);
        assert_eq!(
            FrameEnd::steps(true),
            &[FrameEnd::WaitFrameFence, FrameEnd::PresentQueueIdle]
        );
    }

    #[test]
    fn an_armed_fence_is_settled_once() {
        let mut latch = FenceLatch::default();
        assert!(!latch.take());
        latch.arm();
        assert!(latch.take());
        assert!(!latch.take());
    }

    #[test]
    fn compute_only_uses_its_fence() {
        let plan = plan(false, true);
        let compute = plan.submission(FrameStage::ComputeDispatch).unwrap();
        assert_eq!(compute.fence, Some(FenceRole::Compute));
        assert_eq!(compute.waits, None);
        assert_eq!(compute.signals, None);
        assert_eq!(plan.submissions[0].stage, FrameStage::ComputeDispatch);
    }
}
