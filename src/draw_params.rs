use ash::vk;

use crate::{passes::FrameState, settings::RenderSettings, swapchain::Drawable, Context};

/// What a [`crate::SubRenderer`] gets to record its overlay with.
///
/// Rendering into the swapchain image has already begun when a sub-renderer sees these, with the
/// image loaded rather than cleared, so the overlay lands on top of the finished frame.
#[derive(Clone, Copy)]
pub struct DrawParams<'a> {
    pub context: &'a Context,
    pub command_buffer: vk::CommandBuffer,
    pub drawable: Drawable,
    pub state: &'a FrameState,
    pub settings: &'a RenderSettings,
}

impl<'a> DrawParams<'a> {
    pub fn new(
        context: &'a Context,
        command_buffer: vk::CommandBuffer,
        drawable: Drawable,
        state: &'a FrameState,
        settings: &'a RenderSettings,
    ) -> Self {
        Self {
            context,
            command_buffer,
            drawable,
            state,
            settings,
        }
    }
}
