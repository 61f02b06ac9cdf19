use crate::{allocator::Allocator, draw_params::DrawParams, error::RenderResult, pipeline::Pipeline};

/// An overlay drawn after every post pass, typically a GUI.
///
/// The engine doesn't know anything about widgets; it only hands over the command buffer while
/// the swapchain image is bound as the colour attachment.
pub trait SubRenderer {
    fn draw(&mut self, params: &DrawParams) -> RenderResult<()>;

    /// Stage uploads for this frame. Called before the frame's transfers are recorded.
    fn stage_transfers(&mut self, _allocator: &mut Allocator) -> RenderResult<()> {
        Ok(())
    }

    /// Release GPU resources. The device is idle when this is called.
    fn destroy(&mut self, _allocator: &mut Allocator) {}

    /// Convenience function to Generally Do the right thing: bind `pipeline` and set the viewport
    /// and scissor to the whole drawable.
    fn bind_pipeline(&self, params: &DrawParams, pipeline: &Pipeline) {
        let device = &params.context.device;
        let command_buffer = params.command_buffer;
        let extent = params.drawable.extent;
        pipeline.bind(params.context, command_buffer);
        unsafe {
            device.cmd_set_scissor(command_buffer, 0, &[extent.into()]);
            device.cmd_set_viewport(
                command_buffer,
                0,
                &[ash::vk::Viewport::default()
                    .width(extent.width as _)
                    .height(extent.height as _)
                    .max_depth(1.)],
            );
        }
    }
}
