use ash::vk;

use super::{BindingContext, FrameContext, FrameState, Pass, UpdateContext};
use crate::{
    allocator::Allocator, draw_params::DrawParams, error::RenderResult, frame_plan::SWAPCHAIN,
    image::AttachmentState, sub_renderer::SubRenderer,
};

/// Hands the finished swapchain image to every registered [`SubRenderer`].
#[derive(Default)]
pub struct UiPass {
    sub_renderers: Vec<Box<dyn SubRenderer>>,
    state: Option<FrameState>,
}

impl UiPass {
    pub fn new(sub_renderers: Vec<Box<dyn SubRenderer>>) -> Self {
        Self {
            sub_renderers,
            state: None,
        }
    }

    pub fn push(&mut self, sub_renderer: Box<dyn SubRenderer>) {
        self.sub_renderers.push(sub_renderer);
    }

    pub fn len(&self) -> usize {
        self.sub_renderers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_renderers.is_empty()
    }

    pub fn stage_transfers(&mut self, allocator: &mut Allocator) -> RenderResult<()> {
        for sub_renderer in &mut self.sub_renderers {
            sub_renderer.stage_transfers(allocator)?;
        }
        Ok(())
    }
}

impl Pass for UiPass {
    fn update(&mut self, frame: &UpdateContext) {
        self.state = Some(frame.state.clone());
    }

    fn draw(&mut self, frame: &mut FrameContext) -> RenderResult<()> {
        if self.sub_renderers.is_empty() {
            return Ok(());
        }
        let Some(state) = &self.state else {
            return Ok(());
        };

        frame.transition(SWAPCHAIN, AttachmentState::ColourOutput)?;
        let attachment = frame.attachment(SWAPCHAIN, vk::AttachmentLoadOp::LOAD)?;
        frame.begin_rendering(frame.drawable.extent.into(), &[attachment], None);

        let params = DrawParams::new(
            frame.context,
            frame.command_buffer,
            frame.drawable,
            state,
            frame.settings,
        );
        let result = self
            .sub_renderers
            .iter_mut()
            .try_for_each(|sub_renderer| sub_renderer.draw(&params));

        frame.end_rendering();
        result
    }

    fn update_descriptor_sets(&mut self, _bindings: &BindingContext) -> RenderResult<()> {
        Ok(())
    }

    fn destroy(&mut self, allocator: &mut Allocator) {
        for mut sub_renderer in self.sub_renderers.drain(..) {
            sub_renderer.destroy(allocator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Overlay;

    impl SubRenderer for Overlay {
        fn draw(&mut self, _params: &DrawParams) -> RenderResult<()> {
            Ok(())
        }
    }

    #[test]
    fn sub_renderers_are_registered() {
        let mut ui = UiPass::default();
        assert!(ui.is_empty());
        ui.push(Box::new(Overlay));
        ui.push(Box::new(Overlay));
        assert_eq!(ui.len(), 2);
    }
}
