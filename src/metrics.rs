use std::time::Duration;

use ash::vk;

use crate::{
    error::RenderResult, frame_plan::PassKind, image::take_handle, settings::MAX_SHADOW_LIGHTS,
    Context,
};

/// What a pair of timestamp queries is timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricSlot {
    Frame,
    Pass(PassKind),
    Shadow(usize),
    Compute,
}

impl MetricSlot {
    pub const COUNT: usize = 1 + PassKind::ORDER.len() + MAX_SHADOW_LIGHTS + 1;

    pub fn index(self) -> usize {
        match self {
            MetricSlot::Frame => 0,
            MetricSlot::Pass(pass) => {
                1 + PassKind::ORDER
                    .iter()
                    .position(|p| *p == pass)
                    .unwrap_or_default()
            }
            MetricSlot::Shadow(light) => {
                1 + PassKind::ORDER.len() + light.min(MAX_SHADOW_LIGHTS - 1)
            }
            MetricSlot::Compute => Self::COUNT - 1,
        }
    }
}

/// Convert a pair of raw timestamps to milliseconds. `period` is nanoseconds per tick.
pub fn ticks_to_ms(start: u64, end: u64, period: f32) -> f32 {
    (end.wrapping_sub(start) as f64 * period as f64 / 1_000_000.0) as f32
}

/// CPU side timings of the last frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTimings {
    /// From the start of the frame until present was queued.
    pub cpu: Duration,
    /// Spent blocked on the frame fence and, with `overloaded_gpu`, the present queue.
    pub gpu_wait: Duration,
}

/// GPU timestamps bracketing every pass.
///
/// Readback never waits: a slot whose queries haven't landed yet simply keeps the value from the
/// last frame that did.
pub struct GpuMetrics {
    pool: vk::QueryPool,
    timestamp_period: f32,
    written: [bool; MetricSlot::COUNT],
    results: [f32; MetricSlot::COUNT],
    pub timings: FrameTimings,
}

impl GpuMetrics {
    pub fn new(context: &Context) -> RenderResult<Self> {
        let limits = context.device_properties.limits;
        let pool = if limits.timestamp_compute_and_graphics == vk::TRUE {
            let pool = unsafe {
                context.device.create_query_pool(
                    &vk::QueryPoolCreateInfo::default()
                        .query_type(vk::QueryType::TIMESTAMP)
                        .query_count(2 * MetricSlot::COUNT as u32),
                    None,
                )
            }?;
            context.set_debug_label(pool, "GPU Metrics");
            pool
        } else {
            log::warn!("Timestamps not supported on every queue, GPU metrics disabled");
            vk::QueryPool::null()
        };

        Ok(Self {
            pool,
            timestamp_period: limits.timestamp_period,
            written: [false; MetricSlot::COUNT],
            results: [0.0; MetricSlot::COUNT],
            timings: FrameTimings::default(),
        })
    }

    pub fn start(&mut self, context: &Context, command_buffer: vk::CommandBuffer, slot: MetricSlot) {
        if self.pool == vk::QueryPool::null() {
            return;
        }
        let first = 2 * slot.index() as u32;
        unsafe {
            context
                .device
                .cmd_reset_query_pool(command_buffer, self.pool, first, 2);
            context.device.cmd_write_timestamp2(
                command_buffer,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                self.pool,
                first,
            );
        }
    }

    pub fn end(&mut self, context: &Context, command_buffer: vk::CommandBuffer, slot: MetricSlot) {
        if self.pool == vk::QueryPool::null() {
            return;
        }
        unsafe {
            context.device.cmd_write_timestamp2(
                command_buffer,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                self.pool,
                2 * slot.index() as u32 + 1,
            );
        }
        self.written[slot.index()] = true;
    }

    /// Pull in whatever results are available.
    pub fn collect(&mut self, context: &Context) {
        if self.pool == vk::QueryPool::null() {
            return;
        }
        for index in 0..MetricSlot::COUNT {
            if !self.written[index] {
                continue;
            }
            // Value and availability for the start and end query.
            let mut data = [[0u64; 2]; 2];
            let result = unsafe {
                context.device.get_query_pool_results(
                    self.pool,
                    2 * index as u32,
                    &mut data[..],
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WITH_AVAILABILITY,
                )
            };
            match result {
                Ok(()) | Err(vk::Result::NOT_READY) => {}
                Err(e) => {
                    log::trace!("Timestamp readback for slot {index} failed: {e:?}");
                    continue;
                }
            }
            let [[start, start_ready], [end, end_ready]] = data;
            if start_ready != 0 && end_ready != 0 {
                self.results[index] = ticks_to_ms(start, end, self.timestamp_period);
            }
        }
    }

    /// Milliseconds the slot took on the GPU the last time it was read back.
    pub fn get(&self, slot: MetricSlot) -> f32 {
        self.results[slot.index()]
    }

    /// Safe to call more than once.
    pub fn destroy(&mut self, context: &Context) {
        if let Some(pool) = take_handle(&mut self.pool) {
            unsafe { context.device.destroy_query_pool(pool, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_unique_and_dense() {
        let mut slots = vec![MetricSlot::Frame, MetricSlot::Compute];
        slots.extend(PassKind::ORDER.map(MetricSlot::Pass));
        slots.extend((0..MAX_SHADOW_LIGHTS).map(MetricSlot::Shadow));

        let mut indices: Vec<_> = slots.iter().map(|s| s.index()).collect();
        indices.sort();
        assert_eq!(indices, (0..MetricSlot::COUNT).collect::<Vec<_>>());
    }

    #[test]
    fn slot_count_matches_layout() {
        // Frame, nine passes, three shadow lights, compute.
        assert_eq!(MetricSlot::COUNT, 14);
    }

    #[test]
    fn ticks_convert_with_period() {
        // 1 tick = 1ns
        assert_eq!(ticks_to_ms(0, 2_000_000, 1.0), 2.0);
        // 1 tick = 52.08ns, 19200 ticks = ~1ms
        let ms = ticks_to_ms(100, 100 + 19_200, 52.08);
        assert!((ms - 1.0).abs() < 0.001, "{ms}");
    }

    #[test]
    fn wrapped_counter_still_yields_the_delta() {
        assert_eq!(ticks_to_ms(u64::MAX, 999_999, 1.0), 1.0);
    }
}
