use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

/// Upper bound on shadow casting lights. Shadow maps are bound as a fixed-size array in the
/// composition layout, so this can't be changed at runtime.
pub const MAX_SHADOW_LIGHTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowSettings {
    /// Number of lights that get a shadow map, at most [`MAX_SHADOW_LIGHTS`].
    pub lights: u32,
    /// Width and height of each shadow map.
    pub map_size: u32,
    /// Constant factor, clamp, slope factor.
    pub depth_bias: [f32; 3],
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            lights: MAX_SHADOW_LIGHTS as u32,
            map_size: 4096,
            depth_bias: [0.0, 0.0, -6.2],
        }
    }
}

/// Runtime switches and tunables, normally driven by a UI.
///
/// Toggling an effect doesn't take effect on the GPU side by itself: the renderer compares the
/// old and new settings with [`RenderSettings::binding_changes`] and rebuilds the descriptor sets
/// that read the affected targets.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    pub ssao: bool,
    pub ssr: bool,
    pub fxaa: bool,
    pub bloom: bool,
    pub motion_blur: bool,
    pub shadow_cast: bool,
    pub use_compute: bool,
    /// Wait for the present queue to go idle every frame. Smooths pacing on a GPU that can't keep
    /// up with the CPU, at the cost of latency.
    pub overloaded_gpu: bool,
    /// `None` means uncapped.
    pub fps_cap: Option<f32>,
    pub shadows: ShadowSettings,
    pub bloom_threshold: f32,
    pub bloom_strength: f32,
    pub bloom_range: f32,
    pub motion_blur_strength: f32,
    pub ssao_radius: f32,
    pub ssr_max_distance: f32,
    pub clear_color: [f32; 4],
    /// Normalised x, y, width, height of the window inside the surface that is rendered to.
    pub render_area: [f32; 4],
    /// Directory holding the precompiled SPIR-V for every technique.
    pub shader_dir: PathBuf,
    /// Vertices and indices reserved for the scene-wide geometry buffers.
    pub geometry_capacity: (u32, u32),
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            ssao: true,
            ssr: true,
            fxaa: true,
            bloom: false,
            motion_blur: false,
            shadow_cast: true,
            use_compute: false,
            overloaded_gpu: false,
            fps_cap: None,
            shadows: ShadowSettings::default(),
            bloom_threshold: 0.5,
            bloom_strength: 0.12,
            bloom_range: 2.5,
            motion_blur_strength: 1.0,
            ssao_radius: 0.5,
            ssr_max_distance: 8.0,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            render_area: [0.0, 0.0, 1.0, 1.0],
            shader_dir: PathBuf::from("shaders"),
            geometry_capacity: (4 << 20, 12 << 20),
        }
    }
}

/// What a settings change invalidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingChanges {
    /// Some pass now reads a different set of targets.
    pub descriptor_sets_stale: bool,
    /// The shadow map size changed, shadow maps must be recreated.
    pub shadow_maps_stale: bool,
}

impl RenderSettings {
    pub fn with_ssao(mut self, on: bool) -> Self {
        self.ssao = on;
        self
    }

    pub fn with_ssr(mut self, on: bool) -> Self {
        self.ssr = on;
        self
    }

    pub fn with_fxaa(mut self, on: bool) -> Self {
        self.fxaa = on;
        self
    }

    pub fn with_bloom(mut self, on: bool) -> Self {
        self.bloom = on;
        self
    }

    pub fn with_motion_blur(mut self, on: bool) -> Self {
        self.motion_blur = on;
        self
    }

    pub fn with_shadows(mut self, on: bool) -> Self {
        self.shadow_cast = on;
        self
    }

    pub fn with_compute(mut self, on: bool) -> Self {
        self.use_compute = on;
        self
    }

    pub fn with_fps_cap(mut self, cap: Option<f32>) -> Self {
        self.fps_cap = cap;
        self
    }

    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    /// Number of shadow maps actually rendered.
    pub fn shadow_light_count(&self) -> usize {
        (self.shadows.lights as usize).min(MAX_SHADOW_LIGHTS)
    }

    /// Compare against the settings the current descriptor sets were written with.
    pub fn binding_changes(&self, previous: &RenderSettings) -> BindingChanges {
        // Composition samples the AO and reflection targets, or the blank target when they're
        // off. Every other pass binds the same targets whatever the toggles say.
        let descriptor_sets_stale = self.ssao != previous.ssao || self.ssr != previous.ssr;

        BindingChanges {
            descriptor_sets_stale,
            shadow_maps_stale: self.shadows.map_size != previous.shadows.map_size,
        }
    }
}

/// Enforces [`RenderSettings::fps_cap`].
#[derive(Debug)]
pub struct FramePacer {
    frame_start: Instant,
}

impl Default for FramePacer {
    fn default() -> Self {
        Self {
            frame_start: Instant::now(),
        }
    }
}

impl FramePacer {
    /// How long the frame thread should still sleep, given how long the frame took.
    pub fn remaining(cap: Option<f32>, elapsed: Duration) -> Option<Duration> {
        let cap = cap.filter(|fps| *fps > 0.0)?;
        let budget = Duration::from_secs_f64(1.0 / cap as f64);
        budget.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Sleep out the rest of the frame budget and start timing the next frame.
    pub fn end_frame(&mut self, cap: Option<f32>) {
        if let Some(sleep) = Self::remaining(cap, self.frame_start.elapsed()) {
            std::thread::sleep(sleep);
        }
        self.frame_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_ssao_invalidates_descriptor_sets() {
        let before = RenderSettings::default();
        let after = before.clone().with_ssao(!before.ssao);
        assert!(after.binding_changes(&before).descriptor_sets_stale);
    }

    #[test]
    fn other_toggles_keep_descriptor_sets() {
        let before = RenderSettings::default();
        let after = before
            .clone()
            .with_bloom(!before.bloom)
            .with_motion_blur(!before.motion_blur)
            .with_fxaa(!before.fxaa)
            .with_shadows(!before.shadow_cast);
        assert!(!after.binding_changes(&before).descriptor_sets_stale);
    }

    #[test]
    fn tunables_do_not_invalidate_descriptor_sets() {
        let before = RenderSettings::default();
        let mut after = before.clone();
        after.bloom_strength = 0.9;
        after.fps_cap = Some(30.0);
        after.overloaded_gpu = true;
        assert_eq!(after.binding_changes(&before), BindingChanges::default());
    }

    #[test]
    fn shadow_map_resize_is_reported() {
        let before = RenderSettings::default();
        let mut after = before.clone();
        after.shadows.map_size = 1024;
        let changes = after.binding_changes(&before);
        assert!(changes.shadow_maps_stale);
        assert!(!changes.descriptor_sets_stale);
    }

    #[test]
    fn light_count_is_clamped() {
        let mut settings = RenderSettings::default();
        settings.shadows.lights = 12;
        assert_eq!(settings.shadow_light_count(), MAX_SHADOW_LIGHTS);
    }

    #[test]
    fn frame_pacer_budget() {
        assert_eq!(FramePacer::remaining(None, Duration::ZERO), None);
        assert_eq!(FramePacer::remaining(Some(0.0), Duration::ZERO), None);
        let remaining = FramePacer::remaining(Some(4.0), Duration::from_millis(50)).unwrap();
        assert_eq!(remaining, Duration::from_millis(200));
        assert_eq!(
            FramePacer::remaining(Some(50.0), Duration::from_millis(25)),
            None
        );
    }
}
