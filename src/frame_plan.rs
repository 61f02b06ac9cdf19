use crate::{
    render_targets::{
        shadow_map_name, ALBEDO, BLANK, BLOOM, BLOOM_BLUR_H, BLOOM_BLUR_V, COMPOSITION, DEPTH,
        EMISSIVE, GBUFFER_DEPTH, GBUFFER_OUTPUTS, NORMAL, SKY, SRM, SSAO, SSAO_BLUR, SSR,
        VELOCITY,
    },
    error::{RenderError, RenderResult},
    settings::{BindingChanges, RenderSettings, MAX_SHADOW_LIGHTS},
};

/// Pseudo target name for the swapchain image being rendered this frame.
pub const SWAPCHAIN: &str = "swapchain";

/// The steps of one frame, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Idle,
    AcquireImage,
    ComputeDispatch,
    ShadowPass,
    DeferredPasses,
    Present,
}

/// The passes recorded into the deferred command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Skybox,
    Geometry,
    Ssao,
    Ssr,
    Composition,
    Fxaa,
    Bloom,
    MotionBlur,
    Ui,
}

impl PassKind {
    /// Fixed recording order. Nothing is ever reordered, disabled passes are only left out.
    pub const ORDER: [PassKind; 9] = [
        PassKind::Skybox,
        PassKind::Geometry,
        PassKind::Ssao,
        PassKind::Ssr,
        PassKind::Composition,
        PassKind::Fxaa,
        PassKind::Bloom,
        PassKind::MotionBlur,
        PassKind::Ui,
    ];

    pub fn enabled(self, settings: &RenderSettings) -> bool {
        match self {
            PassKind::Skybox | PassKind::Geometry | PassKind::Composition | PassKind::Ui => true,
            PassKind::Ssao => settings.ssao,
            PassKind::Ssr => settings.ssr,
            PassKind::Fxaa => settings.fxaa,
            PassKind::Bloom => settings.bloom,
            PassKind::MotionBlur => settings.motion_blur,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PassKind::Skybox => "Skybox",
            PassKind::Geometry => "Geometry",
            PassKind::Ssao => "SSAO",
            PassKind::Ssr => "SSR",
            PassKind::Composition => "Composition",
            PassKind::Fxaa => "FXAA",
            PassKind::Bloom => "Bloom",
            PassKind::MotionBlur => "Motion Blur",
            PassKind::Ui => "UI",
        }
    }

    /// Post passes sample what composition produced, so the swapchain image is first copied into
    /// the composition target and the pass renders back over the swapchain.
    pub fn copies_swapchain(self) -> bool {
        matches!(self, PassKind::Fxaa | PassKind::Bloom | PassKind::MotionBlur)
    }

    /// Targets this pass samples under `settings`.
    pub fn reads(self, settings: &RenderSettings) -> Vec<String> {
        let names: Vec<&str> = match self {
            PassKind::Skybox | PassKind::Geometry | PassKind::Ui => Vec::new(),
            PassKind::Ssao => vec![DEPTH, NORMAL],
            PassKind::Ssr => vec![ALBEDO, DEPTH, NORMAL, SRM],
            PassKind::Composition => vec![
                ALBEDO,
                DEPTH,
                NORMAL,
                SRM,
                if settings.ssao { SSAO_BLUR } else { BLANK },
                if settings.ssr { SSR } else { BLANK },
                EMISSIVE,
                SKY,
            ],
            PassKind::Fxaa => vec![COMPOSITION],
            PassKind::Bloom => vec![COMPOSITION],
            PassKind::MotionBlur => vec![COMPOSITION, DEPTH, VELOCITY],
        };

        let mut reads: Vec<String> = names.into_iter().map(str::to_string).collect();
        if self == PassKind::Composition {
            reads.extend((0..MAX_SHADOW_LIGHTS).map(shadow_map_name));
        }
        reads
    }

    /// Targets this pass renders into.
    pub fn writes(self) -> Vec<&'static str> {
        match self {
            PassKind::Skybox => vec![SKY],
            PassKind::Geometry => {
                let mut writes = GBUFFER_OUTPUTS.to_vec();
                writes.push(GBUFFER_DEPTH);
                writes
            }
            PassKind::Ssao => vec![SSAO, SSAO_BLUR],
            PassKind::Ssr => vec![SSR],
            PassKind::Composition | PassKind::Fxaa | PassKind::MotionBlur | PassKind::Ui => {
                vec![SWAPCHAIN]
            }
            PassKind::Bloom => vec![BLOOM, BLOOM_BLUR_H, BLOOM_BLUR_V, SWAPCHAIN],
        }
    }
}

/// What the orchestrator will do this frame, derived purely from the settings.
///
/// The plan doesn't depend on what's in the scene: with no models loaded the geometry pass still
/// clears the G-buffer, so composition always reads well defined targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    pub stages: Vec<FrameStage>,
    pub passes: Vec<PassKind>,
    pub shadow_lights: u32,
}

impl FramePlan {
    pub fn new(settings: &RenderSettings) -> Self {
        let mut stages = vec![FrameStage::AcquireImage];
        if settings.use_compute {
            stages.push(FrameStage::ComputeDispatch);
        }
        if settings.shadow_cast {
            stages.push(FrameStage::ShadowPass);
        }
        stages.push(FrameStage::DeferredPasses);
        stages.push(FrameStage::Present);
        stages.push(FrameStage::Idle);

        Self {
            stages,
            passes: deferred_passes(settings),
            shadow_lights: if settings.shadow_cast {
                settings.shadow_light_count() as u32
            } else {
                0
            },
        }
    }

    pub fn has_stage(&self, stage: FrameStage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn has_pass(&self, pass: PassKind) -> bool {
        self.passes.contains(&pass)
    }
}

/// Surface and binding work that has to be settled before the next frame is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameUpkeep {
    rebuild: bool,
    rewrite_descriptors: bool,
}

/// What [`FrameUpkeep::take`] hands the orchestrator, in the order it has to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpkeepSteps {
    pub rebuild: bool,
    pub rewrite_descriptors: bool,
}

impl Default for FrameUpkeep {
    /// Nothing has been written yet, so the first frame starts with a rewrite.
    fn default() -> Self {
        Self {
            rebuild: false,
            rewrite_descriptors: true,
        }
    }
}

impl FrameUpkeep {
    pub fn request_rebuild(&mut self) {
        self.rebuild = true;
    }

    pub fn settings_changed(&mut self, changes: BindingChanges) {
        self.rewrite_descriptors |= changes.descriptor_sets_stale || changes.shadow_maps_stale;
    }

    /// An out of date swapchain skips the frame and rebuilds before the next one. Any other error
    /// is handed back.
    pub fn acquire_failed(&mut self, error: RenderError) -> RenderResult<()> {
        match error {
            RenderError::SwapchainOutOfDate => {
                self.rebuild = true;
                Ok(())
            }
            error => Err(error),
        }
    }

    /// Clear the pending work and return it. Recreated targets invalidate every set, so a rebuild
    /// always comes with a rewrite.
    pub fn take(&mut self) -> UpkeepSteps {
        let steps = UpkeepSteps {
            rebuild: self.rebuild,
            rewrite_descriptors: self.rebuild || self.rewrite_descriptors,
        };
        self.rebuild = false;
        self.rewrite_descriptors = false;
        steps
    }
}

pub fn deferred_passes(settings: &RenderSettings) -> Vec<PassKind> {
    PassKind::ORDER
        .into_iter()
        .filter(|pass| pass.enabled(settings))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_toggle_combination() -> impl Iterator<Item = RenderSettings> {
        (0..32u32).map(|bits| {
            RenderSettings::default()
                .with_ssao(bits & 1 != 0)
                .with_ssr(bits & 2 != 0)
                .with_fxaa(bits & 4 != 0)
                .with_bloom(bits & 8 != 0)
                .with_motion_blur(bits & 16 != 0)
        })
    }

    fn position(pass: PassKind) -> usize {
        PassKind::ORDER.iter().position(|p| *p == pass).unwrap()
    }

    #[test]
    fn order_is_fixed_for_every_combination() {
        for settings in every_toggle_combination() {
            let passes = deferred_passes(&settings);
            for pair in passes.windows(2) {
                assert!(position(pair[0]) < position(pair[1]), "{passes:?}");
            }
            for pass in PassKind::ORDER {
                assert_eq!(passes.contains(&pass), pass.enabled(&settings));
            }
        }
    }

    #[test]
    fn everything_on() {
        let settings = RenderSettings::default()
            .with_ssao(true)
            .with_ssr(true)
            .with_fxaa(true)
            .with_bloom(true)
            .with_motion_blur(true);
        assert_eq!(deferred_passes(&settings), PassKind::ORDER.to_vec());
    }

    #[test]
    fn ambient_occlusion_off_skips_the_pass() {
        let settings = RenderSettings::default().with_ssao(false).with_ssr(false);
        let plan = FramePlan::new(&settings);
        assert!(!plan.has_pass(PassKind::Ssao));

        let reads = PassKind::Composition.reads(&settings);
        assert!(!reads.iter().any(|r| r == SSAO || r == SSAO_BLUR));
        for target in [ALBEDO, DEPTH, NORMAL, SRM, EMISSIVE, SKY] {
            assert!(reads.iter().any(|r| r == target), "{target}");
        }
        assert!(reads.iter().any(|r| r == &shadow_map_name(0)));
        assert!(reads.iter().any(|r| r == BLANK));
    }

    #[test]
    fn inputs_are_written_before_they_are_read() {
        for settings in every_toggle_combination() {
            let plan = FramePlan::new(&settings);
            let mut written: Vec<&str> = vec![BLANK];
            for pass in &plan.passes {
                if pass.copies_swapchain() {
                    assert!(written.contains(&SWAPCHAIN));
                    written.push(COMPOSITION);
                }
                for read in pass.reads(&settings) {
                    if read.starts_with("shadowMap") {
                        continue;
                    }
                    assert!(
                        written.contains(&read.as_str()),
                        "{} reads {read} before anything wrote it",
                        pass.name()
                    );
                }
                written.extend(pass.writes());
            }
        }
    }

    #[test]
    fn stages_follow_toggles() {
        let plan = FramePlan::new(&RenderSettings::default().with_shadows(false));
        assert_eq!(
            plan.stages,
            vec![
                FrameStage::AcquireImage,
                FrameStage::DeferredPasses,
                FrameStage::Present,
                FrameStage::Idle
            ]
        );
        assert_eq!(plan.shadow_lights, 0);

        let plan = FramePlan::new(
            &RenderSettings::default()
                .with_shadows(true)
                .with_compute(true),
        );
        assert_eq!(
            plan.stages,
            vec![
                FrameStage::AcquireImage,
                FrameStage::ComputeDispatch,
                FrameStage::ShadowPass,
                FrameStage::DeferredPasses,
                FrameStage::Present,
                FrameStage::Idle
            ]
        );
        assert_eq!(plan.shadow_lights, MAX_SHADOW_LIGHTS as u32);
    }

    #[test]
    fn first_frame_writes_descriptor_sets() {
        let mut upkeep = FrameUpkeep::default();
        assert_eq!(
            upkeep.take(),
            UpkeepSteps {
                rebuild: false,
                rewrite_descriptors: true,
            }
        );
        assert_eq!(upkeep.take(), UpkeepSteps::default());
    }

    #[test]
    fn out_of_date_skips_the_frame_and_rebuilds_next() {
        let mut upkeep = FrameUpkeep::default();
        upkeep.take();

        assert!(upkeep.acquire_failed(RenderError::SwapchainOutOfDate).is_ok());
        let steps = upkeep.take();
        assert!(steps.rebuild);
        assert!(steps.rewrite_descriptors);
        assert_eq!(upkeep.take(), UpkeepSteps::default());
    }

    #[test]
    fn other_acquire_errors_are_passed_on() {
        let mut upkeep = FrameUpkeep::default();
        upkeep.take();
        assert!(matches!(
            upkeep.acquire_failed(RenderError::DeviceLost),
            Err(RenderError::DeviceLost)
        ));
        assert_eq!(upkeep.take(), UpkeepSteps::default());
    }

    #[test]
    fn resize_rebuilds_and_rewrites() {
        let mut upkeep = FrameUpkeep::default();
        upkeep.take();
        upkeep.request_rebuild();
        assert_eq!(
            upkeep.take(),
            UpkeepSteps {
                rebuild: true,
                rewrite_descriptors: true,
            }
        );
    }

    #[test]
    fn toggling_ssao_rewrites_but_tunables_do_not() {
        let mut upkeep = FrameUpkeep::default();
        upkeep.take();
        let before = RenderSettings::default();

        let mut tuned = before.clone();
        tuned.bloom_strength *= 2.0;
        tuned.ssr_max_distance += 1.0;
        upkeep.settings_changed(tuned.binding_changes(&before));
        assert_eq!(upkeep.take(), UpkeepSteps::default());

        let toggled = before.clone().with_ssao(!before.ssao);
        upkeep.settings_changed(toggled.binding_changes(&before));
        assert_eq!(
            upkeep.take(),
            UpkeepSteps {
                rebuild: false,
                rewrite_descriptors: true,
            }
        );
    }
}
