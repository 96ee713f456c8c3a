use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use log::info;

use crate::config::DecoderConfig;
use crate::error::{ModelError, Result};
use crate::models::MAX_LEVEL;
use crate::models::backbone::PyramidProbe;

/// Levels deeper than this keep their resolution once pools are replaced by none layers.
pub const NONE_LAYER_THRESHOLD: usize = 3;

/// How same-resolution features are combined.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Channel concatenation followed by a 1x1 projection.
    Concat,
    /// Elementwise mean, all inputs must have the same width.
    Mean,
}

impl FromStr for MergePolicy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "concat" => Ok(MergePolicy::Concat),
            "mean" => Ok(MergePolicy::Mean),
            other => Err(ModelError::Configuration(format!(
                "unsupported merge type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsampleKind {
    /// 4x4 stride 2 transposed convolution, then a 3x3 refinement.
    TransposeThenRefine,
    /// 3x3 refinement at the current resolution.
    RefineOnly,
    /// Merge only. Used by equal-depth plans.
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Main,
    Aux(usize),
    /// Output of the previous, deeper, stage.
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageInput {
    pub source: InputSource,
    pub channels: usize,
}

/// One merge and upsample step of the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderStageSpec {
    pub level: usize,
    pub merge_policy: MergePolicy,
    /// Ordered main branch, auxiliary branches, then the carried tensor.
    pub inputs: Vec<StageInput>,
    /// Width of the 1x1 projection after a concat. `None` for mean merges.
    pub projection_channels: Option<usize>,
    pub upsample_kind: UpsampleKind,
    pub output_channels: usize,
}

impl DecoderStageSpec {
    pub fn input_channels(&self) -> Vec<usize> {
        self.inputs.iter().map(|input| input.channels).collect()
    }

    /// Width right after the merge.
    pub fn merged_channels(&self) -> usize {
        match self.merge_policy {
            MergePolicy::Concat => self.inputs.iter().map(|input| input.channels).sum(),
            MergePolicy::Mean => self.inputs.first().map_or(0, |input| input.channels),
        }
    }

    /// Whether a tensor carried from a deeper stage takes part in the merge.
    pub fn has_previous(&self) -> bool {
        self.inputs
            .iter()
            .any(|input| input.source == InputSource::Previous)
    }
}

/// Ordered decoder stages, deepest first, built from branch shapes alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderPlan {
    stages: Vec<DecoderStageSpec>,
    branch_count: usize,
}

impl DecoderPlan {
    /// Plans one stage per level from `deconv_layer` down to `upsample_layer`.
    ///
    /// Every stage projects back to the main branch width at its level, so that width
    /// is what the next stage receives as its carried input. Mean merges with unequal
    /// widths fail here, before any layer is allocated.
    pub fn build(
        main: &dyn PyramidProbe,
        aux: &[&dyn PyramidProbe],
        config: &DecoderConfig,
    ) -> Result<Self> {
        let (upsample, deconv) = (config.upsample_layer, config.deconv_layer);
        if upsample > MAX_LEVEL || deconv > MAX_LEVEL {
            return Err(ModelError::Configuration(format!(
                "decoder levels {deconv}..{upsample} exceed the last pyramid level {MAX_LEVEL}"
            )));
        }
        if deconv < upsample || (deconv == upsample && !config.allow_equal_depth) {
            return Err(ModelError::Configuration(format!(
                "deconv_layer {deconv} must be greater than upsample_layer {upsample}"
            )));
        }

        let mut stages: Vec<DecoderStageSpec> = Vec::with_capacity(deconv - upsample + 1);
        for level in (upsample..=deconv).rev() {
            let main_channels = main.probe_channels(level)?;

            let mut inputs = vec![StageInput {
                source: InputSource::Main,
                channels: main_channels,
            }];
            for (i, branch) in aux.iter().enumerate() {
                inputs.push(StageInput {
                    source: InputSource::Aux(i),
                    channels: branch.probe_channels(level)?,
                });
            }
            if let Some(previous) = stages.last() {
                inputs.push(StageInput {
                    source: InputSource::Previous,
                    channels: previous.output_channels,
                });
            }

            let projection_channels = match config.merge_type {
                MergePolicy::Concat => Some(main_channels),
                MergePolicy::Mean => {
                    if inputs.iter().any(|input| input.channels != main_channels) {
                        return Err(ModelError::ShapeMismatch {
                            level,
                            channels: inputs.iter().map(|input| input.channels).collect(),
                        });
                    }
                    None
                }
            };

            let upsample_kind = if deconv == upsample {
                UpsampleKind::Passthrough
            } else if level == 0 || (config.use_none_layer && level > NONE_LAYER_THRESHOLD) {
                UpsampleKind::RefineOnly
            } else {
                UpsampleKind::TransposeThenRefine
            };

            stages.push(DecoderStageSpec {
                level,
                merge_policy: config.merge_type,
                inputs,
                projection_channels,
                upsample_kind,
                output_channels: main_channels,
            });
        }

        let plan = Self {
            stages,
            branch_count: aux.len() + 1,
        };
        info!(
            "decoder plan: {} stage(s) over {} branch(es), output width {}",
            plan.stages.len(),
            plan.branch_count,
            plan.output_channels()
        );
        Ok(plan)
    }

    pub fn stages(&self) -> &[DecoderStageSpec] {
        &self.stages
    }

    pub fn stage(&self, level: usize) -> Option<&DecoderStageSpec> {
        self.stages.iter().find(|stage| stage.level == level)
    }

    pub fn branch_count(&self) -> usize {
        self.branch_count
    }

    /// Width of the decoder output, the main branch width at the shallowest level.
    pub fn output_channels(&self) -> usize {
        self.stages.last().map_or(0, |stage| stage.output_channels)
    }

    /// Shallowest decoded level.
    pub fn output_level(&self) -> Option<usize> {
        self.stages.last().map(|stage| stage.level)
    }
}

impl fmt::Display for DecoderPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in &self.stages {
            let inputs: Vec<String> = stage
                .inputs
                .iter()
                .map(|input| match input.source {
                    InputSource::Main => format!("main {}", input.channels),
                    InputSource::Aux(i) => format!("aux{i} {}", input.channels),
                    InputSource::Previous => format!("previous {}", input.channels),
                })
                .collect();
            write!(f, "level {}: {:?} [{}]", stage.level, stage.merge_policy, inputs.join(", "))?;
            if let Some(projection) = stage.projection_channels {
                write!(f, " -> 1x1 {projection}")?;
            }
            writeln!(f, " -> {:?} -> {}", stage.upsample_kind, stage.output_channels)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Probe with fixed per-level widths.
    struct FakeProbe {
        channels: [usize; 6],
        calls: Cell<usize>,
    }

    impl FakeProbe {
        fn new(channels: [usize; 6]) -> Self {
            Self {
                channels,
                calls: Cell::new(0),
            }
        }
    }

    impl PyramidProbe for FakeProbe {
        fn probe_channels(&self, level: usize) -> Result<usize> {
            self.calls.set(self.calls.get() + 1);
            self.channels
                .get(level)
                .copied()
                .ok_or(ModelError::InvalidLevel {
                    level,
                    format: "fake".into(),
                })
        }

        fn probe_spatial_size(&self, level: usize, [h, w]: [usize; 2]) -> Result<[usize; 2]> {
            Ok([h >> level, w >> level])
        }
    }

    const VGG: [usize; 6] = [64, 128, 256, 512, 512, 512];

    fn config(upsample: usize, deconv: usize) -> DecoderConfig {
        DecoderConfig::new(upsample, deconv)
    }

    #[test]
    fn test_deepest_stage_takes_branch_widths() {
        let main = FakeProbe::new([8, 16, 32, 64, 64, 64]);
        let aux = FakeProbe::new([8, 16, 32, 64, 64, 64]);
        let plan = DecoderPlan::build(&main, &[&aux], &config(3, 5)).expect("plan");

        let deepest = &plan.stages()[0];
        assert_eq!(deepest.level, 5);
        assert_eq!(deepest.input_channels(), vec![64, 64]);
        assert_eq!(deepest.projection_channels, Some(64));
        assert!(!deepest.has_previous());

        let levels: Vec<usize> = plan.stages().iter().map(|s| s.level).collect();
        assert_eq!(levels, vec![5, 4, 3]);
        assert_eq!(plan.branch_count(), 2);
    }

    #[test]
    fn test_carried_width_is_previous_output() {
        let main = FakeProbe::new(VGG);
        let flow = FakeProbe::new([2, 16, 32, 48, 48, 48]);
        let plan = DecoderPlan::build(&main, &[&flow], &config(2, 4)).expect("plan");

        assert_eq!(plan.stages()[0].input_channels(), vec![512, 48]);
        assert_eq!(plan.stages()[1].input_channels(), vec![512, 48, 512]);
        assert_eq!(plan.stages()[2].input_channels(), vec![256, 32, 512]);
        assert_eq!(plan.stages()[2].merged_channels(), 800);
        assert_eq!(plan.stages()[2].projection_channels, Some(256));
        assert_eq!(plan.output_channels(), 256);
        assert_eq!(plan.output_level(), Some(2));
    }

    #[test]
    fn test_mean_with_unequal_widths_fails() {
        let main = FakeProbe::new(VGG);
        let aux = FakeProbe::new([8, 16, 32, 64, 64, 64]);
        let err = DecoderPlan::build(
            &main,
            &[&aux],
            &config(3, 5).with_merge_type(MergePolicy::Mean),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ModelError::ShapeMismatch {
                level: 5,
                channels: vec![512, 64]
            }
        );
    }

    #[test]
    fn test_mean_with_equal_widths() {
        let main = FakeProbe::new(VGG);
        let aux = FakeProbe::new(VGG);
        let plan = DecoderPlan::build(
            &main,
            &[&aux],
            &config(3, 5).with_merge_type(MergePolicy::Mean),
        )
        .expect("plan");
        assert!(plan.stages().iter().all(|s| s.projection_channels.is_none()));
        assert_eq!(plan.stages()[1].merged_channels(), 512);
    }

    #[test]
    fn test_none_layer_threshold() {
        let main = FakeProbe::new(VGG);
        let plan = DecoderPlan::build(&main, &[], &config(2, 5).with_use_none_layer(true))
            .expect("plan");
        let kind = |level| plan.stage(level).map(|s| s.upsample_kind);
        assert_eq!(kind(5), Some(UpsampleKind::RefineOnly));
        assert_eq!(kind(4), Some(UpsampleKind::RefineOnly));
        assert_eq!(kind(3), Some(UpsampleKind::TransposeThenRefine));
        assert_eq!(kind(2), Some(UpsampleKind::TransposeThenRefine));

        let plain = DecoderPlan::build(&main, &[], &config(2, 5)).expect("plan");
        assert!(
            plain
                .stages()
                .iter()
                .all(|s| s.upsample_kind == UpsampleKind::TransposeThenRefine)
        );
    }

    #[test]
    fn test_level_zero_never_transposes() {
        let main = FakeProbe::new(VGG);
        let plan = DecoderPlan::build(&main, &[], &config(0, 1)).expect("plan");
        assert_eq!(plan.stage(1).map(|s| s.upsample_kind), Some(UpsampleKind::TransposeThenRefine));
        assert_eq!(plan.stage(0).map(|s| s.upsample_kind), Some(UpsampleKind::RefineOnly));
    }

    #[test]
    fn test_depth_relation() {
        let main = FakeProbe::new(VGG);
        assert!(matches!(
            DecoderPlan::build(&main, &[], &config(4, 3)),
            Err(ModelError::Configuration(_))
        ));
        assert!(matches!(
            DecoderPlan::build(&main, &[], &config(3, 3)),
            Err(ModelError::Configuration(_))
        ));
        assert!(matches!(
            DecoderPlan::build(&main, &[], &config(3, 6)),
            Err(ModelError::Configuration(_))
        ));
        assert_eq!(main.calls.get(), 0);

        let merge_only =
            DecoderPlan::build(&main, &[], &config(3, 3).with_allow_equal_depth(true)).expect("plan");
        assert_eq!(merge_only.stages().len(), 1);
        assert_eq!(merge_only.stages()[0].upsample_kind, UpsampleKind::Passthrough);
    }

    #[test]
    fn test_probe_errors_propagate() {
        struct Shallow;
        impl PyramidProbe for Shallow {
            fn probe_channels(&self, level: usize) -> Result<usize> {
                if level <= 3 {
                    Ok(16)
                } else {
                    Err(ModelError::InvalidLevel {
                        level,
                        format: "vgg".into(),
                    })
                }
            }

            fn probe_spatial_size(&self, _: usize, size: [usize; 2]) -> Result<[usize; 2]> {
                Ok(size)
            }
        }

        let err = DecoderPlan::build(&Shallow, &[], &config(3, 5)).unwrap_err();
        assert!(matches!(err, ModelError::InvalidLevel { level: 5, .. }));
    }

    #[test]
    fn test_merge_policy_parsing() {
        assert_eq!("Concat".parse::<MergePolicy>(), Ok(MergePolicy::Concat));
        assert!(matches!(
            "max".parse::<MergePolicy>(),
            Err(ModelError::Configuration(_))
        ));
    }

    #[test]
    fn test_display_lists_every_stage() {
        let main = FakeProbe::new(VGG);
        let plan = DecoderPlan::build(&main, &[], &config(3, 5)).expect("plan");
        let text = plan.to_string();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("level 5: Concat [main 512] -> 1x1 512"));
    }
}
