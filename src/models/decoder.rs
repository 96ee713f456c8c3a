use burn::module::Ignored;
use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use log::debug;

use crate::config::DecoderConfig;
use crate::error::{ModelError, Result};
use crate::models::blocks::ConvBnRelu;
use crate::models::plan::{DecoderPlan, DecoderStageSpec, MergePolicy, UpsampleKind};

/// Layers of one planned stage.
#[derive(Module, Debug)]
pub struct DecoderStage<B: Backend> {
    spec: Ignored<DecoderStageSpec>,
    projection: Option<ConvBnRelu<B>>,
    transpose: Option<ConvTranspose2d<B>>,
    refine: Option<ConvBnRelu<B>>,
}

impl<B: Backend> DecoderStage<B> {
    pub fn new(spec: &DecoderStageSpec, config: &DecoderConfig, device: &B::Device) -> Self {
        let (eps, momentum) = (config.eps, config.momentum);
        let merged = spec.merged_channels();

        let projection = spec
            .projection_channels
            .map(|out| ConvBnRelu::new(device, merged, out, 1, eps, momentum));
        let width = spec.projection_channels.unwrap_or(merged);

        let transpose = (spec.upsample_kind == UpsampleKind::TransposeThenRefine).then(|| {
            ConvTranspose2dConfig::new([width, width], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_bias(false)
                .init(device)
        });
        let refine = (spec.upsample_kind != UpsampleKind::Passthrough)
            .then(|| ConvBnRelu::new(device, width, width, 3, eps, momentum));

        Self {
            spec: Ignored(spec.clone()),
            projection,
            transpose,
            refine,
        }
    }

    pub fn spec(&self) -> &DecoderStageSpec {
        &self.spec
    }

    /// Merges `inputs`, ordered as in the stage spec, then upsamples or refines.
    pub fn forward(&self, inputs: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let x = match self.spec.merge_policy {
            MergePolicy::Concat => Tensor::cat(inputs, 1),
            MergePolicy::Mean => Tensor::stack::<5>(inputs, 0).mean_dim(0).squeeze::<4>(0),
        };

        let x = match &self.projection {
            Some(projection) => projection.forward(x),
            None => x,
        };
        let x = match &self.transpose {
            Some(transpose) => transpose.forward(x),
            None => x,
        };
        match &self.refine {
            Some(refine) => refine.forward(x),
            None => x,
        }
    }
}

/// Runs a [`DecoderPlan`] over per-branch feature pyramids, deepest stage first.
///
/// Each branch is the output of `forward_all_levels` of one backbone, in the order the
/// plan was built with (main branch first). Nothing is kept between calls.
#[derive(Module, Debug)]
pub struct DecoderExecutor<B: Backend> {
    stages: Vec<DecoderStage<B>>,
    branch_count: usize,
}

impl<B: Backend> DecoderExecutor<B> {
    pub fn new(plan: &DecoderPlan, config: &DecoderConfig, device: &B::Device) -> Self {
        let stages = plan
            .stages()
            .iter()
            .map(|spec| DecoderStage::new(spec, config, device))
            .collect();

        Self {
            stages,
            branch_count: plan.branch_count(),
        }
    }

    pub fn stages(&self) -> &[DecoderStage<B>] {
        &self.stages
    }

    /// Decodes through every planned stage.
    pub fn forward(&self, branches: &[Vec<Tensor<B, 4>>]) -> Result<Tensor<B, 4>> {
        self.forward_to(branches, 0)
    }

    /// Decodes from the deepest stage down to the stage at `level` and returns its
    /// output. Levels shallower than the plan return the full decoder output.
    pub fn forward_to(&self, branches: &[Vec<Tensor<B, 4>>], level: usize) -> Result<Tensor<B, 4>> {
        if branches.len() != self.branch_count {
            return Err(ModelError::BranchCount {
                expected: self.branch_count,
                actual: branches.len(),
            });
        }

        let mut carried: Option<Tensor<B, 4>> = None;
        for stage in self.stages.iter().take_while(|stage| stage.spec.level >= level) {
            let stage_level = stage.spec.level;

            // every input is resized to the main branch before merging
            let mut inputs = Vec::with_capacity(self.branch_count + 1);
            let mut size = None;
            for (index, branch) in branches.iter().enumerate() {
                let features = branch.get(stage_level).ok_or_else(|| ModelError::InvalidLevel {
                    level: stage_level,
                    format: format!("decoder branch {index}"),
                })?;
                let [_, _, height, width] = features.dims();
                let size = *size.get_or_insert([height, width]);
                inputs.push(align(features.clone(), size));
            }

            if let (Some(previous), Some(size)) = (carried.take(), size) {
                inputs.push(align(previous, size));
            }

            let out = stage.forward(inputs);
            debug!("decoder level {stage_level}: {:?}", out.dims());
            carried = Some(out);
        }

        carried.ok_or_else(|| ModelError::InvalidLevel {
            level,
            format: "decoder".into(),
        })
    }
}

/// Bilinear resize of `x` to `size` when the spatial sizes differ.
fn align<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    if [height, width] == size {
        return x;
    }

    debug!("resizing features from {:?} to {size:?}", [height, width]);
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Bilinear))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backbone::PyramidProbe;
    use burn::backend::NdArray;
    use burn::backend::ndarray::NdArrayDevice;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    struct Widths(Vec<usize>);

    impl PyramidProbe for Widths {
        fn probe_channels(&self, level: usize) -> Result<usize> {
            Ok(self.0[level])
        }

        fn probe_spatial_size(&self, level: usize, [h, w]: [usize; 2]) -> Result<[usize; 2]> {
            Ok([h >> level, w >> level])
        }
    }

    /// Random pyramid with `widths[level]` channels at `size >> level`.
    fn pyramid(widths: &[usize], size: usize, device: &NdArrayDevice) -> Vec<Tensor<TestBackend, 4>> {
        widths
            .iter()
            .enumerate()
            .map(|(level, &c)| {
                let side = (size >> level).max(1);
                Tensor::random([1, c, side, side], Distribution::Default, device)
            })
            .collect()
    }

    #[test]
    fn test_concat_decoder_output_shape() {
        let device = NdArrayDevice::default();
        let widths = vec![4, 8, 12, 16, 16, 16];
        let config = DecoderConfig::new(3, 5);
        let plan = DecoderPlan::build(&Widths(widths.clone()), &[&Widths(widths.clone())], &config)
            .expect("plan");
        let decoder = DecoderExecutor::<TestBackend>::new(&plan, &config, &device);

        let branches = vec![pyramid(&widths, 64, &device), pyramid(&widths, 64, &device)];
        let out = decoder.forward(&branches).expect("decode");
        // stage 3 transposes 8x8 features to 16x16
        assert_eq!(out.dims(), [1, 16, 16, 16]);

        let partial = decoder.forward_to(&branches, 4).expect("decode");
        assert_eq!(partial.dims(), [1, 16, 8, 8]);
    }

    #[test]
    fn test_refine_only_keeps_resolution() {
        let device = NdArrayDevice::default();
        let widths = vec![4, 8, 12, 16, 16, 16];
        let config = DecoderConfig::new(3, 5).with_use_none_layer(true);
        let plan = DecoderPlan::build(&Widths(widths.clone()), &[], &config).expect("plan");
        let decoder = DecoderExecutor::<TestBackend>::new(&plan, &config, &device);

        // levels 3..=5 share one resolution
        let branch: Vec<Tensor<TestBackend, 4>> = widths
            .iter()
            .enumerate()
            .map(|(level, &c)| {
                let side = 32 >> level.min(3);
                Tensor::random([1, c, side, side], Distribution::Default, &device)
            })
            .collect();

        assert_eq!(decoder.forward_to(&[branch.clone()], 4).expect("decode").dims(), [1, 16, 4, 4]);
        assert_eq!(decoder.forward(&[branch]).expect("decode").dims(), [1, 16, 8, 8]);
    }

    #[test]
    fn test_mean_merge_averages_inputs() {
        let device = NdArrayDevice::default();
        let widths = vec![6, 6, 6, 6, 6, 6];
        let config = DecoderConfig::new(4, 4)
            .with_merge_type(MergePolicy::Mean)
            .with_allow_equal_depth(true);
        let plan = DecoderPlan::build(&Widths(widths.clone()), &[&Widths(widths.clone())], &config)
            .expect("plan");
        let decoder = DecoderExecutor::<TestBackend>::new(&plan, &config, &device);

        let a = pyramid(&widths, 32, &device);
        let b = pyramid(&widths, 32, &device);
        let expected = (a[4].clone() + b[4].clone()).div_scalar(2.0);

        let out = decoder.forward(&[a, b]).expect("decode");
        out.into_data()
            .assert_approx_eq::<f32>(&expected.into_data(), burn::tensor::Tolerance::default());
    }

    #[test]
    fn test_carried_tensor_is_aligned() {
        let device = NdArrayDevice::default();
        let widths = vec![4, 8, 12, 16, 16, 16];
        let config = DecoderConfig::new(2, 3);
        let plan = DecoderPlan::build(&Widths(widths.clone()), &[], &config).expect("plan");
        let decoder = DecoderExecutor::<TestBackend>::new(&plan, &config, &device);

        // odd sizes: level 3 is 3x3, so its transposed output (6x6) misses level 2 (7x7)
        let mut branch = pyramid(&widths, 28, &device);
        branch[2] = Tensor::random([1, 12, 7, 7], Distribution::Default, &device);
        branch[3] = Tensor::random([1, 16, 3, 3], Distribution::Default, &device);

        let out = decoder.forward(&[branch]).expect("decode");
        assert_eq!(out.dims(), [1, 12, 14, 14]);
    }

    #[test]
    fn test_branch_features_are_aligned_to_main_branch() {
        let device = NdArrayDevice::default();
        let widths = vec![4, 8, 12, 16, 16, 16];
        let config = DecoderConfig::new(3, 4);
        let plan = DecoderPlan::build(&Widths(widths.clone()), &[&Widths(widths.clone())], &config)
            .expect("plan");
        let decoder = DecoderExecutor::<TestBackend>::new(&plan, &config, &device);

        // families that round odd sizes differently: 13x13 and 7x7 against 12x12 and 6x6
        let mut main = pyramid(&widths, 100, &device);
        main[3] = Tensor::random([1, 16, 13, 13], Distribution::Default, &device);
        main[4] = Tensor::random([1, 16, 7, 7], Distribution::Default, &device);
        let mut other = pyramid(&widths, 100, &device);
        other[3] = Tensor::random([1, 16, 12, 12], Distribution::Default, &device);
        other[4] = Tensor::random([1, 16, 6, 6], Distribution::Default, &device);

        let out = decoder.forward(&[main, other]).expect("decode");
        assert_eq!(out.dims(), [1, 16, 26, 26]);
    }

    #[test]
    fn test_wrong_branch_count() {
        let device = NdArrayDevice::default();
        let widths = vec![4, 8, 12, 16, 16, 16];
        let config = DecoderConfig::new(3, 5);
        let plan = DecoderPlan::build(&Widths(widths.clone()), &[&Widths(widths.clone())], &config)
            .expect("plan");
        let decoder = DecoderExecutor::<TestBackend>::new(&plan, &config, &device);

        let err = decoder.forward(&[pyramid(&widths, 32, &device)]).unwrap_err();
        assert_eq!(err, ModelError::BranchCount { expected: 2, actual: 1 });
    }

    #[test]
    fn test_short_branch_is_rejected() {
        let device = NdArrayDevice::default();
        let widths = vec![4, 8, 12, 16, 16, 16];
        let config = DecoderConfig::new(3, 5);
        let plan = DecoderPlan::build(&Widths(widths.clone()), &[], &config).expect("plan");
        let decoder = DecoderExecutor::<TestBackend>::new(&plan, &config, &device);

        let err = decoder.forward(&[pyramid(&widths[..4], 32, &device)]).unwrap_err();
        assert!(matches!(err, ModelError::InvalidLevel { level: 5, .. }));
    }
}
