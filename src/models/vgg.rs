use std::collections::BTreeMap;

use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use crate::layers::LayerDesc;
use crate::models::blocks::FeatureLayer;

/// Flat VGG style feature extractor.
///
/// “Very Deep Convolutional Networks for Large-Scale Image Recognition”
/// Authors: Karen Simonyan, Andrew Zisserman
/// Link (official): https://arxiv.org/abs/1409.1556
///
/// Only the convolutional `features` part of the network is kept. The fully-connected
/// classifier is dropped since every consumer taps intermediate activations. Layers are
/// stored flat, one per cataloged stage, so a stage index addresses a layer directly.
#[derive(Module, Debug)]
pub struct VggFeatures<B: Backend> {
    layers: Vec<FeatureLayer<B>>,
}

impl<B: Backend> VggFeatures<B> {
    pub fn new(layers: &[LayerDesc], eps: f64, momentum: f64, device: &B::Device) -> Self {
        let layers = layers
            .iter()
            .flat_map(|desc| FeatureLayer::from_desc(desc, eps, momentum, device))
            .collect();
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs stages `0..=last` and returns the output of `last`.
    pub fn forward_through(&self, input: Tensor<B, 4>, last: usize) -> Tensor<B, 4> {
        self.layers
            .iter()
            .take(last + 1)
            .fold(input, |x, layer| layer.forward(x))
    }

    /// One pass that keeps the output of every stage listed in `taps`. Stops after the
    /// deepest tap.
    pub fn forward_taps(&self, input: Tensor<B, 4>, taps: &[usize]) -> BTreeMap<usize, Tensor<B, 4>> {
        let mut outputs = BTreeMap::new();
        let Some(deepest) = taps.iter().max().copied() else {
            return outputs;
        };

        let mut x = input;
        for (index, layer) in self.layers.iter().enumerate().take(deepest + 1) {
            x = layer.forward(x);
            if taps.contains(&index) {
                outputs.insert(index, x.clone());
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{vgg_layers, VGG11};
    use burn::backend::NdArray;
    use burn::backend::ndarray::NdArrayDevice;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_vgg11_downsamples_five_times() {
        let device = NdArrayDevice::default();
        let features =
            VggFeatures::<TestBackend>::new(&vgg_layers(VGG11, false, 3, false), 1e-5, 0.1, &device);
        assert_eq!(features.len(), 21);

        let out = features.forward_through(Tensor::ones([1, 3, 32, 32], &device), features.len() - 1);
        assert_eq!(out.dims(), [1, 512, 1, 1]);
    }

    #[test]
    fn test_taps_match_partial_forward() {
        let device = NdArrayDevice::default();
        let features =
            VggFeatures::<TestBackend>::new(&vgg_layers(VGG11, true, 3, true), 1e-5, 0.1, &device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 16, 16],
            burn::tensor::Distribution::Default,
            &device,
        );

        let taps = features.forward_taps(input.clone(), &[2, 7, 12]);
        assert_eq!(taps.len(), 3);
        for (index, tapped) in taps {
            let direct = features.forward_through(input.clone(), index);
            tapped
                .into_data()
                .assert_approx_eq::<f32>(&direct.into_data(), burn::tensor::Tolerance::default());
        }
    }

    #[test]
    fn test_no_taps_runs_nothing() {
        let device = NdArrayDevice::default();
        let features =
            VggFeatures::<TestBackend>::new(&vgg_layers(VGG11, false, 3, false), 1e-5, 0.1, &device);
        assert!(features.forward_taps(Tensor::ones([1, 3, 8, 8], &device), &[]).is_empty());
    }
}
