use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// 1x1 convolution to class logits followed by a bilinear resize to the input size.
#[derive(Module, Debug)]
pub struct SegmentationHead<B: Backend> {
    classifier: Conv2d<B>,
    output_size: [usize; 2],
}

impl<B: Backend> SegmentationHead<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        class_number: usize,
        output_size: [usize; 2],
    ) -> Self {
        Self {
            classifier: Conv2dConfig::new([in_channels, class_number], [1, 1])
                .with_bias(false)
                .init(device),
            output_size,
        }
    }

    /// `(B, C, h, w)` decoder features to `(B, class_number, H, W)` logits.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let logits = self.classifier.forward(x);
        let [_, _, height, width] = logits.dims();
        if [height, width] == self.output_size {
            return logits;
        }
        interpolate(
            logits,
            self.output_size,
            InterpolateOptions::new(InterpolateMode::Bilinear),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::backend::ndarray::NdArrayDevice;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_head_resizes_to_output() {
        let device = NdArrayDevice::default();
        let head = SegmentationHead::<TestBackend>::new(&device, 16, 2, [40, 30]);
        let out = head.forward(Tensor::ones([3, 16, 10, 8], &device));
        assert_eq!(out.dims(), [3, 2, 40, 30]);
    }

    #[test]
    fn test_head_at_full_resolution() {
        let device = NdArrayDevice::default();
        let head = SegmentationHead::<TestBackend>::new(&device, 4, 5, [8, 8]);
        let out = head.forward(Tensor::zeros([1, 4, 8, 8], &device));
        assert_eq!(out.dims(), [1, 5, 8, 8]);
        // no bias, zero in zero out
        assert_eq!(out.abs().sum().into_scalar(), 0.0);
    }
}
