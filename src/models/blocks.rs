use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

use crate::layers::LayerDesc;

/// Convolution without bias, batch norm and ReLU. Used for every refinement and
/// projection step of the decoder.
#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        eps: f64,
        momentum: f64,
    ) -> Self {
        let padding = kernel_size / 2;

        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels)
                .with_epsilon(eps)
                .with_momentum(momentum)
                .init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Keeps resolution and channels. Stands where a pool used to be so that the level
/// boundary it marked is preserved.
#[derive(Module, Clone, Debug, Default)]
pub struct NoneLayer;

impl NoneLayer {
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        x
    }
}

/// Runtime counterpart of a non-grouping [`LayerDesc`].
#[derive(Module, Debug)]
pub enum FeatureLayer<B: Backend> {
    Conv(Conv2d<B>),
    BatchNorm(BatchNorm<B, 2>),
    Relu(Relu),
    MaxPool(MaxPool2d),
    NonePool(NoneLayer),
}

impl<B: Backend> FeatureLayer<B> {
    /// Builds the layers for `desc`. Nested groups are flattened in execution order, so
    /// the result lines up one-to-one with [`LayerDesc::flatten`].
    pub fn from_desc(desc: &LayerDesc, eps: f64, momentum: f64, device: &B::Device) -> Vec<Self> {
        match desc {
            LayerDesc::Conv {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
                dilation,
                bias,
            } => vec![FeatureLayer::Conv(
                Conv2dConfig::new([*in_channels, *out_channels], [*kernel, *kernel])
                    .with_stride([*stride, *stride])
                    .with_padding(PaddingConfig2d::Explicit(*padding, *padding))
                    .with_dilation([*dilation, *dilation])
                    .with_bias(*bias)
                    .init(device),
            )],
            LayerDesc::BatchNorm { channels } => vec![FeatureLayer::BatchNorm(
                BatchNormConfig::new(*channels)
                    .with_epsilon(eps)
                    .with_momentum(momentum)
                    .init(device),
            )],
            LayerDesc::Relu => vec![FeatureLayer::Relu(Relu::new())],
            LayerDesc::MaxPool {
                kernel,
                stride,
                padding,
            } => vec![FeatureLayer::MaxPool(
                MaxPool2dConfig::new([*kernel, *kernel])
                    .with_strides([*stride, *stride])
                    .with_padding(PaddingConfig2d::Explicit(*padding, *padding))
                    .init(),
            )],
            LayerDesc::NoneLayer => vec![FeatureLayer::NonePool(NoneLayer)],
            LayerDesc::Sequential(layers) => layers
                .iter()
                .flat_map(|layer| Self::from_desc(layer, eps, momentum, device))
                .collect(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            FeatureLayer::Conv(conv) => conv.forward(x),
            FeatureLayer::BatchNorm(bn) => bn.forward(x),
            FeatureLayer::Relu(relu) => relu.forward(x),
            FeatureLayer::MaxPool(pool) => pool.forward(x),
            FeatureLayer::NonePool(none) => none.forward(x),
        }
    }
}
