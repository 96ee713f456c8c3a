use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

/// “Deep Residual Learning for Image Recognition”
/// Authors: Kaiming He, Xiangyu Zhang, Shaoqing Ren, Jian Sun
/// Link (official): https://arxiv.org/abs/1512.03385
///
/// Blocks per stage, Table 1.
pub const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];
pub const RESNET34_BLOCKS: [usize; 4] = [3, 4, 6, 3];
pub const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
pub const RESNET101_BLOCKS: [usize; 4] = [3, 4, 23, 3];
pub const RESNET152_BLOCKS: [usize; 4] = [3, 8, 36, 3];

const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];

#[derive(Debug, Clone, Copy)]
struct NormSettings {
    eps: f64,
    momentum: f64,
}

impl NormSettings {
    fn init<B: Backend>(&self, channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
        BatchNormConfig::new(channels)
            .with_epsilon(self.eps)
            .with_momentum(self.momentum)
            .init(device)
    }
}

fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    dilation: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = dilation * (kernel / 2);
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_dilation([dilation, dilation])
        .with_bias(false)
        .init(device)
}

/// 7x7 stride 2 convolution, batch norm and ReLU, followed by a 3x3 stride 2 pool.
#[derive(Module, Debug)]
pub struct ResNetStem<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ResNetStem<B> {
    fn new(in_channels: usize, norm: NormSettings, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, 64], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn: norm.init(64, device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
        }
    }

    /// Stem activation at half resolution, before the pool.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }

    pub fn pool(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        self.relu.forward(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.relu.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        self.relu.forward(out + identity)
    }
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ResidualBlock::Basic(block) => block.forward(x),
            ResidualBlock::Bottleneck(block) => block.forward(x),
        }
    }
}

/// Settings shared by every block of one residual stage.
struct StageSpec {
    blocks: usize,
    in_channels: usize,
    width: usize,
    stride: usize,
    /// Dilation of the first block, the rest use `dilation`.
    first_dilation: usize,
    dilation: usize,
}

#[derive(Module, Debug)]
pub struct ResNetStage<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> ResNetStage<B> {
    fn new(spec: StageSpec, bottleneck: bool, norm: NormSettings, device: &B::Device) -> Self {
        let expansion = if bottleneck { 4 } else { 1 };
        let out_channels = spec.width * expansion;
        let mut in_channels = spec.in_channels;

        let blocks = (0..spec.blocks)
            .map(|i| {
                let (stride, dilation) = if i == 0 {
                    (spec.stride, spec.first_dilation)
                } else {
                    (1, spec.dilation)
                };
                let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
                    conv: conv([in_channels, out_channels], 1, stride, 1, device),
                    bn: norm.init(out_channels, device),
                });

                let block = if bottleneck {
                    ResidualBlock::Bottleneck(Bottleneck {
                        conv1: conv([in_channels, spec.width], 1, 1, 1, device),
                        bn1: norm.init(spec.width, device),
                        conv2: conv([spec.width, spec.width], 3, stride, dilation, device),
                        bn2: norm.init(spec.width, device),
                        conv3: conv([spec.width, out_channels], 1, 1, 1, device),
                        bn3: norm.init(out_channels, device),
                        relu: Relu::new(),
                        downsample,
                    })
                } else {
                    ResidualBlock::Basic(BasicBlock {
                        conv1: conv([in_channels, out_channels], 3, stride, dilation, device),
                        bn1: norm.init(out_channels, device),
                        conv2: conv([out_channels, out_channels], 3, 1, dilation, device),
                        bn2: norm.init(out_channels, device),
                        relu: Relu::new(),
                        downsample,
                    })
                };
                in_channels = out_channels;
                block
            })
            .collect();

        Self { blocks }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

/// Residual feature extractor without the classifier.
///
/// Levels are fixed: 0 is the input, 1 the stem activation before its pool, 2 to 5 the
/// four residual stages. With `use_none_layer` the last two stages trade their stride
/// for dilation 2 and 4, so levels 3 to 5 share one resolution.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: ResNetStem<B>,
    stages: Vec<ResNetStage<B>>,
}

impl<B: Backend> ResNet<B> {
    pub fn new(
        blocks: [usize; 4],
        bottleneck: bool,
        in_channels: usize,
        use_none_layer: bool,
        eps: f64,
        momentum: f64,
        device: &B::Device,
    ) -> Self {
        let norm = NormSettings { eps, momentum };
        let expansion = if bottleneck { 4 } else { 1 };

        let mut stages = Vec::with_capacity(4);
        let mut channels = 64;
        let mut dilation = 1;
        for (i, (count, width)) in blocks.iter().zip(STAGE_WIDTHS).enumerate() {
            let mut stride = if i == 0 { 1 } else { 2 };
            let first_dilation = dilation;
            if use_none_layer && i >= 2 {
                dilation *= stride;
                stride = 1;
            }
            stages.push(ResNetStage::new(
                StageSpec {
                    blocks: *count,
                    in_channels: channels,
                    width,
                    stride,
                    first_dilation,
                    dilation,
                },
                bottleneck,
                norm,
                device,
            ));
            channels = width * expansion;
        }

        Self {
            stem: ResNetStem::new(in_channels, norm, device),
            stages,
        }
    }

    /// Activations of levels `0..=deepest`, computed in one pass. `deepest` is clamped
    /// to 5.
    pub fn forward_pyramid(&self, input: Tensor<B, 4>, deepest: usize) -> Vec<Tensor<B, 4>> {
        let mut levels = vec![input.clone()];
        if deepest == 0 {
            return levels;
        }

        let stem = self.stem.forward(input);
        levels.push(stem.clone());

        let mut x = self.stem.pool(stem);
        for stage in self.stages.iter().take(deepest.min(5) - 1) {
            x = stage.forward(x);
            levels.push(x.clone());
        }
        levels
    }
}
