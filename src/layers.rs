/// Declarative description of one layer of a flat feature extractor.
///
/// Feature extractors are described as a list of these before any weights exist. The
/// list is the single source for both the runtime module stack and the stage catalog
/// used to find resolution boundaries, so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerDesc {
    /// Square 2d convolution.
    Conv {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        bias: bool,
    },
    BatchNorm {
        channels: usize,
    },
    Relu,
    /// Square max pooling.
    MaxPool {
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    /// Stand-in for a pooling layer once downsampling has been switched off. Keeps the
    /// resolution but still marks a new pyramid level.
    NoneLayer,
    /// Ordered group of layers. Flattened before it is built or cataloged.
    Sequential(Vec<LayerDesc>),
}

impl LayerDesc {
    /// 3x3 convolution with padding 1 and bias, the building block of the VGG family.
    pub fn conv3x3(in_channels: usize, out_channels: usize) -> Self {
        LayerDesc::Conv {
            in_channels,
            out_channels,
            kernel: 3,
            stride: 1,
            padding: 1,
            dilation: 1,
            bias: true,
        }
    }

    /// Strided convolution, mostly useful to describe custom networks.
    pub fn conv_strided(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
    ) -> Self {
        LayerDesc::Conv {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding: kernel / 2,
            dilation: 1,
            bias: true,
        }
    }

    /// 2x2 max pooling with stride 2.
    pub fn max_pool() -> Self {
        LayerDesc::MaxPool {
            kernel: 2,
            stride: 2,
            padding: 0,
        }
    }

    /// Spatial stride of this layer on its own. Sequential groups report the product of
    /// their members.
    pub fn stride(&self) -> [usize; 2] {
        match self {
            LayerDesc::Conv { stride, .. } | LayerDesc::MaxPool { stride, .. } => {
                [*stride, *stride]
            }
            LayerDesc::Sequential(layers) => layers.iter().fold([1, 1], |acc, layer| {
                let [h, w] = layer.stride();
                [acc[0] * h, acc[1] * w]
            }),
            LayerDesc::BatchNorm { .. } | LayerDesc::Relu | LayerDesc::NoneLayer => [1, 1],
        }
    }

    /// Leaf layers of `layers` in execution order, with every nested group expanded.
    pub fn flatten(layers: &[LayerDesc]) -> Vec<LayerDesc> {
        let mut flat = Vec::with_capacity(layers.len());
        for layer in layers {
            match layer {
                LayerDesc::Sequential(inner) => flat.extend(Self::flatten(inner)),
                leaf => flat.push(leaf.clone()),
            }
        }
        flat
    }

    /// Channel count produced by this layer, if it changes it.
    pub fn out_channels(&self) -> Option<usize> {
        match self {
            LayerDesc::Conv { out_channels, .. } => Some(*out_channels),
            LayerDesc::Sequential(layers) => layers.iter().rev().find_map(|l| l.out_channels()),
            _ => None,
        }
    }
}

/// One entry of a VGG style configuration table.
///
/// “Very Deep Convolutional Networks for Large-Scale Image Recognition”
/// Authors: Karen Simonyan, Andrew Zisserman
/// Link (official): https://arxiv.org/abs/1409.1556
///
/// Table 1 lists each configuration as a column of `conv3-N` entries separated by
/// `maxpool`. `NonePool` is a pool that may be swapped for a [`LayerDesc::NoneLayer`]
/// when further downsampling is switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggItem {
    Conv(usize),
    Pool,
    NonePool,
}

use VggItem::{Conv as C, NonePool as N, Pool as M};

/// Configuration A.
#[rustfmt::skip]
pub const VGG11: &[VggItem] = &[
    C(64), M,
    C(128), M,
    C(256), C(256), M,
    C(512), C(512), N,
    C(512), C(512), N,
];

/// Configuration B.
#[rustfmt::skip]
pub const VGG13: &[VggItem] = &[
    C(64), C(64), M,
    C(128), C(128), M,
    C(256), C(256), M,
    C(512), C(512), N,
    C(512), C(512), N,
];

/// Configuration D.
#[rustfmt::skip]
pub const VGG16: &[VggItem] = &[
    C(64), C(64), M,
    C(128), C(128), M,
    C(256), C(256), C(256), M,
    C(512), C(512), C(512), N,
    C(512), C(512), C(512), N,
];

/// Configuration E.
#[rustfmt::skip]
pub const VGG19: &[VggItem] = &[
    C(64), C(64), M,
    C(128), C(128), M,
    C(256), C(256), C(256), C(256), M,
    C(512), C(512), C(512), C(512), N,
    C(512), C(512), C(512), C(512), N,
];

/// Narrow companion network run next to the main backbone of a panet model. It keeps
/// two convolutions after its last marker so level 5 has real features.
#[rustfmt::skip]
pub const PANET: &[VggItem] = &[
    C(8), M,
    C(16), M,
    C(32), C(32), M,
    C(64), C(64), N,
    C(64), C(64), N,
    C(64), C(64),
];

/// Expands a configuration table into layer descriptions, following the layout of the
/// torchvision `features` block: every convolution is followed by an optional batch norm
/// and a ReLU.
pub fn vgg_layers(
    cfg: &[VggItem],
    batch_norm: bool,
    in_channels: usize,
    use_none_layer: bool,
) -> Vec<LayerDesc> {
    let mut layers = Vec::with_capacity(cfg.len() * 3);
    let mut channels = in_channels;

    for item in cfg {
        match *item {
            VggItem::Conv(out) => {
                layers.push(LayerDesc::conv3x3(channels, out));
                if batch_norm {
                    layers.push(LayerDesc::BatchNorm { channels: out });
                }
                layers.push(LayerDesc::Relu);
                channels = out;
            }
            VggItem::Pool => layers.push(LayerDesc::max_pool()),
            VggItem::NonePool if use_none_layer => layers.push(LayerDesc::NoneLayer),
            VggItem::NonePool => layers.push(LayerDesc::max_pool()),
        }
    }

    layers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vgg16_matches_torchvision_layout() {
        let layers = vgg_layers(VGG16, false, 3, false);
        // 13 conv + 13 relu + 5 pool
        assert_eq!(layers.len(), 31);
        assert_eq!(layers[0], LayerDesc::conv3x3(3, 64));
        assert_eq!(layers[4], LayerDesc::max_pool());
        assert_eq!(layers[30], LayerDesc::max_pool());

        let bn = vgg_layers(VGG16, true, 3, false);
        assert_eq!(bn.len(), 44);
        assert_eq!(bn[1], LayerDesc::BatchNorm { channels: 64 });
    }

    #[test]
    fn test_none_layer_replaces_last_two_pools() {
        let layers = vgg_layers(VGG11, false, 3, true);
        let pools = layers
            .iter()
            .filter(|l| matches!(l, LayerDesc::MaxPool { .. }))
            .count();
        let nones = layers
            .iter()
            .filter(|l| matches!(l, LayerDesc::NoneLayer))
            .count();
        assert_eq!(pools, 3);
        assert_eq!(nones, 2);
    }

    #[test]
    fn test_in_channels_feed_first_conv() {
        let layers = vgg_layers(PANET, false, 2, false);
        assert_eq!(layers[0], LayerDesc::conv3x3(2, 8));
        assert_eq!(layers.last(), Some(&LayerDesc::Relu));
        assert_eq!(
            layers.iter().rev().find_map(|l| l.out_channels()),
            Some(64)
        );
    }

    #[test]
    fn test_sequential_stride_is_product() {
        let block = LayerDesc::Sequential(vec![
            LayerDesc::conv_strided(3, 8, 3, 2),
            LayerDesc::Relu,
            LayerDesc::max_pool(),
        ]);
        assert_eq!(block.stride(), [4, 4]);
        assert_eq!(block.out_channels(), Some(8));
        assert_eq!(LayerDesc::NoneLayer.stride(), [1, 1]);

        let flat = LayerDesc::flatten(&[LayerDesc::Relu, block]);
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[3], LayerDesc::max_pool());
    }
}
