use std::collections::HashMap;
use std::fmt::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use burn::module::Ignored;
use burn::prelude::*;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::BackboneConfig;
use crate::error::{ModelError, Result};
use crate::layers::{LayerDesc, PANET, VGG11, VGG13, VGG16, VGG19, vgg_layers};
use crate::models::MAX_LEVEL;
use crate::models::catalog::StageCatalog;
use crate::models::level_map::{LevelMap, Locator};
use crate::models::resnet::{
    RESNET18_BLOCKS, RESNET34_BLOCKS, RESNET50_BLOCKS, RESNET101_BLOCKS, RESNET152_BLOCKS, ResNet,
};
use crate::models::vgg::VggFeatures;

/// Batch size of the synthetic probe input.
pub const PROBE_BATCH: usize = 2;

/// Supported backbone families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneName {
    Vgg { depth: usize, batch_norm: bool },
    ResNet { depth: usize },
    /// Narrow companion network of panet models.
    Panet,
    /// Network assembled directly from a layer list.
    Custom,
}

impl FromStr for BackboneName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.to_ascii_lowercase();
        let (base, batch_norm) = match name.strip_suffix("_bn") {
            Some(base) => (base, true),
            None => (name.as_str(), false),
        };

        match base {
            "vgg11" => Ok(BackboneName::Vgg { depth: 11, batch_norm }),
            "vgg13" => Ok(BackboneName::Vgg { depth: 13, batch_norm }),
            "vgg16" => Ok(BackboneName::Vgg { depth: 16, batch_norm }),
            "vgg19" => Ok(BackboneName::Vgg { depth: 19, batch_norm }),
            "resnet18" if !batch_norm => Ok(BackboneName::ResNet { depth: 18 }),
            "resnet34" if !batch_norm => Ok(BackboneName::ResNet { depth: 34 }),
            "resnet50" if !batch_norm => Ok(BackboneName::ResNet { depth: 50 }),
            "resnet101" if !batch_norm => Ok(BackboneName::ResNet { depth: 101 }),
            "resnet152" if !batch_norm => Ok(BackboneName::ResNet { depth: 152 }),
            "panet" if !batch_norm => Ok(BackboneName::Panet),
            _ => Err(ModelError::UnknownBackbone(s.to_string())),
        }
    }
}

impl fmt::Display for BackboneName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneName::Vgg { depth, batch_norm: false } => write!(f, "vgg{depth}"),
            BackboneName::Vgg { depth, batch_norm: true } => write!(f, "vgg{depth}_bn"),
            BackboneName::ResNet { depth } => write!(f, "resnet{depth}"),
            BackboneName::Panet => write!(f, "panet"),
            BackboneName::Custom => write!(f, "custom"),
        }
    }
}

impl BackboneName {
    pub fn format(&self) -> BackboneFormat {
        match self {
            BackboneName::ResNet { .. } => BackboneFormat::ResNet,
            _ => BackboneFormat::Vgg,
        }
    }

    /// Layer list of a flat family, `None` for residual and custom networks.
    pub fn layers(&self, in_channels: usize, use_none_layer: bool) -> Option<Vec<LayerDesc>> {
        let (cfg, batch_norm) = match *self {
            BackboneName::Vgg { depth: 11, batch_norm } => (VGG11, batch_norm),
            BackboneName::Vgg { depth: 13, batch_norm } => (VGG13, batch_norm),
            BackboneName::Vgg { depth: 16, batch_norm } => (VGG16, batch_norm),
            BackboneName::Vgg { depth: 19, batch_norm } => (VGG19, batch_norm),
            BackboneName::Panet => (PANET, false),
            _ => return None,
        };
        Some(vgg_layers(cfg, batch_norm, in_channels, use_none_layer))
    }
}

/// How levels are located inside a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneFormat {
    /// Flat layer list, levels found through the stage catalog.
    Vgg,
    /// Stem plus four residual stages at fixed levels.
    ResNet,
}

impl fmt::Display for BackboneFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneFormat::Vgg => write!(f, "vgg"),
            BackboneFormat::ResNet => write!(f, "resnet"),
        }
    }
}

/// Shape facts of a backbone, all the decoder plan needs to know about it.
pub trait PyramidProbe {
    /// Channel count of the features at `level`.
    fn probe_channels(&self, level: usize) -> Result<usize>;

    /// Spatial size of the features at `level` for an input of `input_size`.
    fn probe_spatial_size(&self, level: usize, input_size: [usize; 2]) -> Result<[usize; 2]>;
}

#[derive(Module, Debug)]
pub enum BackboneNetwork<B: Backend> {
    Vgg(VggFeatures<B>),
    ResNet(ResNet<B>),
}

type ProbeCache = Arc<Mutex<HashMap<(usize, [usize; 2]), [usize; 4]>>>;

/// A classification network used as a multi-scale feature extractor.
///
/// Owns the network, its stage catalog (flat networks only) and its level map. Shapes
/// discovered by probing are cached per `(level, input size)` for the lifetime of the
/// backbone; clones share the cache.
#[derive(Module, Debug)]
pub struct FeaturePyramidBackbone<B: Backend> {
    network: BackboneNetwork<B>,
    name: Ignored<BackboneName>,
    catalog: Ignored<Option<StageCatalog>>,
    level_map: Ignored<LevelMap>,
    in_channels: usize,
    probe_size: [usize; 2],
    probe_device: Ignored<B::Device>,
    probe_cache: Ignored<ProbeCache>,
    probe_passes: Ignored<Arc<AtomicUsize>>,
}

impl<B: Backend> FeaturePyramidBackbone<B> {
    /// Builds the family named in `config`. Fails with
    /// [`ModelError::UnknownBackbone`] for names outside the supported families.
    pub fn new(config: &BackboneConfig, in_channels: usize, device: &B::Device) -> Result<Self> {
        let name = BackboneName::from_str(&config.backbone_name)?;

        match name.layers(in_channels, config.use_none_layer) {
            Some(layers) => Self::flat(name, &layers, config, in_channels, device),
            None => {
                let (blocks, bottleneck) = match name {
                    BackboneName::ResNet { depth: 18 } => (RESNET18_BLOCKS, false),
                    BackboneName::ResNet { depth: 34 } => (RESNET34_BLOCKS, false),
                    BackboneName::ResNet { depth: 50 } => (RESNET50_BLOCKS, true),
                    BackboneName::ResNet { depth: 101 } => (RESNET101_BLOCKS, true),
                    BackboneName::ResNet { depth: 152 } => (RESNET152_BLOCKS, true),
                    _ => return Err(ModelError::UnknownBackbone(config.backbone_name.clone())),
                };
                let network = ResNet::new(
                    blocks,
                    bottleneck,
                    in_channels,
                    config.use_none_layer,
                    config.eps,
                    config.momentum,
                    device,
                );
                info!("built {name} backbone with {in_channels} input channels");
                Ok(Self::assemble(
                    name,
                    BackboneNetwork::ResNet(network),
                    None,
                    LevelMap::residual(),
                    in_channels,
                    config.probe_size,
                    device,
                ))
            }
        }
    }

    /// Builds a custom flat network from `layers`. `config.backbone_name` is not used.
    ///
    /// The layer list must be non-empty and its channel counts must chain, starting from
    /// `in_channels`.
    pub fn from_layers(
        layers: &[LayerDesc],
        config: &BackboneConfig,
        in_channels: usize,
        device: &B::Device,
    ) -> Result<Self> {
        check_channel_chain(layers, in_channels)?;
        Self::flat(BackboneName::Custom, layers, config, in_channels, device)
    }

    fn flat(
        name: BackboneName,
        layers: &[LayerDesc],
        config: &BackboneConfig,
        in_channels: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let catalog = StageCatalog::build(layers);
        if catalog.is_empty() {
            return Err(ModelError::Configuration(format!("{name} backbone has no layers")));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let level_map = LevelMap::from_catalog(&catalog, config.layer_preference, &mut rng);
        for (level, locator) in level_map.iter() {
            debug!("{name}: level {level} -> {locator}");
        }

        let network = VggFeatures::new(layers, config.eps, config.momentum, device);
        info!(
            "built {name} backbone: {} stages, levels 0..={}",
            catalog.len(),
            level_map.iter().map(|(level, _)| level).max().unwrap_or(0)
        );

        Ok(Self::assemble(
            name,
            BackboneNetwork::Vgg(network),
            Some(catalog),
            level_map,
            in_channels,
            config.probe_size,
            device,
        ))
    }

    fn assemble(
        name: BackboneName,
        network: BackboneNetwork<B>,
        catalog: Option<StageCatalog>,
        level_map: LevelMap,
        in_channels: usize,
        probe_size: [usize; 2],
        device: &B::Device,
    ) -> Self {
        Self {
            network,
            name: Ignored(name),
            catalog: Ignored(catalog),
            level_map: Ignored(level_map),
            in_channels,
            probe_size,
            probe_device: Ignored(device.clone()),
            probe_cache: Ignored(ProbeCache::default()),
            probe_passes: Ignored(Arc::new(AtomicUsize::new(0))),
        }
    }

    pub fn name(&self) -> BackboneName {
        *self.name
    }

    pub fn format(&self) -> BackboneFormat {
        self.name.format()
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn catalog(&self) -> Option<&StageCatalog> {
        self.catalog.0.as_ref()
    }

    pub fn level_map(&self) -> &LevelMap {
        &self.level_map
    }

    /// Deepest level `forward_all_levels` produces.
    pub fn deepest_level(&self) -> usize {
        self.level_map.iter().map(|(level, _)| level).max().unwrap_or(0)
    }

    /// Whether `level` can be requested. Flat networks without stages at level 0 fall
    /// back to the input.
    pub fn defines_level(&self, level: usize) -> bool {
        level == 0 || (level <= MAX_LEVEL && self.level_map.contains(level))
    }

    fn invalid_level(&self, level: usize) -> ModelError {
        ModelError::InvalidLevel {
            level,
            format: self.format().to_string(),
        }
    }

    /// Activation at `level`. Layers past the located stage are not run.
    pub fn forward_to_level(&self, input: Tensor<B, 4>, level: usize) -> Result<Tensor<B, 4>> {
        if !self.defines_level(level) {
            return Err(self.invalid_level(level));
        }

        match &self.network {
            BackboneNetwork::Vgg(features) => match self.level_map.get(level) {
                Some(Locator::Stage(index)) => Ok(features.forward_through(input, index)),
                Some(Locator::Input) => Ok(input),
                None => {
                    warn!("{}: no stage at level 0, using the input", *self.name);
                    Ok(input)
                }
                Some(_) => Err(self.invalid_level(level)),
            },
            BackboneNetwork::ResNet(resnet) => resnet
                .forward_pyramid(input, level)
                .pop()
                .ok_or_else(|| self.invalid_level(level)),
        }
    }

    /// Activations of every level `0..=deepest_level()` from a single traversal, indexed
    /// by level.
    pub fn forward_all_levels(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        match &self.network {
            BackboneNetwork::ResNet(resnet) => resnet.forward_pyramid(input, MAX_LEVEL),
            BackboneNetwork::Vgg(features) => {
                let taps: Vec<usize> = self
                    .level_map
                    .iter()
                    .filter_map(|(_, locator)| match locator {
                        Locator::Stage(index) => Some(index),
                        _ => None,
                    })
                    .collect();
                let mut outputs = features.forward_taps(input.clone(), &taps);

                (0..=self.deepest_level())
                    .map(|level| match self.level_map.get(level) {
                        Some(Locator::Stage(index)) => {
                            outputs.remove(&index).unwrap_or_else(|| input.clone())
                        }
                        _ => input.clone(),
                    })
                    .collect()
            }
        }
    }

    /// Full `(batch, channels, height, width)` shape at `level` for a synthetic input of
    /// `input_size`. Runs at most one forward pass per key.
    pub fn probe_shape(&self, level: usize, input_size: [usize; 2]) -> Result<[usize; 4]> {
        if !self.defines_level(level) {
            return Err(self.invalid_level(level));
        }

        let mut cache = self.probe_cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(shape) = cache.get(&(level, input_size)) {
            return Ok(*shape);
        }

        let shape = self.forward_to_level(self.probe_input(input_size), level)?.dims();
        self.probe_passes.fetch_add(1, Ordering::Relaxed);
        debug!("{}: probed level {level} at {input_size:?} -> {shape:?}", *self.name);

        cache.insert((level, input_size), shape);
        Ok(shape)
    }

    /// Shapes of every level from one `forward_all_levels` pass. Served from the probe
    /// cache when every level is already known for `input_size`.
    pub fn probe_layer_shapes(&self, input_size: [usize; 2]) -> Vec<[usize; 4]> {
        {
            let cache = self.probe_cache.lock().unwrap_or_else(PoisonError::into_inner);
            let cached: Option<Vec<[usize; 4]>> = (0..=self.deepest_level())
                .map(|level| cache.get(&(level, input_size)).copied())
                .collect();
            if let Some(shapes) = cached {
                return shapes;
            }
        }

        let shapes: Vec<[usize; 4]> = self
            .forward_all_levels(self.probe_input(input_size))
            .iter()
            .map(|t| t.dims())
            .collect();
        self.probe_passes.fetch_add(1, Ordering::Relaxed);

        let mut cache = self.probe_cache.lock().unwrap_or_else(PoisonError::into_inner);
        for (level, shape) in shapes.iter().enumerate() {
            cache.insert((level, input_size), *shape);
        }
        shapes
    }

    /// Number of synthetic forward passes run so far.
    pub fn probe_passes(&self) -> usize {
        self.probe_passes.load(Ordering::Relaxed)
    }

    fn probe_input(&self, [height, width]: [usize; 2]) -> Tensor<B, 4> {
        Tensor::zeros([PROBE_BATCH, self.in_channels, height, width], &*self.probe_device)
    }

    /// Printable report of the catalog, the stage chosen per level and the probed shape
    /// of every level.
    pub fn describe_layers(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(
            report,
            "{} ({} format, {} input channels)",
            *self.name,
            self.format(),
            self.in_channels
        );

        if let Some(catalog) = self.catalog.0.as_ref() {
            let _ = write!(report, "{catalog}");
        }

        let shapes = self.probe_layer_shapes(self.probe_size);
        let _ = writeln!(report, "level  source      shape @ {:?}", self.probe_size);
        for (level, shape) in shapes.iter().enumerate() {
            let source = self
                .level_map
                .get(level)
                .map_or_else(|| Locator::Input.to_string(), |l| l.to_string());
            let _ = writeln!(report, "{level:>5}  {source:<10}  {shape:?}");
        }
        report
    }
}

impl<B: Backend> PyramidProbe for FeaturePyramidBackbone<B> {
    fn probe_channels(&self, level: usize) -> Result<usize> {
        Ok(self.probe_shape(level, self.probe_size)?[1])
    }

    fn probe_spatial_size(&self, level: usize, input_size: [usize; 2]) -> Result<[usize; 2]> {
        let [_, _, height, width] = self.probe_shape(level, input_size)?;
        Ok([height, width])
    }
}

fn check_channel_chain(layers: &[LayerDesc], in_channels: usize) -> Result<()> {
    let mut channels = in_channels;
    for (index, layer) in LayerDesc::flatten(layers).iter().enumerate() {
        let expected = match layer {
            LayerDesc::Conv { in_channels, .. } => Some(*in_channels),
            LayerDesc::BatchNorm { channels } => Some(*channels),
            _ => None,
        };
        match expected {
            Some(expected) if expected != channels => {
                return Err(ModelError::Configuration(format!(
                    "layer {index} expects {expected} channels but receives {channels}"
                )));
            }
            _ => {}
        }
        if let Some(out) = layer.out_channels() {
            channels = out;
        }
    }
    Ok(())
}
