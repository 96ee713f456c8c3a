use std::str::FromStr;

use burn::config::Config;
use argh::FromArgs;

use crate::error::{ModelError, Result};
use crate::models::backbone::BackboneName;
use crate::models::level_map::LayerPreference;
use crate::models::plan::MergePolicy;
use crate::models::MAX_LEVEL;

/// Construction options for one feature pyramid backbone.
///
/// `backbone_name` selects the network family (`vgg16`, `vgg19_bn`, `resnet50`, `panet`,
/// ...) and is checked when the backbone is built. `seed` only matters for the `random`
/// layer preference, and `probe_size` is the spatial size of the synthetic input used to
/// discover channel counts.
#[derive(Config, Debug)]
pub struct BackboneConfig {
    pub backbone_name: String,
    #[config(default = "LayerPreference::Last")]
    pub layer_preference: LayerPreference,
    #[config(default = false)]
    pub use_none_layer: bool,
    #[config(default = 1e-5)]
    pub eps: f64,
    #[config(default = 0.1)]
    pub momentum: f64,
    #[config(default = 1)]
    pub seed: u64,
    #[config(default = "[224, 224]")]
    pub probe_size: [usize; 2],
}

/// Decoder variant wrapped around the backbone(s).
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum NetName {
    /// One backbone shared by both frames, transposed-convolution decoder.
    MotionUnet,
    /// Backbone plus a narrow panet companion per frame.
    MotionPanet,
    /// Features merged at a single level, no deconvolution.
    MotionFcn,
}

impl NetName {
    /// Whether the variant decodes through transposed convolutions, which needs
    /// `deconv_layer > upsample_layer`.
    pub fn requires_deconvolution(&self) -> bool {
        !matches!(self, NetName::MotionFcn)
    }
}

impl FromStr for NetName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "motion_unet" | "motion_unet_flow" => Ok(NetName::MotionUnet),
            "motion_panet" | "motion_panet_flow" => Ok(NetName::MotionPanet),
            "motion_fcn" | "motion_fcn_flow" => Ok(NetName::MotionFcn),
            other => Err(ModelError::Configuration(format!(
                "unknown net name '{other}'"
            ))),
        }
    }
}

/// Full model configuration, loaded from JSON with [`Config::load`].
#[derive(Config, Debug)]
pub struct MotionNetConfig {
    pub backbone: BackboneConfig,
    #[config(default = "NetName::MotionUnet")]
    pub net_name: NetName,
    /// Shallowest decoded level; the decoder output lives at this level's width.
    #[config(default = 3)]
    pub upsample_layer: usize,
    /// Deepest level the decoder starts from.
    #[config(default = 5)]
    pub deconv_layer: usize,
    #[config(default = "MergePolicy::Concat")]
    pub merge_type: MergePolicy,
    #[config(default = true)]
    pub use_aux_input: bool,
    /// Feed the auxiliary frame as optical flow instead of a second image.
    #[config(default = false)]
    pub use_flow: bool,
    #[config(default = 2)]
    pub flow_channels: usize,
    #[config(default = 2)]
    pub class_number: usize,
    #[config(default = "[224, 224]")]
    pub input_shape: [usize; 2],
}

impl MotionNetConfig {
    /// Checks every option once, before anything is built.
    pub fn validate(&self) -> Result<()> {
        BackboneName::from_str(&self.backbone.backbone_name)?;

        for (name, level) in [
            ("upsample_layer", self.upsample_layer),
            ("deconv_layer", self.deconv_layer),
        ] {
            if level > MAX_LEVEL {
                return Err(ModelError::Configuration(format!(
                    "{name} {level} is deeper than the last pyramid level {MAX_LEVEL}"
                )));
            }
        }

        if self.net_name.requires_deconvolution() && self.deconv_layer <= self.upsample_layer {
            return Err(ModelError::Configuration(format!(
                "deconv_layer {} must be greater than upsample_layer {} for {:?}",
                self.deconv_layer, self.upsample_layer, self.net_name
            )));
        }

        if self.use_flow && self.flow_channels == 0 {
            return Err(ModelError::Configuration(
                "use_flow needs at least one flow channel".into(),
            ));
        }

        if self.class_number == 0 {
            return Err(ModelError::Configuration("class_number must be positive".into()));
        }

        if self.input_shape.contains(&0) || self.backbone.probe_size.contains(&0) {
            return Err(ModelError::Configuration(format!(
                "input shape {:?} and probe size {:?} must be non-empty",
                self.input_shape, self.backbone.probe_size
            )));
        }

        Ok(())
    }

    /// Whether a second frame (image or flow) takes part in the merges.
    pub fn has_aux_input(&self) -> bool {
        self.use_aux_input || self.use_flow
    }

    /// The plan builder's view of this configuration. Merge-only variants decode at a
    /// single level, so their deconvolution depth collapses onto `upsample_layer`.
    pub fn decoder_config(&self) -> DecoderConfig {
        let (deconv_layer, allow_equal_depth) = if self.net_name.requires_deconvolution() {
            (self.deconv_layer, false)
        } else {
            (self.upsample_layer, true)
        };

        DecoderConfig::new(self.upsample_layer, deconv_layer)
            .with_merge_type(self.merge_type)
            .with_use_none_layer(self.backbone.use_none_layer)
            .with_allow_equal_depth(allow_equal_depth)
            .with_eps(self.backbone.eps)
            .with_momentum(self.backbone.momentum)
    }
}

/// Options consumed by the decoder plan builder and executor.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    pub upsample_layer: usize,
    pub deconv_layer: usize,
    #[config(default = "MergePolicy::Concat")]
    pub merge_type: MergePolicy,
    #[config(default = false)]
    pub use_none_layer: bool,
    /// Accept `deconv_layer == upsample_layer` and build a merge-only plan.
    #[config(default = false)]
    pub allow_equal_depth: bool,
    #[config(default = 1e-5)]
    pub eps: f64,
    #[config(default = 0.1)]
    pub momentum: f64,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Top-level command.
pub struct MotionCmd {
    #[argh(subcommand)]
    pub commands: Commands,
    #[argh(switch, short = 'v')]
    /// print tensors and debug logs
    pub verbose: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Layers(SubCommandLayers),
    Plan(SubCommandPlan),
    Forward(SubCommandForward),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Show the stage catalog, level map and probed shapes of a backbone
#[argh(subcommand, name = "layers")]
pub struct SubCommandLayers {
    #[argh(option)]
    /// backbone name e.g 'vgg16', 'resnet50', 'panet'
    pub backbone: String,
    #[argh(option)]
    /// layer preference: first, last or random (default last)
    pub preference: Option<String>,
    #[argh(switch)]
    /// replace the deepest pools with none layers
    pub none_layer: bool,
    #[argh(option)]
    /// square probe input size (default 224)
    pub size: Option<usize>,
    #[argh(option)]
    /// number of input channels (default 3)
    pub in_channels: Option<usize>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Print the decoder plan for a model configuration
#[argh(subcommand, name = "plan")]
pub struct SubCommandPlan {
    #[argh(option)]
    /// model configuration file (json)
    pub config: Option<String>,
    #[argh(option)]
    /// backbone name used when no configuration file is given
    pub backbone: Option<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Assemble a model and run one synthetic forward pass
#[argh(subcommand, name = "forward")]
pub struct SubCommandForward {
    #[argh(option)]
    /// model configuration file (json)
    pub config: Option<String>,
    #[argh(option)]
    /// backbone name used when no configuration file is given
    pub backbone: Option<String>,
    #[argh(option)]
    /// batch size of the synthetic input (default 1)
    pub batch: Option<usize>,
}
