use burn::module::Ignored;
use burn::prelude::*;
use log::info;

use crate::config::{BackboneConfig, MotionNetConfig, NetName};
use crate::error::{ModelError, Result};
use crate::models::backbone::{FeaturePyramidBackbone, PyramidProbe};
use crate::models::decoder::DecoderExecutor;
use crate::models::head::SegmentationHead;
use crate::models::plan::DecoderPlan;

/// Input frame fed to a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// The current image.
    Image,
    /// The second image, or optical flow when flow is enabled.
    Aux,
}

/// One decoder branch: which network runs on which frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchSource {
    pub network: usize,
    pub frame: Frame,
}

/// Motion segmentation model: backbone(s), planned decoder and segmentation head.
///
/// Branch layout per variant, main branch first:
/// - `MotionUnet`/`MotionFcn`: backbone on the image, then the same backbone on the
///   second image, or a flow backbone on the flow.
/// - `MotionPanet`: backbone and panet on the image, then either both again on the
///   second image or a flow panet on the flow.
#[derive(Module, Debug)]
pub struct MotionNet<B: Backend> {
    networks: Vec<FeaturePyramidBackbone<B>>,
    branches: Ignored<Vec<BranchSource>>,
    plan: Ignored<DecoderPlan>,
    decoder: DecoderExecutor<B>,
    head: SegmentationHead<B>,
}

impl<B: Backend> MotionNet<B> {
    pub fn new(config: &MotionNetConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;

        let mut panet_config: BackboneConfig = config.backbone.clone();
        panet_config.backbone_name = "panet".to_string();

        let mut networks = vec![FeaturePyramidBackbone::new(&config.backbone, 3, device)?];
        let mut branches = vec![BranchSource {
            network: 0,
            frame: Frame::Image,
        }];

        let panet = config.net_name == NetName::MotionPanet;
        if panet {
            networks.push(FeaturePyramidBackbone::new(&panet_config, 3, device)?);
            branches.push(BranchSource {
                network: 1,
                frame: Frame::Image,
            });
        }

        if config.use_flow {
            let flow_config = if panet { &panet_config } else { &config.backbone };
            networks.push(FeaturePyramidBackbone::new(
                flow_config,
                config.flow_channels,
                device,
            )?);
            branches.push(BranchSource {
                network: networks.len() - 1,
                frame: Frame::Aux,
            });
        } else if config.use_aux_input {
            let image_networks: Vec<usize> = (0..networks.len()).collect();
            branches.extend(image_networks.into_iter().map(|network| BranchSource {
                network,
                frame: Frame::Aux,
            }));
        }

        let probes: Vec<&dyn PyramidProbe> = branches
            .iter()
            .map(|branch| &networks[branch.network] as &dyn PyramidProbe)
            .collect();
        let decoder_config = config.decoder_config();
        let plan = DecoderPlan::build(probes[0], &probes[1..], &decoder_config)?;

        let decoder = DecoderExecutor::new(&plan, &decoder_config, device);
        let head = SegmentationHead::new(
            device,
            plan.output_channels(),
            config.class_number,
            config.input_shape,
        );
        info!(
            "built {:?} on {} with {} branch(es)",
            config.net_name,
            networks[0].name(),
            branches.len()
        );

        Ok(Self {
            networks,
            branches: Ignored(branches),
            plan: Ignored(plan),
            decoder,
            head,
        })
    }

    pub fn plan(&self) -> &DecoderPlan {
        &self.plan
    }

    pub fn branches(&self) -> &[BranchSource] {
        &self.branches
    }

    pub fn networks(&self) -> &[FeaturePyramidBackbone<B>] {
        &self.networks
    }

    /// Decoder output before the head, `(B, C, h, w)` with `C` the main backbone width at
    /// `upsample_layer`.
    pub fn forward_features(&self, image: Tensor<B, 4>, aux: Option<Tensor<B, 4>>) -> Result<Tensor<B, 4>> {
        let pyramids = self
            .branches
            .iter()
            .map(|branch| -> Result<Vec<Tensor<B, 4>>> {
                let input = match branch.frame {
                    Frame::Image => image.clone(),
                    Frame::Aux => aux.clone().ok_or_else(|| {
                        ModelError::Configuration("this model needs an auxiliary frame".into())
                    })?,
                };
                Ok(self.networks[branch.network].forward_all_levels(input))
            })
            .collect::<Result<Vec<_>>>()?;

        self.decoder.forward(&pyramids)
    }

    /// Segmentation logits `(B, class_number, H, W)` at the configured input shape.
    ///
    /// `aux` is the second frame (or its optical flow) and is required whenever the model
    /// was configured with an auxiliary input.
    pub fn forward(&self, image: Tensor<B, 4>, aux: Option<Tensor<B, 4>>) -> Result<Tensor<B, 4>> {
        Ok(self.head.forward(self.forward_features(image, aux)?))
    }
}
