use std::str::FromStr;

use anyhow::{Context, Result};
use burn::{config::Config, prelude::Backend, tensor::Distribution, tensor::Tensor};
use log::info;
use motion_seg::{
    check_nan,
    config::{BackboneConfig, Commands, MotionCmd, MotionNetConfig},
    debug::{fmt_shape, set_tensor_dbg_precision},
    models::{
        backbone::FeaturePyramidBackbone, level_map::LayerPreference, motion_net::MotionNet,
    },
};

#[cfg(feature = "tch")]
type BackendType = burn::backend::LibTorch;
#[cfg(not(feature = "tch"))]
type BackendType = burn::backend::NdArray<f32>;
type DeviceType = <BackendType as Backend>::Device;

const DEFAULT_BACKBONE: &str = "vgg16";

fn load_config(path: Option<String>, backbone: Option<String>) -> Result<MotionNetConfig> {
    match path {
        Some(path) => MotionNetConfig::load(&path)
            .with_context(|| format!("could not load model configuration from {path}")),
        None => Ok(MotionNetConfig::new(BackboneConfig::new(
            backbone.unwrap_or_else(|| DEFAULT_BACKBONE.to_string()),
        ))),
    }
}

fn main() -> Result<()> {
    let cli_cmd: MotionCmd = argh::from_env();

    env_logger::builder()
        .filter_level(if cli_cmd.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let device = DeviceType::default();

    match cli_cmd.commands {
        Commands::Layers(sub_command_layers) => {
            let size = sub_command_layers.size.unwrap_or(224);
            let preference = match &sub_command_layers.preference {
                Some(preference) => LayerPreference::from_str(preference)?,
                None => LayerPreference::Last,
            };
            let config = BackboneConfig::new(sub_command_layers.backbone)
                .with_layer_preference(preference)
                .with_use_none_layer(sub_command_layers.none_layer)
                .with_probe_size([size, size]);

            let backbone = FeaturePyramidBackbone::<BackendType>::new(
                &config,
                sub_command_layers.in_channels.unwrap_or(3),
                &device,
            )?;
            print!("{}", backbone.describe_layers());
        }
        Commands::Plan(sub_command_plan) => {
            let config = load_config(sub_command_plan.config, sub_command_plan.backbone)?;
            let model = MotionNet::<BackendType>::new(&config, &device)?;
            print!("{}", model.plan());
        }
        Commands::Forward(sub_command_forward) => {
            let config = load_config(sub_command_forward.config, sub_command_forward.backbone)?;
            let batch = sub_command_forward.batch.unwrap_or(1);
            let [height, width] = config.input_shape;

            let model = MotionNet::<BackendType>::new(&config, &device)?;
            let image = Tensor::random([batch, 3, height, width], Distribution::Default, &device);
            let aux = config.has_aux_input().then(|| {
                let channels = if config.use_flow { config.flow_channels } else { 3 };
                Tensor::random([batch, channels, height, width], Distribution::Default, &device)
            });

            let masks = model.forward(image, aux)?;
            check_nan!(masks);
            if cli_cmd.verbose {
                set_tensor_dbg_precision(4);
                println!("{masks}");
            }
            info!("mask logits: {}", fmt_shape(&masks.dims()));
        }
    };

    Ok(())
}
