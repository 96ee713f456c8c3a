pub mod backbone;
pub mod blocks;
pub mod catalog;
pub mod decoder;
pub mod head;
pub mod level_map;
pub mod motion_net;
pub mod plan;
pub mod resnet;
pub mod vgg;

/// Deepest canonical pyramid level (stride 32).
pub const MAX_LEVEL: usize = 5;
