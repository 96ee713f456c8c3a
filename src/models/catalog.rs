use std::collections::BTreeMap;
use std::fmt;

use crate::layers::LayerDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Convolution,
    Pooling,
    /// Resolution preserving stand-in for a pool.
    Identity,
    Other,
}

/// One cataloged layer with the pyramid level its output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub index: usize,
    pub kind: StageKind,
    pub stride: [usize; 2],
    pub level: usize,
}

/// Ordered, immutable list of stages with the level counter already resolved.
///
/// The level starts at 0 and is bumped *before* a stage is recorded whenever that stage
/// is a convolution or pool with stride 2 in either dimension, or a none layer. Nested
/// groups are flattened first, so stage indices match the flattened layer list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCatalog {
    stages: Vec<Stage>,
}

impl StageCatalog {
    pub fn build(layers: &[LayerDesc]) -> Self {
        let mut level = 0;
        let stages = LayerDesc::flatten(layers)
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                let kind = match layer {
                    LayerDesc::Conv { .. } => StageKind::Convolution,
                    LayerDesc::MaxPool { .. } => StageKind::Pooling,
                    LayerDesc::NoneLayer => StageKind::Identity,
                    _ => StageKind::Other,
                };
                let stride = layer.stride();

                let halves = stride.contains(&2);
                match kind {
                    StageKind::Convolution | StageKind::Pooling if halves => level += 1,
                    StageKind::Identity => level += 1,
                    _ => {}
                }

                Stage {
                    index,
                    kind,
                    stride,
                    level,
                }
            })
            .collect();

        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage indices grouped by level, each group in ascending order.
    pub fn levels(&self) -> BTreeMap<usize, Vec<usize>> {
        let mut levels: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for stage in &self.stages {
            levels.entry(stage.level).or_default().push(stage.index);
        }
        levels
    }
}

impl fmt::Display for StageCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>5}  {:<12} {:>6}  level", "index", "kind", "stride")?;
        for stage in &self.stages {
            writeln!(
                f,
                "{:>5}  {:<12} {:>6}  {}",
                stage.index,
                format!("{:?}", stage.kind),
                format!("{}x{}", stage.stride[0], stage.stride[1]),
                stage.level
            )?;
        }
        Ok(())
    }
}
