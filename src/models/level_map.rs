use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use rand::Rng;

use crate::error::{ModelError, Result};
use crate::models::catalog::StageCatalog;
use crate::models::MAX_LEVEL;

/// Which stage represents a level when several share it.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum LayerPreference {
    First,
    Last,
    Random,
}

impl FromStr for LayerPreference {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(LayerPreference::First),
            "last" => Ok(LayerPreference::Last),
            "random" | "rand" => Ok(LayerPreference::Random),
            other => Err(ModelError::Configuration(format!(
                "unknown layer preference '{other}'"
            ))),
        }
    }
}

/// Where the activation of a level is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    /// The network input itself.
    Input,
    /// Output of a cataloged stage.
    Stage(usize),
    /// Residual stem output, before the stem pool.
    Stem,
    /// Output of residual stage `n` (0 based).
    Residual(usize),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Input => write!(f, "input"),
            Locator::Stage(index) => write!(f, "stage {index}"),
            Locator::Stem => write!(f, "stem"),
            Locator::Residual(n) => write!(f, "layer{}", n + 1),
        }
    }
}

/// Canonical level (0 = input resolution, 5 = stride 32) to locator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelMap {
    entries: BTreeMap<usize, Locator>,
}

impl LevelMap {
    /// Picks one stage per cataloged level. Levels past [`MAX_LEVEL`] are dropped.
    pub fn from_catalog<R: Rng>(
        catalog: &StageCatalog,
        preference: LayerPreference,
        rng: &mut R,
    ) -> Self {
        let entries = catalog
            .levels()
            .into_iter()
            .filter(|(level, _)| *level <= MAX_LEVEL)
            .filter_map(|(level, members)| {
                let index = match preference {
                    LayerPreference::First => members.first().copied(),
                    LayerPreference::Last => members.last().copied(),
                    LayerPreference::Random => {
                        members.get(rng.random_range(0..members.len())).copied()
                    }
                }?;
                Some((level, Locator::Stage(index)))
            })
            .collect();

        Self { entries }
    }

    /// Fixed layout of residual networks: input, stem, then the four residual stages.
    pub fn residual() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, Locator::Input);
        entries.insert(1, Locator::Stem);
        for stage in 0..4 {
            entries.insert(stage + 2, Locator::Residual(stage));
        }
        Self { entries }
    }

    pub fn get(&self, level: usize) -> Option<Locator> {
        self.entries.get(&level).copied()
    }

    pub fn contains(&self, level: usize) -> bool {
        self.entries.contains_key(&level)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Locator)> + '_ {
        self.entries.iter().map(|(level, locator)| (*level, *locator))
    }

    /// Highest stage index any level points at.
    pub fn deepest_stage(&self) -> Option<usize> {
        self.entries
            .values()
            .filter_map(|locator| match locator {
                Locator::Stage(index) => Some(*index),
                _ => None,
            })
            .max()
    }
}
