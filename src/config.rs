use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{dataset::SyntheticConfig, optim::AdamConfig, Error, Result};

/// Run configuration. Every field has a default, so a JSON file only
/// needs to name what it changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub seed: u64,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub inference: InferenceConfig,
    pub synthetic: SyntheticConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            num_layers: 3,
            dropout: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Neighbors drawn per node, one entry per layer, seeds outward.
    pub fanouts: Vec<usize>,
    pub replace: bool,
    pub optimizer: AdamConfig,
    pub progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 1024,
            fanouts: vec![10, 10, 10],
            replace: true,
            optimizer: AdamConfig::default(),
            progress: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub batch_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self { batch_size: 4096 }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));

        if self.model.num_layers == 0 || self.model.hidden_size == 0 {
            return fail(String::from("model needs at least one layer of positive width"));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return fail(format!("dropout {} outside [0, 1)", self.model.dropout));
        }
        if self.train.fanouts.len() != self.model.num_layers {
            return fail(format!(
                "{} fanouts for {} layers",
                self.train.fanouts.len(),
                self.model.num_layers
            ));
        }
        if self.train.fanouts.contains(&0) {
            return fail(String::from("fanouts must be positive"));
        }
        if self.train.batch_size == 0 || self.inference.batch_size == 0 {
            return fail(String::from("batch sizes must be positive"));
        }
        if self.train.optimizer.lr <= 0.0 {
            return fail(format!("learning rate {} must be positive", self.train.optimizer.lr));
        }

        let synthetic = &self.synthetic;
        if synthetic.train_fraction < 0.0
            || synthetic.val_fraction < 0.0
            || synthetic.train_fraction + synthetic.val_fraction > 1.0
        {
            return fail(String::from("synthetic split fractions must sum to at most 1"));
        }

        Ok(())
    }
}
