//! # Trainer Configuration

use crate::error::{Result, TrainerError};
use serde::{Deserialize, Serialize};

/// How many workers a distributed update is spread across.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub num_workers: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        ScalingConfig { num_workers: 1 }
    }
}

/// Execution-mode settings shared by every trainer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Route `build` and `update` through the distributed hooks.
    pub distributed: bool,
    pub scaling_config: ScalingConfig,
}

impl TrainerConfig {
    pub fn local() -> Self {
        TrainerConfig::default()
    }

    pub fn distributed(num_workers: usize) -> Self {
        TrainerConfig {
            distributed: true,
            scaling_config: ScalingConfig { num_workers },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.distributed && self.scaling_config.num_workers == 0 {
            return Err(TrainerError::Config(
                "distributed training requires scaling_config.num_workers >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrainerConfig =
            serde_json::from_str(json).map_err(|e| TrainerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
