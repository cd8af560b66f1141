//! Training recipe configuration.
//!
//! The recipe is plain data: it can be built in code, or deserialized from TOML with
//! [`TrainConfig::from_toml_file`]. Nothing in here talks to a device or a peer; the
//! data-parallel width is derived later from the world size and `tp_size`/`pp_size`.

use crate::error::{Result, config_err};
use crate::model::ModuleKind;
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Requested numeric precision for the sharded replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DTypeChoice {
    Fp16,
    Bf16,
    /// `bf16` when the device supports it, else `fp16`.
    Auto,
}

impl FromStr for DTypeChoice {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp16" => Ok(DTypeChoice::Fp16),
            "bf16" => Ok(DTypeChoice::Bf16),
            "auto" => Ok(DTypeChoice::Auto),
            other => Err(config_err(format!(
                "`dtype` only supports `fp16`, `bf16`, or `auto`, but found `{other}`"
            ))),
        }
    }
}

/// What the local accelerator can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub bf16_supported: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            bf16_supported: true,
        }
    }
}

impl DTypeChoice {
    /// Resolves the choice against the device.
    ///
    /// # Errors
    ///
    /// `Configuration` if `bf16` is requested explicitly on a device without support.
    pub fn resolve(self, caps: &DeviceCaps) -> Result<DType> {
        match self {
            DTypeChoice::Fp16 => Ok(DType::F16),
            DTypeChoice::Bf16 if caps.bf16_supported => Ok(DType::BF16),
            DTypeChoice::Bf16 => Err(config_err(
                "the device does not support `bf16`, please set `dtype` to `fp16`",
            )),
            DTypeChoice::Auto if caps.bf16_supported => Ok(DType::BF16),
            DTypeChoice::Auto => Ok(DType::F16),
        }
    }
}

/// The recognised training options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub tp_size: usize,
    pub pp_size: usize,
    /// Samples per forward + backward.
    pub micro_batch_size: usize,
    /// Samples per optimizer step, summed over data-parallel ranks.
    pub global_batch_size: usize,
    /// Longer samples are truncated when packed.
    pub max_length: usize,
    pub dtype: DTypeChoice,
    /// Fraction of transformer blocks that recompute activations in backward.
    pub selective_recompute: f64,
    /// `< 1`: fraction of total steps. `>= 1`: absolute step count.
    pub checkpoint_interval: f64,
    /// Save only model shards; such checkpoints cannot be resumed.
    pub checkpoint_drop_optimizer: bool,
    pub max_grad_norm: f32,
    pub lr: f32,
    pub weight_decay: f32,
    pub warmup_ratio: f64,
    pub epochs: usize,
    pub log_interval: usize,
    pub log_level: String,
    pub work_dir: PathBuf,
    pub resume: Option<PathBuf>,
    pub seed: u64,
    /// Module kinds that become their own sharding unit.
    pub wrap_kinds: Vec<ModuleKind>,
    /// Swap attention to the packed variable-length kernel on the skeleton.
    pub packed_sequences: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            tp_size: 1,
            pp_size: 1,
            micro_batch_size: 1,
            global_batch_size: 16,
            max_length: 2048,
            dtype: DTypeChoice::Auto,
            selective_recompute: 1.0,
            checkpoint_interval: 0.25,
            checkpoint_drop_optimizer: false,
            max_grad_norm: 1.0,
            lr: 4e-5,
            weight_decay: 0.01,
            warmup_ratio: 0.03,
            epochs: 1,
            log_interval: 1,
            log_level: "info".to_string(),
            work_dir: PathBuf::from("work_dirs"),
            resume: None,
            seed: 0,
            wrap_kinds: ModuleKind::default_wrap_kinds(),
            packed_sequences: false,
        }
    }
}

impl TrainConfig {
    /// Loads a recipe from a TOML file. Missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading training config");
        let content = std::fs::read_to_string(path)?;
        let config: TrainConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Data-parallel width implied by `world_size`.
    pub fn dp_size(&self, world_size: usize) -> Result<usize> {
        let model_parallel = self.tp_size * self.pp_size;
        if model_parallel == 0 || world_size % model_parallel != 0 {
            return Err(config_err(format!(
                "world size {world_size} is not divisible by tp_size * pp_size = {model_parallel}"
            )));
        }
        Ok(world_size / model_parallel)
    }

    /// Checks every option that can be checked without a device.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        let dp = self.dp_size(world_size)?;
        if self.micro_batch_size == 0 || self.global_batch_size == 0 {
            return Err(config_err("batch sizes must be positive"));
        }
        if self.max_length == 0 {
            return Err(config_err("max_length must be positive"));
        }
        if self.global_batch_size % (self.micro_batch_size * dp) != 0 {
            return Err(config_err(format!(
                "global_batch_size {} must be divisible by micro_batch_size {} x dp {}",
                self.global_batch_size, self.micro_batch_size, dp
            )));
        }
        if !(0.0..=1.0).contains(&self.selective_recompute) {
            return Err(config_err(format!(
                "selective_recompute must be in [0, 1], got {}",
                self.selective_recompute
            )));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(config_err(format!(
                "warmup_ratio must be in [0, 1], got {}",
                self.warmup_ratio
            )));
        }
        if !self.checkpoint_interval.is_finite() || self.checkpoint_interval < 0.0 {
            return Err(config_err(format!(
                "checkpoint_interval must be a non-negative number, got {}",
                self.checkpoint_interval
            )));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(config_err("max_grad_norm must be positive"));
        }
        if self.epochs == 0 {
            return Err(config_err("epochs must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_dtype_resolution() {
        let with = DeviceCaps {
            bf16_supported: true,
        };
        let without = DeviceCaps {
            bf16_supported: false,
        };
        assert_eq!(DTypeChoice::Auto.resolve(&with).unwrap(), DType::BF16);
        assert_eq!(DTypeChoice::Auto.resolve(&without).unwrap(), DType::F16);
        assert_eq!(DTypeChoice::Fp16.resolve(&with).unwrap(), DType::F16);
        assert!(matches!(
            DTypeChoice::Bf16.resolve(&without),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_dtype_parse_rejects_unknown() {
        assert_eq!("auto".parse::<DTypeChoice>().unwrap(), DTypeChoice::Auto);
        assert!(matches!(
            "fp8".parse::<DTypeChoice>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_dimensions() {
        let config = TrainConfig {
            tp_size: 3,
            ..Default::default()
        };
        assert!(config.validate(8).is_err());

        let config = TrainConfig {
            tp_size: 2,
            ..Default::default()
        };
        assert_eq!(config.dp_size(8).unwrap(), 4);
        config.validate(8).unwrap();
    }

    #[test]
    fn test_validate_ratios() {
        let config = TrainConfig {
            selective_recompute: 1.5,
            ..Default::default()
        };
        assert!(config.validate(1).is_err());

        let config = TrainConfig {
            checkpoint_interval: -1.0,
            ..Default::default()
        };
        assert!(config.validate(1).is_err());

        let config = TrainConfig {
            max_length: 0,
            ..Default::default()
        };
        assert!(config.validate(1).is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        std::fs::write(
            &path,
            "tp_size = 2\ndtype = \"fp16\"\ncheckpoint_interval = 5\nwrap_kinds = [\"block\"]\n",
        )
        .unwrap();
        let config = TrainConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.tp_size, 2);
        assert_eq!(config.dtype, DTypeChoice::Fp16);
        assert_eq!(config.checkpoint_interval, 5.0);
        assert_eq!(config.wrap_kinds, vec![ModuleKind::Block]);
        assert_eq!(config.global_batch_size, 16);
    }
}
