// config.rs
// ============================================================================
// Note:  Runtime configuration for the summarization model. One struct for
//        all recognized options, JSON persistence, validation. The device
//        flag exists because tensor placement is decided once at the
//        tensorizer boundary; the ndarray backend is host-only, so "cpu" is
//        the only residency that validates.
// ============================================================================

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Clone, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct Config {
    // Model dimensions
    pub embed_dim: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub attr_dim: usize,

    // Regularization
    pub encoder_dropout: f32,
    pub decoder_dropout: f32,

    // Vocabulary
    pub word_min_cnt: u64,
    /// Upper bound on the fixed vocabulary after pruning, 0 = uncapped.
    pub max_vocab: usize,

    // Sequence limits
    pub src_max_len: usize,
    pub sum_max_len: usize,
    pub review_max_len: usize,
    /// Memory slots per example (memory variant).
    pub mem_size: usize,

    // Loop options
    pub batch_size: usize,
    pub epochs: usize,

    // Tensor placement, applied once when tensors leave the tensorizer.
    pub device: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embed_dim: 300,
            hidden_size: 512,
            num_layers: 2,
            attr_dim: 64,
            encoder_dropout: 0.1,
            decoder_dropout: 0.1,
            word_min_cnt: 5,
            max_vocab: 0,
            src_max_len: 400,
            sum_max_len: 15,
            review_max_len: 200,
            mem_size: 10,
            batch_size: 32,
            epochs: 10,
            device: "cpu".to_string(),
        }
    }
}

impl Config {
    pub fn load(s_path: &str) -> Result<Self> {
        let s_data = fs::read_to_string(s_path)
            .with_context(|| format!("cannot read config {}", s_path))?;
        let cfg: Config = serde_json::from_str(&s_data)
            .with_context(|| format!("cannot parse config {}", s_path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, s_path: &str) -> Result<()> {
        let s_json = serde_json::to_string_pretty(self).context("cannot serialize config")?;
        fs::write(s_path, s_json).with_context(|| format!("cannot write config {}", s_path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device != "cpu" {
            bail!("unsupported device '{}', tensors are host-resident", self.device);
        }
        if self.embed_dim == 0 || self.hidden_size == 0 || self.num_layers == 0 {
            bail!("model dimensions must be positive");
        }
        if self.sum_max_len == 0 {
            bail!("sum_max_len must be positive");
        }
        if !(0.0..1.0).contains(&self.encoder_dropout) || !(0.0..1.0).contains(&self.decoder_dropout) {
            bail!("dropout rates must lie in [0, 1)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.device, "cpu");
        assert_eq!(cfg.max_vocab, 0);
    }

    #[test]
    fn foreign_device_is_rejected() {
        let cfg = Config { device: "cuda:0".to_string(), ..Config::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_roundtrip() {
        let cfg = Config { hidden_size: 128, sum_max_len: 8, ..Config::default() };
        let s_json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&s_json).unwrap();
        assert_eq!(back.hidden_size, 128);
        assert_eq!(back.sum_max_len, 8);
    }
}
