//! Model hyperparameters relevant to expert paging

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// MoE hyperparameters parsed from config.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer layers
    #[serde(alias = "num_hidden_layers")]
    pub n_layer: usize,

    /// Leading layers with a dense FFN instead of experts
    #[serde(default, alias = "first_k_dense_replace")]
    pub n_layer_dense_lead: usize,

    /// Routed experts per MoE layer
    #[serde(
        alias = "n_routed_experts",
        alias = "num_local_experts",
        alias = "num_experts"
    )]
    pub n_expert: usize,

    /// Experts selected per token (top-k)
    #[serde(default, alias = "num_experts_per_tok")]
    pub n_expert_used: usize,
}

impl ModelConfig {
    /// Build a config directly from its dimensions
    pub fn new(n_layer: usize, n_layer_dense_lead: usize, n_expert: usize, n_expert_used: usize) -> Self {
        Self {
            n_layer,
            n_layer_dense_lead,
            n_expert,
            n_expert_used,
        }
    }

    /// Load config from a model directory
    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let config_path = model_dir.as_ref().join("config.json");
        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| Error::Config(format!("Failed to read config.json: {}", e)))?;
        Self::from_json(&config_str)
    }

    /// Parse config from a JSON string
    pub fn from_json(s: &str) -> Result<Self> {
        let config: ModelConfig = serde_json::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config.json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of layers that carry experts
    pub fn n_moe_layers(&self) -> Result<usize> {
        self.n_layer
            .checked_sub(self.n_layer_dense_lead)
            .ok_or_else(|| {
                Error::Config(format!(
                    "dense lead ({}) exceeds layer count ({})",
                    self.n_layer_dense_lead, self.n_layer
                ))
            })
    }

    /// Absolute layer index of a MoE layer
    pub fn absolute_layer(&self, moe_layer: usize) -> usize {
        moe_layer + self.n_layer_dense_lead
    }

    fn validate(&self) -> Result<()> {
        if self.n_expert == 0 {
            return Err(Error::Config("model has no routed experts".to_string()));
        }
        if self.n_moe_layers()? == 0 {
            return Err(Error::Config("model has no MoE layers".to_string()));
        }
        if self.n_expert_used > self.n_expert {
            return Err(Error::Config(format!(
                "top-k ({}) exceeds expert count ({})",
                self.n_expert_used, self.n_expert
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deepseek_style_keys() {
        let config = ModelConfig::from_json(
            r#"{
                "num_hidden_layers": 27,
                "first_k_dense_replace": 1,
                "n_routed_experts": 64,
                "num_experts_per_tok": 6,
                "hidden_size": 2048
            }"#,
        )
        .unwrap();
        assert_eq!(config.n_moe_layers().unwrap(), 26);
        assert_eq!(config.n_expert, 64);
        assert_eq!(config.absolute_layer(0), 1);
    }

    #[test]
    fn test_mixtral_style_keys() {
        let config = ModelConfig::from_json(
            r#"{"num_hidden_layers": 32, "num_local_experts": 8, "num_experts_per_tok": 2}"#,
        )
        .unwrap();
        assert_eq!(config.n_layer_dense_lead, 0);
        assert_eq!(config.n_moe_layers().unwrap(), 32);
    }

    #[test]
    fn test_dense_lead_underflow() {
        let err = ModelConfig::from_json(
            r#"{"n_layer": 2, "n_layer_dense_lead": 3, "n_expert": 4}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
