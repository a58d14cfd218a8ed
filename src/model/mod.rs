//! Model hyperparameters and weight manifests

mod config;
mod manifest;

pub use config::ModelConfig;
pub use manifest::{TensorEntry, WeightManifest};
