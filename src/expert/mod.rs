//! Expert residency: disk index, residency table, loader and the
//! demand-paging controller

mod activity;
mod cache;
mod index;
mod loader;
pub mod remap;
mod table;

pub use activity::{ActivityTracker, ActivityUnit};
pub use cache::{CacheConfig, CacheStats, ExpertCache};
pub use index::{DiskIndex, LayerFormat};
pub use loader::ShardLoader;
pub use remap::{remap_parallel, remap_selection, Selection};
pub use table::{ExpertCell, ResidencyTable};

use serde::{Deserialize, Serialize};

/// The three weight shards that make up one expert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRole {
    Up,
    Gate,
    Down,
}

impl ShardRole {
    /// All roles, in region order
    pub const ALL: [ShardRole; 3] = [ShardRole::Up, ShardRole::Gate, ShardRole::Down];

    /// Position of this role in per-role arrays
    pub fn index(self) -> usize {
        match self {
            ShardRole::Up => 0,
            ShardRole::Gate => 1,
            ShardRole::Down => 2,
        }
    }
}

impl std::fmt::Display for ShardRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRole::Up => write!(f, "up"),
            ShardRole::Gate => write!(f, "gate"),
            ShardRole::Down => write!(f, "down"),
        }
    }
}

/// Where one shard of one expert lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardLocation {
    /// Backing file
    pub file_index: u16,
    /// Absolute byte offset
    pub byte_offset: u64,
}

/// Residency of an expert or a whole layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpertState {
    OnDisk,
    InMemory,
}

/// Naming convention for fused expert tensors and the graph nodes that
/// carry per-layer expert selections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardNaming {
    /// Prefix for layers (e.g., "blk" for GGUF)
    pub layer_prefix: String,
    /// Fused up projection, all experts
    pub up: String,
    /// Fused gate projection, all experts
    pub gate: String,
    /// Fused down projection, all experts
    pub down: String,
    /// Name of the top-k selection node, suffixed with `-{layer}`
    pub topk_node: String,
}

impl Default for ShardNaming {
    fn default() -> Self {
        // GGUF-style naming
        Self {
            layer_prefix: "blk".to_string(),
            up: "ffn_up_exps.weight".to_string(),
            gate: "ffn_gate_exps.weight".to_string(),
            down: "ffn_down_exps.weight".to_string(),
            topk_node: "ffn_moe_topk".to_string(),
        }
    }
}

impl ShardNaming {
    /// Naming for HF checkpoints with experts fused per projection
    pub fn fused_hf() -> Self {
        Self {
            layer_prefix: "model.layers".to_string(),
            up: "mlp.experts.up_proj".to_string(),
            gate: "mlp.experts.gate_proj".to_string(),
            down: "mlp.experts.down_proj".to_string(),
            topk_node: "ffn_moe_topk".to_string(),
        }
    }

    /// Full tensor name of a shard for an absolute layer index
    pub fn tensor_name(&self, layer: usize, role: ShardRole) -> String {
        let suffix = match role {
            ShardRole::Up => &self.up,
            ShardRole::Gate => &self.gate,
            ShardRole::Down => &self.down,
        };
        format!("{}.{}.{}", self.layer_prefix, layer, suffix)
    }

    /// Selection node name for an absolute layer index
    pub fn node_name(&self, layer: usize) -> String {
        format!("{}-{}", self.topk_node, layer)
    }
}
