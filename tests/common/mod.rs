//! Shared fixtures: small weight files whose every expert shard has a
//! distinct byte pattern

#![allow(dead_code)]

use moe_offload::model::TensorEntry;
use moe_offload::{DType, ModelConfig, ShardNaming, ShardRole, WeightManifest};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

pub const ROWS: usize = 2;
pub const COLS: usize = 32;

/// Bytes stored for one expert shard
pub fn pattern(layer: usize, expert: usize, role: ShardRole, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((layer * 61 + expert * 17 + role.index() * 5 + i) % 251) as u8)
        .collect()
}

pub struct Fixture {
    pub dir: TempDir,
    pub weights: PathBuf,
    pub model: ModelConfig,
    pub manifest: WeightManifest,
    pub naming: ShardNaming,
}

impl Fixture {
    /// Per-expert bytes of a U8 fixture shard
    pub fn expert_bytes(&self) -> usize {
        ROWS * COLS
    }
}

/// `n_moe` MoE layers after `dense` dense layers, `n_expert` experts each,
/// every shard `[n_expert, ROWS, COLS]` of U8
pub fn fixture(n_moe: usize, dense: usize, n_expert: usize) -> Fixture {
    fixture_with(n_moe, dense, n_expert, |_| DType::U8, COLS, ROWS)
}

/// Fixture with a per-layer element format
pub fn fixture_with(
    n_moe: usize,
    dense: usize,
    n_expert: usize,
    dtype_of: impl Fn(usize) -> DType,
    cols: usize,
    rows: usize,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("experts.bin");
    let naming = ShardNaming::default();
    let mut manifest = WeightManifest::default();
    manifest.files.push(weights.clone());

    // A header-sized gap so no shard starts at offset zero
    let mut data = vec![0xEEu8; 96];
    for il in 0..n_moe {
        let dtype = dtype_of(il);
        let expert_bytes = dtype.row_size(cols).unwrap() * rows;
        for role in ShardRole::ALL {
            let offset = data.len() as u64;
            for e in 0..n_expert {
                data.extend(pattern(il, e, role, expert_bytes));
            }
            manifest.tensors.insert(
                naming.tensor_name(il + dense, role),
                TensorEntry {
                    file_index: 0,
                    offset,
                    nbytes: (expert_bytes * n_expert) as u64,
                    dtype,
                    shape: vec![n_expert, rows, cols],
                },
            );
        }
    }
    File::create(&weights).unwrap().write_all(&data).unwrap();

    Fixture {
        dir,
        weights,
        model: ModelConfig::new(n_moe + dense, dense, n_expert, 2),
        manifest,
        naming,
    }
}

/// Write the same layout as a safetensors file plus config.json into a
/// model directory
pub fn write_safetensors_model(n_moe: usize, n_expert: usize) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let naming = ShardNaming::default();
    let expert_bytes = ROWS * COLS;

    let mut header = serde_json::Map::new();
    let mut payload = Vec::new();
    for il in 0..n_moe {
        for role in ShardRole::ALL {
            let start = payload.len();
            for e in 0..n_expert {
                payload.extend(pattern(il, e, role, expert_bytes));
            }
            header.insert(
                naming.tensor_name(il, role),
                serde_json::json!({
                    "dtype": "U8",
                    "shape": [n_expert, ROWS, COLS],
                    "data_offsets": [start, payload.len()],
                }),
            );
        }
    }
    let mut header = serde_json::to_vec(&serde_json::Value::Object(header)).unwrap();
    while header.len() % 8 != 0 {
        header.push(b' ');
    }

    let mut file = File::create(dir.path().join("model.safetensors")).unwrap();
    file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
    file.write_all(&header).unwrap();
    file.write_all(&payload).unwrap();

    let config = serde_json::json!({
        "num_hidden_layers": n_moe,
        "num_local_experts": n_expert,
        "num_experts_per_tok": 2,
    });
    std::fs::write(dir.path().join("config.json"), config.to_string()).unwrap();
    dir
}
