//! Per-(layer, expert) shard locations built from the weight manifest
//!
//! Fused expert tensors are laid out `[expert][row][col]`, so expert `j` of
//! a shard starts at `base + j * stride` with `stride = nbytes / n_expert`.
//! Every expert of a shard must therefore be the same size; a format with
//! per-expert sizes would need per-expert offsets in the manifest.

use super::{ShardLocation, ShardNaming, ShardRole};
use crate::model::{ModelConfig, WeightManifest};
use crate::pool::RoleGeometry;
use crate::tensor::DType;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Element formats and per-expert byte widths of one layer's shards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerFormat {
    /// Format per role (up, gate, down)
    pub dtypes: [DType; 3],
    /// Bytes of one expert per role
    pub expert_bytes: [usize; 3],
}

impl LayerFormat {
    pub fn dtype(&self, role: ShardRole) -> DType {
        self.dtypes[role.index()]
    }

    pub fn expert_bytes(&self, role: ShardRole) -> usize {
        self.expert_bytes[role.index()]
    }

    /// Largest single-expert shard, which bounds the staging buffer
    pub fn max_expert_bytes(&self) -> usize {
        self.expert_bytes.iter().copied().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct LayerShards {
    base: [ShardLocation; 3],
    format: LayerFormat,
}

/// Disk locations of every expert shard of every MoE layer
#[derive(Debug, Clone)]
pub struct DiskIndex {
    files: Vec<PathBuf>,
    n_expert: usize,
    layers: Vec<LayerShards>,
    roles: [RoleGeometry; 3],
}

impl DiskIndex {
    /// Locate the three fused shard tensors of each MoE layer.
    ///
    /// Fails with [`Error::Config`] when the manifest disagrees with the
    /// model's layer or expert counts, when role shapes differ across
    /// layers, or when a per-expert stride is not a multiple of `alignment`.
    pub fn build(
        manifest: &WeightManifest,
        model: &ModelConfig,
        naming: &ShardNaming,
        alignment: usize,
    ) -> Result<Self> {
        let n_moe = model.n_moe_layers()?;
        let n_expert = model.n_expert;
        if n_moe == 0 || n_expert == 0 {
            return Err(Error::Config(format!(
                "empty expert table: {} MoE layers x {} experts",
                n_moe, n_expert
            )));
        }

        let beyond = naming.tensor_name(model.n_layer, ShardRole::Up);
        if manifest.contains(&beyond) {
            return Err(Error::Config(format!(
                "manifest has {} but the model declares {} layers",
                beyond, model.n_layer
            )));
        }

        // (role, dtype) -> per-expert bytes, computed once
        let mut sizes: HashMap<(ShardRole, DType), usize> = HashMap::new();
        let mut dims: [Option<(usize, usize)>; 3] = [None; 3];
        let mut layers = Vec::with_capacity(n_moe);

        for il in 0..n_moe {
            let abs = model.absolute_layer(il);
            let mut base = [ShardLocation::default(); 3];
            let mut dtypes = [DType::U8; 3];
            let mut expert_bytes = [0usize; 3];

            for role in ShardRole::ALL {
                let name = naming.tensor_name(abs, role);
                let entry = manifest.tensors.get(&name).ok_or_else(|| {
                    Error::Config(format!(
                        "model declares MoE layer {} (block {}) but the manifest has no {}",
                        il, abs, name
                    ))
                })?;

                if entry.shape.len() != 3 || entry.shape[0] != n_expert {
                    return Err(Error::Config(format!(
                        "{} has shape {:?}, expected [{}, rows, cols]",
                        name, entry.shape, n_expert
                    )));
                }
                let (rows, cols) = (entry.shape[1], entry.shape[2]);
                match dims[role.index()] {
                    None => dims[role.index()] = Some((rows, cols)),
                    Some(d) if d != (rows, cols) => {
                        return Err(Error::Config(format!(
                            "{} is {}x{} but earlier layers use {}x{}",
                            name, rows, cols, d.0, d.1
                        )))
                    }
                    Some(_) => {}
                }

                let size = match sizes.get(&(role, entry.dtype)) {
                    Some(&size) => size,
                    None => {
                        let size = RoleGeometry::new(entry.dtype, cols, rows)?.slot_bytes;
                        sizes.insert((role, entry.dtype), size);
                        size
                    }
                };
                if entry.nbytes != (size * n_expert) as u64 {
                    return Err(Error::Config(format!(
                        "{} spans {} bytes, expected {} experts x {} bytes",
                        name, entry.nbytes, n_expert, size
                    )));
                }
                if alignment > 1 && size % alignment != 0 {
                    return Err(Error::Config(format!(
                        "{} per-expert stride {} is not {}-byte aligned",
                        name, size, alignment
                    )));
                }

                base[role.index()] = ShardLocation {
                    file_index: entry.file_index,
                    byte_offset: entry.offset,
                };
                dtypes[role.index()] = entry.dtype;
                expert_bytes[role.index()] = size;
            }

            debug!("Layer {} ({}): {:?} {:?}", il, abs, dtypes, expert_bytes);
            layers.push(LayerShards {
                base,
                format: LayerFormat {
                    dtypes,
                    expert_bytes,
                },
            });
        }

        // Pool format per role: the widest layer, last one on ties
        let mut roles = [RoleGeometry::new(DType::U8, 0, 0)?; 3];
        for role in ShardRole::ALL {
            let widest = layers
                .iter()
                .max_by_key(|l| l.format.expert_bytes(role))
                .map(|l| l.format.dtype(role))
                .unwrap_or(DType::U8);
            let (rows, cols) = dims[role.index()].unwrap_or((0, 0));
            roles[role.index()] = RoleGeometry::new(widest, cols, rows)?;
        }

        info!(
            "Disk index: {} MoE layers x {} experts, slot bytes up={} gate={} down={}",
            n_moe, n_expert, roles[0].slot_bytes, roles[1].slot_bytes, roles[2].slot_bytes
        );

        Ok(Self {
            files: manifest.files.clone(),
            n_expert,
            layers,
            roles,
        })
    }

    /// Number of MoE layers
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Experts per layer
    pub fn n_expert(&self) -> usize {
        self.n_expert
    }

    /// Backing files
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Pool geometry per role
    pub fn roles(&self) -> [RoleGeometry; 3] {
        self.roles
    }

    /// Formats of one layer
    pub fn format(&self, layer: usize) -> Result<&LayerFormat> {
        self.layers
            .get(layer)
            .map(|l| &l.format)
            .ok_or_else(|| Error::invariant(format!("layer {} out of range", layer)))
    }

    /// Location of one expert's shard
    pub fn location(&self, layer: usize, expert: usize, role: ShardRole) -> Result<ShardLocation> {
        let shards = self
            .layers
            .get(layer)
            .ok_or_else(|| Error::invariant(format!("layer {} out of range", layer)))?;
        if expert >= self.n_expert {
            return Err(Error::invariant(format!("expert {} out of range", expert)));
        }
        let base = shards.base[role.index()];
        Ok(ShardLocation {
            file_index: base.file_index,
            byte_offset: base.byte_offset
                + (expert * shards.format.expert_bytes(role)) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TensorEntry;

    /// Manifest with the given (layer, dtype) shards back to back in one file
    fn manifest(naming: &ShardNaming, layers: &[(usize, DType)], n_expert: usize) -> WeightManifest {
        let mut m = WeightManifest::default();
        m.files.push(PathBuf::from("weights.bin"));
        let mut offset = 0u64;
        for &(layer, dtype) in layers {
            for role in ShardRole::ALL {
                let (rows, cols) = (8, 64);
                let nbytes = (dtype.row_size(cols).unwrap() * rows * n_expert) as u64;
                m.tensors.insert(
                    naming.tensor_name(layer, role),
                    TensorEntry {
                        file_index: 0,
                        offset,
                        nbytes,
                        dtype,
                        shape: vec![n_expert, rows, cols],
                    },
                );
                offset += nbytes;
            }
        }
        m
    }

    #[test]
    fn test_expert_locations_follow_stride() {
        let naming = ShardNaming::default();
        let m = manifest(&naming, &[(1, DType::U8), (2, DType::U8)], 4);
        let model = ModelConfig::new(3, 1, 4, 2);
        let index = DiskIndex::build(&m, &model, &naming, 32).unwrap();

        assert_eq!(index.n_layers(), 2);
        let gate = m.get("blk.2.ffn_gate_exps.weight").unwrap();
        let loc = index.location(1, 3, ShardRole::Gate).unwrap();
        assert_eq!(loc.byte_offset, gate.offset + 3 * 512);
        assert_eq!(index.format(0).unwrap().expert_bytes(ShardRole::Down), 512);
        assert!(matches!(
            index.location(0, 4, ShardRole::Up),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_expert_count_mismatch() {
        let naming = ShardNaming::default();
        let m = manifest(&naming, &[(0, DType::U8)], 4);
        let model = ModelConfig::new(1, 0, 8, 2);
        assert!(matches!(
            DiskIndex::build(&m, &model, &naming, 32),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_extra_layer_in_manifest() {
        let naming = ShardNaming::default();
        let m = manifest(&naming, &[(0, DType::U8), (1, DType::U8)], 4);
        let model = ModelConfig::new(1, 0, 4, 2);
        assert!(matches!(
            DiskIndex::build(&m, &model, &naming, 32),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_layer_in_manifest() {
        let naming = ShardNaming::default();
        let m = manifest(&naming, &[(0, DType::U8), (1, DType::U8)], 4);
        let model = ModelConfig::new(3, 0, 4, 2);
        match DiskIndex::build(&m, &model, &naming, 32) {
            Err(Error::Config(msg)) => assert!(msg.contains("blk.2.ffn_up_exps.weight"), "{}", msg),
            other => panic!("expected Config error, got {:?}", other.map(|i| i.n_layers())),
        }
    }

    #[test]
    fn test_pool_format_is_widest_layer() {
        let naming = ShardNaming::default();
        let m = manifest(&naming, &[(0, DType::Q4_0), (1, DType::Q8_0), (2, DType::Q4_0)], 2);
        let model = ModelConfig::new(3, 0, 2, 1);
        let index = DiskIndex::build(&m, &model, &naming, 32).unwrap();

        let up = index.roles()[ShardRole::Up.index()];
        assert_eq!(up.dtype, DType::Q8_0);
        assert_eq!(up.slot_bytes, 68 * 8);
        assert_eq!(index.format(2).unwrap().dtype(ShardRole::Up), DType::Q4_0);
        assert_eq!(index.format(2).unwrap().expert_bytes(ShardRole::Up), 36 * 8);
    }

    #[test]
    fn test_misaligned_stride_rejected() {
        let naming = ShardNaming::default();
        let m = manifest(&naming, &[(0, DType::U8)], 2);
        let model = ModelConfig::new(1, 0, 2, 1);
        assert!(matches!(
            DiskIndex::build(&m, &model, &naming, 1024),
            Err(Error::Config(_))
        ));
    }
}
