//! Weight manifest: where every named tensor lives on disk

use crate::tensor::{index_safetensors, DType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Byte location and layout of one tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    /// Index into [`WeightManifest::files`]
    pub file_index: u16,
    /// Absolute byte offset of the payload
    pub offset: u64,
    /// Payload length in bytes
    pub nbytes: u64,
    /// Element format
    pub dtype: DType,
    /// Shape, outermost dimension first
    pub shape: Vec<usize>,
}

/// Tensor name to on-disk location, across one or more backing files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightManifest {
    /// Backing files, addressed by `TensorEntry::file_index`
    pub files: Vec<PathBuf>,
    /// Tensors by name
    pub tensors: BTreeMap<String, TensorEntry>,
}

impl WeightManifest {
    /// File name of a JSON manifest inside a model directory
    pub const FILE_NAME: &'static str = "manifest.json";

    /// Load a model directory's manifest: `manifest.json` when present,
    /// otherwise an index of its safetensors files
    pub fn open(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let json = model_dir.join(Self::FILE_NAME);
        if json.exists() {
            return Self::from_json_file(json);
        }
        Self::from_dir(model_dir)
    }

    /// Index every `*.safetensors` file in a model directory
    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref();

        let mut files: Vec<PathBuf> = std::fs::read_dir(model_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "safetensors"))
            .collect();
        files.sort();
        info!("Found {} safetensors files", files.len());

        if files.is_empty() {
            return Err(Error::Config("No safetensors files found".to_string()));
        }

        Self::from_safetensors(&files)
    }

    /// Index the given safetensors files, in order
    pub fn from_safetensors(paths: &[PathBuf]) -> Result<Self> {
        if paths.len() > u16::MAX as usize {
            return Err(Error::Config(format!("too many weight files: {}", paths.len())));
        }

        let mut manifest = WeightManifest::default();
        for (file_idx, path) in paths.iter().enumerate() {
            debug!("Indexing {:?}", path);
            for span in index_safetensors(path)? {
                manifest.tensors.insert(
                    span.name,
                    TensorEntry {
                        file_index: file_idx as u16,
                        offset: span.offset,
                        nbytes: span.nbytes,
                        dtype: span.dtype,
                        shape: span.shape,
                    },
                );
            }
            manifest.files.push(path.clone());
        }

        info!(
            "Indexed {} tensors across {} files",
            manifest.tensors.len(),
            manifest.files.len()
        );
        Ok(manifest)
    }

    /// Load a JSON manifest. Relative file paths are resolved against the
    /// manifest's own directory.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut manifest: WeightManifest = serde_json::from_str(&text)?;
        if let Some(dir) = path.parent() {
            for file in &mut manifest.files {
                if file.is_relative() {
                    *file = dir.join(&*file);
                }
            }
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write the manifest as JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Look up a tensor by name
    pub fn get(&self, name: &str) -> Result<&TensorEntry> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))
    }

    /// Check if tensor exists
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn validate(&self) -> Result<()> {
        for (name, entry) in &self.tensors {
            if entry.file_index as usize >= self.files.len() {
                return Err(Error::Config(format!(
                    "tensor {} refers to file {} but only {} files are listed",
                    name,
                    entry.file_index,
                    self.files.len()
                )));
            }
        }
        Ok(())
    }
}
