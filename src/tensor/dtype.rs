//! Element formats for expert shards

use serde::{Deserialize, Serialize};

/// Element format of a shard tensor.
///
/// Block-quantized formats pack `block_size()` logical elements into
/// `type_size()` bytes; plain formats have a block size of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// 16-bit brain floating point
    BF16,
    /// 8-bit signed integer
    I8,
    /// 8-bit unsigned integer (raw bytes)
    U8,
    /// 32-bit signed integer
    I32,
    /// 4-bit, 32-element blocks with an f16 scale
    Q4_0,
    /// 4-bit, 32-element blocks with f16 scale and min
    Q4_1,
    /// 8-bit, 32-element blocks with an f16 scale
    Q8_0,
    /// 4-bit k-quant, 256-element super-blocks
    Q4K,
    /// 5-bit k-quant, 256-element super-blocks
    Q5K,
    /// 6-bit k-quant, 256-element super-blocks
    Q6K,
}

impl DType {
    /// Number of logical elements per storage block
    pub fn block_size(&self) -> usize {
        match self {
            DType::Q4_0 | DType::Q4_1 | DType::Q8_0 => 32,
            DType::Q4K | DType::Q5K | DType::Q6K => 256,
            _ => 1,
        }
    }

    /// Size in bytes of one storage block
    pub fn type_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::I8 => 1,
            DType::U8 => 1,
            DType::I32 => 4,
            DType::Q4_0 => 18,
            DType::Q4_1 => 20,
            DType::Q8_0 => 34,
            DType::Q4K => 144,
            DType::Q5K => 176,
            DType::Q6K => 210,
        }
    }

    /// Bytes needed for a row of `n` elements, or `None` if `n` is not a
    /// whole number of blocks.
    pub fn row_size(&self, n: usize) -> Option<usize> {
        let block = self.block_size();
        if n % block != 0 {
            return None;
        }
        Some(n / block * self.type_size())
    }

    /// Is this a block-quantized type?
    pub fn is_quantized(&self) -> bool {
        self.block_size() > 1
    }

    /// Parse from safetensors dtype string
    pub fn from_safetensors(s: &str) -> Option<Self> {
        match s {
            "F32" => Some(DType::F32),
            "F16" => Some(DType::F16),
            "BF16" => Some(DType::BF16),
            "I8" => Some(DType::I8),
            "U8" => Some(DType::U8),
            "I32" => Some(DType::I32),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
