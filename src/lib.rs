//! moe-offload: demand-paged expert weights for Mixture-of-Experts models
//!
//! This library lets a sparse MoE model run with only part of its expert
//! weights resident in fast memory. The rest stay in the model's weight
//! files and are paged in when a top-k selection node picks them.
//!
//! ## Key Features
//!
//! - **Slot pool**: one arena per shard role (up, gate, down), addressed by a
//!   single slot index
//! - **Coalescing allocator**: first-fit runs with neighbour merging
//! - **Layer fast path**: whole layers loaded as one contiguous block, with
//!   ring reuse across sequential layers
//! - **Expert path**: single experts loaded on demand for decode, evicted by
//!   hit count when the pool is full
//! - **Mixed quantization**: per-layer formats viewed through strided views
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ExpertCache                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ DiskIndex   │  │ Residency   │  │ remap kernel        │  │
//! │  │ (manifest)  │  │ Table       │  │ (ids -> slots)      │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ ShardLoader │  │ SlotPool    │  │ ActivityTracker     │  │
//! │  │ (file I/O)  │  │ + Allocator │  │ (eviction order)    │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod expert;
pub mod model;
pub mod pool;
pub mod tensor;
pub mod trace;

// Re-exports
pub use error::{Error, Result};
pub use expert::{
    remap_parallel, remap_selection, CacheConfig, CacheStats, ExpertCache, ExpertState,
    Selection, ShardNaming, ShardRole,
};
pub use model::{ModelConfig, WeightManifest};
pub use pool::{Backend, CpuBackend, SlotAllocator, SlotIndex};
pub use tensor::{DType, RegionView};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
