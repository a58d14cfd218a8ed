//! Fixed-capacity expert slot pool
//!
//! One arena per shard role. Slot `i` lives at `i * slot_bytes(role)` in
//! every arena at once, so a single [`SlotIndex`] addresses an expert's
//! complete weights. Nothing outside this module sees arena addresses.

mod allocator;
mod backend;

pub use allocator::{SlotAllocator, SlotIndex};
pub use backend::{Backend, Buffer, CpuBackend};
pub(crate) use backend::read_full;

use crate::expert::ShardRole;
use crate::tensor::{DType, RegionView};
use crate::{Error, Result};
use tracing::info;

/// Layout of one role's slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleGeometry {
    /// Storage format the region is sized for
    pub dtype: DType,
    /// Elements per row
    pub cols: usize,
    /// Rows per expert
    pub rows: usize,
    /// Bytes per slot
    pub slot_bytes: usize,
}

impl RoleGeometry {
    /// Geometry for an expert of `rows x cols` elements stored as `dtype`
    pub fn new(dtype: DType, cols: usize, rows: usize) -> Result<Self> {
        let row = dtype.row_size(cols).ok_or_else(|| {
            Error::Config(format!(
                "{} columns is not a multiple of the {} block size {}",
                cols,
                dtype,
                dtype.block_size()
            ))
        })?;
        Ok(Self {
            dtype,
            cols,
            rows,
            slot_bytes: row * rows,
        })
    }
}

/// Number of slots a memory budget affords:
/// `floor(utilization * memory_total / group_bytes)`
pub fn slots_for_budget(utilization: f32, memory_total: u64, group_bytes: usize) -> usize {
    if group_bytes == 0 || !(utilization > 0.0) {
        return 0;
    }
    let available = (utilization.min(1.0) as f64 * memory_total as f64) as u64;
    (available / group_bytes as u64) as usize
}

/// Three role regions of `n_slots` fixed-width slots each
pub struct SlotPool {
    roles: [RoleGeometry; 3],
    n_slots: usize,
    regions: [Box<dyn Buffer>; 3],
    backend: String,
}

impl SlotPool {
    /// Allocate the regions on `backend`
    pub fn new(roles: [RoleGeometry; 3], n_slots: usize, backend: &dyn Backend) -> Result<Self> {
        if n_slots == 0 {
            return Err(Error::Memory("pool has no slots".to_string()));
        }
        let alloc = |role: ShardRole| -> Result<Box<dyn Buffer>> {
            let bytes = roles[role.index()]
                .slot_bytes
                .checked_mul(n_slots)
                .ok_or_else(|| Error::Memory(format!("{} region size overflows", role)))?;
            backend.alloc_buffer(bytes)
        };
        let regions = [alloc(ShardRole::Up)?, alloc(ShardRole::Gate)?, alloc(ShardRole::Down)?];

        let pool = Self {
            roles,
            n_slots,
            regions,
            backend: backend.name().to_string(),
        };
        info!(
            "{} expert pool: {} slots, {:.2} MiB",
            pool.backend,
            n_slots,
            pool.total_size() as f64 / 1024.0 / 1024.0
        );
        Ok(pool)
    }

    /// Slots per region
    pub fn n_slots(&self) -> usize {
        self.n_slots
    }

    /// Geometry of one role
    pub fn geometry(&self, role: ShardRole) -> &RoleGeometry {
        &self.roles[role.index()]
    }

    /// Bytes of one slot across all three roles
    pub fn group_bytes(&self) -> usize {
        self.roles.iter().map(|r| r.slot_bytes).sum()
    }

    /// Storage region of one role
    pub fn region(&self, role: ShardRole) -> &dyn Buffer {
        self.regions[role.index()].as_ref()
    }

    /// Byte offset of `slot` within the region of `role`
    pub fn slot_offset(&self, role: ShardRole, slot: SlotIndex) -> usize {
        slot * self.roles[role.index()].slot_bytes
    }

    /// Whether file bytes can be read straight into the regions
    pub fn is_host(&self) -> bool {
        self.regions.iter().all(|r| r.is_host())
    }

    /// Backend the regions live on
    pub fn backend_name(&self) -> &str {
        &self.backend
    }

    /// Pool byte footprint
    pub fn total_size(&self) -> usize {
        self.regions.iter().map(|r| r.size()).sum()
    }

    /// View of a region in its own storage format
    pub fn view(&self, role: ShardRole) -> Result<RegionView> {
        let g = self.geometry(role);
        RegionView::contiguous(g.dtype, g.cols, g.rows, self.n_slots)
    }
}
