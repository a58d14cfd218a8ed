//! Element formats and views over pool storage
//!
//! The pool keeps one arena per shard role. Downstream computation never
//! holds addresses into an arena; it receives a [`RegionView`] describing
//! how to walk the arena and a slot index saying where to start.

mod dtype;
pub mod view;

pub use dtype::DType;
pub use view::{index_safetensors, TensorSpan};

use crate::{Error, Result};
use std::ops::Range;

/// A 3-D view `[slot][row][col]` over one pool region.
///
/// `ne` holds the extents innermost first (cols, rows, slots) and `nb` the
/// matching byte strides (block, row, slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionView {
    /// Element format the view interprets the bytes as
    pub dtype: DType,
    /// Extents: columns, rows, slots
    pub ne: [usize; 3],
    /// Byte strides: block, row, slot
    pub nb: [usize; 3],
    /// True when the strides were substituted for a format that differs
    /// from the one the region was sized for
    pub strided: bool,
}

impl RegionView {
    /// View a region exactly as it was laid out
    pub fn contiguous(dtype: DType, cols: usize, rows: usize, n_slots: usize) -> Result<Self> {
        let row = dtype.row_size(cols).ok_or_else(|| Error::ShapeMismatch {
            expected: vec![dtype.block_size()],
            got: vec![cols],
        })?;
        Ok(Self {
            dtype,
            ne: [cols, rows, n_slots],
            nb: [dtype.type_size(), row, row * rows],
            strided: false,
        })
    }

    /// Reinterpret this view with another element format, keeping the slot
    /// stride of the underlying region
    pub fn with_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        let row = dtype.row_size(self.ne[0]).ok_or_else(|| Error::ShapeMismatch {
            expected: vec![dtype.block_size()],
            got: vec![self.ne[0]],
        })?;
        if row * self.ne[1] > self.nb[2] {
            return Err(Error::Config(format!(
                "{} expert of {} bytes does not fit a {}-byte slot",
                dtype,
                row * self.ne[1],
                self.nb[2]
            )));
        }
        Ok(Self {
            dtype,
            ne: self.ne,
            nb: [dtype.type_size(), row, self.nb[2]],
            strided: true,
        })
    }

    /// Bytes occupied by one expert in this view
    pub fn expert_bytes(&self) -> usize {
        self.nb[1] * self.ne[1]
    }

    /// Byte range of the expert held in `slot`
    pub fn slot_range(&self, slot: usize) -> Option<Range<usize>> {
        if slot >= self.ne[2] {
            return None;
        }
        let start = slot * self.nb[2];
        Some(start..start + self.expert_bytes())
    }

    /// Byte range of one row of the expert held in `slot`
    pub fn row_range(&self, slot: usize, row: usize) -> Option<Range<usize>> {
        if row >= self.ne[1] {
            return None;
        }
        let start = self.slot_range(slot)?.start + row * self.nb[1];
        Some(start..start + self.nb[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        let view = RegionView::contiguous(DType::F16, 64, 8, 4).unwrap();
        assert_eq!(view.nb, [2, 128, 1024]);
        assert_eq!(view.slot_range(3), Some(3072..4096));
        assert_eq!(view.slot_range(4), None);
        assert_eq!(view.row_range(1, 2), Some(1024 + 256..1024 + 384));
    }

    #[test]
    fn test_strided_substitution_keeps_slot_stride() {
        let base = RegionView::contiguous(DType::Q8_0, 64, 8, 4).unwrap();
        let view = base.with_dtype(DType::Q4_0).unwrap();
        assert!(view.strided);
        assert_eq!(view.nb, [18, 36, base.nb[2]]);
        assert_eq!(view.slot_range(1), Some(base.nb[2]..base.nb[2] + 36 * 8));
    }

    #[test]
    fn test_wider_format_rejected() {
        let base = RegionView::contiguous(DType::Q4_0, 64, 8, 4).unwrap();
        assert!(base.with_dtype(DType::F32).is_err());
    }
}
