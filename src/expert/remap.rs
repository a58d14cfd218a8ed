//! Selection-to-slot remapping kernel
//!
//! Turns a `[tokens x top_k]` tensor of selected expert ids into a tensor
//! of pool slot indices of the same shape. With more than one token
//! (prompt processing) the node's layer is made resident once and every
//! worker maps its own token range. With a single token (decode) worker 0
//! checks and maps each selected expert on its own.

use super::ExpertCache;
use crate::{Error, Result};
use rayon::prelude::*;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::trace;

/// Selected expert ids produced by one top-k node at one step
#[derive(Debug, Clone, Copy)]
pub struct Selection<'a> {
    /// Top-k node name, mapped to a MoE layer by the cache
    pub node: &'a str,
    /// Evaluation step; the layer check runs once per (node, step)
    pub step: u64,
    /// Row-major ids, `n_ids` per token
    pub ids: &'a [i32],
    /// Experts selected per token
    pub n_ids: usize,
}

impl<'a> Selection<'a> {
    pub fn new(node: &'a str, step: u64, ids: &'a [i32], n_ids: usize) -> Self {
        Self {
            node,
            step,
            ids,
            n_ids,
        }
    }

    pub fn n_tokens(&self) -> usize {
        if self.n_ids == 0 {
            0
        } else {
            self.ids.len() / self.n_ids
        }
    }

    /// More than one token: the whole layer is loaded up front
    pub fn is_bulk(&self) -> bool {
        self.n_tokens() > 1
    }

    /// Check the ids form whole rows and fit a destination of `dst_len`
    pub fn validate(&self, dst_len: usize) -> Result<()> {
        if self.n_ids == 0 || self.ids.len() % self.n_ids != 0 {
            return Err(Error::ShapeMismatch {
                expected: vec![self.n_tokens(), self.n_ids],
                got: vec![self.ids.len()],
            });
        }
        if dst_len != self.ids.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.n_tokens(), self.n_ids],
                got: vec![dst_len],
            });
        }
        Ok(())
    }
}

fn expert_id(id: i32) -> Result<usize> {
    usize::try_from(id).map_err(|_| Error::invariant(format!("negative expert id {}", id)))
}

fn slot_value(slot: usize) -> Result<i32> {
    i32::try_from(slot).map_err(|_| Error::invariant(format!("slot {} does not fit i32", slot)))
}

/// Kernel body for worker `ith` of `nth`: write the slot of every selected
/// expert into `dst`
pub fn remap_selection(
    dst: &[AtomicI32],
    sel: &Selection<'_>,
    ith: usize,
    nth: usize,
    cache: &ExpertCache,
) -> Result<()> {
    sel.validate(dst.len())?;
    if nth == 0 || ith >= nth {
        return Err(Error::invariant(format!("worker {} of {}", ith, nth)));
    }

    let n_tokens = sel.n_tokens();
    if sel.is_bulk() {
        let layer = cache.prepare_node(sel)?;

        let slots = cache.layer_slots(layer)?;

        let dr = (n_tokens + nth - 1) / nth;
        let ir0 = (dr * ith).min(n_tokens);
        let ir1 = (ir0 + dr).min(n_tokens);
        for i in ir0 * sel.n_ids..ir1 * sel.n_ids {
            let expert = expert_id(sel.ids[i])?;
            let slot = slots
                .get(expert)
                .ok_or_else(|| {
                    Error::invariant(format!("expert {} outside {} experts", expert, slots.len()))
                })?
                .ok_or_else(|| {
                    Error::invariant(format!("expert ({}, {}) mapped while on disk", layer, expert))
                })?;
            dst[i].store(slot_value(slot)?, Ordering::Relaxed);
        }
        trace!("{} worker {}: tokens {}..{}", sel.node, ith, ir0, ir1);
        return Ok(());
    }

    if ith != 0 {
        return Ok(());
    }
    let layer = cache.layer_for_node(sel.node).ok_or_else(|| {
        Error::invariant(format!("no MoE layer registered for node {}", sel.node))
    })?;
    let mut pinned = Vec::with_capacity(sel.ids.len());
    for (i, &id) in sel.ids.iter().enumerate() {
        let expert = expert_id(id)?;
        let slot = cache.check_expert_pinned(layer, expert, &pinned)?;
        pinned.push(expert);
        dst[i].store(slot_value(slot)?, Ordering::Relaxed);
    }
    Ok(())
}

/// Run the kernel for one node on `n_threads` rayon workers and return the
/// slot tensor.
///
/// For bulk selections the layer check completes before any worker starts.
pub fn remap_parallel(cache: &ExpertCache, sel: &Selection<'_>, n_threads: usize) -> Result<Vec<i32>> {
    let nth = n_threads.max(1);
    let dst: Vec<AtomicI32> = (0..sel.ids.len()).map(|_| AtomicI32::new(-1)).collect();
    sel.validate(dst.len())?;
    if sel.is_bulk() {
        cache.prepare_node(sel)?;
    }

    (0..nth)
        .into_par_iter()
        .try_for_each(|ith| remap_selection(&dst, sel, ith, nth, cache))?;

    Ok(dst.into_iter().map(AtomicI32::into_inner).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_count_and_mode() {
        let ids = [1, 2, 3, 4, 5, 6];
        let sel = Selection::new("ffn_moe_topk-1", 0, &ids, 2);
        assert_eq!(sel.n_tokens(), 3);
        assert!(sel.is_bulk());

        let decode = Selection::new("ffn_moe_topk-1", 1, &ids[..2], 2);
        assert_eq!(decode.n_tokens(), 1);
        assert!(!decode.is_bulk());
    }

    #[test]
    fn test_shape_validation() {
        let ids = [1, 2, 3];
        assert!(matches!(
            Selection::new("n", 0, &ids, 2).validate(3),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            Selection::new("n", 0, &ids, 0).validate(3),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            Selection::new("n", 0, &ids, 3).validate(4),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(Selection::new("n", 0, &ids, 3).validate(3).is_ok());
    }

    #[test]
    fn test_negative_id_rejected() {
        assert!(matches!(expert_id(-1), Err(Error::Invariant(_))));
        assert_eq!(expert_id(7).unwrap(), 7);
    }
}
