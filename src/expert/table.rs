//! Residency table: where every (layer, expert) currently lives

use super::{ExpertState, LayerFormat, ShardLocation, ShardRole};
use crate::pool::SlotIndex;
use crate::{Error, Result};

/// One (layer, expert) entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertCell {
    /// Disk location per role (up, gate, down)
    pub locations: [ShardLocation; 3],
    slot: Option<SlotIndex>,
}

impl ExpertCell {
    pub fn new(locations: [ShardLocation; 3]) -> Self {
        Self {
            locations,
            slot: None,
        }
    }

    /// `InMemory` exactly when a slot is held
    pub fn state(&self) -> ExpertState {
        match self.slot {
            Some(_) => ExpertState::InMemory,
            None => ExpertState::OnDisk,
        }
    }

    pub fn slot(&self) -> Option<SlotIndex> {
        self.slot
    }

    pub fn location(&self, role: ShardRole) -> ShardLocation {
        self.locations[role.index()]
    }
}

/// `n_layers x n_expert` grid of [`ExpertCell`]s plus per-layer state.
///
/// A layer is `InMemory` only while one contiguous block
/// `head..head + n_expert` holds all of its experts; experts loaded one at
/// a time leave the layer `OnDisk` even when every one of them is resident.
#[derive(Debug, Clone)]
pub struct ResidencyTable {
    n_expert: usize,
    cells: Vec<ExpertCell>,
    layer_head: Vec<Option<SlotIndex>>,
    formats: Vec<LayerFormat>,
}

impl ResidencyTable {
    /// Build a table with every cell `OnDisk`.
    ///
    /// `cells` is row-major: all experts of layer 0, then layer 1, and so on.
    pub fn new(n_expert: usize, cells: Vec<ExpertCell>, formats: Vec<LayerFormat>) -> Result<Self> {
        if n_expert == 0 || cells.len() != formats.len() * n_expert {
            return Err(Error::Config(format!(
                "{} cells do not fill {} layers x {} experts",
                cells.len(),
                formats.len(),
                n_expert
            )));
        }
        Ok(Self {
            n_expert,
            layer_head: vec![None; formats.len()],
            cells,
            formats,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.formats.len()
    }

    pub fn n_expert(&self) -> usize {
        self.n_expert
    }

    fn index(&self, layer: usize, expert: usize) -> Result<usize> {
        if layer >= self.n_layers() || expert >= self.n_expert {
            return Err(Error::invariant(format!(
                "cell ({}, {}) outside {} x {} table",
                layer,
                expert,
                self.n_layers(),
                self.n_expert
            )));
        }
        Ok(layer * self.n_expert + expert)
    }

    fn check_layer_index(&self, layer: usize) -> Result<()> {
        if layer >= self.n_layers() {
            return Err(Error::invariant(format!(
                "layer {} outside table of {} layers",
                layer,
                self.n_layers()
            )));
        }
        Ok(())
    }

    /// Cell at `(layer, expert)`
    pub fn at(&self, layer: usize, expert: usize) -> Result<&ExpertCell> {
        let i = self.index(layer, expert)?;
        Ok(&self.cells[i])
    }

    /// Set state and slot of one cell together.
    ///
    /// `InMemory` requires a slot; `OnDisk` clears it whatever was passed.
    pub fn mark(
        &mut self,
        layer: usize,
        expert: usize,
        state: ExpertState,
        slot: Option<SlotIndex>,
    ) -> Result<()> {
        let i = self.index(layer, expert)?;
        self.cells[i].slot = match (state, slot) {
            (ExpertState::InMemory, Some(s)) => Some(s),
            (ExpertState::InMemory, None) => {
                return Err(Error::invariant(format!(
                    "cell ({}, {}) marked in memory without a slot",
                    layer, expert
                )))
            }
            (ExpertState::OnDisk, _) => None,
        };
        Ok(())
    }

    /// Move a whole layer to the block at `head` or back to disk
    pub fn mark_layer(
        &mut self,
        layer: usize,
        state: ExpertState,
        head: Option<SlotIndex>,
    ) -> Result<()> {
        self.check_layer_index(layer)?;
        let start = layer * self.n_expert;
        let row = &mut self.cells[start..start + self.n_expert];
        match (state, head) {
            (ExpertState::InMemory, Some(head)) => {
                for (j, cell) in row.iter_mut().enumerate() {
                    cell.slot = Some(head + j);
                }
                self.layer_head[layer] = Some(head);
            }
            (ExpertState::InMemory, None) => {
                return Err(Error::invariant(format!(
                    "layer {} marked in memory without a head slot",
                    layer
                )))
            }
            (ExpertState::OnDisk, _) => {
                for cell in row.iter_mut() {
                    cell.slot = None;
                }
                self.layer_head[layer] = None;
            }
        }
        Ok(())
    }

    /// Aggregate state of a layer
    pub fn layer_state(&self, layer: usize) -> Result<ExpertState> {
        Ok(match self.layer_head(layer)? {
            Some(_) => ExpertState::InMemory,
            None => ExpertState::OnDisk,
        })
    }

    /// First slot of the layer's block, when the layer is block-resident
    pub fn layer_head(&self, layer: usize) -> Result<Option<SlotIndex>> {
        self.check_layer_index(layer)?;
        Ok(self.layer_head[layer])
    }

    /// Shard formats of a layer
    pub fn format(&self, layer: usize) -> Result<&LayerFormat> {
        self.check_layer_index(layer)?;
        Ok(&self.formats[layer])
    }

    /// Experts of `layer` that hold a slot outside a layer block
    pub fn scattered(&self, layer: usize) -> Result<Vec<(usize, SlotIndex)>> {
        if self.layer_head(layer)?.is_some() {
            return Ok(Vec::new());
        }
        let start = layer * self.n_expert;
        Ok(self.cells[start..start + self.n_expert]
            .iter()
            .enumerate()
            .filter_map(|(j, c)| c.slot.map(|s| (j, s)))
            .collect())
    }

    /// Slots held by live cells
    pub fn resident_slots(&self) -> usize {
        self.cells.iter().filter(|c| c.slot.is_some()).count()
    }
}
