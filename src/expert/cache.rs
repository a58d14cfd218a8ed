//! Demand-paging controller
//!
//! Owns the residency table, the slot pool and the loader. All table and
//! allocator mutations happen under one state lock; file reads happen
//! outside it, after the destination slots are reserved. A per-layer row
//! lock serializes checks on the same layer so two callers never load the
//! same expert twice.

use super::remap::Selection;
use super::{
    ActivityTracker, DiskIndex, ExpertCell, ExpertState, ResidencyTable, ShardLoader,
    ShardNaming, ShardRole,
};
use crate::model::{ModelConfig, WeightManifest};
use crate::pool::{slots_for_budget, Backend, SlotAllocator, SlotIndex, SlotPool};
use crate::tensor::RegionView;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, trace};

/// Cache sizing and naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fraction of backend memory the pool may use
    pub utilization: f32,
    /// Memory size to budget against instead of querying the backend
    pub memory_total: Option<u64>,
    /// Upper bound on pool slots
    pub max_slots: Option<usize>,
    /// Required alignment of per-expert strides, in bytes
    pub alignment: usize,
    /// Tensor and node naming
    pub naming: ShardNaming,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            utilization: 0.5,
            memory_total: None,
            max_slots: None,
            alignment: 32,
            naming: ShardNaming::default(),
        }
    }
}

impl CacheConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.utilization > 0.0 && self.utilization <= 1.0) {
            return Err(Error::Config(format!(
                "utilization {} outside (0, 1]",
                self.utilization
            )));
        }
        if self.alignment == 0 {
            return Err(Error::Config("alignment must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Checks that found the data resident
    pub hits: u64,
    /// Checks that had to load
    pub misses: u64,
    /// Single experts loaded
    pub expert_loads: u64,
    /// Whole layers loaded
    pub layer_loads: u64,
    /// Experts or layer blocks returned to disk to make room
    pub evictions: u64,
    /// Bytes read from backing files
    pub bytes_read: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expert_loads: AtomicU64,
    layer_loads: AtomicU64,
    evictions: AtomicU64,
    bytes_read: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

struct CacheState {
    table: ResidencyTable,
    alloc: SlotAllocator,
    activity: ActivityTracker,
    /// Block-resident layers, oldest first
    ring: VecDeque<usize>,
}

/// Run-once gate for one selection node at one step
struct NodeGate {
    step: u64,
    done: Arc<OnceLock<std::result::Result<(), String>>>,
}

/// Expert residency cache over a fixed slot pool
pub struct ExpertCache {
    config: CacheConfig,
    n_expert: usize,
    pool: SlotPool,
    loader: ShardLoader,
    state: Mutex<CacheState>,
    rows: Vec<Mutex<()>>,
    gates: Mutex<HashMap<String, NodeGate>>,
    node_layers: RwLock<HashMap<String, usize>>,
    counters: Counters,
}

impl ExpertCache {
    /// Build the cache for a model directory.
    ///
    /// Uses `manifest.json` when the directory has one, otherwise indexes
    /// the directory's safetensors files.
    pub fn from_dir(
        model_dir: impl AsRef<Path>,
        config: CacheConfig,
        backend: &dyn Backend,
    ) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let model = ModelConfig::from_dir(model_dir)?;
        let manifest = WeightManifest::open(model_dir)?;
        Self::new(&manifest, &model, config, backend)
    }

    /// Index the manifest, size the pool and start with every expert on disk
    pub fn new(
        manifest: &WeightManifest,
        model: &ModelConfig,
        config: CacheConfig,
        backend: &dyn Backend,
    ) -> Result<Self> {
        config.validate()?;
        let index = DiskIndex::build(manifest, model, &config.naming, config.alignment)?;
        let n_layers = index.n_layers();
        let n_expert = index.n_expert();
        let roles = index.roles();

        let group_bytes: usize = roles.iter().map(|r| r.slot_bytes).sum();
        let memory_total = match config.memory_total {
            Some(bytes) => bytes,
            None => backend.memory_total()?,
        };
        let mut n_slots = slots_for_budget(config.utilization, memory_total, group_bytes)
            .min(n_layers * n_expert);
        if let Some(max) = config.max_slots {
            n_slots = n_slots.min(max);
        }
        if n_slots == 0 {
            return Err(Error::Memory(format!(
                "{:.0}% of {} bytes holds no {}-byte expert slot",
                config.utilization * 100.0,
                memory_total,
                group_bytes
            )));
        }
        let pool = SlotPool::new(roles, n_slots, backend)?;

        let mut cells = Vec::with_capacity(n_layers * n_expert);
        let mut formats = Vec::with_capacity(n_layers);
        for il in 0..n_layers {
            for e in 0..n_expert {
                cells.push(ExpertCell::new([
                    index.location(il, e, ShardRole::Up)?,
                    index.location(il, e, ShardRole::Gate)?,
                    index.location(il, e, ShardRole::Down)?,
                ]));
            }
            formats.push(*index.format(il)?);
        }
        let staging = formats.iter().map(|f| f.max_expert_bytes()).max().unwrap_or(0);
        let table = ResidencyTable::new(n_expert, cells, formats)?;
        let loader = ShardLoader::new(index.files(), staging);

        let node_layers = (0..n_layers)
            .map(|il| (config.naming.node_name(model.absolute_layer(il)), il))
            .collect();

        info!(
            "Expert cache: {} layers x {} experts, {} slots ({} full layers)",
            n_layers,
            n_expert,
            n_slots,
            n_slots / n_expert
        );

        Ok(Self {
            config,
            n_expert,
            pool,
            loader,
            state: Mutex::new(CacheState {
                table,
                alloc: SlotAllocator::new(n_slots),
                activity: ActivityTracker::new(n_layers),
                ring: VecDeque::new(),
            }),
            rows: (0..n_layers).map(|_| Mutex::new(())).collect(),
            gates: Mutex::new(HashMap::new()),
            node_layers: RwLock::new(node_layers),
            counters: Counters::default(),
        })
    }

    /// Sizing and naming the cache was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of MoE layers
    pub fn n_layers(&self) -> usize {
        self.rows.len()
    }

    /// Experts per MoE layer
    pub fn n_expert(&self) -> usize {
        self.n_expert
    }

    /// Slots in the pool
    pub fn n_slots(&self) -> usize {
        self.pool.n_slots()
    }

    /// Pool byte footprint
    pub fn total_size(&self) -> usize {
        self.pool.total_size()
    }

    /// Underlying slot pool
    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    fn row(&self, layer: usize) -> Result<&Mutex<()>> {
        self.rows.get(layer).ok_or_else(|| {
            Error::invariant(format!("layer {} outside {} MoE layers", layer, self.rows.len()))
        })
    }

    /// Make every expert of `layer` resident as one contiguous block.
    ///
    /// A miss first returns the layer's individually loaded experts to the
    /// pool, then takes a fresh block if one fits, else reuses the block of
    /// the oldest resident layer, else evicts single experts until a block
    /// fits.
    pub fn check_layer(&self, layer: usize) -> Result<()> {
        let _row = self.row(layer)?.lock();

        let (head, base, format) = {
            let mut st = self.state.lock();
            if st.table.layer_head(layer)?.is_some() {
                Counters::bump(&self.counters.hits, 1);
                trace!("Layer {} resident", layer);
                return Ok(());
            }
            Counters::bump(&self.counters.misses, 1);

            let scattered = st.table.scattered(layer)?;
            for (expert, slot) in scattered {
                st.alloc.free(slot, 1);
                st.table.mark(layer, expert, ExpertState::OnDisk, None)?;
                st.activity.remove(layer, expert);
            }
            let head = self.reserve_block(&mut st, layer)?;
            let base = st.table.at(layer, 0)?.locations;
            let format = *st.table.format(layer)?;
            (head, base, format)
        };

        let loaded = self
            .loader
            .load_layer(&self.pool, &base, &format, self.n_expert, head);

        let mut st = self.state.lock();
        match loaded {
            Ok(bytes) => {
                st.table.mark_layer(layer, ExpertState::InMemory, Some(head))?;
                st.ring.push_back(layer);
                Counters::bump(&self.counters.layer_loads, 1);
                Counters::bump(&self.counters.bytes_read, bytes);
                debug!(
                    "Loaded layer {} into slots {}..{} ({} bytes)",
                    layer,
                    head,
                    head + self.n_expert,
                    bytes
                );
                Ok(())
            }
            Err(e) => {
                st.alloc.free(head, self.n_expert);
                Err(e)
            }
        }
    }

    /// Make one expert resident and return its slot
    pub fn check_expert(&self, layer: usize, expert: usize) -> Result<SlotIndex> {
        self.check_expert_pinned(layer, expert, &[])
    }

    /// Like [`check_expert`](Self::check_expert), but never evicts the
    /// experts of `layer` listed in `pinned`
    pub fn check_expert_pinned(
        &self,
        layer: usize,
        expert: usize,
        pinned: &[usize],
    ) -> Result<SlotIndex> {
        let _row = self.row(layer)?.lock();

        let (slot, locations, format) = {
            let mut st = self.state.lock();
            let (resident, locations) = {
                let cell = st.table.at(layer, expert)?;
                (cell.slot(), cell.locations)
            };
            if let Some(slot) = resident {
                if st.activity.contains(layer, expert) {
                    st.activity.touch(layer, expert);
                }
                Counters::bump(&self.counters.hits, 1);
                trace!("Expert ({}, {}) resident in slot {}", layer, expert, slot);
                return Ok(slot);
            }
            Counters::bump(&self.counters.misses, 1);

            let slot = self.reserve_slot(&mut st, layer, pinned)?;
            let format = *st.table.format(layer)?;
            (slot, locations, format)
        };

        let loaded = self
            .loader
            .load_expert(&self.pool, &locations, &format, slot);

        let mut st = self.state.lock();
        match loaded {
            Ok(bytes) => {
                st.table
                    .mark(layer, expert, ExpertState::InMemory, Some(slot))?;
                st.activity.admit(layer, expert);
                Counters::bump(&self.counters.expert_loads, 1);
                Counters::bump(&self.counters.bytes_read, bytes);
                debug!("Loaded expert ({}, {}) into slot {}", layer, expert, slot);
                Ok(slot)
            }
            Err(e) => {
                st.alloc.free(slot, 1);
                Err(e)
            }
        }
    }

    /// Slot currently holding `(layer, expert)`.
    ///
    /// Fails with [`Error::Invariant`] when the expert is on disk: callers
    /// must check the layer or expert first.
    pub fn id_map(&self, layer: usize, expert: usize) -> Result<SlotIndex> {
        let st = self.state.lock();
        st.table.at(layer, expert)?.slot().ok_or_else(|| {
            Error::invariant(format!(
                "expert ({}, {}) mapped while on disk",
                layer, expert
            ))
        })
    }

    /// Snapshot of the slot of every expert of `layer`, `None` when on disk
    pub fn layer_slots(&self, layer: usize) -> Result<Vec<Option<SlotIndex>>> {
        let st = self.state.lock();
        (0..self.n_expert)
            .map(|e| Ok(st.table.at(layer, e)?.slot()))
            .collect()
    }

    /// Load whole layers from layer 0 upward while fresh blocks fit.
    /// Returns the number of layers loaded.
    pub fn prefill_init(&self) -> Result<usize> {
        let mut loaded = 0;
        for layer in 0..self.n_layers() {
            let _row = self.row(layer)?.lock();
            let (head, base, format) = {
                let mut st = self.state.lock();
                if st.table.layer_head(layer)?.is_some() {
                    continue;
                }
                let head = match st.alloc.allocate(self.n_expert) {
                    Some(head) => head,
                    None => break,
                };
                (head, st.table.at(layer, 0)?.locations, *st.table.format(layer)?)
            };

            let loaded_layer = self
                .loader
                .load_layer(&self.pool, &base, &format, self.n_expert, head);
            let mut st = self.state.lock();
            match loaded_layer {
                Ok(bytes) => {
                    st.table.mark_layer(layer, ExpertState::InMemory, Some(head))?;
                    st.ring.push_back(layer);
                    Counters::bump(&self.counters.layer_loads, 1);
                    Counters::bump(&self.counters.bytes_read, bytes);
                    loaded += 1;
                }
                Err(e) => {
                    st.alloc.free(head, self.n_expert);
                    return Err(e);
                }
            }
        }
        info!("Prefilled {} of {} layers", loaded, self.n_layers());
        Ok(loaded)
    }

    /// Return one individually loaded expert to disk.
    ///
    /// Returns `false` when it was already on disk. Experts inside a layer
    /// block cannot be evicted alone; use [`evict_layer`](Self::evict_layer).
    pub fn evict_expert(&self, layer: usize, expert: usize) -> Result<bool> {
        let _row = self.row(layer)?.lock();
        let mut st = self.state.lock();
        if st.table.layer_head(layer)?.is_some() {
            return Err(Error::invariant(format!(
                "expert ({}, {}) is part of a layer block",
                layer, expert
            )));
        }
        if st.table.at(layer, expert)?.slot().is_none() {
            return Ok(false);
        }
        self.evict_unit(&mut st, layer, expert)?;
        Ok(true)
    }

    /// Return every resident expert of `layer` to disk. Returns slots freed.
    pub fn evict_layer(&self, layer: usize) -> Result<usize> {
        let _row = self.row(layer)?.lock();
        let mut st = self.state.lock();
        if let Some(head) = st.table.layer_head(layer)? {
            st.table.mark_layer(layer, ExpertState::OnDisk, None)?;
            st.alloc.free(head, self.n_expert);
            st.ring.retain(|&l| l != layer);
            Counters::bump(&self.counters.evictions, 1);
            debug!("Evicted layer {} from slots {}..", layer, head);
            return Ok(self.n_expert);
        }
        let scattered = st.table.scattered(layer)?;
        for &(expert, _) in &scattered {
            self.evict_unit(&mut st, layer, expert)?;
        }
        Ok(scattered.len())
    }

    /// Residency of one expert
    pub fn residency(&self, layer: usize, expert: usize) -> Result<ExpertState> {
        Ok(self.state.lock().table.at(layer, expert)?.state())
    }

    /// Aggregate residency of a layer
    pub fn layer_state(&self, layer: usize) -> Result<ExpertState> {
        self.state.lock().table.layer_state(layer)
    }

    /// Free slot runs as `(start, len)`
    pub fn free_ranges(&self) -> Vec<(SlotIndex, usize)> {
        self.state.lock().alloc.free_ranges()
    }

    /// Slots held by resident experts
    pub fn resident_slots(&self) -> usize {
        self.state.lock().table.resident_slots()
    }

    /// Snapshot of the hit, miss, load and eviction counters
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            expert_loads: c.expert_loads.load(Ordering::Relaxed),
            layer_loads: c.layer_loads.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Copy a resident expert's shard out of the pool, in its layer's format
    pub fn read_expert(&self, layer: usize, expert: usize, role: ShardRole) -> Result<Vec<u8>> {
        let st = self.state.lock();
        let slot = st.table.at(layer, expert)?.slot().ok_or_else(|| {
            Error::invariant(format!("expert ({}, {}) is on disk", layer, expert))
        })?;
        let mut out = vec![0u8; st.table.format(layer)?.expert_bytes(role)];
        self.pool
            .region(role)
            .get(self.pool.slot_offset(role, slot), &mut out)?;
        Ok(out)
    }

    /// View of a role region in the format of `layer`.
    ///
    /// Matches the pool's own view when the layer uses the pool format;
    /// otherwise the element strides are substituted and the slot stride
    /// kept.
    pub fn view(&self, layer: usize, role: ShardRole) -> Result<RegionView> {
        let dtype = self.state.lock().table.format(layer)?.dtype(role);
        self.pool.view(role)?.with_dtype(dtype)
    }

    /// Up-projection view in the format of `layer`
    pub fn get_up(&self, layer: usize) -> Result<RegionView> {
        self.view(layer, ShardRole::Up)
    }

    /// Gate-projection view in the format of `layer`
    pub fn get_gate(&self, layer: usize) -> Result<RegionView> {
        self.view(layer, ShardRole::Gate)
    }

    /// Down-projection view in the format of `layer`
    pub fn get_down(&self, layer: usize) -> Result<RegionView> {
        self.view(layer, ShardRole::Down)
    }

    /// MoE layer a selection node belongs to
    pub fn layer_for_node(&self, node: &str) -> Option<usize> {
        self.node_layers.read().get(node).copied()
    }

    /// Map an extra node name to a MoE layer
    pub fn register_node(&self, node: impl Into<String>, layer: usize) -> Result<()> {
        self.row(layer)?;
        self.node_layers.write().insert(node.into(), layer);
        Ok(())
    }

    /// Make the node's layer resident once for `sel.step`.
    ///
    /// Every caller for the same node and step blocks until the first one's
    /// [`check_layer`](Self::check_layer) has returned, then sees its
    /// outcome. A new step value re-arms the gate. Returns the layer.
    pub fn prepare_node(&self, sel: &Selection<'_>) -> Result<usize> {
        let layer = self.layer_for_node(sel.node).ok_or_else(|| {
            Error::invariant(format!("no MoE layer registered for node {}", sel.node))
        })?;

        let done = {
            let mut gates = self.gates.lock();
            let gate = gates
                .entry(sel.node.to_string())
                .or_insert_with(|| NodeGate {
                    step: sel.step,
                    done: Arc::new(OnceLock::new()),
                });
            if gate.step != sel.step {
                gate.step = sel.step;
                gate.done = Arc::new(OnceLock::new());
            }
            Arc::clone(&gate.done)
        };

        let mut own = None;
        let outcome = done.get_or_init(|| match self.check_layer(layer) {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = e.to_string();
                own = Some(e);
                Err(reason)
            }
        });
        match (outcome, own) {
            (Ok(()), _) => Ok(layer),
            (Err(_), Some(e)) => Err(e),
            (Err(reason), None) => Err(Error::LayerCheck {
                layer,
                reason: reason.clone(),
            }),
        }
    }

    fn evict_unit(&self, st: &mut CacheState, layer: usize, expert: usize) -> Result<()> {
        let slot = st.table.at(layer, expert)?.slot().ok_or_else(|| {
            Error::invariant(format!("evicting expert ({}, {}) already on disk", layer, expert))
        })?;
        st.alloc.free(slot, 1);
        st.table.mark(layer, expert, ExpertState::OnDisk, None)?;
        st.activity.remove(layer, expert);
        Counters::bump(&self.counters.evictions, 1);
        debug!("Evicted expert ({}, {}) from slot {}", layer, expert, slot);
        Ok(())
    }

    /// Hand the oldest resident layer block other than `keep` back to the
    /// caller without freeing it
    fn take_oldest_block(&self, st: &mut CacheState, keep: usize) -> Result<Option<SlotIndex>> {
        let pos = match st.ring.iter().position(|&l| l != keep) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let old = st
            .ring
            .remove(pos)
            .ok_or_else(|| Error::invariant("layer ring index vanished"))?;
        let head = st
            .table
            .layer_head(old)?
            .ok_or_else(|| Error::invariant(format!("ring layer {} has no block", old)))?;
        st.table.mark_layer(old, ExpertState::OnDisk, None)?;
        Counters::bump(&self.counters.evictions, 1);
        debug!("Reclaimed layer {} block at slot {}", old, head);
        Ok(Some(head))
    }

    fn reserve_block(&self, st: &mut CacheState, layer: usize) -> Result<SlotIndex> {
        let n = self.n_expert;
        if let Some(head) = st.alloc.allocate(n) {
            return Ok(head);
        }
        if let Some(head) = self.take_oldest_block(st, layer)? {
            return Ok(head);
        }
        while let Some(victim) = st.activity.victim(|_, _| false) {
            self.evict_unit(st, victim.layer, victim.expert)?;
            if let Some(head) = st.alloc.allocate(n) {
                return Ok(head);
            }
        }
        Err(Error::AllocationExhausted {
            requested: n,
            largest_free: st.alloc.largest_free(),
        })
    }

    fn reserve_slot(&self, st: &mut CacheState, layer: usize, pinned: &[usize]) -> Result<SlotIndex> {
        loop {
            if let Some(slot) = st.alloc.allocate(1) {
                return Ok(slot);
            }
            if let Some(victim) = st
                .activity
                .victim(|l, e| l == layer && pinned.contains(&e))
            {
                self.evict_unit(st, victim.layer, victim.expert)?;
                continue;
            }
            match self.take_oldest_block(st, layer)? {
                Some(head) => st.alloc.free(head, self.n_expert),
                None => {
                    return Err(Error::AllocationExhausted {
                        requested: 1,
                        largest_free: st.alloc.largest_free(),
                    })
                }
            }
        }
    }
}
