//! Block-wise array cache.
//!
//! The volume is tiled into blocks of the configured shape. A read computes
//! each missing block by a submitted request on `Input`, so distinct blocks
//! are produced in parallel; concurrent readers of the same block share one
//! request. Cached blocks are evicted oldest first once the cache holds
//! more than its memory budget.

use crate::config::CacheConfig;
use roiflow_core::{block_bounds, intersecting_blocks};
use roiflow_graph::{
    ArrayData, Dirty, Error, Meta, Operator, OperatorBuilder, Request, Result, Roi, Slot,
    SlotType, Value,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

enum BlockState {
    Empty,
    Loading(Request<Value>),
    Ready(ArrayData),
}

type BlockEntry = Arc<Mutex<BlockState>>;

#[derive(Default)]
struct CacheState {
    shape: Vec<usize>,
    block_shape: Vec<usize>,
    blocks: HashMap<Vec<usize>, BlockEntry>,
    // Cached blocks in insertion order, with their sizes.
    fifo: VecDeque<(Vec<usize>, usize)>,
    bytes: usize,
    pending: Option<Dirty>,
}

impl CacheState {
    fn forget(&mut self, start: &[usize]) {
        self.blocks.remove(start);
        let mut freed = 0;
        self.fifo.retain(|(key, size)| {
            if key.as_slice() == start {
                freed += size;
                false
            } else {
                true
            }
        });
        self.bytes -= freed;
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.fifo.clear();
        self.bytes = 0;
    }
}

fn lock_block(entry: &BlockEntry) -> MutexGuard<'_, BlockState> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Caches `Input` block by block.
pub struct OpBlockedArrayCache {
    pub input: Slot,
    pub fix_at_current: Slot,
    pub output: Slot,
    config: CacheConfig,
    budget_bytes: usize,
    state: Mutex<CacheState>,
}

impl OpBlockedArrayCache {
    /// Declares the slots and resolves the memory budget.
    ///
    /// # Errors
    /// Returns an error if the budget cannot be resolved.
    pub fn build(b: &mut OperatorBuilder, config: CacheConfig) -> Result<Self> {
        let budget_bytes = config.resolve_budget_bytes()?;
        log::debug!("{}: cache budget {budget_bytes} bytes", b.name());
        Ok(Self {
            input: b.input("Input", SlotType::Array),
            fix_at_current: b.input_with_default("FixAtCurrent", SlotType::Value, false),
            output: b.output("Output", SlotType::Array),
            config,
            budget_bytes,
            state: Mutex::new(CacheState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fixed(&self) -> Result<bool> {
        self.fix_at_current.value()?.as_bool()
    }

    /// Number of blocks currently held.
    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.lock().fifo.len()
    }

    /// Bytes currently held.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.lock().bytes
    }

    #[must_use]
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    fn entry(&self, start: &[usize]) -> BlockEntry {
        Arc::clone(
            self.lock()
                .blocks
                .entry(start.to_vec())
                .or_insert_with(|| Arc::new(Mutex::new(BlockState::Empty))),
        )
    }

    /// Records a finished block and evicts the oldest blocks over budget.
    fn admit(&self, start: &[usize], entry: &BlockEntry, size: usize) {
        let mut state = self.lock();
        let current = state
            .blocks
            .get(start)
            .is_some_and(|e| Arc::ptr_eq(e, entry));
        if !current {
            // Invalidated while loading.
            return;
        }
        state.fifo.push_back((start.to_vec(), size));
        state.bytes += size;
        while state.bytes > self.budget_bytes && state.fifo.len() > 1 {
            let Some((victim, victim_size)) = state.fifo.pop_front() else {
                break;
            };
            state.blocks.remove(&victim);
            state.bytes -= victim_size;
            log::trace!("evicted block {victim:?} ({victim_size} bytes)");
        }
    }

    fn invalidate(&self, dirty: &Dirty) -> Result<()> {
        let mut state = self.lock();
        match dirty {
            Dirty::Whole => state.clear(),
            Dirty::Region(roi) => {
                if state.block_shape.len() == roi.ndim() {
                    for start in intersecting_blocks(&state.block_shape, roi)? {
                        state.forget(&start);
                    }
                }
            }
        }
        Ok(())
    }

    fn copy_block(result: &mut Value, roi: &Roi, bounds: &Roi, block: &ArrayData) -> Result<()> {
        let Some(overlap) = bounds.intersection(roi) else {
            return Ok(());
        };
        let source = block.region(&overlap.relative_to(bounds.start())?)?;
        result
            .as_array_mut()?
            .assign_region(&overlap.relative_to(roi.start())?, &source)
    }
}

impl Operator for OpBlockedArrayCache {
    fn setup_outputs(&self) -> Result<()> {
        let meta: Meta = self.input.meta()?;
        let block_shape = self.config.effective_block_shape(&meta.shape)?;
        {
            let mut state = self.lock();
            if state.shape != meta.shape || state.block_shape != block_shape {
                state.clear();
                state.shape.clone_from(&meta.shape);
                state.block_shape = block_shape;
            }
        }
        self.output.set_meta(meta)
    }

    fn execute(&self, slot: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        if *slot != self.output {
            return Err(Error::Unsupported(format!("unknown output {slot}")));
        }
        let (shape, block_shape) = {
            let state = self.lock();
            (state.shape.clone(), state.block_shape.clone())
        };

        let mut loading = Vec::new();
        for start in intersecting_blocks(&block_shape, roi)? {
            let bounds = block_bounds(&shape, &block_shape, &start)?;
            let entry = self.entry(&start);
            let request = {
                let mut block = lock_block(&entry);
                match &*block {
                    BlockState::Ready(data) => {
                        Self::copy_block(result, roi, &bounds, data)?;
                        continue;
                    }
                    BlockState::Loading(request) => request.clone(),
                    BlockState::Empty => {
                        let request = self.input.request(bounds.clone());
                        request.submit();
                        *block = BlockState::Loading(request.clone());
                        request
                    }
                }
            };
            loading.push((start, bounds, entry, request));
        }

        for (start, bounds, entry, request) in loading {
            let data = match request.wait().and_then(Value::into_array) {
                Ok(data) => data,
                Err(e) => {
                    let mut block = lock_block(&entry);
                    if matches!(*block, BlockState::Loading(_)) {
                        *block = BlockState::Empty;
                    }
                    return Err(e);
                }
            };
            let admitted = {
                let mut block = lock_block(&entry);
                if matches!(*block, BlockState::Loading(_)) {
                    *block = BlockState::Ready(data.clone());
                    true
                } else {
                    false
                }
            };
            if admitted {
                self.admit(&start, &entry, data.nbytes());
            }
            Self::copy_block(result, roi, &bounds, &data)?;
        }
        Ok(())
    }

    fn propagate_dirty(&self, slot: &Slot, _: Option<usize>, dirty: &Dirty) -> Result<()> {
        if *slot == self.input {
            if self.is_fixed()? {
                let mut state = self.lock();
                state.pending = Some(match state.pending.take() {
                    Some(pending) => pending.union(dirty),
                    None => dirty.clone(),
                });
                return Ok(());
            }
            self.invalidate(dirty)?;
            self.output.set_dirty(dirty.clone());
            Ok(())
        } else if *slot == self.fix_at_current {
            if self.is_fixed()? {
                return Ok(());
            }
            let pending = self.lock().pending.take();
            if let Some(pending) = pending {
                self.invalidate(&pending)?;
                self.output.set_dirty(pending);
            }
            Ok(())
        } else {
            Err(Error::Unsupported(format!("unknown input {slot}")))
        }
    }
}
