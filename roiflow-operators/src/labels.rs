//! Block-sparse label storage.

use roiflow_core::{block_bounds, intersecting_blocks};
use roiflow_graph::{
    ArrayData, DType, Dirty, Error, Meta, Operator, OperatorBuilder, Result, Roi, Slot, SlotType,
    Value,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Default label block extent per axis.
pub const LABEL_BLOCK_EXTENT: usize = 64;

/// Sparse `u8` label volume stored as fixed-size blocks.
///
/// Only blocks that contain at least one non-zero label are kept; writing
/// zeros over a block's last label drops it.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelBlockStore {
    shape: Vec<usize>,
    block_shape: Vec<usize>,
    blocks: BTreeMap<Vec<usize>, ArrayData>,
}

impl LabelBlockStore {
    /// Empty store for a volume of `shape`.
    ///
    /// Block extents are clipped to the volume.
    #[must_use]
    pub fn new(shape: &[usize], block_extent: usize) -> Self {
        Self {
            shape: shape.to_vec(),
            block_shape: shape.iter().map(|n| block_extent.min(*n).max(1)).collect(),
            blocks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn block_shape(&self) -> &[usize] {
        &self.block_shape
    }

    /// Number of stored blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Writes `data` into `roi`. Values are cast to `u8`.
    ///
    /// # Errors
    /// Returns an error if `roi` is outside the volume or `data` does not
    /// have the shape of `roi`.
    pub fn write(&mut self, roi: &Roi, data: &ArrayData) -> Result<()> {
        roi.check_within(&self.shape)?;
        if data.shape() != roi.shape().as_slice() {
            return Err(Error::ShapeMismatch {
                expected: roi.shape(),
                found: data.shape().to_vec(),
            });
        }
        let data = data.cast(DType::U8);
        for start in intersecting_blocks(&self.block_shape, roi)? {
            let bounds = block_bounds(&self.shape, &self.block_shape, &start)?;
            let Some(overlap) = bounds.intersection(roi) else {
                continue;
            };
            let source = data.region(&overlap.relative_to(roi.start())?)?;
            let target = overlap.relative_to(bounds.start())?;
            let block = self
                .blocks
                .entry(start.clone())
                .or_insert_with(|| ArrayData::zeros(DType::U8, &bounds.shape()));
            block.assign_region(&target, &source)?;
            if !block.any_nonzero() {
                self.blocks.remove(&start);
            }
        }
        Ok(())
    }

    /// Labels inside `roi`; unlabeled voxels read as 0.
    ///
    /// # Errors
    /// Returns an error if `roi` is outside the volume.
    pub fn read(&self, roi: &Roi) -> Result<ArrayData> {
        roi.check_within(&self.shape)?;
        let mut out = ArrayData::zeros(DType::U8, &roi.shape());
        if roi.is_empty() {
            return Ok(out);
        }
        for start in intersecting_blocks(&self.block_shape, roi)? {
            let Some(block) = self.blocks.get(&start) else {
                continue;
            };
            let bounds = block_bounds(&self.shape, &self.block_shape, &start)?;
            let Some(overlap) = bounds.intersection(roi) else {
                continue;
            };
            let source = block.region(&overlap.relative_to(bounds.start())?)?;
            out.assign_region(&overlap.relative_to(roi.start())?, &source)?;
        }
        Ok(out)
    }

    /// Bounds of every stored block, in row-major block order.
    ///
    /// # Errors
    /// Returns an error only if the store is internally inconsistent.
    pub fn nonzero_blocks(&self) -> Result<Vec<Roi>> {
        self.blocks
            .keys()
            .map(|start| block_bounds(&self.shape, &self.block_shape, start))
            .collect()
    }

    /// Largest stored label, 0 when empty.
    #[must_use]
    pub fn max_label(&self) -> u8 {
        self.blocks
            .values()
            .filter_map(|block| block.as_u8().and_then(|a| a.iter().copied().max()))
            .max()
            .unwrap_or(0)
    }
}

/// Label volume written through `Input` and shaped like `Image`.
///
/// Writing region R dirties `Output` over R and `NonzeroBlocks` and
/// `MaxLabel` wholly. Changing the image shape discards the labels.
pub struct OpLabelArray {
    pub image: Slot,
    pub input: Slot,
    pub output: Slot,
    pub nonzero_blocks: Slot,
    pub max_label: Slot,
    block_extent: usize,
    store: Mutex<Option<LabelBlockStore>>,
}

impl OpLabelArray {
    /// # Errors
    /// Never fails; the signature matches [`roiflow_graph::Graph::add_operator`].
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        Self::with_block_extent(b, LABEL_BLOCK_EXTENT)
    }

    /// Like [`Self::build`] with a custom block extent.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `block_extent` is zero.
    pub fn with_block_extent(b: &mut OperatorBuilder, block_extent: usize) -> Result<Self> {
        if block_extent == 0 {
            return Err(Error::Config("label block extent must be positive".to_string()));
        }
        Ok(Self {
            image: b.input("Image", SlotType::Array),
            input: b.optional_input("Input", SlotType::Array),
            output: b.output("Output", SlotType::Array),
            nonzero_blocks: b.output("NonzeroBlocks", SlotType::Value),
            max_label: b.output("MaxLabel", SlotType::Value),
            block_extent,
            store: Mutex::new(None),
        })
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, Option<LabelBlockStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes every label.
    pub fn clear_labels(&self) {
        let had_labels = self
            .lock_store()
            .as_mut()
            .is_some_and(|store| {
                let had = !store.is_empty();
                store.clear();
                had
            });
        if had_labels {
            self.output.set_dirty(Dirty::Whole);
            self.nonzero_blocks.set_dirty(Dirty::Whole);
            self.max_label.set_dirty(Dirty::Whole);
        }
    }
}

impl Operator for OpLabelArray {
    fn setup_outputs(&self) -> Result<()> {
        let image = self.image.meta()?;
        {
            let mut store = self.lock_store();
            if store.as_ref().map(LabelBlockStore::shape) != Some(image.shape.as_slice()) {
                if store.as_ref().is_some_and(|s| !s.is_empty()) {
                    log::debug!("label volume reshaped to {:?}; labels discarded", image.shape);
                }
                *store = Some(LabelBlockStore::new(&image.shape, self.block_extent));
            }
        }
        let mut meta = Meta::new(image.shape.clone(), DType::U8);
        meta.axistags = image.axistags;
        self.output.set_meta(meta)?;
        self.nonzero_blocks.set_meta(Meta::scalar())?;
        self.max_label.set_meta(Meta::scalar())
    }

    fn execute(&self, slot: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        let store = self.lock_store();
        let store = store
            .as_ref()
            .ok_or_else(|| Error::not_ready(slot.label()))?;
        *result = if *slot == self.output {
            Value::Array(store.read(roi)?)
        } else if *slot == self.nonzero_blocks {
            Value::Rois(store.nonzero_blocks()?)
        } else if *slot == self.max_label {
            Value::Int(i64::from(store.max_label()))
        } else {
            return Err(Error::Unsupported(format!("unknown output {slot}")));
        };
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, _: &Dirty) -> Result<()> {
        // Labels do not depend on image values.
        Ok(())
    }

    fn set_in_slot(
        &self,
        slot: &Slot,
        _: Option<usize>,
        roi: &Roi,
        data: &ArrayData,
    ) -> Result<()> {
        if *slot != self.input {
            return Err(Error::Unsupported(format!("'{slot}' does not accept writes")));
        }
        {
            let mut store = self.lock_store();
            let store = store
                .as_mut()
                .ok_or_else(|| Error::not_ready(self.image.label()))?;
            store.write(roi, data)?;
        }
        self.output.set_dirty(roi.clone());
        self.nonzero_blocks.set_dirty(Dirty::Whole);
        self.max_label.set_dirty(Dirty::Whole);
        Ok(())
    }
}
