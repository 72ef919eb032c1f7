//! Carving restricted to one body of an existing label volume.

use crate::carving::{OpCarving, BACKGROUND};
use crate::highlight::OpHighlightLabel;
use roiflow_core::{block_bounds, intersecting_blocks};
use roiflow_graph::{
    ArrayData, DType, Dirty, Error, Operator, OperatorBuilder, OperatorHandle, Result, Roi, Slot,
    SlotType, StructureChange, Subscription, Value,
};

/// Block extent used when seeding the background automatically.
pub const BLOCK_SIZE: usize = 520;

/// [`OpCarving`] combined with an existing body labeling.
///
/// `HighlightedRavelerObject` marks the voxels of `CurrentRavelerLabel`;
/// `MaskedSegmentation` is the carving segmentation inside that body and
/// 0 elsewhere.
pub struct OpSplitBodyCarving {
    carving: OpCarving,
    pub raveler_labels: Slot,
    pub current_raveler_label: Slot,
    pub highlighted_raveler_object: Slot,
    pub masked_segmentation: Slot,
    highlight: OperatorHandle<OpHighlightLabel>,
    _segmentation_watch: Subscription,
}

impl OpSplitBodyCarving {
    /// # Errors
    /// Propagates errors from building the nested operators.
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        let carving = OpCarving::build(b)?;
        let raveler_labels = b.input("RavelerLabels", SlotType::Array);
        let current_raveler_label =
            b.input_with_default("CurrentRavelerLabel", SlotType::Value, 0_i64);
        let highlighted_raveler_object = b.output("HighlightedRavelerObject", SlotType::Array);
        let masked_segmentation = b.output("MaskedSegmentation", SlotType::Array);

        let highlight = b.child("Highlight", OpHighlightLabel::build)?;
        highlight.input.connect(&raveler_labels)?;
        highlight.highlight_label.connect(&current_raveler_label)?;
        highlighted_raveler_object.connect(&highlight.output)?;

        let masked = masked_segmentation.downgrade();
        let segmentation_watch = carving.segmentation.notify_dirty(move |_, dirty| {
            if let Some(masked) = masked.upgrade() {
                masked.set_dirty(dirty.clone());
            }
        });

        Ok(Self {
            carving,
            raveler_labels,
            current_raveler_label,
            highlighted_raveler_object,
            masked_segmentation,
            highlight,
            _segmentation_watch: segmentation_watch,
        })
    }

    /// The underlying carving operator.
    #[must_use]
    pub fn carving(&self) -> &OpCarving {
        &self.carving
    }

    /// Label currently highlighted by the nested highlight operator.
    ///
    /// # Errors
    /// Returns an error if the label slot holds no integer.
    pub fn highlighted_label(&self) -> Result<i64> {
        self.highlight.highlight_label.value()?.as_int()
    }

    /// Paints background seeds around body `foreground_label`.
    ///
    /// The volume is visited in blocks of [`BLOCK_SIZE`] (clipped to the
    /// volume). In every block that contains the body, voxels outside the
    /// body become background seeds; seeds inside the body are kept.
    /// Returns the number of blocks written.
    ///
    /// # Errors
    /// Returns an error if the labels cannot be read or the seeds written.
    pub fn auto_seed_background(&self, foreground_label: i64) -> Result<usize> {
        let shape = self.raveler_labels.meta()?.shape;
        let block_shape: Vec<usize> = shape.iter().map(|n| BLOCK_SIZE.min(*n).max(1)).collect();
        let mut written = 0;
        for start in intersecting_blocks(&block_shape, &Roi::from_shape(&shape))? {
            let bounds = block_bounds(&shape, &block_shape, &start)?;
            let labels = self.raveler_labels.read(&bounds)?.to_u32();
            let inside = labels.mapv(|v| i64::from(v) == foreground_label);
            if !inside.iter().any(|v| *v) {
                continue;
            }
            let existing = self.carving.seeds.read(&bounds)?.to_u8();
            let seeds = ndarray::Zip::from(&inside)
                .and(&existing)
                .map_collect(|inside, seed| if *inside { *seed } else { BACKGROUND });
            self.carving
                .write_seeds
                .write(&bounds, &ArrayData::U8(seeds))?;
            written += 1;
        }
        log::debug!("auto-seeded background of body {foreground_label} in {written} blocks");
        Ok(written)
    }

    fn compute_masked(&self, roi: &Roi, result: &mut Value) -> Result<()> {
        let current = self.current_raveler_label.value()?.as_int()?;
        let labels = self.raveler_labels.read(roi)?.to_u32();
        let segmentation = self.carving.segmentation.read(roi)?.to_u8();
        let masked = ndarray::Zip::from(&labels)
            .and(&segmentation)
            .map_collect(|label, seg| if i64::from(*label) == current { *seg } else { 0 });
        *result = Value::Array(ArrayData::U8(masked));
        Ok(())
    }
}

impl Operator for OpSplitBodyCarving {
    fn setup_outputs(&self) -> Result<()> {
        self.carving.setup_outputs()?;
        let raw = self.carving.raw_data.meta()?;
        let labels = self.raveler_labels.meta()?;
        if labels.shape != raw.shape {
            return Err(Error::ShapeMismatch {
                expected: raw.shape,
                found: labels.shape,
            });
        }
        self.masked_segmentation.set_meta(raw.with_dtype(DType::U8))
    }

    fn execute(
        &self,
        slot: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        if *slot == self.masked_segmentation {
            self.compute_masked(roi, result)
        } else {
            self.carving.execute(slot, subindex, roi, result)
        }
    }

    fn propagate_dirty(&self, slot: &Slot, subindex: Option<usize>, dirty: &Dirty) -> Result<()> {
        if *slot == self.raveler_labels {
            self.masked_segmentation.set_dirty(dirty.clone());
            Ok(())
        } else if *slot == self.current_raveler_label {
            self.masked_segmentation.set_dirty(Dirty::Whole);
            Ok(())
        } else {
            self.carving.propagate_dirty(slot, subindex, dirty)
        }
    }

    fn propagate_structure(&self, slot: &Slot, change: &StructureChange) -> Result<()> {
        self.carving.propagate_structure(slot, change)
    }

    fn set_in_slot(
        &self,
        slot: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        data: &ArrayData,
    ) -> Result<()> {
        self.carving.set_in_slot(slot, subindex, roi, data)
    }
}
