//! Binary mask of one label value.

use roiflow_graph::{
    ArrayData, DType, Dirty, Error, Operator, OperatorBuilder, Result, Roi, Slot, SlotType, Value,
};

/// `Output = (Input == HighlightLabel)` as `u8`.
///
/// A highlight label of 0 (or any negative value) yields an all-zero mask
/// without reading `Input`.
pub struct OpHighlightLabel {
    pub input: Slot,
    pub highlight_label: Slot,
    pub output: Slot,
}

impl OpHighlightLabel {
    /// # Errors
    /// Never fails; the signature matches [`roiflow_graph::Graph::add_operator`].
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        Ok(Self {
            input: b.input("Input", SlotType::Array),
            highlight_label: b.input("HighlightLabel", SlotType::Value),
            output: b.output("Output", SlotType::Array),
        })
    }
}

/// Mask of the elements of `labels` equal to `label`.
pub(crate) fn label_mask(labels: &ArrayData, label: i64) -> ArrayData {
    ArrayData::U8(labels.to_u32().mapv(|v| u8::from(i64::from(v) == label)))
}

impl Operator for OpHighlightLabel {
    fn setup_outputs(&self) -> Result<()> {
        self.output
            .set_meta(self.input.meta()?.with_dtype(DType::U8))
    }

    fn execute(&self, slot: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        if *slot != self.output {
            return Err(Error::Unsupported(format!("unknown output {slot}")));
        }
        let label = self.highlight_label.value()?.as_int()?;
        if label <= 0 {
            // Result arrives zero-filled.
            return Ok(());
        }
        *result = Value::Array(label_mask(&self.input.read(roi)?, label));
        Ok(())
    }

    fn propagate_dirty(&self, slot: &Slot, _: Option<usize>, dirty: &Dirty) -> Result<()> {
        if *slot == self.input {
            self.output.set_dirty(dirty.clone());
        } else if *slot == self.highlight_label {
            self.output.set_dirty(Dirty::Whole);
        } else {
            return Err(Error::Unsupported(format!("unknown input {slot}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_label_mask() {
        let labels = ArrayData::U32(ArrayD::from_shape_vec(IxDyn(&[4]), vec![0, 7, 3, 7]).unwrap());
        let mask = label_mask(&labels, 7);
        assert_eq!(mask.as_u8().unwrap().as_slice().unwrap(), &[0, 1, 0, 1]);
    }
}
