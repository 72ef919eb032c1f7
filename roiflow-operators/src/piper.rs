//! Pass-through operator.

use roiflow_graph::{Dirty, Operator, OperatorBuilder, Result, Roi, Slot, SlotType, Value};

/// `Output` mirrors `Input` region for region.
pub struct OpArrayPiper {
    pub input: Slot,
    pub output: Slot,
}

impl OpArrayPiper {
    /// Declares `Input` and `Output`.
    ///
    /// # Errors
    /// Never fails; the signature matches [`roiflow_graph::Graph::add_operator`].
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        Ok(Self {
            input: b.input("Input", SlotType::Array),
            output: b.output("Output", SlotType::Array),
        })
    }
}

impl Operator for OpArrayPiper {
    fn setup_outputs(&self) -> Result<()> {
        self.output.set_meta(self.input.meta()?)
    }

    fn execute(&self, _slot: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        *result = Value::Array(self.input.read(roi)?);
        Ok(())
    }

    fn propagate_dirty(&self, _slot: &Slot, _: Option<usize>, dirty: &Dirty) -> Result<()> {
        self.output.set_dirty(dirty.clone());
        Ok(())
    }
}
