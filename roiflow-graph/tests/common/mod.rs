#![allow(dead_code)]

use roiflow_graph::{
    ArrayData, Dirty, Error, Graph, Operator, OperatorBuilder, OperatorHandle, Result, Roi,
    Scheduler, SchedulerConfig, Slot, SlotType, StructureChange, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn graph(threads: usize) -> Graph {
    let config = SchedulerConfig::default()
        .with_num_threads(threads)
        .with_thread_name_prefix("test-worker");
    Graph::new(Arc::new(Scheduler::new(&config).unwrap()))
}

pub fn ramp(shape: &[usize]) -> ArrayData {
    let len: usize = shape.iter().product();
    #[allow(clippy::cast_precision_loss)]
    let data: Vec<f32> = (0..len).map(|v| v as f32).collect();
    ArrayData::F32(ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(shape), data).unwrap())
}

pub fn roi(start: &[usize], stop: &[usize]) -> Roi {
    Roi::new(start.to_vec(), stop.to_vec()).unwrap()
}

/// Collects every dirty notification seen on a slot.
pub fn record_dirty(slot: &Slot) -> (Arc<Mutex<Vec<Dirty>>>, roiflow_graph::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = slot.notify_dirty(move |_, dirty| sink.lock().unwrap().push(dirty.clone()));
    (seen, subscription)
}

/// Output mirrors input, region for region.
pub struct Identity {
    pub input: Slot,
    pub output: Slot,
    pub setups: AtomicUsize,
    pub executions: AtomicUsize,
}

impl Identity {
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        Ok(Self {
            input: b.input("Input", SlotType::Array),
            output: b.output("Output", SlotType::Array),
            setups: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
        })
    }

    pub fn add(graph: &Graph, name: &str) -> OperatorHandle<Self> {
        graph.add_operator(name, Self::build).unwrap()
    }
}

impl Operator for Identity {
    fn setup_outputs(&self) -> Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.output.set_meta(self.input.meta()?)
    }

    fn execute(&self, _: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        *result = Value::Array(self.input.read(roi)?);
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, dirty: &Dirty) -> Result<()> {
        self.output.set_dirty(dirty.clone());
        Ok(())
    }
}

/// Whole-value operator: Output = Input + Offset.
pub struct AddOffset {
    pub input: Slot,
    pub offset: Slot,
    pub output: Slot,
}

impl AddOffset {
    pub fn add(graph: &Graph, name: &str) -> OperatorHandle<Self> {
        graph
            .add_operator(name, |b| {
                Ok(Self {
                    input: b.input("Input", SlotType::Value),
                    offset: b.input_with_default("Offset", SlotType::Value, 0i64),
                    output: b.output("Output", SlotType::Value),
                })
            })
            .unwrap()
    }
}

impl Operator for AddOffset {
    fn setup_outputs(&self) -> Result<()> {
        self.output.set_meta(roiflow_graph::Meta::scalar())
    }

    fn execute(&self, _: &Slot, _: Option<usize>, _: &Roi, result: &mut Value) -> Result<()> {
        let a = self.input.value()?.as_int()?;
        let b = self.offset.value()?.as_int()?;
        *result = Value::Int(a + b);
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, _: &Dirty) -> Result<()> {
        self.output.set_dirty(Dirty::Whole);
        Ok(())
    }
}

/// Reads its input in two halves along the first axis through nested
/// requests.
pub struct Halves {
    pub input: Slot,
    pub output: Slot,
}

impl Halves {
    pub fn add(graph: &Graph, name: &str) -> OperatorHandle<Self> {
        graph
            .add_operator(name, |b| {
                Ok(Self {
                    input: b.input("Input", SlotType::Array),
                    output: b.output("Output", SlotType::Array),
                })
            })
            .unwrap()
    }
}

impl Operator for Halves {
    fn setup_outputs(&self) -> Result<()> {
        self.output.set_meta(self.input.meta()?)
    }

    fn execute(&self, _: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        let start = roi.start().to_vec();
        let stop = roi.stop().to_vec();
        let mid = (start[0] + stop[0]) / 2;
        let mut first_stop = stop.clone();
        first_stop[0] = mid;
        let mut second_start = start.clone();
        second_start[0] = mid;
        let halves = [
            Roi::new(start.clone(), first_stop)?,
            Roi::new(second_start, stop)?,
        ];
        let requests: Vec<_> = halves
            .iter()
            .map(|half| self.input.request(half.clone()))
            .collect();
        let parts = roiflow_graph::wait_all(&requests)?;
        let out = result.as_array_mut()?;
        for (half, part) in halves.iter().zip(parts) {
            out.assign_region(&half.relative_to(&start)?, part.as_array()?)?;
        }
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, dirty: &Dirty) -> Result<()> {
        self.output.set_dirty(dirty.clone());
        Ok(())
    }
}

/// Fails or panics on every read.
pub struct Faulty {
    pub input: Slot,
    pub output: Slot,
    pub panic: bool,
}

impl Faulty {
    pub fn add(graph: &Graph, name: &str, panic: bool) -> OperatorHandle<Self> {
        graph
            .add_operator(name, |b| {
                Ok(Self {
                    input: b.input("Input", SlotType::Array),
                    output: b.output("Output", SlotType::Array),
                    panic,
                })
            })
            .unwrap()
    }
}

impl Operator for Faulty {
    fn setup_outputs(&self) -> Result<()> {
        self.output.set_meta(self.input.meta()?)
    }

    fn execute(&self, _: &Slot, _: Option<usize>, _: &Roi, _: &mut Value) -> Result<()> {
        assert!(!self.panic, "sensor exploded");
        Err(Error::InvalidRoi("no data here".to_string()))
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, _: &Dirty) -> Result<()> {
        Ok(())
    }
}

/// One output lane per input lane.
pub struct LanePiper {
    pub inputs: Slot,
    pub outputs: Slot,
}

impl LanePiper {
    pub fn add(graph: &Graph, name: &str) -> OperatorHandle<Self> {
        graph
            .add_operator(name, |b| {
                Ok(Self {
                    inputs: b.optional_multi_input("Inputs", SlotType::Array),
                    outputs: b.multi_output("Outputs", SlotType::Array),
                })
            })
            .unwrap()
    }
}

impl Operator for LanePiper {
    fn setup_outputs(&self) -> Result<()> {
        for (index, input) in self.inputs.children().iter().enumerate() {
            let output = self.outputs.child(index)?;
            match input.meta() {
                Ok(meta) => output.set_meta(meta)?,
                Err(_) => output.clear_meta(),
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        _: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let lane = subindex.unwrap_or_default();
        *result = Value::Array(self.inputs.child(lane)?.read(roi)?);
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, subindex: Option<usize>, dirty: &Dirty) -> Result<()> {
        if let Some(lane) = subindex {
            self.outputs.child(lane)?.set_dirty(dirty.clone());
        }
        Ok(())
    }

    fn propagate_structure(&self, _: &Slot, change: &StructureChange) -> Result<()> {
        change.apply_to(&self.outputs)
    }
}
