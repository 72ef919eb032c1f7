#![allow(dead_code)]

use ndarray::{ArrayD, Dimension, IxDyn};
use roiflow_graph::{
    ArrayData, Dirty, Graph, Meta, Operator, OperatorHandle, Result, Roi, Scheduler,
    SchedulerConfig, Slot, SlotType, Subscription, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn graph(threads: usize) -> Graph {
    let config = SchedulerConfig::default().with_num_threads(threads);
    Graph::new(Arc::new(Scheduler::new(&config).unwrap()))
}

pub fn roi(start: &[usize], stop: &[usize]) -> Roi {
    Roi::new(start.to_vec(), stop.to_vec()).unwrap()
}

pub fn ramp(shape: &[usize]) -> ArrayData {
    let len: usize = shape.iter().product();
    #[allow(clippy::cast_precision_loss)]
    let data: Vec<f32> = (0..len).map(|v| v as f32).collect();
    ArrayData::F32(ArrayD::from_shape_vec(IxDyn(shape), data).unwrap())
}

pub fn f32_array(shape: &[usize], f: impl Fn(&[usize]) -> f32) -> ArrayData {
    ArrayData::F32(ArrayD::from_shape_fn(IxDyn(shape), |ix| f(ix.slice())))
}

pub fn u8_array(shape: &[usize], value: u8) -> ArrayData {
    ArrayData::U8(ArrayD::from_elem(IxDyn(shape), value))
}

pub fn record_dirty(slot: &Slot) -> (Arc<Mutex<Vec<Dirty>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = slot.notify_dirty(move |_, dirty| sink.lock().unwrap().push(dirty.clone()));
    (seen, subscription)
}

/// Pass-through that counts how often it computes.
pub struct Counter {
    pub input: Slot,
    pub output: Slot,
    pub executions: AtomicUsize,
}

impl Counter {
    pub fn add(graph: &Graph, name: &str, slot_type: SlotType) -> OperatorHandle<Self> {
        graph
            .add_operator(name, |b| {
                Ok(Self {
                    input: b.input("Input", slot_type),
                    output: b.output("Output", slot_type),
                    executions: AtomicUsize::new(0),
                })
            })
            .unwrap()
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl Operator for Counter {
    fn setup_outputs(&self) -> Result<()> {
        let meta = self.input.meta()?;
        if self.output.slot_type() == SlotType::Value {
            return self.output.set_meta(Meta::scalar());
        }
        self.output.set_meta(meta)
    }

    fn execute(&self, _: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        *result = match self.output.slot_type() {
            SlotType::Array => Value::Array(self.input.read(roi)?),
            SlotType::Value => self.input.value()?,
        };
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, dirty: &Dirty) -> Result<()> {
        self.output.set_dirty(dirty.clone());
        Ok(())
    }
}

/// Pass-through that sleeps after reading its input.
pub struct Slow {
    pub input: Slot,
    pub output: Slot,
    pub delay: Duration,
}

impl Slow {
    pub fn add(
        graph: &Graph,
        name: &str,
        slot_type: SlotType,
        delay: Duration,
    ) -> OperatorHandle<Self> {
        graph
            .add_operator(name, |b| {
                Ok(Self {
                    input: b.input("Input", slot_type),
                    output: b.output("Output", slot_type),
                    delay,
                })
            })
            .unwrap()
    }
}

impl Operator for Slow {
    fn setup_outputs(&self) -> Result<()> {
        let meta = self.input.meta()?;
        if self.output.slot_type() == SlotType::Value {
            return self.output.set_meta(Meta::scalar());
        }
        self.output.set_meta(meta)
    }

    fn execute(&self, _: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        *result = match self.output.slot_type() {
            SlotType::Array => Value::Array(self.input.read(roi)?),
            SlotType::Value => self.input.value()?,
        };
        std::thread::sleep(self.delay);
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, dirty: &Dirty) -> Result<()> {
        self.output.set_dirty(dirty.clone());
        Ok(())
    }
}
