//! roiflow-graph: Lazy dataflow engine.
//!
//! Operators expose typed [`Slot`]s. Connecting slots builds a graph;
//! metadata flows forward eagerly, data is pulled lazily through
//! [`Request`]s that run on the graph's [`Scheduler`], and changes are
//! announced as dirty regions that each operator maps from its inputs to
//! its outputs.
//!
//! ```no_run
//! use roiflow_graph::{Graph, Scheduler, SchedulerConfig};
//! use std::sync::Arc;
//!
//! let scheduler = Arc::new(Scheduler::new(&SchedulerConfig::default())?);
//! let graph = Graph::new(scheduler);
//! # Ok::<(), roiflow_core::Error>(())
//! ```

pub mod dirty;
pub mod graph;
pub mod operator;
pub mod request;
pub mod slot;

pub use dirty::{DirtyCallback, IndexCallback, Subscription};
pub use graph::Graph;
pub use operator::{Operator, OperatorBuilder, OperatorHandle, OperatorNode, StructureChange};
pub use request::{wait_all, Request, Scheduler, SchedulerConfig};
pub use slot::{Direction, Slot, SlotStatus, SlotType, WeakSlot};

// Re-export core types for convenience
pub use roiflow_core::{ArrayData, DType, Dirty, Error, Meta, Result, Roi, Value};
