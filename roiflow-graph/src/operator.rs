//! Operator trait, operator nodes and the builder that declares their slots.

use crate::request::Scheduler;
use crate::slot::{Direction, Slot, SlotDescriptor, SlotType};
use roiflow_core::{ArrayData, Dirty, Error, Result, Roi, Value};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

/// Change in the length of a multi-slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureChange {
    /// A sub-slot was inserted at `index`; `len` is the new length.
    Inserted { index: usize, len: usize },
    /// The sub-slot at `index` was removed; `len` is the new length.
    Removed { index: usize, len: usize },
}

impl StructureChange {
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Inserted { index, .. } | Self::Removed { index, .. } => *index,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Inserted { len, .. } | Self::Removed { len, .. } => *len,
        }
    }

    /// Applies the same change to another multi-slot.
    ///
    /// # Errors
    /// Returns the error of [`Slot::insert_slot`] or [`Slot::remove_slot`].
    pub fn apply_to(&self, slot: &Slot) -> Result<()> {
        match *self {
            Self::Inserted { index, .. } => slot.insert_slot(index).map(|_| ()),
            Self::Removed { index, .. } => slot.remove_slot(index),
        }
    }
}

/// Behavior of a node in the graph.
///
/// Slots are declared through [`OperatorBuilder`] when the operator is
/// added to a graph; the operator keeps clones of the handles it needs.
pub trait Operator: Send + Sync + 'static {
    /// Derives output metadata from input metadata.
    ///
    /// Called whenever input metadata changes and every required input is
    /// ready. Setting identical metadata again must not notify anyone, which
    /// [`Slot::set_meta`] guarantees.
    ///
    /// # Errors
    /// An error leaves the computed outputs unconfigured.
    fn setup_outputs(&self) -> Result<()>;

    /// Computes `roi` of `slot` (sub-slot `subindex` for multi-slots) into
    /// `result`, which arrives zero-filled with the region's shape for
    /// array slots and as [`Value::None`] for whole-value slots.
    ///
    /// # Errors
    /// Errors reach every waiter of the request.
    fn execute(
        &self,
        slot: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()>;

    /// Translates a dirty input region into dirty output regions.
    ///
    /// # Errors
    /// Errors are logged; propagation continues elsewhere.
    fn propagate_dirty(&self, slot: &Slot, subindex: Option<usize>, dirty: &Dirty) -> Result<()>;

    /// Reacts to a change in the length of an input multi-slot.
    ///
    /// # Errors
    /// Errors are logged.
    fn propagate_structure(&self, _slot: &Slot, _change: &StructureChange) -> Result<()> {
        Ok(())
    }

    /// Accepts data written into an input.
    ///
    /// # Errors
    /// The default rejects writes with [`Error::Unsupported`].
    fn set_in_slot(
        &self,
        slot: &Slot,
        _subindex: Option<usize>,
        _roi: &Roi,
        _data: &ArrayData,
    ) -> Result<()> {
        Err(Error::Unsupported(format!(
            "'{}' does not accept writes",
            slot.label()
        )))
    }
}

/// An operator instance placed in a graph, with its slots.
pub struct OperatorNode {
    id: usize,
    name: String,
    scheduler: Arc<Scheduler>,
    operator: OnceLock<Arc<dyn Operator>>,
    inputs: OnceLock<Vec<Slot>>,
    outputs: OnceLock<Vec<Slot>>,
    children: Mutex<Vec<Arc<OperatorNode>>>,
}

impl OperatorNode {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn inputs(&self) -> &[Slot] {
        self.inputs.get().map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn outputs(&self) -> &[Slot] {
        self.outputs.get().map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn input(&self, name: &str) -> Option<Slot> {
        self.inputs().iter().find(|s| s.name() == name).cloned()
    }

    #[must_use]
    pub fn output(&self, name: &str) -> Option<Slot> {
        self.outputs().iter().find(|s| s.name() == name).cloned()
    }

    /// Nested operators owned by this one.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<OperatorNode>> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-runs output setup after input metadata changed.
    ///
    /// If a required input is not ready, or setup fails, the computed
    /// outputs become unconfigured.
    pub(crate) fn configure(&self) {
        let Some(operator) = self.operator.get() else {
            return;
        };
        let ready = self
            .inputs()
            .iter()
            .all(|slot| slot.is_optional() || slot.ready());
        if ready {
            match operator.setup_outputs() {
                Ok(()) => {
                    log::trace!("configured {}", self.name);
                    return;
                }
                Err(e) => log::debug!("{}: output setup deferred: {e}", self.name),
            }
        }
        for slot in self.outputs() {
            slot.clear_meta();
        }
    }

    pub(crate) fn execute(
        &self,
        slot: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let operator = self
            .operator
            .get()
            .ok_or_else(|| Error::not_ready(slot.label()))?;
        operator
            .execute(slot, subindex, roi, result)
            .map_err(|e| match e {
                e @ (Error::Compute { .. } | Error::NotReady { .. }) => e,
                other => Error::compute(&self.name, other.to_string()),
            })
    }

    pub(crate) fn propagate_dirty(&self, slot: &Slot, subindex: Option<usize>, dirty: &Dirty) {
        if let Some(operator) = self.operator.get() {
            if let Err(e) = operator.propagate_dirty(slot, subindex, dirty) {
                log::warn!("{}: dirty propagation from {slot} failed: {e}", self.name);
            }
        }
    }

    pub(crate) fn propagate_structure(&self, slot: &Slot, change: &StructureChange) {
        if let Some(operator) = self.operator.get() {
            if let Err(e) = operator.propagate_structure(slot, change) {
                log::warn!("{}: structure change on {slot} failed: {e}", self.name);
            }
        }
    }

    pub(crate) fn set_in_slot(
        &self,
        slot: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        data: &ArrayData,
    ) -> Result<()> {
        let operator = self
            .operator
            .get()
            .ok_or_else(|| Error::not_ready(slot.label()))?;
        operator.set_in_slot(slot, subindex, roi, data)
    }

    /// Disconnects every slot of this operator and of its children.
    pub(crate) fn teardown(&self) {
        for child in self.children().iter().rev() {
            child.teardown();
        }
        for slot in self.outputs() {
            slot.disconnect_downstream();
        }
        for slot in self.inputs() {
            slot.disconnect();
        }
        for slot in self.outputs() {
            slot.clear_meta();
        }
        log::debug!("tore down {}", self.name);
    }
}

impl fmt::Debug for OperatorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("inputs", &self.inputs().len())
            .field("outputs", &self.outputs().len())
            .finish_non_exhaustive()
    }
}

/// Typed handle to an operator in a graph.
pub struct OperatorHandle<T> {
    node: Arc<OperatorNode>,
    operator: Arc<T>,
}

impl<T> OperatorHandle<T> {
    #[must_use]
    pub fn node(&self) -> &Arc<OperatorNode> {
        &self.node
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.node.name()
    }
}

impl<T> Clone for OperatorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            operator: Arc::clone(&self.operator),
        }
    }
}

impl<T> Deref for OperatorHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.operator
    }
}

impl<T> fmt::Debug for OperatorHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OperatorHandle").field(&self.node).finish()
    }
}

/// Declares the slots and children of an operator under construction.
pub struct OperatorBuilder {
    node: Weak<OperatorNode>,
    scheduler: Arc<Scheduler>,
    ids: Arc<AtomicUsize>,
    name: String,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
    children: Vec<Arc<OperatorNode>>,
}

impl OperatorBuilder {
    /// Name of the operator being built.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn declare(
        &mut self,
        name: &str,
        direction: Direction,
        slot_type: SlotType,
        level: usize,
        optional: bool,
        default: Option<Value>,
    ) -> Slot {
        let slot = Slot::new(
            SlotDescriptor {
                name: name.to_string(),
                direction,
                slot_type,
                level,
                optional,
                default,
            },
            self.node.clone(),
        );
        match direction {
            Direction::Input => self.inputs.push(slot.clone()),
            Direction::Output => self.outputs.push(slot.clone()),
        }
        slot
    }

    /// Required input.
    pub fn input(&mut self, name: &str, slot_type: SlotType) -> Slot {
        self.declare(name, Direction::Input, slot_type, 0, false, None)
    }

    /// Input that does not block output setup while unconnected.
    pub fn optional_input(&mut self, name: &str, slot_type: SlotType) -> Slot {
        self.declare(name, Direction::Input, slot_type, 0, true, None)
    }

    /// Input holding `default` until something else is connected or set.
    pub fn input_with_default(
        &mut self,
        name: &str,
        slot_type: SlotType,
        default: impl Into<Value>,
    ) -> Slot {
        self.declare(
            name,
            Direction::Input,
            slot_type,
            0,
            false,
            Some(default.into()),
        )
    }

    /// Multi-slot input.
    pub fn multi_input(&mut self, name: &str, slot_type: SlotType) -> Slot {
        self.declare(name, Direction::Input, slot_type, 1, false, None)
    }

    /// Multi-slot input whose sub-slots may stay unconnected.
    pub fn optional_multi_input(&mut self, name: &str, slot_type: SlotType) -> Slot {
        self.declare(name, Direction::Input, slot_type, 1, true, None)
    }

    pub fn output(&mut self, name: &str, slot_type: SlotType) -> Slot {
        self.declare(name, Direction::Output, slot_type, 0, false, None)
    }

    pub fn multi_output(&mut self, name: &str, slot_type: SlotType) -> Slot {
        self.declare(name, Direction::Output, slot_type, 1, false, None)
    }

    /// Builds a nested operator owned by this one.
    ///
    /// # Errors
    /// Propagates the child's construction error.
    pub fn child<T, F>(&mut self, name: &str, build: F) -> Result<OperatorHandle<T>>
    where
        T: Operator,
        F: FnOnce(&mut OperatorBuilder) -> Result<T>,
    {
        let qualified = format!("{}.{name}", self.name);
        let handle = build_operator(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.ids),
            &qualified,
            build,
        )?;
        self.children.push(Arc::clone(&handle.node));
        Ok(handle)
    }
}

/// Creates the node first so slots can refer to it, then the operator.
pub(crate) fn build_operator<T, F>(
    scheduler: Arc<Scheduler>,
    ids: Arc<AtomicUsize>,
    name: &str,
    build: F,
) -> Result<OperatorHandle<T>>
where
    T: Operator,
    F: FnOnce(&mut OperatorBuilder) -> Result<T>,
{
    let node = Arc::new(OperatorNode {
        id: ids.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        name: name.to_string(),
        scheduler: Arc::clone(&scheduler),
        operator: OnceLock::new(),
        inputs: OnceLock::new(),
        outputs: OnceLock::new(),
        children: Mutex::new(Vec::new()),
    });
    let mut builder = OperatorBuilder {
        node: Arc::downgrade(&node),
        scheduler,
        ids,
        name: name.to_string(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        children: Vec::new(),
    };
    let operator = match build(&mut builder) {
        Ok(operator) => Arc::new(operator),
        Err(e) => {
            for child in builder.children.iter().rev() {
                child.teardown();
            }
            return Err(e);
        }
    };

    let OperatorBuilder {
        inputs,
        outputs,
        children,
        ..
    } = builder;
    // The cells are fresh; these sets cannot fail.
    let _ = node.inputs.set(inputs);
    let _ = node.outputs.set(outputs);
    node.children
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(children);
    let dynamic: Arc<dyn Operator> = Arc::clone(&operator) as Arc<dyn Operator>;
    let _ = node.operator.set(dynamic);

    log::debug!("created operator {name} (id {})", node.id);
    node.configure();
    Ok(OperatorHandle { node, operator })
}
