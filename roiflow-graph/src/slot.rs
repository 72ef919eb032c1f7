//! Typed endpoints of operators.
//!
//! A [`Slot`] is either fed by an upstream slot, holds a value set directly,
//! or (for outputs) is computed by its owning operator. Level-1 slots are
//! multi-slots: ordered lists of level-0 sub-slots that share a name.

use crate::dirty::{DirtyCallback, IndexCallback, ObserverKind, ObserverList, Subscription};
use crate::operator::{OperatorNode, StructureChange};
use crate::request::{Request, Scheduler};
use roiflow_core::{ArrayData, Dirty, Error, Meta, Result, Roi, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Whether the owning operator reads or produces the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// What a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// Region-addressable n-dimensional data.
    Array,
    /// A whole value read with an empty region.
    Value,
}

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// No metadata.
    Unconfigured,
    /// Metadata known, no dirty notification seen yet.
    MetadataReady,
    /// Contents changed since the last clean mark.
    Dirty,
    /// A consumer has marked the contents as read.
    Clean,
}

/// Declaration of a slot, consumed by the operator builder.
#[derive(Debug, Clone)]
pub(crate) struct SlotDescriptor {
    pub(crate) name: String,
    pub(crate) direction: Direction,
    pub(crate) slot_type: SlotType,
    pub(crate) level: usize,
    pub(crate) optional: bool,
    pub(crate) default: Option<Value>,
}

#[derive(Clone)]
enum Source {
    Empty,
    Upstream(Slot),
    Value(Value),
}

struct SlotState {
    source: Source,
    meta: Option<Meta>,
    status: SlotStatus,
    children: Vec<Slot>,
    downstream: Vec<WeakSlot>,
}

struct SlotInner {
    name: String,
    direction: Direction,
    slot_type: SlotType,
    level: usize,
    optional: bool,
    default: Option<Value>,
    owner: Weak<OperatorNode>,
    parent: Option<WeakSlot>,
    index: AtomicUsize,
    state: RwLock<SlotState>,
    dirty_observers: ObserverList<DirtyCallback>,
    inserted_observers: ObserverList<IndexCallback>,
    removed_observers: ObserverList<IndexCallback>,
}

/// Shared handle to a slot. Clones refer to the same slot.
#[derive(Clone)]
pub struct Slot {
    inner: Arc<SlotInner>,
}

/// Non-owning handle to a slot.
#[derive(Clone)]
pub struct WeakSlot {
    inner: Weak<SlotInner>,
}

impl WeakSlot {
    #[must_use]
    pub fn upgrade(&self) -> Option<Slot> {
        self.inner.upgrade().map(|inner| Slot { inner })
    }
}

impl Slot {
    pub(crate) fn new(descriptor: SlotDescriptor, owner: Weak<OperatorNode>) -> Self {
        let (source, meta, status) = match &descriptor.default {
            Some(value) if descriptor.level == 0 => (
                Source::Value(value.clone()),
                Some(Meta::for_value(value)),
                SlotStatus::MetadataReady,
            ),
            _ => (Source::Empty, None, SlotStatus::Unconfigured),
        };
        Self::build(descriptor, owner, None, 0, source, meta, status)
    }

    fn build(
        descriptor: SlotDescriptor,
        owner: Weak<OperatorNode>,
        parent: Option<WeakSlot>,
        index: usize,
        source: Source,
        meta: Option<Meta>,
        status: SlotStatus,
    ) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                name: descriptor.name,
                direction: descriptor.direction,
                slot_type: descriptor.slot_type,
                level: descriptor.level,
                optional: descriptor.optional,
                default: descriptor.default,
                owner,
                parent,
                index: AtomicUsize::new(index),
                state: RwLock::new(SlotState {
                    source,
                    meta,
                    status,
                    children: Vec::new(),
                    downstream: Vec::new(),
                }),
                dirty_observers: ObserverList::new(),
                inserted_observers: ObserverList::new(),
                removed_observers: ObserverList::new(),
            }),
        }
    }

    fn new_child(&self, index: usize) -> Slot {
        let descriptor = SlotDescriptor {
            name: self.inner.name.clone(),
            direction: self.inner.direction,
            slot_type: self.inner.slot_type,
            level: 0,
            optional: self.inner.optional,
            default: None,
        };
        Self::build(
            descriptor,
            self.inner.owner.clone(),
            Some(self.downgrade()),
            index,
            Source::Empty,
            None,
            SlotStatus::Unconfigured,
        )
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SlotState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSlot {
        WeakSlot {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Declared name; sub-slots share their parent's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Qualified name used in logs and errors, e.g. `Carving.Output[2]`.
    #[must_use]
    pub fn label(&self) -> String {
        let owner = self
            .owner()
            .map_or_else(|| "<detached>".to_string(), |node| node.name().to_string());
        match self.index() {
            Some(index) => format!("{owner}.{}[{index}]", self.inner.name),
            None => format!("{owner}.{}", self.inner.name),
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    #[must_use]
    pub fn slot_type(&self) -> SlotType {
        self.inner.slot_type
    }

    /// 0 for plain slots, 1 for multi-slots.
    #[must_use]
    pub fn level(&self) -> usize {
        self.inner.level
    }

    #[must_use]
    pub fn is_multi(&self) -> bool {
        self.inner.level > 0
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.inner.optional
    }

    /// Position within the parent multi-slot.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.inner
            .parent
            .as_ref()
            .map(|_| self.inner.index.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn parent(&self) -> Option<Slot> {
        self.inner.parent.as_ref().and_then(WeakSlot::upgrade)
    }

    pub(crate) fn owner(&self) -> Option<Arc<OperatorNode>> {
        self.inner.owner.upgrade()
    }

    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.owner().map(|node| Arc::clone(node.scheduler()))
    }

    /// The slot and sub-slot index an operator sees for this slot.
    fn addressing(&self) -> (Slot, Option<usize>) {
        match self.parent() {
            Some(parent) => (parent, self.index()),
            None => (self.clone(), None),
        }
    }

    /// Upstream partner, if connected.
    #[must_use]
    pub fn upstream(&self) -> Option<Slot> {
        match &self.read_state().source {
            Source::Upstream(upstream) => Some(upstream.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.read_state().source, Source::Upstream(_))
    }

    /// Returns true if the slot holds a directly set value.
    #[must_use]
    pub fn has_value(&self) -> bool {
        matches!(self.read_state().source, Source::Value(_))
    }

    /// Outputs without an upstream are computed by their owner.
    fn is_computed(&self) -> bool {
        self.inner.direction == Direction::Output && matches!(self.read_state().source, Source::Empty)
    }

    /// Downstream partners fed by this slot.
    #[must_use]
    pub fn downstream(&self) -> Vec<Slot> {
        self.read_state()
            .downstream
            .iter()
            .filter_map(WeakSlot::upgrade)
            .collect()
    }

    /// Returns true if reads can be served.
    ///
    /// A multi-slot is ready when every sub-slot is ready; an empty
    /// multi-slot is trivially ready.
    #[must_use]
    pub fn ready(&self) -> bool {
        if self.is_multi() {
            return self.children().iter().all(Slot::ready);
        }
        self.read_state().meta.is_some()
    }

    /// Current metadata.
    ///
    /// # Errors
    /// Returns [`Error::NotReady`] if the slot has no metadata.
    pub fn meta(&self) -> Result<Meta> {
        self.read_state()
            .meta
            .clone()
            .ok_or_else(|| Error::not_ready(self.label()))
    }

    #[must_use]
    pub fn status(&self) -> SlotStatus {
        self.read_state().status
    }

    /// Marks the current contents as consumed.
    pub fn mark_clean(&self) {
        let mut state = self.write_state();
        if matches!(state.status, SlotStatus::Dirty | SlotStatus::MetadataReady) {
            state.status = SlotStatus::Clean;
        }
    }

    /// Number of sub-slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_state().children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_state().children.is_empty()
    }

    /// Sub-slot at `index`.
    ///
    /// # Errors
    /// Returns [`Error::StructuralRace`] if the index no longer exists.
    pub fn child(&self, index: usize) -> Result<Slot> {
        let state = self.read_state();
        state
            .children
            .get(index)
            .cloned()
            .ok_or_else(|| Error::StructuralRace {
                slot: self.label(),
                index,
                len: state.children.len(),
            })
    }

    #[must_use]
    pub fn children(&self) -> Vec<Slot> {
        self.read_state().children.clone()
    }

    // ---------------------------------------------------------------------
    // Connections and values
    // ---------------------------------------------------------------------

    /// Makes this slot follow `upstream`.
    ///
    /// Any previous connection or value is replaced. Metadata is mirrored
    /// from the upstream and the slot becomes dirty in its whole domain.
    /// A multi-slot mirrors the upstream's length and connects its
    /// sub-slots pairwise.
    ///
    /// # Errors
    /// Returns [`Error::IncompatibleSlot`] when element type or level differ.
    pub fn connect(&self, upstream: &Slot) -> Result<()> {
        let incompatible = |reason: String| Error::IncompatibleSlot {
            upstream: upstream.label(),
            downstream: self.label(),
            reason,
        };
        if self == upstream {
            return Err(incompatible("a slot cannot feed itself".to_string()));
        }
        if self.inner.slot_type != upstream.inner.slot_type {
            return Err(incompatible(format!(
                "element type {:?} does not match {:?}",
                upstream.inner.slot_type, self.inner.slot_type
            )));
        }
        if self.inner.level != upstream.inner.level {
            return Err(incompatible(format!(
                "level {} does not match {}",
                upstream.inner.level, self.inner.level
            )));
        }
        if self.upstream().as_ref() == Some(upstream) {
            return Ok(());
        }

        self.detach_source();
        self.write_state().source = Source::Upstream(upstream.clone());
        upstream.write_state().downstream.push(self.downgrade());
        log::debug!("connected {} -> {}", upstream.label(), self.label());

        if self.is_multi() {
            self.mirror_children(upstream)
        } else {
            self.refresh_meta();
            self.set_dirty(Dirty::Whole);
            Ok(())
        }
    }

    fn mirror_children(&self, upstream: &Slot) -> Result<()> {
        let sources = upstream.children();
        let current = self.len();
        for index in (sources.len()..current).rev() {
            self.remove_child(index);
        }
        for index in current..sources.len() {
            self.insert_child(index);
        }
        for (index, source) in sources.iter().enumerate() {
            self.child(index)?.connect(source)?;
        }
        Ok(())
    }

    /// Drops the current source, leaving the slot empty.
    fn detach_source(&self) {
        let previous = std::mem::replace(&mut self.write_state().source, Source::Empty);
        if let Source::Upstream(upstream) = previous {
            upstream.remove_downstream(self);
        }
    }

    fn remove_downstream(&self, slot: &Slot) {
        self.write_state()
            .downstream
            .retain(|weak| weak.upgrade().is_some_and(|s| s != *slot));
    }

    /// Removes the upstream connection or value.
    ///
    /// A slot with a declared default falls back to it; otherwise it
    /// becomes unconfigured. A multi-slot shrinks to zero sub-slots.
    pub fn disconnect(&self) {
        self.detach_source();
        if self.is_multi() {
            for index in (0..self.len()).rev() {
                self.remove_child(index);
            }
            return;
        }
        if let Some(default) = &self.inner.default {
            self.write_state().source = Source::Value(default.clone());
            self.refresh_meta();
            self.set_dirty(Dirty::Whole);
        } else if self.inner.direction == Direction::Input {
            self.update_meta(None);
        } else {
            // Outputs go back to being computed; their owner decides the
            // metadata.
            self.update_meta(None);
            if let Some(owner) = self.owner() {
                owner.configure();
            }
        }
    }

    /// Sets a value directly, replacing any upstream connection.
    ///
    /// The slot always becomes dirty in its whole domain.
    ///
    /// # Errors
    /// Returns [`Error::IncompatibleSlot`] when an array slot receives a
    /// non-array value and [`Error::Unsupported`] on multi-slots.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if self.is_multi() {
            return Err(Error::Unsupported(format!(
                "cannot set a value on multi-slot '{}'",
                self.label()
            )));
        }
        if self.inner.slot_type == SlotType::Array && !matches!(value, Value::Array(_)) {
            return Err(Error::IncompatibleSlot {
                upstream: format!("<{} value>", value.kind()),
                downstream: self.label(),
                reason: "array slots accept only array values".to_string(),
            });
        }
        self.detach_source();
        self.write_state().source = Source::Value(value);
        self.refresh_meta();
        self.set_dirty(Dirty::Whole);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Metadata
    // ---------------------------------------------------------------------

    /// Assigns metadata to a computed output.
    ///
    /// Downstream slots and operators are only notified when the metadata
    /// actually changes.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for inputs, multi-slots and outputs
    /// that follow an upstream.
    pub fn set_meta(&self, meta: Meta) -> Result<()> {
        if self.is_multi() || !self.is_computed() {
            return Err(Error::Unsupported(format!(
                "metadata of '{}' is not owned by its operator",
                self.label()
            )));
        }
        self.update_meta(Some(meta));
        Ok(())
    }

    /// Clears the metadata of a computed output (and of computed
    /// sub-slots). Slots fed from elsewhere are left alone.
    pub fn clear_meta(&self) {
        if self.is_multi() {
            for child in self.children() {
                child.clear_meta();
            }
        } else if self.is_computed() {
            self.update_meta(None);
        }
    }

    fn refresh_meta(&self) {
        let source = self.read_state().source.clone();
        let meta = match source {
            Source::Upstream(upstream) => upstream.read_state().meta.clone(),
            Source::Value(value) => Some(Meta::for_value(&value)),
            Source::Empty if self.inner.direction == Direction::Output => return,
            Source::Empty => None,
        };
        self.update_meta(meta);
    }

    fn update_meta(&self, meta: Option<Meta>) -> bool {
        {
            let mut state = self.write_state();
            if state.meta == meta {
                return false;
            }
            state.status = if meta.is_some() {
                SlotStatus::MetadataReady
            } else {
                SlotStatus::Unconfigured
            };
            state.meta = meta;
        }
        log::trace!("metadata of {} changed", self.label());
        for slot in self.downstream() {
            slot.refresh_meta();
        }
        if self.inner.direction == Direction::Input {
            if let Some(owner) = self.owner() {
                owner.configure();
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Dirty propagation
    // ---------------------------------------------------------------------

    /// Announces that `dirty` changed.
    ///
    /// The region is clipped to the slot's shape. Observers of the slot run
    /// first, then observers of its parent multi-slot, then downstream
    /// partners, then (for inputs) the owning operator. Notifications on an
    /// unconfigured slot are dropped.
    pub fn set_dirty(&self, dirty: impl Into<Dirty>) {
        let dirty = dirty.into();
        if self.is_multi() {
            for child in self.children() {
                child.set_dirty(dirty.clone());
            }
            return;
        }
        let Some(shape) = self.read_state().meta.as_ref().map(|m| m.shape.clone()) else {
            log::trace!("dropping dirty {dirty} on unconfigured {}", self.label());
            return;
        };
        let Some(dirty) = dirty.clip_to(&shape) else {
            return;
        };
        self.write_state().status = SlotStatus::Dirty;
        log::trace!("{} dirty {dirty}", self.label());

        for callback in self.inner.dirty_observers.snapshot() {
            callback(self, &dirty);
        }
        if let Some(parent) = self.parent() {
            for callback in parent.inner.dirty_observers.snapshot() {
                callback(self, &dirty);
            }
        }
        for slot in self.downstream() {
            slot.set_dirty(dirty.clone());
        }
        if self.inner.direction == Direction::Input {
            if let Some(owner) = self.owner() {
                let (slot, subindex) = self.addressing();
                owner.propagate_dirty(&slot, subindex, &dirty);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reads and writes
    // ---------------------------------------------------------------------

    /// Deferred read of `roi`. Whole-value slots take [`Roi::scalar`].
    #[must_use]
    pub fn request(&self, roi: Roi) -> Request<Value> {
        let Some(scheduler) = self.scheduler() else {
            return Request::finished(Err(Error::not_ready(self.label())));
        };
        let slot = self.clone();
        Request::labeled(scheduler, self.label(), move || slot.fetch(&roi))
    }

    /// Reads `roi` of an array slot, blocking until it is computed.
    ///
    /// # Errors
    /// Returns [`Error::NotReady`] for unconfigured slots and the
    /// producing operator's error otherwise.
    pub fn read(&self, roi: &Roi) -> Result<ArrayData> {
        self.request(roi.clone()).wait()?.into_array()
    }

    /// Reads the full value: the whole array, or the scalar value.
    ///
    /// # Errors
    /// Returns [`Error::NotReady`] for unconfigured slots and the
    /// producing operator's error otherwise.
    pub fn value(&self) -> Result<Value> {
        let roi = match self.inner.slot_type {
            SlotType::Array => Roi::from_shape(&self.meta()?.shape),
            SlotType::Value => Roi::scalar(),
        };
        self.request(roi).wait()
    }

    /// Produces the contents of `roi` on the calling thread.
    pub(crate) fn fetch(&self, roi: &Roi) -> Result<Value> {
        if self.is_multi() {
            return Err(Error::Unsupported(format!(
                "multi-slot '{}' must be read through its sub-slots",
                self.label()
            )));
        }
        let (source, meta) = {
            let state = self.read_state();
            (state.source.clone(), state.meta.clone())
        };
        match source {
            Source::Upstream(upstream) => upstream.fetch(roi),
            Source::Value(Value::Array(array)) => Ok(Value::Array(array.region(roi)?)),
            Source::Value(value) => Ok(value),
            Source::Empty => match self.inner.direction {
                Direction::Input => Err(Error::not_ready(self.label())),
                Direction::Output => self.compute(roi, meta),
            },
        }
    }

    fn compute(&self, roi: &Roi, meta: Option<Meta>) -> Result<Value> {
        let meta = meta.ok_or_else(|| Error::not_ready(self.label()))?;
        let owner = self.owner().ok_or_else(|| Error::not_ready(self.label()))?;
        let mut result = match self.inner.slot_type {
            SlotType::Array => {
                roi.check_within(&meta.shape)?;
                Value::Array(ArrayData::zeros(meta.require_dtype()?, &roi.shape()))
            }
            SlotType::Value => Value::None,
        };
        let (slot, subindex) = self.addressing();
        owner.execute(&slot, subindex, roi, &mut result)?;
        if let Value::Array(array) = &result {
            if array.shape() != roi.shape().as_slice() {
                return Err(Error::compute(
                    owner.name(),
                    format!(
                        "{} produced shape {:?} for {roi}",
                        self.label(),
                        array.shape()
                    ),
                ));
            }
        }
        Ok(result)
    }

    /// Writes `data` into `roi` through the owning operator.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] if the operator does not accept
    /// writes on this slot.
    pub fn write(&self, roi: &Roi, data: &ArrayData) -> Result<()> {
        let owner = self.owner().ok_or_else(|| Error::not_ready(self.label()))?;
        let (slot, subindex) = self.addressing();
        owner.set_in_slot(&slot, subindex, roi, data)
    }

    // ---------------------------------------------------------------------
    // Multi-slot structure
    // ---------------------------------------------------------------------

    fn check_resizable(&self) -> Result<()> {
        if !self.is_multi() {
            return Err(Error::Unsupported(format!(
                "'{}' is not a multi-slot",
                self.label()
            )));
        }
        if self.is_connected() {
            return Err(Error::Unsupported(format!(
                "'{}' follows its upstream's length",
                self.label()
            )));
        }
        Ok(())
    }

    /// Grows or shrinks the multi-slot to `len` sub-slots.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for plain slots and for multi-slots
    /// that follow an upstream.
    pub fn resize(&self, len: usize) -> Result<()> {
        self.check_resizable()?;
        let current = self.len();
        for index in (len..current).rev() {
            self.remove_child(index);
        }
        for index in current..len {
            self.insert_child(index);
        }
        Ok(())
    }

    /// Inserts a sub-slot at `index`.
    ///
    /// # Errors
    /// Returns [`Error::StructuralRace`] if `index` is past the end.
    pub fn insert_slot(&self, index: usize) -> Result<Slot> {
        self.check_resizable()?;
        let len = self.len();
        if index > len {
            return Err(Error::StructuralRace {
                slot: self.label(),
                index,
                len,
            });
        }
        Ok(self.insert_child(index))
    }

    /// Removes the sub-slot at `index`.
    ///
    /// # Errors
    /// Returns [`Error::StructuralRace`] if `index` does not exist.
    pub fn remove_slot(&self, index: usize) -> Result<()> {
        self.check_resizable()?;
        let len = self.len();
        if index >= len {
            return Err(Error::StructuralRace {
                slot: self.label(),
                index,
                len,
            });
        }
        self.remove_child(index);
        Ok(())
    }

    fn insert_child(&self, index: usize) -> Slot {
        let child = self.new_child(index);
        let len = {
            let mut state = self.write_state();
            let index = index.min(state.children.len());
            state.children.insert(index, child.clone());
            for (i, slot) in state.children.iter().enumerate().skip(index + 1) {
                slot.inner.index.store(i, Ordering::Release);
            }
            state.children.len()
        };
        log::debug!("{} inserted sub-slot {index} (length {len})", self.label());

        for callback in self.inner.inserted_observers.snapshot() {
            callback(self, index);
        }
        if self.inner.direction == Direction::Input {
            if let Some(owner) = self.owner() {
                owner.propagate_structure(self, &StructureChange::Inserted { index, len });
                // Readiness of the multi-slot may have changed.
                owner.configure();
            }
        }
        for partner in self.downstream() {
            let follower = partner.insert_child(index);
            if let Err(e) = follower.connect(&child) {
                log::warn!("failed to connect {}: {e}", follower.label());
            }
        }
        child
    }

    fn remove_child(&self, index: usize) {
        let (child, len) = {
            let mut state = self.write_state();
            if index >= state.children.len() {
                return;
            }
            let child = state.children.remove(index);
            for (i, slot) in state.children.iter().enumerate().skip(index) {
                slot.inner.index.store(i, Ordering::Release);
            }
            (child, state.children.len())
        };
        child.detach_source();
        child.update_meta(None);
        log::debug!("{} removed sub-slot {index} (length {len})", self.label());

        for callback in self.inner.removed_observers.snapshot() {
            callback(self, index);
        }
        if self.inner.direction == Direction::Input {
            if let Some(owner) = self.owner() {
                owner.propagate_structure(self, &StructureChange::Removed { index, len });
                // Readiness of the multi-slot may have changed.
                owner.configure();
            }
        }
        for partner in self.downstream() {
            partner.remove_child(index);
        }
    }

    // ---------------------------------------------------------------------
    // Observers
    // ---------------------------------------------------------------------

    /// Calls `callback` whenever this slot, or a sub-slot of this
    /// multi-slot, becomes dirty. Sub-slot notifications pass the sub-slot.
    pub fn notify_dirty(
        &self,
        callback: impl Fn(&Slot, &Dirty) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.dirty_observers.add(Arc::new(callback));
        Subscription::new(self.downgrade(), ObserverKind::Dirty, id)
    }

    /// Calls `callback` after a sub-slot was inserted.
    pub fn notify_inserted(
        &self,
        callback: impl Fn(&Slot, usize) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.inserted_observers.add(Arc::new(callback));
        Subscription::new(self.downgrade(), ObserverKind::Inserted, id)
    }

    /// Calls `callback` after a sub-slot was removed.
    pub fn notify_removed(
        &self,
        callback: impl Fn(&Slot, usize) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.removed_observers.add(Arc::new(callback));
        Subscription::new(self.downgrade(), ObserverKind::Removed, id)
    }

    pub(crate) fn remove_observer(&self, kind: ObserverKind, id: u64) {
        let removed = match kind {
            ObserverKind::Dirty => self.inner.dirty_observers.remove(id),
            ObserverKind::Inserted => self.inner.inserted_observers.remove(id),
            ObserverKind::Removed => self.inner.removed_observers.remove(id),
        };
        if !removed {
            log::trace!("observer {id} on {} already gone", self.label());
        }
    }

    /// Severs every downstream connection of this slot.
    pub(crate) fn disconnect_downstream(&self) {
        for slot in self.downstream() {
            slot.disconnect();
        }
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Slot {}

impl Hash for Slot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.label())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
