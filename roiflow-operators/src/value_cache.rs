//! Cache for a single whole value.

use roiflow_graph::{Dirty, Error, Meta, Operator, OperatorBuilder, Result, Roi, Slot, SlotType, Value};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct CacheState {
    value: Option<Value>,
    // Input changed while frozen.
    pending: bool,
    // Bumped whenever `value` is replaced or dropped.
    generation: u64,
}

impl CacheState {
    fn replace(&mut self, value: Option<Value>) {
        self.value = value;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Caches the value of `Input`.
///
/// While `FixAtCurrent` is true, input changes do not invalidate the cached
/// value; they are replayed once it is released. A value placed with
/// [`OpValueCache::force_value`] is served without evaluating `Input`.
pub struct OpValueCache {
    pub input: Slot,
    pub fix_at_current: Slot,
    pub output: Slot,
    state: Mutex<CacheState>,
    compute: Mutex<()>,
}

impl OpValueCache {
    /// # Errors
    /// Never fails; the signature matches [`roiflow_graph::Graph::add_operator`].
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        Ok(Self {
            input: b.optional_input("Input", SlotType::Value),
            fix_at_current: b.input_with_default("FixAtCurrent", SlotType::Value, false),
            output: b.output("Output", SlotType::Value),
            state: Mutex::new(CacheState::default()),
            compute: Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fixed(&self) -> Result<bool> {
        self.fix_at_current.value()?.as_bool()
    }

    /// Returns true if a value is cached.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Places `value` in the cache.
    ///
    /// `Output` becomes ready at once and serves `value` until `Input`
    /// changes.
    ///
    /// # Errors
    /// Returns an error if `Output` is fed from elsewhere.
    pub fn force_value(&self, value: Value) -> Result<()> {
        {
            let mut state = self.lock();
            state.replace(Some(value));
            state.pending = false;
        }
        log::debug!("forced value into {}", self.output.label());
        self.output.set_meta(Meta::scalar())?;
        self.output.set_dirty(Dirty::Whole);
        Ok(())
    }

    /// Drops the cached value and announces the change unless frozen.
    fn invalidate(&self) -> Result<()> {
        if self.is_fixed()? {
            self.lock().pending = true;
            return Ok(());
        }
        self.lock().replace(None);
        self.output.set_dirty(Dirty::Whole);
        Ok(())
    }
}

impl Operator for OpValueCache {
    fn setup_outputs(&self) -> Result<()> {
        if self.input.ready() || self.has_value() {
            self.output.set_meta(Meta::scalar())
        } else {
            self.output.clear_meta();
            Ok(())
        }
    }

    fn execute(&self, slot: &Slot, _: Option<usize>, _: &Roi, result: &mut Value) -> Result<()> {
        if *slot != self.output {
            return Err(Error::Unsupported(format!("unknown output {slot}")));
        }
        if let Some(value) = &self.lock().value {
            *result = value.clone();
            return Ok(());
        }

        let _computing = self.compute.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = {
            let state = self.lock();
            if let Some(value) = &state.value {
                *result = value.clone();
                return Ok(());
            }
            state.generation
        };
        let value = self.input.value()?;
        let mut state = self.lock();
        // An invalidation during the read already announced newer data.
        if state.generation == generation {
            state.replace(Some(value.clone()));
        } else {
            log::trace!("dropping stale value for {}", self.output.label());
        }
        *result = value;
        Ok(())
    }

    fn propagate_dirty(&self, slot: &Slot, _: Option<usize>, _: &Dirty) -> Result<()> {
        if *slot == self.input {
            self.invalidate()
        } else if *slot == self.fix_at_current {
            let replay = !self.is_fixed()? && std::mem::take(&mut self.lock().pending);
            if replay {
                self.lock().replace(None);
                self.output.set_dirty(Dirty::Whole);
            }
            Ok(())
        } else {
            Err(Error::Unsupported(format!("unknown input {slot}")))
        }
    }
}
