//! The graph: owner of operators and of the scheduler they run on.

use crate::operator::{build_operator, Operator, OperatorBuilder, OperatorHandle, OperatorNode};
use crate::request::Scheduler;
use crate::slot::Slot;
use roiflow_core::Result;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, PoisonError};

struct GraphInner {
    scheduler: Arc<Scheduler>,
    ids: Arc<AtomicUsize>,
    operators: Mutex<Vec<Arc<OperatorNode>>>,
}

/// A set of connected operators sharing one scheduler.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                scheduler,
                ids: Arc::new(AtomicUsize::new(0)),
                operators: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// Adds a top-level operator.
    ///
    /// `build` declares the operator's slots and children and returns the
    /// operator. Outputs are set up as soon as it is in place.
    ///
    /// # Errors
    /// Propagates the construction error of `build`.
    pub fn add_operator<T, F>(&self, name: &str, build: F) -> Result<OperatorHandle<T>>
    where
        T: Operator,
        F: FnOnce(&mut OperatorBuilder) -> Result<T>,
    {
        let handle = build_operator(
            Arc::clone(&self.inner.scheduler),
            Arc::clone(&self.inner.ids),
            name,
            build,
        )?;
        self.inner
            .operators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(handle.node()));
        Ok(handle)
    }

    /// Feeds `downstream` from `upstream`.
    ///
    /// # Errors
    /// See [`Slot::connect`].
    pub fn connect(&self, upstream: &Slot, downstream: &Slot) -> Result<()> {
        downstream.connect(upstream)
    }

    /// Disconnects and forgets an operator. Returns false if it is not a
    /// top-level operator of this graph.
    pub fn remove_operator(&self, node: &Arc<OperatorNode>) -> bool {
        let removed = {
            let mut operators = self
                .inner
                .operators
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let before = operators.len();
            operators.retain(|n| !Arc::ptr_eq(n, node));
            operators.len() != before
        };
        if removed {
            node.teardown();
        }
        removed
    }

    #[must_use]
    pub fn operators(&self) -> Vec<Arc<OperatorNode>> {
        self.inner
            .operators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .operators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tears down every operator, newest first.
    pub fn teardown(&self) {
        let operators = std::mem::take(
            &mut *self
                .inner
                .operators
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for node in operators.iter().rev() {
            node.teardown();
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("operators", &self.len())
            .field("threads", &self.inner.scheduler.num_threads())
            .finish()
    }
}
