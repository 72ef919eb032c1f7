//! Cache sizing.

use roiflow_core::{Error, Result};
use sysinfo::System;

/// Default block extent per axis.
pub const DEFAULT_BLOCK_EXTENT: usize = 64;

/// Configuration for [`crate::OpBlockedArrayCache`].
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Block extent per axis. `None` uses [`DEFAULT_BLOCK_EXTENT`] on every
    /// axis.
    pub block_shape: Option<Vec<usize>>,
    /// Fraction of available system memory the cache may hold
    /// (0.0 < fraction <= 1.0).
    pub memory_fraction: f64,
    /// Explicit memory budget override (bytes). If set, `memory_fraction`
    /// is ignored.
    pub memory_budget_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_shape: None,
            memory_fraction: 0.25,
            memory_budget_bytes: None,
        }
    }
}

impl CacheConfig {
    /// Set the block shape. Zero extents are clamped to 1.
    ///
    /// Use [`Self::try_with_block_shape`] to surface invalid values as an
    /// error instead.
    #[must_use]
    pub fn with_block_shape(mut self, block_shape: Vec<usize>) -> Self {
        self.block_shape = Some(block_shape.into_iter().map(|b| b.max(1)).collect());
        self
    }

    /// Fallible variant of [`Self::with_block_shape`].
    ///
    /// # Errors
    /// Returns an error if the shape is empty or has a zero extent.
    pub fn try_with_block_shape(mut self, block_shape: Vec<usize>) -> Result<Self> {
        if block_shape.is_empty() || block_shape.contains(&0) {
            return Err(Error::Config(format!(
                "block shape {block_shape:?} must be non-empty with positive extents"
            )));
        }
        self.block_shape = Some(block_shape);
        Ok(self)
    }

    /// Set the fraction of available system memory to target.
    #[must_use]
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    /// Set an explicit memory budget in bytes.
    #[must_use]
    pub fn with_memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    /// Block shape for a volume, clipped to the volume's extents.
    ///
    /// # Errors
    /// Returns an error if an explicit block shape has the wrong number of
    /// axes.
    pub fn effective_block_shape(&self, volume_shape: &[usize]) -> Result<Vec<usize>> {
        let block_shape = match &self.block_shape {
            Some(shape) if shape.len() != volume_shape.len() => {
                return Err(Error::Config(format!(
                    "block shape {shape:?} does not match volume shape {volume_shape:?}"
                )))
            }
            Some(shape) => shape.clone(),
            None => vec![DEFAULT_BLOCK_EXTENT; volume_shape.len()],
        };
        Ok(block_shape
            .iter()
            .zip(volume_shape)
            .map(|(b, n)| (*b).min(*n).max(1))
            .collect())
    }

    /// Resolve the cache budget in bytes.
    ///
    /// # Errors
    /// Returns an error if the memory fraction is invalid or system memory
    /// cannot be queried.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn resolve_budget_bytes(&self) -> Result<usize> {
        if let Some(bytes) = self.memory_budget_bytes {
            return Ok(bytes);
        }
        if !(0.0 < self.memory_fraction && self.memory_fraction <= 1.0) {
            return Err(Error::Config(
                "memory_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        if available == 0 {
            return Err(Error::Config(
                "available system memory reported as 0".to_string(),
            ));
        }
        let budget = (available as f64 * self.memory_fraction).floor() as u64;
        Ok(usize::try_from(budget).unwrap_or(usize::MAX))
    }
}
