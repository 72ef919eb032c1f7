//! Seeded two-class carving.
//!
//! Seeds are painted through `WriteSeeds` (1 = background, 2 = object) and
//! kept in a nested [`OpLabelArray`]. Every unseeded voxel takes the class
//! whose mean seed intensity is nearest; the background distance is scaled
//! by `BackgroundPriority`. The segmentation depends on all seeds, so any
//! seed or raw data change dirties it wholly.

use crate::labels::OpLabelArray;
use roiflow_graph::{
    ArrayData, DType, Dirty, Error, Operator, OperatorBuilder, OperatorHandle, Result, Roi, Slot,
    SlotType, Value,
};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Seed label for background.
pub const BACKGROUND: u8 = 1;
/// Seed label for the object.
pub const OBJECT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
struct SeedMeans {
    background: f64,
    object: f64,
}

pub struct OpCarving {
    pub raw_data: Slot,
    pub background_priority: Slot,
    pub write_seeds: Slot,
    pub seeds: Slot,
    pub segmentation: Slot,
    seed_array: OperatorHandle<OpLabelArray>,
    means: Mutex<MeansCache>,
}

#[derive(Default)]
struct MeansCache {
    // `None` until computed; `Some(None)` when a class has no seeds.
    means: Option<Option<SeedMeans>>,
    generation: u64,
}

impl MeansCache {
    fn clear(&mut self) {
        self.means = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

impl OpCarving {
    /// # Errors
    /// Propagates errors from building the seed storage.
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        let raw_data = b.input("RawData", SlotType::Array);
        let background_priority = b.input_with_default("BackgroundPriority", SlotType::Value, 1.0);
        let write_seeds = b.optional_input("WriteSeeds", SlotType::Array);
        let seeds = b.output("Seeds", SlotType::Array);
        let segmentation = b.output("Segmentation", SlotType::Array);

        let seed_array = b.child("Seeds", OpLabelArray::build)?;
        seed_array.image.connect(&raw_data)?;
        seeds.connect(&seed_array.output)?;

        Ok(Self {
            raw_data,
            background_priority,
            write_seeds,
            seeds,
            segmentation,
            seed_array,
            means: Mutex::new(MeansCache::default()),
        })
    }

    fn lock_means(&self) -> MutexGuard<'_, MeansCache> {
        self.means.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes every seed.
    pub fn clear_seeds(&self) {
        self.seed_array.clear_labels();
        self.seeds_changed();
    }

    /// Largest seed label currently painted.
    ///
    /// # Errors
    /// Returns [`Error::NotReady`] before `RawData` is configured.
    pub fn max_seed_label(&self) -> Result<i64> {
        self.seed_array.max_label.value()?.as_int()
    }

    fn seeds_changed(&self) {
        self.lock_means().clear();
        self.segmentation.set_dirty(Dirty::Whole);
    }

    fn seed_means(&self) -> Result<Option<SeedMeans>> {
        let generation = {
            let cache = self.lock_means();
            if let Some(means) = cache.means {
                return Ok(means);
            }
            cache.generation
        };
        let mut sums = [0.0_f64; 2];
        let mut counts = [0_usize; 2];
        for block in self.seed_array.nonzero_blocks.value()?.as_rois()? {
            let seeds = self.seeds.read(block)?.to_u8();
            let raw = self.raw_data.read(block)?.to_f32();
            for (seed, value) in seeds.iter().zip(raw.iter()) {
                let class = match *seed {
                    BACKGROUND => 0,
                    OBJECT => 1,
                    _ => continue,
                };
                sums[class] += f64::from(*value);
                counts[class] += 1;
            }
        }
        #[allow(clippy::cast_precision_loss)]
        let means = (counts[0] > 0 && counts[1] > 0).then(|| SeedMeans {
            background: sums[0] / counts[0] as f64,
            object: sums[1] / counts[1] as f64,
        });
        log::debug!("seed means {means:?}");
        let mut cache = self.lock_means();
        // Seeds or raw data changed while summing; the next read recomputes.
        if cache.generation == generation {
            cache.means = Some(means);
        }
        Ok(means)
    }

    fn compute_segmentation(&self, roi: &Roi, result: &mut Value) -> Result<()> {
        let Some(means) = self.seed_means()? else {
            // Both classes need a seed.
            return Ok(());
        };
        let priority = self.background_priority.value()?.as_float()?;
        let raw = self.raw_data.read(roi)?.to_f32();
        let seeds = self.seeds.read(roi)?.to_u8();
        let labels = ndarray::Zip::from(&raw).and(&seeds).map_collect(|v, s| {
            if *s == BACKGROUND || *s == OBJECT {
                return *s;
            }
            let v = f64::from(*v);
            if (v - means.object).abs() < (v - means.background).abs() * priority {
                OBJECT
            } else {
                BACKGROUND
            }
        });
        *result = Value::Array(ArrayData::U8(labels));
        Ok(())
    }
}

impl Operator for OpCarving {
    fn setup_outputs(&self) -> Result<()> {
        let meta = self.raw_data.meta()?;
        self.segmentation.set_meta(meta.with_dtype(DType::U8))
    }

    fn execute(&self, slot: &Slot, _: Option<usize>, roi: &Roi, result: &mut Value) -> Result<()> {
        if *slot == self.segmentation {
            self.compute_segmentation(roi, result)
        } else {
            Err(Error::Unsupported(format!("unknown output {slot}")))
        }
    }

    fn propagate_dirty(&self, slot: &Slot, _: Option<usize>, _: &Dirty) -> Result<()> {
        if *slot == self.raw_data || *slot == self.background_priority {
            if *slot == self.raw_data {
                self.lock_means().clear();
            }
            self.segmentation.set_dirty(Dirty::Whole);
            Ok(())
        } else if *slot == self.write_seeds {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("unknown input {slot}")))
        }
    }

    fn set_in_slot(
        &self,
        slot: &Slot,
        _: Option<usize>,
        roi: &Roi,
        data: &ArrayData,
    ) -> Result<()> {
        if *slot != self.write_seeds {
            return Err(Error::Unsupported(format!("'{slot}' does not accept writes")));
        }
        self.seed_array.input.write(roi, data)?;
        self.seeds_changed();
        Ok(())
    }
}
