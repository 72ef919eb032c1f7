//! Interactive pixel classification over several image lanes.
//!
//! Each lane pairs an image with a label volume painted through
//! `LabelInputs`. A classifier trained on all lanes is cached in a nested
//! [`OpValueCache`] and predicts per-pixel class probabilities for every
//! lane. Any label change dirties the classifier wholly, which in turn
//! dirties every prediction lane wholly.

use crate::classifier::{NearestMeanClassifier, OpTrainClassifier};
use crate::labels::{LabelBlockStore, LABEL_BLOCK_EXTENT};
use crate::value_cache::OpValueCache;
use ndarray::Dimension;
use roiflow_graph::{
    ArrayData, DType, Dirty, Error, Meta, Operator, OperatorBuilder, OperatorHandle, Result, Roi,
    Slot, SlotType, StructureChange, Value,
};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct OpPixelClassification {
    pub input_images: Slot,
    pub label_inputs: Slot,
    pub num_classes: Slot,
    pub label_images: Slot,
    pub nonzero_label_blocks: Slot,
    pub classifier: Slot,
    pub prediction_probabilities: Slot,
    cached_classifier: Slot,
    train: OperatorHandle<OpTrainClassifier>,
    cache: OperatorHandle<OpValueCache>,
    // One store per `LabelInputs` lane; `None` until the lane's image is known.
    stores: Mutex<Vec<Option<LabelBlockStore>>>,
}

impl OpPixelClassification {
    /// # Errors
    /// Propagates errors from building the nested operators.
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        let input_images = b.multi_input("InputImages", SlotType::Array);
        let label_inputs = b.optional_multi_input("LabelInputs", SlotType::Array);
        let num_classes = b.input_with_default("NumClasses", SlotType::Value, 2_i64);
        let cached_classifier = b.optional_input("CachedClassifier", SlotType::Value);
        let label_images = b.multi_output("LabelImages", SlotType::Array);
        let nonzero_label_blocks = b.multi_output("NonzeroLabelBlocks", SlotType::Value);
        let classifier = b.output("Classifier", SlotType::Value);
        let prediction_probabilities = b.multi_output("PredictionProbabilities", SlotType::Array);

        let train = b.child("Train", OpTrainClassifier::build)?;
        train.images.connect(&input_images)?;
        train.labels.connect(&label_images)?;
        train.nonzero_blocks.connect(&nonzero_label_blocks)?;
        train.num_classes.connect(&num_classes)?;

        let cache = b.child("ClassifierCache", OpValueCache::build)?;
        cache.input.connect(&train.classifier)?;
        classifier.connect(&cache.output)?;
        cached_classifier.connect(&cache.output)?;

        Ok(Self {
            input_images,
            label_inputs,
            num_classes,
            label_images,
            nonzero_label_blocks,
            classifier,
            prediction_probabilities,
            cached_classifier,
            train,
            cache,
            stores: Mutex::new(Vec::new()),
        })
    }

    fn lock_stores(&self) -> MutexGuard<'_, Vec<Option<LabelBlockStore>>> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cache holding the trained classifier.
    #[must_use]
    pub fn classifier_cache(&self) -> &OperatorHandle<OpValueCache> {
        &self.cache
    }

    /// The operator that trains the classifier.
    #[must_use]
    pub fn trainer(&self) -> &OperatorHandle<OpTrainClassifier> {
        &self.train
    }

    /// Number of image lanes.
    #[must_use]
    pub fn num_lanes(&self) -> usize {
        self.input_images.len()
    }

    /// Appends a lane fed by `image`; returns its index.
    ///
    /// # Errors
    /// Returns an error if `InputImages` follows an upstream multi-slot or
    /// `image` cannot feed it.
    pub fn add_lane(&self, image: &Slot) -> Result<usize> {
        let index = self.input_images.len();
        self.input_images.insert_slot(index)?.connect(image)?;
        Ok(index)
    }

    fn num_classes(&self) -> Result<usize> {
        let n = self.num_classes.value()?.as_int()?;
        match usize::try_from(n) {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(Error::Config(format!("number of classes must be positive, got {n}"))),
        }
    }

    fn all_inputs_ready(&self) -> bool {
        self.input_images.ready() && self.num_classes.ready()
    }

    fn setup_label_lane(&self, lane: usize, image: Option<&Meta>) -> Result<()> {
        let labels = self.label_images.child(lane)?;
        let blocks = self.nonzero_label_blocks.child(lane)?;
        let Some(image) = image else {
            // Labels survive while lanes are being renumbered.
            labels.clear_meta();
            blocks.clear_meta();
            return Ok(());
        };
        {
            let mut stores = self.lock_stores();
            if let Some(store) = stores.get_mut(lane) {
                if store.as_ref().map(LabelBlockStore::shape) != Some(image.shape.as_slice()) {
                    *store = Some(LabelBlockStore::new(&image.shape, LABEL_BLOCK_EXTENT));
                }
            }
        }
        let mut meta = Meta::new(image.shape.clone(), DType::U8);
        meta.axistags.clone_from(&image.axistags);
        labels.set_meta(meta)?;
        blocks.set_meta(Meta::scalar())
    }

    fn predict(&self, lane: usize, roi: &Roi, result: &mut Value) -> Result<()> {
        let classifier = self.cached_classifier.value()?;
        if classifier.is_none() {
            return Err(Error::not_ready(self.classifier.label()));
        }
        let classifier = classifier
            .downcast::<NearestMeanClassifier>()
            .ok_or_else(|| Error::Unsupported(format!("{} is not a classifier", classifier.kind())))?;

        let ndim = roi.ndim();
        if ndim == 0 {
            return Err(Error::InvalidRoi(format!("{roi} lacks a channel axis")));
        }
        let spatial = Roi::new(roi.start()[..ndim - 1].to_vec(), roi.stop()[..ndim - 1].to_vec())?;
        let channels = roi.start()[ndim - 1]..roi.stop()[ndim - 1];
        let image = self.input_images.child(lane)?.read(&spatial)?.to_f32();

        let out = match result {
            Value::Array(ArrayData::F32(out)) => out,
            other => {
                return Err(Error::Unsupported(format!(
                    "prediction buffer holds {}",
                    other.kind()
                )))
            }
        };
        for (index, value) in image.indexed_iter() {
            let probabilities = classifier.predict(*value);
            let mut position = index.slice().to_vec();
            position.push(0);
            for (offset, channel) in channels.clone().enumerate() {
                position[ndim - 1] = offset;
                out[position.as_slice()] = probabilities.get(channel).copied().unwrap_or(0.0);
            }
        }
        Ok(())
    }

    fn label_lane_changed(&self, lane: usize, roi: &Roi) -> Result<()> {
        self.label_images.child(lane)?.set_dirty(roi.clone());
        self.nonzero_label_blocks.child(lane)?.set_dirty(Dirty::Whole);
        Ok(())
    }

    /// Removes every label of lane `lane`.
    ///
    /// # Errors
    /// Returns [`Error::StructuralRace`] if the lane does not exist.
    pub fn clear_labels(&self, lane: usize) -> Result<()> {
        let shape = {
            let mut stores = self.lock_stores();
            let len = stores.len();
            let store = stores.get_mut(lane).ok_or_else(|| Error::StructuralRace {
                slot: self.label_inputs.label(),
                index: lane,
                len,
            })?;
            store.as_mut().map(|store| {
                store.clear();
                store.shape().to_vec()
            })
        };
        if let Some(shape) = shape {
            self.label_lane_changed(lane, &Roi::from_shape(&shape))?;
        }
        Ok(())
    }
}

impl Operator for OpPixelClassification {
    fn setup_outputs(&self) -> Result<()> {
        let num_classes = self.num_classes()?;
        let images = self.input_images.children();

        for (lane, image) in images.iter().enumerate() {
            let Ok(prediction) = self.prediction_probabilities.child(lane) else {
                continue;
            };
            let meta = image.meta()?;
            let mut shape = meta.shape.clone();
            shape.push(num_classes);
            let mut prediction_meta = Meta::new(shape, DType::F32);
            if let Some(tags) = &meta.axistags {
                prediction_meta.axistags = Some(format!("{tags}c"));
            }
            prediction.set_meta(prediction_meta)?;
        }

        for lane in 0..self.label_inputs.len() {
            let image = images.get(lane).map(Slot::meta).transpose()?;
            self.setup_label_lane(lane, image.as_ref())?;
        }
        Ok(())
    }

    fn execute(
        &self,
        slot: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let lane = subindex.ok_or_else(|| Error::Unsupported(format!("unknown output {slot}")))?;
        if *slot == self.prediction_probabilities {
            return self.predict(lane, roi, result);
        }
        let stores = self.lock_stores();
        let store = stores
            .get(lane)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_ready(format!("{}[{lane}]", slot.label())))?;
        *result = if *slot == self.label_images {
            Value::Array(store.read(roi)?)
        } else if *slot == self.nonzero_label_blocks {
            Value::Rois(store.nonzero_blocks()?)
        } else {
            return Err(Error::Unsupported(format!("unknown output {slot}")));
        };
        Ok(())
    }

    fn propagate_dirty(&self, slot: &Slot, subindex: Option<usize>, dirty: &Dirty) -> Result<()> {
        if *slot == self.input_images {
            let Some(lane) = subindex else {
                return Ok(());
            };
            let prediction = self.prediction_probabilities.child(lane)?;
            let dirty = match dirty {
                Dirty::Whole => Dirty::Whole,
                Dirty::Region(roi) => {
                    let num_classes = self.num_classes()?;
                    let mut start = roi.start().to_vec();
                    let mut stop = roi.stop().to_vec();
                    start.push(0);
                    stop.push(num_classes);
                    Dirty::Region(Roi::new(start, stop)?)
                }
            };
            prediction.set_dirty(dirty);
            Ok(())
        } else if *slot == self.num_classes {
            if self.all_inputs_ready() {
                self.setup_outputs()?;
            }
            self.prediction_probabilities.set_dirty(Dirty::Whole);
            Ok(())
        } else if *slot == self.cached_classifier {
            self.prediction_probabilities.set_dirty(Dirty::Whole);
            Ok(())
        } else if *slot == self.label_inputs {
            // Labels arrive through writes, not upstream changes.
            Ok(())
        } else {
            Err(Error::Unsupported(format!("unknown input {slot}")))
        }
    }

    fn propagate_structure(&self, slot: &Slot, change: &StructureChange) -> Result<()> {
        if *slot == self.input_images {
            change.apply_to(&self.prediction_probabilities)?;
            let lanes = change.len();
            match change {
                StructureChange::Inserted { index, .. } if self.label_inputs.len() < lanes => {
                    self.label_inputs.insert_slot(*index)?;
                }
                StructureChange::Removed { index, .. } if self.label_inputs.len() > lanes => {
                    self.label_inputs.remove_slot(*index)?;
                }
                _ => {}
            }
        } else if *slot == self.label_inputs {
            match change {
                StructureChange::Inserted { index, .. } => {
                    let mut stores = self.lock_stores();
                    let index = (*index).min(stores.len());
                    stores.insert(index, None);
                }
                StructureChange::Removed { index, .. } => {
                    let mut stores = self.lock_stores();
                    if *index < stores.len() {
                        stores.remove(*index);
                    }
                }
            }
            change.apply_to(&self.label_images)?;
            change.apply_to(&self.nonzero_label_blocks)?;
        } else {
            return Ok(());
        }
        if self.all_inputs_ready() {
            self.setup_outputs()?;
        }
        Ok(())
    }

    fn set_in_slot(
        &self,
        slot: &Slot,
        subindex: Option<usize>,
        roi: &Roi,
        data: &ArrayData,
    ) -> Result<()> {
        let Some(lane) = subindex.filter(|_| *slot == self.label_inputs) else {
            return Err(Error::Unsupported(format!("'{slot}' does not accept writes")));
        };
        {
            let mut stores = self.lock_stores();
            let store = stores
                .get_mut(lane)
                .and_then(Option::as_mut)
                .ok_or_else(|| Error::not_ready(format!("{}[{lane}]", slot.label())))?;
            store.write(roi, data)?;
        }
        log::trace!("wrote labels {roi} into lane {lane}");
        self.label_lane_changed(lane, roi)
    }
}
