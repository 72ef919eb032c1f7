//! Applet serializers.
//!
//! An [`AppletSerializer`] owns one top-level group of the project tree and
//! translates between it and the state of a pipeline. Serializers track which
//! parts of their state changed since the last save and rewrite only those.

use crate::error::{Error, Result};
use crate::tree::{DatasetData, ProjectGroup};
use roiflow_core::{slicing_to_string, string_to_slicing, Dirty, Roi, Value};
use roiflow_graph::{OperatorHandle, Slot, Subscription};
use roiflow_operators::{NearestMeanClassifier, OpPixelClassification};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Version written to the `StorageVersion` dataset of each top group.
pub const STORAGE_VERSION: &str = "0.1";

/// Root dataset naming the version of the program that wrote the project.
pub const PROJECT_VERSION_KEY: &str = "projectVersion";

/// Progress callback, called with a percentage in `0..=100`.
pub type ProgressCallback = dyn Fn(u8) + Send + Sync;

/// Reads and writes one top-level group of a project.
pub trait AppletSerializer: Send + Sync {
    /// Name of the group this serializer owns.
    fn top_group_name(&self) -> &str;

    fn storage_version(&self) -> &str {
        STORAGE_VERSION
    }

    /// Writes the changed parts of the pipeline state into `group`.
    ///
    /// # Errors
    /// Returns an error if the pipeline cannot produce the state to store.
    fn serialize_group(&self, group: &mut ProjectGroup) -> Result<()>;

    /// Restores the pipeline state from `group`.
    ///
    /// # Errors
    /// Returns an error if the group does not match `version`'s layout or
    /// the pipeline rejects the stored state.
    fn deserialize_group(&self, group: &ProjectGroup, version: &str) -> Result<()>;

    /// True if the pipeline state changed since the last save or load.
    fn is_dirty(&self) -> bool;

    /// Resets the pipeline state this serializer restores.
    ///
    /// # Errors
    /// Returns an error if the pipeline refuses the reset.
    fn unload(&self) -> Result<()>;

    /// Creates the top group if needed, stamps its version and serializes.
    ///
    /// # Errors
    /// Propagates errors from [`AppletSerializer::serialize_group`].
    fn serialize(&self, root: &mut ProjectGroup) -> Result<()> {
        let version = self.storage_version().to_string();
        let group = root.require_group(self.top_group_name());
        group.insert_dataset("StorageVersion", DatasetData::Text(version));
        self.serialize_group(group)
    }

    /// Deserializes the top group; a project without it is left alone.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] if the group lacks a version, and
    /// propagates errors from [`AppletSerializer::deserialize_group`].
    fn deserialize(&self, root: &ProjectGroup) -> Result<()> {
        let Some(group) = root.group(self.top_group_name()) else {
            log::debug!("project has no '{}' group", self.top_group_name());
            return Ok(());
        };
        let version = group
            .dataset("StorageVersion")
            .and_then(|d| d.data.as_text())
            .ok_or_else(|| {
                Error::InvalidFormat(format!("'{}' has no StorageVersion", self.top_group_name()))
            })?;
        self.deserialize_group(group, version)
    }
}

/// Options for [`PixelClassificationSerializer`].
#[derive(Clone, Debug, Default)]
pub struct SerializerOptions {
    /// Also store the prediction maps of every lane.
    pub include_predictions: bool,
}

impl SerializerOptions {
    #[must_use]
    pub fn with_include_predictions(mut self, include: bool) -> Self {
        self.include_predictions = include;
        self
    }
}

#[derive(Default)]
struct DirtyFlags {
    labels: AtomicBool,
    classifier: AtomicBool,
    predictions: AtomicBool,
}

impl DirtyFlags {
    fn clear(&self) {
        self.labels.store(false, Ordering::Release);
        self.classifier.store(false, Ordering::Release);
        self.predictions.store(false, Ordering::Release);
    }
}

/// Raises `flag` when `slot`, or any current or future sub-slot of it,
/// becomes dirty.
fn watch(
    slot: &Slot,
    flags: &Arc<DirtyFlags>,
    flag: fn(&DirtyFlags) -> &AtomicBool,
) -> Subscription {
    let flags = Arc::downgrade(flags);
    slot.notify_dirty(move |_, _| {
        if let Some(flags) = flags.upgrade() {
            flag(&flags).store(true, Ordering::Release);
        }
    })
}

/// Stores the labels, classifier and optionally the predictions of an
/// [`OpPixelClassification`].
///
/// Layout of the `PixelClassification` group:
///
/// ```text
/// StorageVersion               "0.1"
/// LabelSets/labels000/block0000  u8 labels, attribute blockSlice = "[0:64,0:64]"
/// Classifier                   classifier as JSON text
/// Predictions/predictions0000  f32 probabilities (optional)
/// ```
pub struct PixelClassificationSerializer {
    operator: OperatorHandle<OpPixelClassification>,
    options: SerializerOptions,
    flags: Arc<DirtyFlags>,
    progress: Option<Box<ProgressCallback>>,
    _subscriptions: Vec<Subscription>,
}

impl PixelClassificationSerializer {
    pub const TOP_GROUP: &'static str = "PixelClassification";

    #[must_use]
    pub fn new(operator: OperatorHandle<OpPixelClassification>, options: SerializerOptions) -> Self {
        let flags = Arc::new(DirtyFlags::default());
        let subscriptions = vec![
            watch(&operator.classifier, &flags, |f| &f.classifier),
            watch(&operator.label_images, &flags, |f| &f.labels),
            watch(&operator.prediction_probabilities, &flags, |f| &f.predictions),
        ];

        Self {
            operator,
            options,
            flags,
            progress: None,
            _subscriptions: subscriptions,
        }
    }

    /// Reports progress of `serialize` and `deserialize` to `callback`.
    #[must_use]
    pub fn with_progress(mut self, callback: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    fn emit(&self, percent: usize) {
        if let Some(progress) = &self.progress {
            progress(u8::try_from(percent.min(100)).unwrap_or(100));
        }
    }

    fn labels_dirty(&self) -> bool {
        self.flags.labels.load(Ordering::Acquire)
    }

    fn classifier_dirty(&self) -> bool {
        self.flags.classifier.load(Ordering::Acquire)
    }

    fn predictions_dirty(&self) -> bool {
        self.options.include_predictions && self.flags.predictions.load(Ordering::Acquire)
    }

    fn serialize_labels(&self, group: &mut ProjectGroup) -> Result<()> {
        let op = &self.operator;
        let sets = group.create_group("LabelSets");
        for lane in 0..op.nonzero_label_blocks.len() {
            let lane_group = sets.create_group(&format!("labels{lane:03}"));
            let blocks = match op.nonzero_label_blocks.child(lane)?.value() {
                Ok(blocks) => blocks,
                Err(e) if e.is_not_ready() => {
                    log::debug!("label lane {lane} is not ready; stored empty");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let labels = op.label_images.child(lane)?;
            for (index, block) in blocks.as_rois()?.iter().enumerate() {
                let data = labels.read(block)?;
                lane_group
                    .insert_dataset(&format!("block{index:04}"), DatasetData::Array(data))
                    .set_attr("blockSlice", slicing_to_string(block));
            }
        }
        self.flags.labels.store(false, Ordering::Release);
        Ok(())
    }

    fn serialize_classifier(&self, group: &mut ProjectGroup) -> Result<()> {
        group.remove("Classifier");
        self.flags.classifier.store(false, Ordering::Release);
        if !self.operator.classifier.ready() {
            return Ok(());
        }
        let value = match self.operator.classifier.value() {
            Ok(value) => value,
            Err(e) if e.is_not_ready() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if value.is_none() {
            return Ok(());
        }
        let classifier = value.downcast::<NearestMeanClassifier>().ok_or_else(|| {
            Error::InvalidFormat(format!("cannot store a classifier of kind {}", value.kind()))
        })?;
        let json = serde_json::to_string(classifier.as_ref())?;
        group.insert_dataset("Classifier", DatasetData::Text(json));
        Ok(())
    }

    fn serialize_predictions(&self, group: &mut ProjectGroup) -> Result<()> {
        let op = &self.operator;
        let predictions = group.create_group("Predictions");
        for (lane, slot) in op.prediction_probabilities.children().iter().enumerate() {
            let Ok(meta) = slot.meta() else {
                continue;
            };
            match slot.read(&Roi::from_shape(&meta.shape)) {
                Ok(data) => {
                    let name = format!("predictions{lane:04}");
                    predictions.insert_dataset(&name, DatasetData::Array(data));
                }
                Err(e) if e.is_not_ready() => {
                    log::debug!("predictions of lane {lane} are not ready; skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.flags.predictions.store(false, Ordering::Release);
        Ok(())
    }

    fn deserialize_labels(&self, group: &ProjectGroup) -> Result<()> {
        let Some(sets) = group.group("LabelSets") else {
            return Ok(());
        };
        let op = &self.operator;
        if op.label_inputs.len() < sets.len() {
            op.label_inputs.resize(sets.len())?;
        }
        for (lane, (_, lane_group)) in sets.groups().enumerate() {
            let target = op.label_inputs.child(lane)?;
            for (name, dataset) in lane_group.datasets() {
                let slicing = dataset.attr("blockSlice").ok_or_else(|| {
                    Error::InvalidFormat(format!("label block {name} has no blockSlice"))
                })?;
                let roi = string_to_slicing(slicing)?;
                let data = dataset.data.as_array().ok_or_else(|| {
                    Error::InvalidFormat(format!("label block {name} is not an array"))
                })?;
                target.write(&roi, data)?;
            }
        }
        log::debug!("restored labels of {} lanes", sets.len());
        Ok(())
    }

    fn deserialize_classifier(&self, group: &ProjectGroup) -> Result<()> {
        let Some(dataset) = group.dataset("Classifier") else {
            return Ok(());
        };
        let json = dataset
            .data
            .as_text()
            .ok_or_else(|| Error::InvalidFormat("Classifier is not text".to_string()))?;
        let classifier: NearestMeanClassifier = serde_json::from_str(json)?;
        self.operator
            .classifier_cache()
            .force_value(Value::opaque(classifier))?;
        Ok(())
    }
}

impl AppletSerializer for PixelClassificationSerializer {
    fn top_group_name(&self) -> &str {
        Self::TOP_GROUP
    }

    fn serialize_group(&self, group: &mut ProjectGroup) -> Result<()> {
        let steps = [self.labels_dirty(), self.classifier_dirty(), self.predictions_dirty()]
            .iter()
            .filter(|dirty| **dirty)
            .count();
        self.emit(0);
        if steps == 0 {
            self.emit(100);
            return Ok(());
        }
        let increment = 100 / steps;
        let mut progress = 0;

        if self.labels_dirty() {
            self.serialize_labels(group)?;
            progress += increment;
            self.emit(progress);
        }
        if self.classifier_dirty() {
            self.serialize_classifier(group)?;
            progress += increment;
            self.emit(progress);
        }
        if self.predictions_dirty() {
            self.serialize_predictions(group)?;
            progress += increment;
            self.emit(progress);
        }
        self.flags.clear();
        if progress < 100 {
            self.emit(100);
        }
        Ok(())
    }

    fn deserialize_group(&self, group: &ProjectGroup, version: &str) -> Result<()> {
        if version != self.storage_version() {
            return Err(Error::InvalidFormat(format!(
                "{} storage version {version} is not supported",
                Self::TOP_GROUP
            )));
        }
        self.emit(0);
        self.deserialize_labels(group)?;
        self.emit(50);
        self.deserialize_classifier(group)?;
        self.emit(100);
        self.flags.clear();
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.labels_dirty() || self.classifier_dirty() || self.predictions_dirty()
    }

    fn unload(&self) -> Result<()> {
        self.operator.label_inputs.resize(0)?;
        self.operator
            .classifier_cache()
            .input
            .set_dirty(Dirty::Whole);
        Ok(())
    }
}

/// Imports the labels of version-0.5 projects.
///
/// Those projects keep one group per image under `DataSets`, each with its
/// labels in `labels/data`. The importer never writes anything back.
pub struct LegacyImportDeserializer {
    operator: OperatorHandle<OpPixelClassification>,
}

impl LegacyImportDeserializer {
    pub const LEGACY_VERSION: f64 = 0.5;

    #[must_use]
    pub fn new(operator: OperatorHandle<OpPixelClassification>) -> Self {
        Self { operator }
    }
}

impl AppletSerializer for LegacyImportDeserializer {
    fn top_group_name(&self) -> &str {
        "DataSets"
    }

    fn serialize_group(&self, _group: &mut ProjectGroup) -> Result<()> {
        Ok(())
    }

    fn serialize(&self, _root: &mut ProjectGroup) -> Result<()> {
        Ok(())
    }

    #[allow(clippy::float_cmp)]
    fn deserialize(&self, root: &ProjectGroup) -> Result<()> {
        let version = root
            .dataset(PROJECT_VERSION_KEY)
            .and_then(|d| d.data.as_float());
        if version != Some(Self::LEGACY_VERSION) {
            return Ok(());
        }
        match root.group(self.top_group_name()) {
            Some(group) => self.deserialize_group(group, "0.5"),
            None => Ok(()),
        }
    }

    fn deserialize_group(&self, group: &ProjectGroup, _version: &str) -> Result<()> {
        let op = &self.operator;
        if op.label_inputs.len() < group.len() {
            op.label_inputs.resize(group.len())?;
        }
        for (lane, (name, item)) in group.groups().enumerate() {
            let Some(labels) = item.dataset_at("labels/data") else {
                log::debug!("legacy dataset {name} has no labels");
                continue;
            };
            let data = labels.data.as_array().ok_or_else(|| {
                Error::InvalidFormat(format!("labels of legacy dataset {name} are not an array"))
            })?;
            op.label_inputs
                .child(lane)?
                .write(&Roi::from_shape(data.shape()), data)?;
        }
        log::info!("imported labels of {} legacy datasets", group.len());
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        false
    }

    fn unload(&self) -> Result<()> {
        Ok(())
    }
}
