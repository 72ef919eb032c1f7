//! Nearest-mean pixel classifier and the operator that trains it.

use roiflow_graph::{
    Dirty, Error, Meta, Operator, OperatorBuilder, Result, Roi, Slot, SlotType, StructureChange,
    Value,
};
use serde::{Deserialize, Serialize};

/// Classifies a pixel by the distance of its intensity to per-class means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestMeanClassifier {
    num_classes: usize,
    /// Mean intensity per class; `None` for classes without samples.
    means: Vec<Option<f64>>,
}

impl NearestMeanClassifier {
    /// Trains from `(intensity, label)` samples.
    ///
    /// Label `k` (1-based) belongs to class `k - 1`. Label 0 and labels
    /// above `num_classes` are ignored.
    pub fn train(num_classes: usize, samples: impl IntoIterator<Item = (f32, u8)>) -> Self {
        let mut sums = vec![0.0_f64; num_classes];
        let mut counts = vec![0_usize; num_classes];
        for (value, label) in samples {
            let label = usize::from(label);
            if label == 0 || label > num_classes {
                continue;
            }
            sums[label - 1] += f64::from(value);
            counts[label - 1] += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        let means = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| (*count > 0).then(|| sum / *count as f64))
            .collect();
        Self { num_classes, means }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[must_use]
    pub fn means(&self) -> &[Option<f64>] {
        &self.means
    }

    /// Number of classes that received samples.
    #[must_use]
    pub fn trained_classes(&self) -> usize {
        self.means.iter().flatten().count()
    }

    /// Class probabilities for one intensity, proportional to inverse
    /// distance. Untrained classes get 0; with no trained class the result
    /// is uniform.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn predict(&self, value: f32) -> Vec<f32> {
        const EPSILON: f64 = 1e-6;
        let value = f64::from(value);
        let weights: Vec<f64> = self
            .means
            .iter()
            .map(|mean| mean.map_or(0.0, |m| 1.0 / ((value - m).abs() + EPSILON)))
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            weights.iter().map(|w| (w / total) as f32).collect()
        } else {
            vec![1.0 / self.num_classes.max(1) as f32; self.num_classes]
        }
    }
}

/// Trains a [`NearestMeanClassifier`] from every labeled lane.
///
/// `Classifier` is [`Value::None`] while no lane carries labels. Any change
/// to images, labels or lanes dirties it wholly.
pub struct OpTrainClassifier {
    pub images: Slot,
    pub labels: Slot,
    pub nonzero_blocks: Slot,
    pub num_classes: Slot,
    pub classifier: Slot,
}

impl OpTrainClassifier {
    /// # Errors
    /// Never fails; the signature matches [`roiflow_graph::Graph::add_operator`].
    pub fn build(b: &mut OperatorBuilder) -> Result<Self> {
        Ok(Self {
            images: b.multi_input("Images", SlotType::Array),
            labels: b.multi_input("Labels", SlotType::Array),
            nonzero_blocks: b.multi_input("NonzeroBlocks", SlotType::Value),
            num_classes: b.input_with_default("NumClasses", SlotType::Value, 2_i64),
            classifier: b.output("Classifier", SlotType::Value),
        })
    }

    fn lane_samples(&self, lane: usize, samples: &mut Vec<(f32, u8)>) -> Result<()> {
        let image = self.images.child(lane)?;
        let labels = self.labels.child(lane)?;
        for block in self.nonzero_blocks.child(lane)?.value()?.as_rois()? {
            let values = image.read(block)?.to_f32();
            let labels = labels.read(block)?.to_u8();
            samples.extend(
                values
                    .iter()
                    .zip(labels.iter())
                    .filter(|(_, label)| **label > 0)
                    .map(|(v, l)| (*v, *l)),
            );
        }
        Ok(())
    }
}

impl Operator for OpTrainClassifier {
    fn setup_outputs(&self) -> Result<()> {
        self.classifier.set_meta(Meta::scalar())
    }

    fn execute(&self, slot: &Slot, _: Option<usize>, _: &Roi, result: &mut Value) -> Result<()> {
        if *slot != self.classifier {
            return Err(Error::Unsupported(format!("unknown output {slot}")));
        }
        let num_classes = usize::try_from(self.num_classes.value()?.as_int()?)
            .map_err(|_| Error::Config("number of classes must not be negative".to_string()))?;
        let lanes = self
            .images
            .len()
            .min(self.labels.len())
            .min(self.nonzero_blocks.len());
        let mut samples = Vec::new();
        for lane in 0..lanes {
            self.lane_samples(lane, &mut samples)?;
        }
        if samples.is_empty() {
            log::debug!("no labels; classifier stays empty");
            return Ok(());
        }
        let classifier = NearestMeanClassifier::train(num_classes, samples);
        log::debug!(
            "trained classifier on {lanes} lanes ({} of {num_classes} classes)",
            classifier.trained_classes()
        );
        *result = Value::opaque(classifier);
        Ok(())
    }

    fn propagate_dirty(&self, _: &Slot, _: Option<usize>, _: &Dirty) -> Result<()> {
        self.classifier.set_dirty(Dirty::Whole);
        Ok(())
    }

    fn propagate_structure(&self, _: &Slot, _: &StructureChange) -> Result<()> {
        self.classifier.set_dirty(Dirty::Whole);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_train_means() {
        let clf = NearestMeanClassifier::train(3, [(1.0, 1), (3.0, 1), (10.0, 2), (5.0, 0), (7.0, 9)]);
        assert_eq!(clf.means(), &[Some(2.0), Some(10.0), None]);
        assert_eq!(clf.trained_classes(), 2);
    }

    #[test]
    fn test_predict_prefers_nearest() {
        let clf = NearestMeanClassifier::train(2, [(0.0, 1), (10.0, 2)]);
        let p = clf.predict(2.0);
        assert_eq!(p.len(), 2);
        assert!(p[0] > p[1]);
        assert_relative_eq!(p.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(p[0], 0.8, epsilon = 1e-4);
    }

    #[test]
    fn test_untrained_is_uniform() {
        let clf = NearestMeanClassifier::train(4, std::iter::empty());
        assert_eq!(clf.predict(3.0), vec![0.25; 4]);
    }
}
