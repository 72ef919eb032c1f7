mod common;

use approx::assert_relative_eq;
use common::{f32_array, graph, record_dirty, roi, u8_array};
use roiflow_graph::{ArrayData, DType, Dirty, Graph, OperatorHandle, Value};
use roiflow_operators::{NearestMeanClassifier, OpPixelClassification};

// Left half dark, right half bright.
fn image() -> ArrayData {
    f32_array(&[4, 4], |ix| if ix[1] < 2 { 10.0 } else { 200.0 })
}

fn pipeline(g: &Graph, lanes: usize) -> OperatorHandle<OpPixelClassification> {
    let op = g
        .add_operator("PixelClassification", OpPixelClassification::build)
        .unwrap();
    op.input_images.resize(lanes).unwrap();
    for lane in 0..lanes {
        op.input_images.child(lane).unwrap().set_value(image()).unwrap();
    }
    op
}

fn paint(op: &OpPixelClassification, lane: usize) {
    let labels = op.label_inputs.child(lane).unwrap();
    labels.write(&roi(&[0, 0], &[1, 1]), &u8_array(&[1, 1], 1)).unwrap();
    labels.write(&roi(&[0, 3], &[1, 4]), &u8_array(&[1, 1], 2)).unwrap();
}

#[test]
fn test_lanes_follow_input_images() {
    let g = graph(2);
    let op = pipeline(&g, 2);

    assert_eq!(op.num_lanes(), 2);
    assert_eq!(op.label_inputs.len(), 2);
    assert_eq!(op.label_images.len(), 2);
    assert_eq!(op.nonzero_label_blocks.len(), 2);
    assert_eq!(op.prediction_probabilities.len(), 2);

    let labels = op.label_images.child(1).unwrap().meta().unwrap();
    assert_eq!(labels.shape, vec![4, 4]);
    assert_eq!(labels.dtype, Some(DType::U8));
    let predictions = op.prediction_probabilities.child(0).unwrap().meta().unwrap();
    assert_eq!(predictions.shape, vec![4, 4, 2]);
    assert_eq!(predictions.dtype, Some(DType::F32));
}

#[test]
fn test_predictions_wait_for_labels() {
    let g = graph(2);
    let op = pipeline(&g, 1);
    let err = op
        .prediction_probabilities
        .child(0)
        .unwrap()
        .read(&roi(&[0, 0, 0], &[4, 4, 2]))
        .unwrap_err();
    assert!(err.is_not_ready(), "{err}");
}

#[test]
fn test_label_write_dirties_every_prediction_lane() {
    let g = graph(2);
    let op = pipeline(&g, 2);
    let (labels_seen, _a) = record_dirty(&op.label_images.child(0).unwrap());
    let (other_lane_seen, _b) = record_dirty(&op.prediction_probabilities.child(1).unwrap());
    let (classifier_seen, _c) = record_dirty(&op.classifier);

    op.label_inputs
        .child(0)
        .unwrap()
        .write(&roi(&[1, 1], &[3, 2]), &u8_array(&[2, 1], 1))
        .unwrap();

    assert_eq!(
        labels_seen.lock().unwrap().as_slice(),
        &[Dirty::Region(roi(&[1, 1], &[3, 2]))]
    );
    let other_lane_seen = other_lane_seen.lock().unwrap();
    assert!(!other_lane_seen.is_empty());
    assert!(other_lane_seen.iter().all(Dirty::is_whole));
    assert!(classifier_seen.lock().unwrap().iter().all(Dirty::is_whole));
}

#[test]
fn test_trained_predictions() {
    let g = graph(4);
    let op = pipeline(&g, 2);
    paint(&op, 0);

    let blocks = op.nonzero_label_blocks.child(0).unwrap().value().unwrap();
    assert_eq!(blocks.as_rois().unwrap(), &[roi(&[0, 0], &[4, 4])]);
    assert!(op
        .nonzero_label_blocks
        .child(1)
        .unwrap()
        .value()
        .unwrap()
        .as_rois()
        .unwrap()
        .is_empty());

    let classifier = op.classifier.value().unwrap();
    let classifier = classifier.downcast::<NearestMeanClassifier>().unwrap();
    assert_eq!(classifier.means(), &[Some(10.0), Some(200.0)]);

    // Lane 1 has no labels of its own but shares the classifier.
    let predictions = op
        .prediction_probabilities
        .child(1)
        .unwrap()
        .read(&roi(&[2, 0, 0], &[3, 4, 2]))
        .unwrap();
    let predictions = predictions.as_f32().unwrap();
    assert_eq!(predictions.shape(), &[1, 4, 2]);
    assert!(predictions[[0, 0, 0]] > 0.99);
    assert!(predictions[[0, 3, 1]] > 0.99);
    assert_relative_eq!(
        predictions[[0, 1, 0]] + predictions[[0, 1, 1]],
        1.0,
        epsilon = 1e-5
    );

    // A single channel can be read on its own.
    let object = op
        .prediction_probabilities
        .child(0)
        .unwrap()
        .read(&roi(&[0, 2, 1], &[1, 4, 2]))
        .unwrap();
    assert_eq!(object.shape(), &[1, 2, 1]);
    assert!(object.as_f32().unwrap().iter().all(|p| *p > 0.99));
}

#[test]
fn test_num_classes_reshapes_predictions() {
    let g = graph(1);
    let op = pipeline(&g, 1);
    let (seen, _sub) = record_dirty(&op.prediction_probabilities.child(0).unwrap());

    op.num_classes.set_value(Value::Int(3)).unwrap();

    let meta = op.prediction_probabilities.child(0).unwrap().meta().unwrap();
    assert_eq!(meta.shape, vec![4, 4, 3]);
    assert!(seen.lock().unwrap().contains(&Dirty::Whole));
}

#[test]
fn test_removing_lane_keeps_other_labels() {
    let g = graph(1);
    let op = pipeline(&g, 2);
    paint(&op, 1);

    op.input_images.remove_slot(0).unwrap();

    assert_eq!(op.label_inputs.len(), 1);
    assert_eq!(op.prediction_probabilities.len(), 1);
    let labels = op.label_images.child(0).unwrap().read(&roi(&[0, 0], &[1, 4])).unwrap();
    assert_eq!(labels.to_u8().iter().copied().collect::<Vec<_>>(), vec![1, 0, 0, 2]);
}

#[test]
fn test_clear_labels_empties_lane() {
    let g = graph(1);
    let op = pipeline(&g, 1);
    paint(&op, 0);
    op.clear_labels(0).unwrap();

    let lane = op.nonzero_label_blocks.child(0).unwrap().value().unwrap();
    assert!(lane.as_rois().unwrap().is_empty());
    assert!(op.clear_labels(3).is_err());
}

#[test]
fn test_forced_classifier_is_ready_without_training() {
    let g = graph(1);
    let op = g
        .add_operator("PixelClassification", OpPixelClassification::build)
        .unwrap();
    // A lane without an image keeps training unconfigured.
    op.input_images.resize(1).unwrap();
    assert!(!op.classifier.ready());

    let forced = NearestMeanClassifier::train(2, [(1.0, 1), (2.0, 2)]);
    op.classifier_cache()
        .force_value(Value::opaque(forced.clone()))
        .unwrap();

    assert!(op.classifier.ready());
    let served = op.classifier.value().unwrap();
    assert_eq!(*served.downcast::<NearestMeanClassifier>().unwrap(), forced);
}
