mod common;

use common::{graph, ramp, record_dirty, roi, AddOffset, Identity, LanePiper};
use roiflow_graph::{Dirty, Error, SlotStatus, Value};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

#[test]
fn test_identity_chain_forwards_region() {
    let g = graph(2);
    let first = Identity::add(&g, "First");
    let second = Identity::add(&g, "Second");
    first.input.set_value(ramp(&[100, 100])).unwrap();
    g.connect(&first.output, &second.input).unwrap();

    let (seen, _sub) = record_dirty(&second.output);
    first.input.set_dirty(roi(&[0, 0], &[10, 10]));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[Dirty::Region(roi(&[0, 0], &[10, 10]))]);
    assert_eq!(second.output.status(), SlotStatus::Dirty);
}

#[test]
fn test_dirty_region_is_clipped_to_shape() {
    let g = graph(1);
    let op = Identity::add(&g, "Clip");
    op.input.set_value(ramp(&[20, 20])).unwrap();
    let (seen, _sub) = record_dirty(&op.output);

    op.input.set_dirty(roi(&[15, 15], &[40, 40]));
    op.input.set_dirty(roi(&[25, 0], &[30, 5]));

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[Dirty::Region(roi(&[15, 15], &[20, 20]))]
    );
}

#[test]
fn test_scalar_change_marks_whole() {
    let g = graph(1);
    let op = AddOffset::add(&g, "Offset");
    op.input.set_value(Value::Int(3)).unwrap();
    let (seen, _sub) = record_dirty(&op.output);

    op.offset.set_value(Value::Int(4)).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[Dirty::Whole]);
    assert_eq!(op.output.value().unwrap(), Value::Int(7));
}

#[test]
fn test_unconfigured_output_reports_not_ready() {
    let g = graph(1);
    let op = Identity::add(&g, "Lonely");
    assert!(!op.output.ready());
    assert!(matches!(
        op.output.read(&roi(&[0], &[1])),
        Err(Error::NotReady { .. })
    ));

    op.input.set_value(ramp(&[4])).unwrap();
    assert!(op.output.ready());
    let data = op.output.read(&roi(&[1], &[3])).unwrap();
    assert_eq!(data.to_f32().as_slice().unwrap(), &[1.0, 2.0]);

    op.input.disconnect();
    assert!(!op.output.ready());
    assert_eq!(op.output.status(), SlotStatus::Unconfigured);
}

#[test]
fn test_default_value_restored_on_disconnect() {
    let g = graph(1);
    let source = AddOffset::add(&g, "Source");
    source.input.set_value(Value::Int(10)).unwrap();
    let op = AddOffset::add(&g, "Target");
    op.input.set_value(Value::Int(1)).unwrap();

    g.connect(&source.output, &op.offset).unwrap();
    assert_eq!(op.output.value().unwrap(), Value::Int(11));

    op.offset.disconnect();
    assert!(op.offset.has_value());
    assert_eq!(op.output.value().unwrap(), Value::Int(1));
}

#[test]
fn test_incompatible_connections_are_rejected() {
    let g = graph(1);
    let array_op = Identity::add(&g, "Arrays");
    let value_op = AddOffset::add(&g, "Values");
    let lanes = LanePiper::add(&g, "Lanes");

    assert!(matches!(
        g.connect(&value_op.output, &array_op.input),
        Err(Error::IncompatibleSlot { .. })
    ));
    assert!(matches!(
        g.connect(&array_op.output, &lanes.inputs),
        Err(Error::IncompatibleSlot { .. })
    ));
    assert!(matches!(
        array_op.input.set_value(Value::Int(1)),
        Err(Error::IncompatibleSlot { .. })
    ));
}

#[test]
fn test_setup_is_idempotent() {
    let g = graph(1);
    let first = Identity::add(&g, "First");
    let second = Identity::add(&g, "Second");
    first.input.set_value(ramp(&[8, 8])).unwrap();
    g.connect(&first.output, &second.input).unwrap();
    assert_eq!(second.setups.load(Ordering::SeqCst), 1);

    // Same shape and dtype: metadata is unchanged downstream.
    first.input.set_value(ramp(&[8, 8])).unwrap();
    g.connect(&first.output, &second.input).unwrap();
    assert_eq!(second.setups.load(Ordering::SeqCst), 1);

    first.input.set_value(ramp(&[4, 8])).unwrap();
    assert_eq!(second.setups.load(Ordering::SeqCst), 2);
    assert_eq!(second.output.meta().unwrap().shape, vec![4, 8]);
}

#[test]
fn test_one_callback_per_subscriber_and_unsubscribe() {
    let g = graph(1);
    let op = Identity::add(&g, "Observed");
    op.input.set_value(ramp(&[6])).unwrap();

    let (a, sub_a) = record_dirty(&op.output);
    let (b, _sub_b) = record_dirty(&op.output);
    op.input.set_dirty(roi(&[0], &[2]));
    assert_eq!(a.lock().unwrap().len(), 1);
    assert_eq!(b.lock().unwrap().len(), 1);

    sub_a.unsubscribe();
    op.input.set_dirty(roi(&[2], &[4]));
    assert_eq!(a.lock().unwrap().len(), 1);
    assert_eq!(b.lock().unwrap().len(), 2);
}

#[test]
fn test_multi_slot_resize_notifies_in_order() {
    let g = graph(1);
    let op = LanePiper::add(&g, "Lanes");
    let events = Arc::new(Mutex::new(Vec::new()));

    let inserted = Arc::clone(&events);
    let _ins = op.outputs.notify_inserted(move |_, index| {
        inserted.lock().unwrap().push(format!("+{index}"));
    });
    let removed = Arc::clone(&events);
    let _rem = op.outputs.notify_removed(move |_, index| {
        removed.lock().unwrap().push(format!("-{index}"));
    });

    op.inputs.resize(3).unwrap();
    assert_eq!(op.outputs.len(), 3);
    op.inputs.resize(0).unwrap();
    assert_eq!(op.outputs.len(), 0);

    assert_eq!(
        events.lock().unwrap().as_slice(),
        &["+0", "+1", "+2", "-2", "-1", "-0"]
    );
}

#[test]
fn test_multi_slot_lanes_are_addressed_by_subindex() {
    let g = graph(2);
    let op = LanePiper::add(&g, "Lanes");
    op.inputs.resize(2).unwrap();
    op.inputs.child(0).unwrap().set_value(ramp(&[3])).unwrap();
    op.inputs.child(1).unwrap().set_value(ramp(&[5])).unwrap();

    let lane = op.outputs.child(1).unwrap();
    assert_eq!(lane.meta().unwrap().shape, vec![5]);
    let data = lane.read(&roi(&[3], &[5])).unwrap();
    assert_eq!(data.to_f32().as_slice().unwrap(), &[3.0, 4.0]);

    // Parent observers see sub-slot notifications with the sub-slot.
    let indices = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&indices);
    let _sub = op.outputs.notify_dirty(move |slot, _| {
        sink.lock().unwrap().push(slot.index());
    });
    op.inputs.child(0).unwrap().set_dirty(Dirty::Whole);
    assert_eq!(indices.lock().unwrap().as_slice(), &[Some(0)]);

    assert!(matches!(
        op.outputs.child(7),
        Err(Error::StructuralRace { index: 7, len: 2, .. })
    ));
}

#[test]
fn test_connected_multi_slot_follows_upstream() {
    let g = graph(1);
    let upstream = LanePiper::add(&g, "Up");
    let downstream = LanePiper::add(&g, "Down");
    upstream.inputs.resize(1).unwrap();
    g.connect(&upstream.outputs, &downstream.inputs).unwrap();
    assert_eq!(downstream.outputs.len(), 1);

    upstream.inputs.resize(3).unwrap();
    assert_eq!(downstream.inputs.len(), 3);
    assert_eq!(downstream.outputs.len(), 3);

    upstream.inputs.child(2).unwrap().set_value(ramp(&[2, 2])).unwrap();
    let lane = downstream.outputs.child(2).unwrap();
    assert_eq!(lane.meta().unwrap().shape, vec![2, 2]);
    assert!(downstream.inputs.resize(1).is_err());

    upstream.inputs.remove_slot(0).unwrap();
    assert_eq!(downstream.outputs.len(), 2);
    assert_eq!(lane.index(), Some(1));
}

#[test]
fn test_teardown_disconnects_consumers() {
    let g = graph(1);
    let first = Identity::add(&g, "First");
    let second = Identity::add(&g, "Second");
    first.input.set_value(ramp(&[4])).unwrap();
    g.connect(&first.output, &second.input).unwrap();
    assert!(second.output.ready());

    assert!(g.remove_operator(first.node()));
    assert!(!second.input.is_connected());
    assert!(!second.output.ready());
    assert_eq!(g.len(), 1);
}

#[test]
fn test_mark_clean() {
    let g = graph(1);
    let op = Identity::add(&g, "Clean");
    assert_eq!(op.input.status(), SlotStatus::Unconfigured);
    op.input.set_value(ramp(&[2])).unwrap();
    assert_eq!(op.output.status(), SlotStatus::Dirty);
    op.output.mark_clean();
    assert_eq!(op.output.status(), SlotStatus::Clean);
}
