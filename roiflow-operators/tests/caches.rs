mod common;

use common::{graph, ramp, record_dirty, roi, Counter, Slow};
use roiflow_graph::{wait_all, Dirty, Roi, SlotType, Value};
use roiflow_operators::{CacheConfig, OpBlockedArrayCache, OpValueCache};
use std::thread;
use std::time::Duration;

fn blocked_config(budget: usize) -> CacheConfig {
    CacheConfig::default()
        .with_block_shape(vec![4, 4])
        .with_memory_budget_bytes(budget)
}

#[test]
fn test_blocked_cache_computes_each_block_once() {
    let g = graph(2);
    let source = Counter::add(&g, "Source", SlotType::Array);
    source.input.set_value(ramp(&[8, 8])).unwrap();
    let cache = g
        .add_operator("Cache", |b| OpBlockedArrayCache::build(b, blocked_config(1 << 20)))
        .unwrap();
    g.connect(&source.output, &cache.input).unwrap();

    let full = roi(&[0, 0], &[8, 8]);
    assert_eq!(cache.output.read(&full).unwrap(), ramp(&[8, 8]));
    assert_eq!(source.executions(), 4);
    assert_eq!(cache.cached_blocks(), 4);
    assert_eq!(cache.cached_bytes(), 4 * 16 * 4);

    let part = cache.output.read(&roi(&[2, 3], &[6, 5])).unwrap();
    assert_eq!(part, ramp(&[8, 8]).region(&roi(&[2, 3], &[6, 5])).unwrap());
    assert_eq!(source.executions(), 4);
}

#[test]
fn test_blocked_cache_invalidates_only_touched_blocks() {
    let g = graph(2);
    let source = Counter::add(&g, "Source", SlotType::Array);
    source.input.set_value(ramp(&[8, 8])).unwrap();
    let cache = g
        .add_operator("Cache", |b| OpBlockedArrayCache::build(b, blocked_config(1 << 20)))
        .unwrap();
    g.connect(&source.output, &cache.input).unwrap();
    cache.output.read(&roi(&[0, 0], &[8, 8])).unwrap();

    let (seen, _sub) = record_dirty(&cache.output);
    source.input.set_dirty(roi(&[1, 1], &[3, 3]));

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[Dirty::Region(roi(&[1, 1], &[3, 3]))]
    );
    assert_eq!(cache.cached_blocks(), 3);
    cache.output.read(&roi(&[0, 0], &[8, 8])).unwrap();
    assert_eq!(source.executions(), 5);
}

#[test]
fn test_blocked_cache_evicts_oldest_over_budget() {
    let g = graph(1);
    let source = Counter::add(&g, "Source", SlotType::Array);
    source.input.set_value(ramp(&[8, 8])).unwrap();
    // Room for two f32 blocks of 4x4.
    let cache = g
        .add_operator("Cache", |b| OpBlockedArrayCache::build(b, blocked_config(128)))
        .unwrap();
    g.connect(&source.output, &cache.input).unwrap();

    cache.output.read(&roi(&[0, 0], &[8, 8])).unwrap();
    assert_eq!(cache.cached_blocks(), 2);
    assert!(cache.cached_bytes() <= cache.budget_bytes());

    // The two most recent blocks are the lower ones.
    cache.output.read(&roi(&[4, 0], &[8, 8])).unwrap();
    assert_eq!(source.executions(), 4);
    cache.output.read(&roi(&[0, 0], &[4, 4])).unwrap();
    assert_eq!(source.executions(), 5);
}

#[test]
fn test_blocked_cache_concurrent_readers_share_blocks() {
    let g = graph(4);
    let source = Counter::add(&g, "Source", SlotType::Array);
    source.input.set_value(ramp(&[8, 8])).unwrap();
    let cache = g
        .add_operator("Cache", |b| OpBlockedArrayCache::build(b, blocked_config(1 << 20)))
        .unwrap();
    g.connect(&source.output, &cache.input).unwrap();

    let requests: Vec<_> = (0..8)
        .map(|_| cache.output.request(roi(&[0, 0], &[8, 8])))
        .collect();
    for request in &requests {
        request.submit();
    }
    for value in wait_all(&requests).unwrap() {
        assert_eq!(value.as_array().unwrap(), &ramp(&[8, 8]));
    }
    assert_eq!(source.executions(), 4);
}

#[test]
fn test_blocked_cache_fix_at_current_defers_invalidation() {
    let g = graph(1);
    let source = Counter::add(&g, "Source", SlotType::Array);
    source.input.set_value(ramp(&[4, 4])).unwrap();
    let cache = g
        .add_operator("Cache", |b| OpBlockedArrayCache::build(b, blocked_config(1 << 20)))
        .unwrap();
    g.connect(&source.output, &cache.input).unwrap();
    let full = roi(&[0, 0], &[4, 4]);
    let before = cache.output.read(&full).unwrap();

    cache.fix_at_current.set_value(true).unwrap();
    let (seen, _sub) = record_dirty(&cache.output);
    let mut changed = ramp(&[4, 4]);
    if let roiflow_graph::ArrayData::F32(a) = &mut changed {
        a.mapv_inplace(|v| v + 100.0);
    }
    source.input.set_value(changed.clone()).unwrap();

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(cache.output.read(&full).unwrap(), before);

    cache.fix_at_current.set_value(false).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[Dirty::Whole]);
    assert_eq!(cache.output.read(&full).unwrap(), changed);
}

#[test]
fn test_value_cache_serves_until_input_changes() {
    let g = graph(1);
    let source = Counter::add(&g, "Source", SlotType::Value);
    source.input.set_value(Value::Int(3)).unwrap();
    let cache = g.add_operator("Cache", OpValueCache::build).unwrap();
    g.connect(&source.output, &cache.input).unwrap();

    assert_eq!(cache.output.value().unwrap(), Value::Int(3));
    assert_eq!(cache.output.value().unwrap(), Value::Int(3));
    assert_eq!(source.executions(), 1);

    let (seen, _sub) = record_dirty(&cache.output);
    source.input.set_value(Value::Int(5)).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[Dirty::Whole]);
    assert!(!cache.has_value());
    assert_eq!(cache.output.value().unwrap(), Value::Int(5));
    assert_eq!(source.executions(), 2);
}

#[test]
fn test_value_cache_force_value_is_ready_without_upstream() {
    let g = graph(1);
    let source = Counter::add(&g, "Source", SlotType::Value);
    let cache = g.add_operator("Cache", OpValueCache::build).unwrap();
    g.connect(&source.output, &cache.input).unwrap();
    assert!(!cache.output.ready());

    cache.force_value(Value::Text("forest".to_string())).unwrap();

    assert!(cache.output.ready());
    assert_eq!(cache.output.value().unwrap(), Value::Text("forest".to_string()));
    assert_eq!(source.executions(), 0);
}

#[test]
fn test_value_cache_fix_at_current_replays_change() {
    let g = graph(1);
    let source = Counter::add(&g, "Source", SlotType::Value);
    source.input.set_value(Value::Int(1)).unwrap();
    let cache = g.add_operator("Cache", OpValueCache::build).unwrap();
    g.connect(&source.output, &cache.input).unwrap();
    assert_eq!(cache.output.value().unwrap(), Value::Int(1));

    cache.fix_at_current.set_value(true).unwrap();
    let (seen, _sub) = record_dirty(&cache.output);
    source.input.set_value(Value::Int(2)).unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(cache.output.value().unwrap(), Value::Int(1));

    cache.fix_at_current.set_value(false).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[Dirty::Whole]);
    assert_eq!(cache.output.value().unwrap(), Value::Int(2));
}

#[test]
fn test_value_cache_drops_value_invalidated_during_read() {
    let g = graph(2);
    let source = Slow::add(&g, "Source", SlotType::Value, Duration::from_millis(300));
    source.input.set_value(Value::Int(1)).unwrap();
    let cache = g.add_operator("Cache", OpValueCache::build).unwrap();
    g.connect(&source.output, &cache.input).unwrap();

    let in_flight = cache.output.request(Roi::scalar());
    in_flight.submit();
    thread::sleep(Duration::from_millis(100));
    source.input.set_value(Value::Int(2)).unwrap();

    assert_eq!(in_flight.wait().unwrap(), Value::Int(1));
    assert_eq!(cache.output.value().unwrap(), Value::Int(2));
}
