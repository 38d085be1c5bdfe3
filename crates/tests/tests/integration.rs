//! End-to-end propagation scenarios.
//!
//! Each test builds a small graph through the harness, injects values
//! and asserts the sequence of observations: ordering across priority
//! classes, barrier coalescing, effect deferral and failure isolation.

use ripple_tests::TestHarness;
use ripple_runtime::{
    Error, LaunchSpec, MovSource, MovTarget, NodeBuilder, Priority, Value,
};
use std::sync::Arc;

/// Simple derivation: `A -> B` where B adds one and stores the result.
#[test]
fn test_simple_derivation() {
    let mut h = TestHarness::new();
    let cell = h.cell(Value::Undefined);

    let mut builder = NodeBuilder::new();
    let reg = builder.register(cell);
    let b = builder
        .compute(|v, _| Ok(Value::Int(v.as_int().unwrap_or(0) + 1)))
        .mov(MovSource::Stack, MovTarget::Reg(reg))
        .build();
    let a = h.source(&[&b]);

    h.engine.launch((&a, 5)).unwrap();
    assert_eq!(h.int(cell), Some(6));
}

/// Filter skip: a negative payload never reaches the compute step; a
/// positive one is doubled.
#[test]
fn test_filter_skip() {
    let mut h = TestHarness::new();
    let cell = h.cell(Value::Undefined);

    let mut builder = NodeBuilder::new();
    let reg = builder.register(cell);
    let b = builder
        .filter(|v, _| Ok(v.as_int().unwrap_or(0) > 0))
        .compute(|v, _| Ok(Value::Int(v.as_int().unwrap_or(0) * 2)))
        .mov(MovSource::Stack, MovTarget::Reg(reg))
        .build();
    let a = h.source(&[&b]);

    let report = h.engine.launch((&a, -1)).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(h.int(cell), None);

    h.engine.launch((&a, 3)).unwrap();
    assert_eq!(h.int(cell), Some(6));
}

/// Combine coalescing: two upstream paths feed one barrier node; its
/// body fires exactly once per propagation.
#[test]
fn test_combine_fires_once_per_propagation() {
    let h = TestHarness::new();

    let combine = NodeBuilder::new()
        .barrier(Priority::Barrier)
        .compute(h.observe("combine"))
        .build();
    let left = NodeBuilder::new()
        .compute(|v, _| Ok(v.clone()))
        .child(&combine)
        .build();
    let right = NodeBuilder::new()
        .compute(|v, _| Ok(v.clone()))
        .child(&combine)
        .build();
    let source = h.source(&[&left, &right]);

    let mut h = h;
    h.engine.launch((&source, 1)).unwrap();
    assert_eq!(h.recorder.events(), vec!["combine:1"]);

    // The barrier registry drained with the propagation: a second launch
    // coalesces afresh and fires exactly once more.
    h.engine.launch((&source, 2)).unwrap();
    assert_eq!(h.recorder.events(), vec!["combine:1", "combine:2"]);
}

/// Sampler ordering: a barrier-class combine completes (and writes its
/// ref cell) before a sampler-class observer reads that cell.
#[test]
fn test_barrier_completes_before_sampler_reads() {
    let mut h = TestHarness::new();
    let combined = h.cell(0);

    let mut builder = NodeBuilder::new();
    let reg = builder.register(combined);
    let k = builder
        .barrier(Priority::Barrier)
        .compute(h.observe("k"))
        .mov(MovSource::Stack, MovTarget::Reg(reg))
        .build();

    let mut builder = NodeBuilder::new();
    let reg = builder.register(combined);
    let o = builder
        .barrier(Priority::Sampler)
        .mov(MovSource::Reg(reg), MovTarget::Stack)
        .compute(h.observe("observed"))
        .build();

    let source = h.source(&[&o, &k]);
    h.engine.launch((&source, 7)).unwrap();

    assert_eq!(h.recorder.events(), vec!["k:7", "observed:7"]);
    assert_eq!(h.int(combined), Some(7));
}

/// Older barriers (smaller ids) fire before newer ones, regardless of
/// arrival order in the shared heap.
#[test]
fn test_older_barrier_fires_first() {
    let h = TestHarness::new();

    // `early` is built first, so its barrier id is smaller
    let early = NodeBuilder::new()
        .barrier(Priority::Barrier)
        .compute(h.observe("early"))
        .build();
    let late = NodeBuilder::new()
        .barrier(Priority::Barrier)
        .compute(h.observe("late"))
        .build();

    let to_late = NodeBuilder::new()
        .compute(|v, _| Ok(v.clone()))
        .child(&late)
        .build();
    let to_early = NodeBuilder::new()
        .compute(|v, _| Ok(v.clone()))
        .child(&early)
        .build();

    // The late barrier is deferred into the heap first
    let source = h.source(&[&to_late, &to_early]);
    let mut h = h;
    h.engine.launch((&source, 1)).unwrap();
    assert_eq!(h.recorder.events(), vec!["early:1", "late:1"]);
}

/// Effect deferral: a `run` step re-queues its node at effect class, so
/// pending child-class work runs in between.
#[test]
fn test_run_defers_to_effect_class() {
    let h = TestHarness::new();

    let x = NodeBuilder::new()
        .compute(h.observe("f1"))
        .run(h.observe("f2"))
        .build();
    let y = NodeBuilder::new().compute(h.observe("y")).build();
    let source = h.source(&[&x, &y]);

    let mut h = h;
    let report = h.engine.launch((&source, 1)).unwrap();
    assert_eq!(h.recorder.events(), vec!["f1:1", "y:1", "f2:1"]);
    // x counts once: its suspended first pass is not a completion
    assert_eq!(report.completed, 3);
}

/// Re-entrant deferred launch: a seed injected from inside a user
/// function joins the live drain; no nested drain starts, so one report
/// covers both propagations.
#[test]
fn test_reentrant_launch_joins_live_drain() {
    let h = TestHarness::new();

    let inner = NodeBuilder::new().compute(h.observe("inner")).build();
    let recorder = h.recorder.clone();
    let inner_handle = inner.clone();
    let outer = NodeBuilder::new()
        .compute(move |v, ctx| {
            ctx.launch(&inner_handle, 9, true);
            recorder.push(format!("outer:{}", v.as_int().unwrap()));
            Ok(v.clone())
        })
        .build();

    let mut h = h;
    let report = h.engine.launch((&outer, 1)).unwrap();
    assert_eq!(h.recorder.events(), vec!["outer:1", "inner:9"]);
    assert_eq!(report.completed, 2);
}

/// A deferred re-entrant seed waits its turn in the live queue: work
/// already owed to higher-priority classes (here the launching node's
/// own child) runs first.
#[test]
fn test_deferred_reentrant_seed_waits_for_queued_work() {
    let h = TestHarness::new();

    let inner = NodeBuilder::new().compute(h.observe("inner")).build();
    let after = NodeBuilder::new().compute(h.observe("after")).build();
    let recorder = h.recorder.clone();
    let inner_handle = inner.clone();
    let outer = NodeBuilder::new()
        .compute(move |v, ctx| {
            ctx.launch(&inner_handle, 9, true);
            recorder.push(format!("outer:{}", v.as_int().unwrap()));
            Ok(v.clone())
        })
        .child(&after)
        .build();

    let mut h = h;
    let report = h.engine.launch((&outer, 1)).unwrap();
    // The child-class delivery outranks the pure-class seed
    assert_eq!(h.recorder.events(), vec!["outer:1", "after:1", "inner:9"]);
    assert_eq!(report.completed, 3);
}

/// A non-deferred re-entrant launch is a nested propagation: the live
/// queue drains in place before the launching node propagates
/// downstream, and its layers land in the same report.
#[test]
fn test_nested_launch_drains_in_place() {
    let h = TestHarness::new();

    let inner = NodeBuilder::new().compute(h.observe("inner")).build();
    let after = NodeBuilder::new().compute(h.observe("after")).build();
    let recorder = h.recorder.clone();
    let inner_handle = inner.clone();
    let outer = NodeBuilder::new()
        .compute(move |v, ctx| {
            ctx.launch(&inner_handle, 9, false);
            recorder.push(format!("outer:{}", v.as_int().unwrap()));
            Ok(v.clone())
        })
        .child(&after)
        .build();

    let mut h = h;
    let report = h.engine.launch((&outer, 1)).unwrap();
    assert_eq!(h.recorder.events(), vec!["outer:1", "inner:9", "after:1"]);
    assert_eq!(report.completed, 3);
}

/// A failing user function stops its own node only; sibling layers in
/// the same propagation still run.
#[test]
fn test_user_failure_is_isolated() {
    let h = TestHarness::new();

    let failing = NodeBuilder::new()
        .compute(|_, _| Err("deliberate".into()))
        .build();
    let healthy = NodeBuilder::new().compute(h.observe("healthy")).build();
    let source = h.source(&[&failing, &healthy]);

    let mut h = h;
    let report = h.engine.launch((&source, 3)).unwrap();
    assert_eq!(h.recorder.events(), vec!["healthy:3"]);
    assert_eq!(report.failures, 1);
}

/// Store-style gating: `check changed` drops propagations whose payload
/// is identical to the cell's current value.
#[test]
fn test_changed_check_gates_identical_values() {
    let mut h = TestHarness::new();
    let cell = h.cell(0);

    let observer = NodeBuilder::new().compute(h.observe("obs")).build();
    let mut builder = NodeBuilder::new();
    let reg = builder.register(cell);
    let store = builder
        .check_defined()
        .check_changed(reg)
        .mov(MovSource::Stack, MovTarget::Reg(reg))
        .child(&observer)
        .build();

    h.engine.launch((&store, 5)).unwrap();
    let second = h.engine.launch((&store, 5)).unwrap();
    h.engine.launch((&store, 6)).unwrap();

    assert_eq!(h.recorder.events(), vec!["obs:5", "obs:6"]);
    assert_eq!(second.skipped, 1);
    assert_eq!(h.int(cell), Some(6));
}

/// The changed gate compares `Data` payloads by reference, not by
/// content: a fresh allocation with equal content still propagates.
#[test]
fn test_changed_check_uses_reference_identity() {
    let mut h = TestHarness::new();
    let cell = h.cell(Value::Undefined);

    let observer = NodeBuilder::new().compute(h.observe("obs")).build();
    let mut builder = NodeBuilder::new();
    let reg = builder.register(cell);
    let store = builder
        .check_changed(reg)
        .mov(MovSource::Stack, MovTarget::Reg(reg))
        .child(&observer)
        .build();

    let payload = Value::data(vec![1, 2, 3]);
    h.engine.launch((&store, payload.clone())).unwrap();
    let replay = h.engine.launch((&store, payload)).unwrap();
    assert_eq!(replay.skipped, 1);

    let lookalike = Value::data(vec![1, 2, 3]);
    let fresh = h.engine.launch((&store, lookalike)).unwrap();
    assert_eq!(fresh.completed, 2);

    assert_eq!(h.recorder.events(), vec!["obs", "obs"]);
}

/// Parallel-arrays injection: each pair seeds independently, in order.
#[test]
fn test_parallel_array_launch() {
    let h = TestHarness::new();

    let first = NodeBuilder::new().compute(h.observe("first")).build();
    let second = NodeBuilder::new().compute(h.observe("second")).build();

    let mut h = h;
    let report = h
        .engine
        .launch(vec![
            (first.clone(), Value::Int(1)),
            (second.clone(), Value::Int(2)),
        ])
        .unwrap();
    assert_eq!(h.recorder.events(), vec!["first:1", "second:2"]);
    assert_eq!(report.completed, 2);
}

/// Descriptor injection: `defer` is inert at the engine entry (which
/// always finds the engine idle), so the drain still runs here.
#[test]
fn test_descriptor_launch_drains_when_idle() {
    let h = TestHarness::new();
    let node = NodeBuilder::new().compute(h.observe("n")).build();

    let mut h = h;
    let report = h
        .engine
        .launch(LaunchSpec::descriptor(&node, 4, true))
        .unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.recorder.events(), vec!["n:4"]);
}

/// Downstream user functions can walk the causal chain of stack frames.
#[test]
fn test_causal_parent_chain() {
    let h = TestHarness::new();

    let recorder = h.recorder.clone();
    let leaf = NodeBuilder::new()
        .compute(move |v, ctx| {
            let parent = ctx.stack().parent().expect("leaf has an upstream frame");
            assert!(parent.parent().is_none());
            recorder.push(format!(
                "leaf:{} from:{}",
                v.as_int().unwrap(),
                parent.value().as_int().unwrap()
            ));
            Ok(v.clone())
        })
        .build();
    let root = NodeBuilder::new()
        .compute(|v, _| Ok(Value::Int(v.as_int().unwrap() + 1)))
        .child(&leaf)
        .build();

    let mut h = h;
    h.engine.launch((&root, 5)).unwrap();
    assert_eq!(h.recorder.events(), vec!["leaf:6 from:6"]);
}

/// The node's scope record reaches its user functions.
#[test]
fn test_scope_reaches_user_functions() {
    let h = TestHarness::new();

    let recorder = h.recorder.clone();
    let node = NodeBuilder::new()
        .scope(Arc::new(String::from("ctx")))
        .compute(move |v, ctx| {
            let tag = ctx.scope_as::<String>().expect("scope is set");
            recorder.push(format!("{tag}:{}", v.as_int().unwrap()));
            Ok(v.clone())
        })
        .build();

    let mut h = h;
    h.engine.launch((&node, 8)).unwrap();
    assert_eq!(h.recorder.events(), vec!["ctx:8"]);
}

/// Engines are isolated instances: a node built against one engine's
/// ref cells is structural corruption on another.
#[test]
fn test_engines_are_isolated() {
    let mut owner = TestHarness::new();
    let cell = owner.cell(0);
    let store = owner.store_into(cell);

    owner.engine.launch((&store, 1)).unwrap();
    assert_eq!(owner.int(cell), Some(1));

    let mut stranger = TestHarness::new();
    let err = stranger.engine.launch((&store, 2)).unwrap_err();
    assert!(matches!(err, Error::RefNotFound(_)));
    // The owner's cell is untouched
    assert_eq!(owner.int(cell), Some(1));
}

/// Two back-to-back launches are independent propagations with the same
/// observable effect as two sequential calls.
#[test]
fn test_back_to_back_launches_are_independent() {
    let h = TestHarness::new();
    let sink = NodeBuilder::new().compute(h.observe("sink")).build();
    let source = h.source(&[&sink]);

    let mut h = h;
    let first = h.engine.launch((&source, 1)).unwrap();
    let second = h.engine.launch((&source, 2)).unwrap();
    assert_eq!(h.recorder.events(), vec!["sink:1", "sink:2"]);
    assert_eq!(first.completed, 2);
    assert_eq!(second.completed, 2);
}
