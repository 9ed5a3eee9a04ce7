// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! End-to-end scenarios driving a [`Driver`] through a [`VecSource`] rather
//! than exercising any one module's machinery in isolation.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::node::{declare_filter, declare_monitor, declare_reduction, declare_splitter, declare_transform};
use crate::{Concurrency, Driver, EngineConfig, FlowError, LevelId, Product, ProductStore, Products, VecSource};

fn leaf(id: LevelId, number: i64) -> ProductStore {
    let mut p = Products::new();
    p.insert("number", number);
    ProductStore::process(id, p)
}

#[test]
fn two_level_reduction_and_mixed_hierarchy_totals() {
    let job = LevelId::root().child("job", 0);

    let mut stores = Vec::new();
    for run in 0..2 {
        let run_id = job.child("run", run);
        for event in 0..5 {
            stores.push(leaf(run_id.child("event", event), i64::from(event)));
        }
    }
    for primitive in 0..10 {
        stores.push(leaf(job.child("primitive", primitive), i64::from(primitive)));
    }

    let run_sums: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let run_sums_sink = Arc::clone(&run_sums);
    let job_sums: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let job_sums_sink = Arc::clone(&job_sums);

    let mut driver = Driver::new(EngineConfig::new());
    driver
        .register(
            declare_reduction("run_add", || 0_i64, |acc: &mut i64, inputs: &[&Product]| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    *acc += n;
                }
            })
            .react_to(["number"])
            .output("run_sum")
            .over("run")
            .build(),
        )
        .register(
            declare_reduction("job_add", || 0_i64, |acc: &mut i64, inputs: &[&Product]| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    *acc += n;
                }
            })
            .react_to(["number"])
            .output("job_sum")
            .over("job")
            .build(),
        )
        .register(
            declare_monitor("run_sum_watch", move |inputs| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    run_sums_sink.lock().unwrap().push(*n);
                }
            })
            .input(["run_sum"])
            .build(),
        )
        .register(
            declare_monitor("job_sum_watch", move |inputs| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    job_sums_sink.lock().unwrap().push(*n);
                }
            })
            .input(["job_sum"])
            .build(),
        );

    driver.execute(VecSource::new(stores)).unwrap();

    // S1: each run sees 5 events, so run_add fires 10 times overall; S2 adds
    // 10 job-level siblings that only job_add can see, so it fires 20 times.
    assert_eq!(driver.execution_count("run_add"), 10);
    assert_eq!(driver.execution_count("job_add"), 20);

    let mut finished_runs = run_sums.lock().unwrap().clone();
    finished_runs.sort_unstable();
    assert_eq!(finished_runs, vec![10, 10]);

    // 0+1+2+3+4 twice (the two runs) plus 0+1+...+9 (the primitives) = 65.
    assert_eq!(job_sums.lock().unwrap().clone(), vec![65]);
}

#[test]
fn even_id_filter_gates_downstream_delivery() {
    let stores: Vec<ProductStore> = (0..10).map(|i| leaf(LevelId::root().child_unnamed(i), i64::from(i))).collect();

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_sink = Arc::clone(&seen);

    let mut driver = Driver::new(EngineConfig::new());
    driver
        .register(
            declare_filter("accept_even_ids", |inputs: &[&Product]| {
                inputs.first().and_then(|p| p.downcast_ref::<i64>()).is_some_and(|n| n % 2 == 0)
            })
            .input(["number"])
            .build(),
        )
        .register(
            declare_monitor("watch_even", move |inputs| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    seen_sink.lock().unwrap().push(*n);
                }
            })
            .input(["number"])
            .preceded_by(["accept_even_ids"])
            .build(),
        );

    driver.execute(VecSource::new(stores)).unwrap();

    let mut got = seen.lock().unwrap().clone();
    got.sort_unstable();
    assert_eq!(got, vec![0, 2, 4, 6, 8]);
}

#[test]
fn splitter_reduction_and_transform_observe_all_children() {
    let job = LevelId::root().child("job", 0);
    let mut p = Products::new();
    p.insert("max_number", 10_i64);
    let trigger = ProductStore::process(job, p);

    let observed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let observed_sink = Arc::clone(&observed);

    let mut driver = Driver::new(EngineConfig::new());
    driver
        .register(
            declare_splitter("split_numbers", |gen, inputs: &[&Product]| {
                let Some(&max) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) else {
                    return;
                };
                for i in 0..max {
                    let mut child = Products::new();
                    child.insert("num", i);
                    gen.make_child(u32::try_from(i).unwrap_or(0), child);
                }
            })
            .level_name("num_child")
            .provides(["num"])
            .input(["max_number"])
            .build(),
        )
        .register(
            declare_reduction("add", || 0_i64, |acc: &mut i64, inputs: &[&Product]| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    *acc += n;
                }
            })
            .react_to(["num"])
            .output("sum")
            .over("job")
            .build(),
        )
        .register(
            declare_transform("print_sum", move |inputs: &[&Product]| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    observed_sink.lock().unwrap().push(*n);
                }
                Vec::new()
            })
            .input(["sum"])
            .build(),
        );

    driver.execute(VecSource::new(vec![trigger])).unwrap();

    assert_eq!(driver.execution_count("split_numbers"), 1);
    assert_eq!(driver.execution_count("add"), 10);
    assert_eq!(driver.execution_count("print_sum"), 1);
    assert_eq!(observed.lock().unwrap().clone(), vec![45]);
}

#[test]
fn splitter_with_zero_children_completes_reduction_with_initial_value() {
    let job = LevelId::root().child("job", 0);
    let mut p = Products::new();
    p.insert("max_number", 0_i64);
    let trigger = ProductStore::process(job, p);

    let observed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let observed_sink = Arc::clone(&observed);

    let mut driver = Driver::new(EngineConfig::new());
    driver
        .register(
            declare_splitter("split_none", |_gen, _inputs: &[&Product]| {})
                .level_name("num_child")
                .provides(["num"])
                .input(["max_number"])
                .build(),
        )
        .register(
            declare_reduction("add", || 0_i64, |acc: &mut i64, inputs: &[&Product]| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    *acc += n;
                }
            })
            .react_to(["num"])
            .output("sum")
            .over("job")
            .build(),
        )
        .register(
            declare_monitor("watch_sum", move |inputs| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    observed_sink.lock().unwrap().push(*n);
                }
            })
            .input(["sum"])
            .build(),
        );

    driver.execute(VecSource::new(vec![trigger])).unwrap();

    assert_eq!(driver.execution_count("add"), 0);
    assert_eq!(observed.lock().unwrap().clone(), vec![0]);
}

#[test]
fn serial_resource_locks_enforce_mutual_exclusion_and_allow_disjoint_overlap() {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    let r_active = Arc::new(AtomicUsize::new(0));
    let g_active = Arc::new(AtomicUsize::new(0));
    let r_violations = Arc::new(AtomicUsize::new(0));
    let g_violations = Arc::new(AtomicUsize::new(0));
    // Only the two disjoint-resource holders rendezvous here; if the engine
    // wrongly serialized every node sharing no resources at all, the other
    // side would never arrive and this test would hang rather than fail.
    let barrier = Arc::new(Barrier::new(2));

    let trigger = leaf(LevelId::root().child_unnamed(0), 1);
    let mut driver = Driver::new(EngineConfig::new().max_parallelism(4));

    driver.register({
        let r_active = Arc::clone(&r_active);
        let r_violations = Arc::clone(&r_violations);
        let barrier = Arc::clone(&barrier);
        declare_monitor("holds_r", move |_| {
            if r_active.fetch_add(1, Ordering::SeqCst) != 0 {
                r_violations.fetch_add(1, Ordering::SeqCst);
            }
            barrier.wait();
            std::thread::sleep(Duration::from_millis(20));
            r_active.fetch_sub(1, Ordering::SeqCst);
        })
        .input(["number"])
        .concurrency(Concurrency::Serial(vec!["R".to_string()]))
        .build()
    });
    driver.register({
        let r_active = Arc::clone(&r_active);
        let g_active = Arc::clone(&g_active);
        let r_violations = Arc::clone(&r_violations);
        let g_violations = Arc::clone(&g_violations);
        declare_monitor("holds_both", move |_| {
            if r_active.fetch_add(1, Ordering::SeqCst) != 0 {
                r_violations.fetch_add(1, Ordering::SeqCst);
            }
            if g_active.fetch_add(1, Ordering::SeqCst) != 0 {
                g_violations.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(10));
            g_active.fetch_sub(1, Ordering::SeqCst);
            r_active.fetch_sub(1, Ordering::SeqCst);
        })
        .input(["number"])
        .concurrency(Concurrency::Serial(vec!["R".to_string(), "G".to_string()]))
        .build()
    });
    driver.register({
        let g_active = Arc::clone(&g_active);
        let g_violations = Arc::clone(&g_violations);
        let barrier = Arc::clone(&barrier);
        declare_monitor("holds_g", move |_| {
            if g_active.fetch_add(1, Ordering::SeqCst) != 0 {
                g_violations.fetch_add(1, Ordering::SeqCst);
            }
            barrier.wait();
            std::thread::sleep(Duration::from_millis(20));
            g_active.fetch_sub(1, Ordering::SeqCst);
        })
        .input(["number"])
        .concurrency(Concurrency::Serial(vec!["G".to_string()]))
        .build()
    });

    driver.execute(VecSource::new(vec![trigger])).unwrap();

    assert_eq!(r_violations.load(Ordering::SeqCst), 0);
    assert_eq!(g_violations.load(Ordering::SeqCst), 0);
}

#[test]
fn registration_problems_are_aggregated_not_reported_one_at_a_time() {
    let mut driver = Driver::new(EngineConfig::new());
    driver
        .register(declare_monitor("watch", |_| {}).input(["x"]).preceded_by(["missing_filter"]).build())
        .register(declare_splitter("broken_split", |_, _: &[&Product]| {}).input(["y"]).build())
        .register(
            declare_reduction("broken_reduce", || 0_i64, |_: &mut i64, _: &[&Product]| {})
                .react_to(["z"])
                .build(),
        );

    let err = driver.execute(VecSource::new(Vec::new())).unwrap_err();
    match err {
        FlowError::Registration(problems) => {
            assert!(problems.iter().any(|p| p.contains("preceded_by unregistered filter")));
            assert!(problems.iter().any(|p| p.contains("declares no level_name")));
            assert!(problems.iter().any(|p| p.contains("declares no output product name")));
            assert!(problems.iter().any(|p| p.contains("declares no over level name")));
        }
        other => panic!("expected Registration, got {other:?}"),
    }
}

#[test]
fn level_id_parse_print_round_trip_matches_constructed_chain() {
    let id = LevelId::root().child("job", 2).child("run", 5).child("event", 11);
    let printed = id.to_string();
    let reparsed = crate::parse(&printed);
    assert_eq!(reparsed, id);
    assert_eq!(reparsed.positional_hash(), id.positional_hash());
    assert_eq!(reparsed.level_hash(), id.level_hash());
}
