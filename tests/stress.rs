//! Randomized stress test exercising the testable properties: mutual
//! exclusion, reader parallelism, single dispatch and no-leak drain,
//! across many tags and a flood of interleaved pushes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use depengine::DependencyEngine;

const N_TAGS: usize = 8;
const N_INSTRUCTIONS: usize = 400;

/// Per-tag occupancy counters, incremented/decremented around each
/// callback body so a mutual-exclusion violation shows up as an
/// assertion failure from inside a running callback rather than as a
/// silently wrong final log.
struct Occupancy {
    mutators: AtomicUsize,
    readers: AtomicUsize,
}

impl Occupancy {
    fn new() -> Self {
        Occupancy {
            mutators: AtomicUsize::new(0),
            readers: AtomicUsize::new(0),
        }
    }
}

#[test]
fn concurrent_mixed_reads_and_writes_never_violate_mutual_exclusion() {
    let engine = DependencyEngine::new();
    let tags: Vec<_> = (0..N_TAGS).map(|_| engine.new_variable()).collect();
    let occupancy: Vec<Arc<Occupancy>> = (0..N_TAGS).map(|_| Arc::new(Occupancy::new())).collect();
    let dispatch_count = Arc::new(AtomicUsize::new(0));
    let mut rng = rand::thread_rng();

    engine.start();

    for _ in 0..N_INSTRUCTIONS {
        let is_mutate: Vec<bool> = (0..N_TAGS).map(|_| rng.gen_bool(0.3)).collect();
        let touched: Vec<usize> = (0..N_TAGS).filter(|_| rng.gen_bool(0.4)).collect();
        if touched.is_empty() {
            continue;
        }

        let mut read_tags = Vec::new();
        let mut mutate_tags = Vec::new();
        for &i in &touched {
            if is_mutate[i] {
                mutate_tags.push(tags[i]);
            } else {
                read_tags.push(tags[i]);
            }
        }

        let occ: Vec<Arc<Occupancy>> = touched.iter().map(|&i| Arc::clone(&occupancy[i])).collect();
        let touched_is_mutate: Vec<bool> = touched.iter().map(|&i| is_mutate[i]).collect();
        let dispatch_count = Arc::clone(&dispatch_count);

        engine
            .push(
                move || {
                    for (occ, &mutating) in occ.iter().zip(touched_is_mutate.iter()) {
                        if mutating {
                            let prev_m = occ.mutators.fetch_add(1, Ordering::SeqCst);
                            let prev_r = occ.readers.load(Ordering::SeqCst);
                            assert_eq!(prev_m, 0, "two mutators overlapped on one tag");
                            assert_eq!(prev_r, 0, "a mutator overlapped with a reader on one tag");
                        } else {
                            occ.readers.fetch_add(1, Ordering::SeqCst);
                            let prev_m = occ.mutators.load(Ordering::SeqCst);
                            assert_eq!(prev_m, 0, "a reader overlapped with a mutator on one tag");
                        }
                    }

                    std::thread::sleep(Duration::from_micros(200));
                    dispatch_count.fetch_add(1, Ordering::SeqCst);

                    for (occ, &mutating) in occ.iter().zip(touched_is_mutate.iter()) {
                        if mutating {
                            occ.mutators.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            occ.readers.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                },
                read_tags,
                mutate_tags,
            )
            .unwrap();
    }

    engine.stop();

    for occ in &occupancy {
        assert_eq!(occ.mutators.load(Ordering::SeqCst), 0);
        assert_eq!(occ.readers.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn every_pushed_callback_runs_exactly_once() {
    let engine = DependencyEngine::new();
    let tags: Vec<_> = (0..N_TAGS).map(|_| engine.new_variable()).collect();
    let run_counts: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; N_INSTRUCTIONS]));
    let mut rng = rand::thread_rng();

    engine.start();

    for id in 0..N_INSTRUCTIONS {
        let touched: Vec<usize> = (0..N_TAGS).filter(|_| rng.gen_bool(0.4)).collect();
        let read_tags: Vec<_> = touched.iter().filter(|_| rng.gen_bool(0.5)).map(|&i| tags[i]).collect();
        let mutate_tags: Vec<_> = touched.iter().map(|&i| tags[i]).collect();

        let run_counts = Arc::clone(&run_counts);
        engine
            .push(move || run_counts.lock().unwrap()[id] += 1, read_tags, mutate_tags)
            .unwrap();
    }

    engine.stop();

    for (id, &count) in run_counts.lock().unwrap().iter().enumerate() {
        assert_eq!(count, 1, "instruction {id} ran {count} times, expected exactly 1");
    }
}

#[test]
fn stop_then_start_resumes_draining() {
    let engine = DependencyEngine::new();
    let x = engine.new_variable();
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_a = Arc::clone(&log);
    engine.push(move || log_a.lock().unwrap().push("A"), [], [x]).unwrap();

    engine.stop();
    engine.stop();

    let log_b = Arc::clone(&log);
    engine.push(move || log_b.lock().unwrap().push("B"), [], [x]).unwrap();
    assert!(log.lock().unwrap().is_empty(), "nothing should run while stopped");

    engine.start();
    engine.stop();

    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
}
