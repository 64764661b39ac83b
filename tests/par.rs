// Integration test: parallel composition. The barrier releases the parent
// exactly once after every child has finished; priority spreading runs
// non-blocking children in index order.

use std::sync::atomic::{AtomicUsize, Ordering};

use cxr::{Proc, initialize, now, par, par_pri};

#[test]
fn parallel_composition() {
    cxr::utils::logger::init();
    initialize(16 << 20, 8192);

    barrier_waits_for_all();
    pri_par_runs_in_priority_order();
    nested_par();
}

/// A hundred children each strike the barrier once; the parent resumes
/// only after all of them.
fn barrier_waits_for_all() {
    let finished = AtomicUsize::new(0);

    let children = (0..100)
        .map(|_| {
            Proc::with_stack(8192, || {
                cxr::after(now()); // already due, returns at once
                finished.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    par(children);

    assert_eq!(finished.load(Ordering::SeqCst), 100);
}

/// Non-blocking PRI PAR children run to completion highest priority
/// first, which is index order.
fn pri_par_runs_in_priority_order() {
    const N: usize = 8;
    let seq = AtomicUsize::new(0);
    let order: Vec<AtomicUsize> = (0..N).map(|_| AtomicUsize::new(usize::MAX)).collect();

    let children = (0..N)
        .map(|i| {
            let order = &order;
            let seq = &seq;
            Proc::new(move || {
                order[i].store(seq.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            })
        })
        .collect();
    par_pri(children);

    for (i, slot) in order.iter().enumerate() {
        assert_eq!(slot.load(Ordering::SeqCst), i);
    }
}

/// A par inside a par child: the inner barrier nests cleanly inside the
/// outer one.
fn nested_par() {
    let leaves = AtomicUsize::new(0);

    par(vec![
        Proc::new(|| {
            par(vec![
                Proc::new(|| {
                    leaves.fetch_add(1, Ordering::SeqCst);
                }),
                Proc::new(|| {
                    leaves.fetch_add(1, Ordering::SeqCst);
                }),
            ]);
        }),
        Proc::new(|| {
            leaves.fetch_add(1, Ordering::SeqCst);
        }),
    ]);

    assert_eq!(leaves.load(Ordering::SeqCst), 3);
}
