// Integration test: wall-clock waits. After() returns no earlier than its
// deadline and within a tick plus scheduling slack; an alternation with a
// timer guard and a silent channel takes the timer branch.

use std::time::Instant;

use cxr::{Alternation, Channel, Guard, initialize, now, tick};

#[test]
fn deadlines() {
    cxr::utils::logger::init();
    initialize(16 << 20, 8192);

    after_respects_deadline();
    past_deadline_returns_immediately();
    alternation_times_out();
}

fn after_respects_deadline() {
    let start = Instant::now();
    let deadline = now() + 1_200_000_000;
    cxr::after(deadline);

    // no earlier than the deadline, no later than a tick plus slack
    assert!(now() >= deadline);
    let elapsed = start.elapsed().as_nanos() as u64;
    assert!(
        elapsed < 1_200_000_000 + tick() + 2_000_000_000,
        "after overslept: {} ns",
        elapsed
    );
}

fn past_deadline_returns_immediately() {
    let start = Instant::now();
    cxr::after(0);
    cxr::after(now().saturating_sub(1));
    assert!(start.elapsed().as_millis() < 100);
}

fn alternation_times_out() {
    let quiet = Channel::<u32>::new();
    let deadline = now() + 1_000_000_000;
    let guards = [Guard::channel(&quiet), Guard::timer(deadline)];
    let mut alt = Alternation::new(&guards);

    let start = Instant::now();
    let selected = alt.fair_select();
    assert_eq!(selected, 1, "silent channel must lose to the deadline");
    assert!(now() >= deadline);
    let elapsed = start.elapsed().as_nanos() as u64;
    assert!(
        elapsed < 1_000_000_000 + tick() + 2_000_000_000,
        "timeout overslept: {} ns",
        elapsed
    );
}
