// Integration test: rendezvous across processing units. The sender lives
// on unit 1, the receiver on unit 0; the wake-up crosses the
// interprocessor queue in both directions.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use cxr::{Channel, Proc, initialize, placed_par};

#[test]
fn rendezvous_crosses_units() {
    cxr::utils::logger::init();
    initialize(16 << 20, 8192);

    let chan = Channel::<u32>::new();
    let received = AtomicU32::new(0);

    placed_par(vec![
        Proc::new(|| {
            received.store(chan.read(), Ordering::SeqCst);
        })
        .on(0),
        Proc::new(|| {
            chan.write(72);
        })
        .on(1),
    ]);

    assert_eq!(received.load(Ordering::SeqCst), 72);

    // many transfers, receiver side placed remotely this time
    let chan2 = Channel::<u32>::new();
    let sum = AtomicU32::new(0);
    let transfers = AtomicUsize::new(0);

    placed_par(vec![
        Proc::new(|| {
            for _ in 0..1000 {
                sum.fetch_add(chan2.read(), Ordering::SeqCst);
                transfers.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on(1),
        Proc::new(|| {
            for i in 0..1000u32 {
                chan2.write(i);
            }
        })
        .on(0),
    ]);

    assert_eq!(transfers.load(Ordering::SeqCst), 1000);
    assert_eq!(sum.load(Ordering::SeqCst), (0..1000).sum::<u32>());
}
