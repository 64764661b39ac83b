// Integration test: alternation selection policies. Covers skip-only
// alternations (selection order), marker retraction after an untaken
// channel guard, and fair selection over two continuously ready
// producers.

use std::sync::atomic::{AtomicUsize, Ordering};

use cxr::{Alternation, Channel, Guard, Proc, initialize, par};

const PER_PRODUCER: usize = 100;

#[test]
fn selection_policies() {
    cxr::utils::logger::init();
    initialize(16 << 20, 8192);

    skip_only();
    marker_is_retracted();
    fair_selection_starves_nobody();
}

/// pri_select on a lone SKIP always takes it; fair_select over several
/// SKIPs cycles through them round-robin.
fn skip_only() {
    let guards = [Guard::skip()];
    let mut alt = Alternation::new(&guards);
    for _ in 0..10 {
        assert_eq!(alt.pri_select(), 0);
    }

    let guards = [Guard::skip(), Guard::skip(), Guard::skip()];
    let mut fair = Alternation::new(&guards);
    let mut pri = Alternation::new(&guards);
    for round in 0..9 {
        assert_eq!(fair.fair_select(), round % 3);
        assert_eq!(pri.pri_select(), 0);
    }
}

/// An untaken channel guard leaves no trace: the channel still works for
/// a plain rendezvous afterwards.
fn marker_is_retracted() {
    let chan = Channel::<u32>::new();
    let guards = [Guard::channel(&chan), Guard::skip()];
    let mut alt = Alternation::new(&guards);
    assert_eq!(alt.pri_select(), 1);

    // nothing waits on the channel now
    assert_eq!(chan.try_read(), None);

    // and a later rendezvous is unaffected
    let got = AtomicUsize::new(0);
    par(vec![
        Proc::new(|| {
            got.store(chan.read() as usize, Ordering::SeqCst);
        }),
        Proc::new(|| {
            chan.write(7);
        }),
    ]);
    assert_eq!(got.load(Ordering::SeqCst), 7);
}

/// Two producers, one fair-selecting consumer: with both producers
/// continuously ready, neither channel is starved and each delivers its
/// values in order.
fn fair_selection_starves_nobody() {
    let chan1 = Channel::<u32>::new();
    let chan2 = Channel::<u32>::new();
    let taken1 = AtomicUsize::new(0);
    let taken2 = AtomicUsize::new(0);

    par(vec![
        Proc::new(|| {
            for i in 0..PER_PRODUCER as u32 {
                chan1.write(i);
            }
        }),
        Proc::new(|| {
            for i in 0..PER_PRODUCER as u32 {
                chan2.write(i);
            }
        }),
        Proc::new(|| {
            let guards = [Guard::channel(&chan1), Guard::channel(&chan2)];
            let mut alt = Alternation::new(&guards);
            let mut expect1 = 0u32;
            let mut expect2 = 0u32;
            for _ in 0..2 * PER_PRODUCER {
                match alt.fair_select() {
                    0 => {
                        assert_eq!(chan1.read(), expect1);
                        expect1 += 1;
                        taken1.fetch_add(1, Ordering::SeqCst);
                    }
                    1 => {
                        assert_eq!(chan2.read(), expect2);
                        expect2 += 1;
                        taken2.fetch_add(1, Ordering::SeqCst);
                    }
                    other => panic!("selected guard {other} of 2"),
                }
            }
        }),
    ]);

    let taken1 = taken1.load(Ordering::SeqCst);
    let taken2 = taken2.load(Ordering::SeqCst);
    assert_eq!(taken1 + taken2, 2 * PER_PRODUCER);
    assert_eq!(taken1, PER_PRODUCER);
    assert_eq!(taken2, PER_PRODUCER);
}
