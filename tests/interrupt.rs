// Integration test: software interrupts. A receiver registers, a sender
// raises the interrupt on the same unit; under par_pri the higher
// priority receiver preempts the sender the moment the handler fires.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use cxr::{INTR_USER0, Proc, initialize, par, par_pri, receive, send_interrupt};

#[test]
fn interrupts_reach_receivers() {
    cxr::utils::logger::init();
    initialize(16 << 20, 8192);

    delivery_at_equal_priority();
    delivery_preempts_lower_priority();
}

/// Equal priorities: the receiver becomes ready on delivery and runs once
/// the sender is done.
fn delivery_at_equal_priority() {
    let delivered = AtomicBool::new(false);

    par(vec![
        Proc::new(|| {
            receive(INTR_USER0);
            delivered.store(true, Ordering::SeqCst);
        }),
        Proc::new(|| {
            // the receiver registered first: it ran to its park before
            // this process was ever scheduled
            send_interrupt(INTR_USER0);
        }),
    ]);

    assert!(delivered.load(Ordering::SeqCst));
}

/// Descending priorities: the receiver outranks the sender, so delivery
/// preempts the sender before its next statement runs.
fn delivery_preempts_lower_priority() {
    let seq = AtomicUsize::new(0);
    let receiver_woke = AtomicUsize::new(usize::MAX);
    let sender_sent = AtomicUsize::new(usize::MAX);
    let sender_resumed = AtomicUsize::new(usize::MAX);

    par_pri(vec![
        Proc::new(|| {
            receive(INTR_USER0);
            receiver_woke.store(seq.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        }),
        Proc::new(|| {
            sender_sent.store(seq.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            send_interrupt(INTR_USER0);
            sender_resumed.store(seq.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        }),
    ]);

    assert_eq!(sender_sent.load(Ordering::SeqCst), 0);
    assert_eq!(
        receiver_woke.load(Ordering::SeqCst),
        1,
        "receiver must run between the send and the sender's next statement"
    );
    assert_eq!(sender_resumed.load(Ordering::SeqCst), 2);
}
