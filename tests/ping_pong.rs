// Integration test: two processes on one unit exchange a token over two
// channels; the token counts the round trips.

use std::sync::atomic::{AtomicU64, Ordering};

use cxr::{Channel, Proc, initialize, par};

const ROUND_TRIPS: u64 = 100_000;

#[test]
fn token_survives_a_hundred_thousand_round_trips() {
    cxr::utils::logger::init();
    initialize(16 << 20, 8192);

    let ping = Channel::<u64>::new();
    let pong = Channel::<u64>::new();
    let result = AtomicU64::new(0);

    par(vec![
        Proc::new(|| {
            // serve: read a token, send it back incremented
            for _ in 0..ROUND_TRIPS {
                let token = ping.read();
                pong.write(token + 1);
            }
        }),
        Proc::new(|| {
            // drive: send the token out, read it back
            let mut token = 0u64;
            for _ in 0..ROUND_TRIPS {
                ping.write(token);
                token = pong.read();
            }
            result.store(token, Ordering::SeqCst);
        }),
    ]);

    assert_eq!(result.load(Ordering::SeqCst), ROUND_TRIPS);
}
