//! Property-based tests for the reference ARQ engine.
//!
//! Two engines are wired back to back through a lossy link driven by a
//! seeded generator. After a lossy phase the link heals; by the end every
//! record must have arrived exactly once and in order.

use std::sync::{Arc, Mutex};

use kcpmux::arq::{Kcp, KcpConfig};
use kcpmux::engine::ArqEngine;
use proptest::prelude::*;

type Wire = Arc<Mutex<Vec<Vec<u8>>>>;

const TICK_MS: u32 = 10;
const LOSSY_STEPS: u32 = 200;
const MAX_STEPS: u32 = 5_000;

fn engine(conv: u32) -> (Kcp, Wire) {
    let wire: Wire = Arc::new(Mutex::new(Vec::new()));
    let sink = wire.clone();
    let mut kcp = Kcp::new(conv, KcpConfig::default());
    kcp.set_output(Box::new(move |frame| sink.lock().unwrap().push(frame.to_vec())));
    (kcp, wire)
}

/// Deterministic drop decisions.
struct Link {
    state: u64,
    loss_per_mille: u64,
}

impl Link {
    fn drops(&mut self) -> bool {
        // xorshift64*
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        let r = self.state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 33;
        r % 1000 < self.loss_per_mille
    }
}

fn carry(wire: &Wire, to: &mut Kcp, link: &mut Link, lossy: bool) {
    let frames: Vec<_> = wire.lock().unwrap().drain(..).collect();
    for frame in frames {
        if lossy && link.drops() {
            continue;
        }
        to.input(&frame).unwrap();
    }
}

fn record_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..3000), 1..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn lossy_link_delivers_every_record_in_order(
        records in record_strategy(),
        seed in 1u64..u64::MAX,
        loss_per_mille in 0u64..400,
    ) {
        let (mut a, a_wire) = engine(42);
        let (mut b, b_wire) = engine(42);
        let mut link = Link { state: seed, loss_per_mille };

        let mut pending = records.iter();
        let mut next = pending.next();
        let mut received: Vec<Vec<u8>> = Vec::new();
        let mut buf = vec![0u8; 1 << 16];
        let mut now = 0u32;

        for step in 0..MAX_STEPS {
            while let Some(rec) = next {
                if !a.can_send() {
                    break;
                }
                a.try_send(rec).unwrap();
                next = pending.next();
            }

            now += TICK_MS;
            a.update(now);
            b.update(now);
            let lossy = step < LOSSY_STEPS;
            carry(&a_wire, &mut b, &mut link, lossy);
            carry(&b_wire, &mut a, &mut link, lossy);

            while let Ok(n) = b.recv(&mut buf) {
                received.push(buf[..n].to_vec());
            }
            if received.len() == records.len() && next.is_none() && a.waiting() == 0 {
                break;
            }
        }

        prop_assert_eq!(&received, &records);
        prop_assert_eq!(a.waiting(), 0);
        prop_assert!(b.stats().segments_received >= a.stats().segments_sent);
    }

    #[test]
    fn window_admission_matches_waiting(sizes in prop::collection::vec(1usize..5000, 1..80)) {
        let (mut a, _wire) = engine(7);
        let window = KcpConfig::default().send_window as usize;
        for size in sizes {
            let before = a.waiting();
            let admitted = a.can_send();
            let result = a.try_send(&vec![0u8; size]);
            prop_assert_eq!(admitted, before < window);
            prop_assert_eq!(result.is_ok(), admitted);
            if result.is_err() {
                prop_assert_eq!(a.waiting(), before);
            }
        }
    }
}
