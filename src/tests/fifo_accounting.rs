use proptest::prelude::*;

use crate::fifo::{AtomicCounters, RingBufferController};

#[test]
fn write_index_wraps_modulo_capacity() {
    let fifo = RingBufferController::new(10, 10);
    fifo.advance_write(7);
    assert_eq!(fifo.write_index(), 7);
    fifo.advance_write(6);
    assert_eq!(fifo.write_index(), 3);
    assert_eq!(fifo.read_index(), 0);
}

#[test]
fn threshold_is_clamped_to_capacity() {
    let fifo = RingBufferController::new(100, 100);
    fifo.set_threshold(-5);
    assert_eq!(fifo.threshold_frames(), 0);
    assert_eq!(fifo.available_to_write(), 0);

    fifo.set_threshold(500);
    assert_eq!(fifo.threshold_frames(), 100);
    fifo.set_threshold(500);
    assert_eq!(fifo.threshold_frames(), 100);

    fifo.set_threshold(40);
    assert_eq!(fifo.threshold_frames(), 40);
    assert_eq!(fifo.available_to_write(), 40);
}

#[test]
fn initial_threshold_never_exceeds_capacity() {
    let fifo = RingBufferController::new(16, 64);
    assert_eq!(fifo.threshold_frames(), 16);
}

#[test]
fn occupancy_survives_counter_wrap() {
    let fifo = RingBufferController::with_counters(AtomicCounters::starting_at(u64::MAX - 2), 16, 16);
    assert_eq!(fifo.available_to_read(), 0);

    fifo.advance_write(5);
    assert!(fifo.write_counter() < fifo.read_counter());
    assert_eq!(fifo.available_to_read(), 5);
    assert_eq!(fifo.available_to_write(), 11);

    fifo.advance_read(3);
    assert_eq!(fifo.available_to_read(), 2);
    fifo.advance_read(2);
    assert_eq!(fifo.available_to_read(), 0);
    assert_eq!(fifo.read_counter(), 2);
}

#[test]
fn zero_capacity_reports_nothing() {
    let fifo = RingBufferController::new(0, 0);
    assert_eq!(fifo.available_to_read(), 0);
    assert_eq!(fifo.available_to_write(), 0);
    assert_eq!(fifo.write_index(), 0);
}

#[derive(Clone, Debug)]
enum Op {
    Write(usize),
    Read(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0usize..64).prop_map(Op::Write), (0usize..64).prop_map(Op::Read)]
}

proptest! {
    #[test]
    fn read_plus_write_equals_threshold(
        capacity in 1usize..128,
        threshold in 0i64..160,
        start in prop_oneof![Just(0u64), Just(u64::MAX - 40), any::<u64>()],
        ops in prop::collection::vec(op(), 1..64),
    ) {
        let fifo = RingBufferController::with_counters(
            AtomicCounters::starting_at(start),
            capacity,
            capacity,
        );
        fifo.set_threshold(threshold);
        let threshold = fifo.threshold_frames();
        prop_assert!(threshold <= capacity);

        for op in ops {
            match op {
                Op::Write(n) => fifo.advance_write(n.min(fifo.available_to_write())),
                Op::Read(n) => fifo.advance_read(n.min(fifo.available_to_read())),
            }
            prop_assert_eq!(fifo.available_to_read() + fifo.available_to_write(), threshold);
            prop_assert!(fifo.read_index() < capacity);
            prop_assert!(fifo.write_index() < capacity);
        }
    }
}
