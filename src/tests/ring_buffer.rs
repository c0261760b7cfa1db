use crate::ring::SharedRingBuffer;

fn ramp(frames: usize, channels: usize, offset: f32) -> Vec<f32> {
    (0..frames * channels).map(|i| offset + i as f32).collect()
}

#[test]
fn push_pop_across_the_wrap() {
    let ring = SharedRingBuffer::new_local(8, 2);
    assert_eq!(ring.push(&ramp(6, 2, 0.0), Some(1)), 6);
    let mut out = vec![0.0; 8];
    assert_eq!(ring.pop(&mut out), 4);
    assert_eq!(out, ramp(4, 2, 0.0));

    let next = ramp(6, 2, 100.0);
    assert_eq!(ring.push(&next, Some(2)), 6);
    assert_eq!(ring.available_read(), 8);
    assert_eq!(ring.available_write(), 0);

    let (first, second) = ring.readable_regions(8);
    assert_eq!(first.len(), 4 * 2);
    assert_eq!(second.len(), 4 * 2);
    assert_eq!(first[..4], [8.0, 9.0, 10.0, 11.0]);
    assert_eq!(second[4..], next[8..]);

    let mut rest = vec![0.0; 16];
    assert_eq!(ring.pop(&mut rest), 8);
    assert_eq!(rest[4..], next[..]);
    assert_eq!(ring.last_timestamp_ns(), 2);
}

#[test]
fn push_stops_at_threshold() {
    let ring = SharedRingBuffer::new_local(64, 1);
    ring.set_threshold(32);
    assert_eq!(ring.push(&[0.5; 48], None), 32);
    assert_eq!(ring.available_write(), 0);
    assert_eq!(ring.fill_ratio(), 1.0);
    assert_eq!(ring.discard(10), 10);
    assert_eq!(ring.available_write(), 10);
}

#[test]
fn mapped_ring_exposes_counters_in_header() {
    let ring = SharedRingBuffer::new_shared(32, 2).expect("anonymous mapping");
    assert_eq!(ring.capacity_frames(), 32);
    assert_eq!(ring.channels(), 2);

    assert_eq!(ring.push(&ramp(10, 2, 1.0), Some(42)), 10);
    assert_eq!(ring.controller().write_counter(), 10);
    assert_eq!(ring.last_timestamp_ns(), 42);

    let mut out = vec![0.0; 20];
    assert_eq!(ring.pop(&mut out), 10);
    assert_eq!(out, ramp(10, 2, 1.0));
    assert_eq!(ring.controller().read_counter(), 10);
}

#[test]
fn from_mmap_rejects_short_mappings() {
    let mmap = memmap2::MmapOptions::new()
        .len(16)
        .map_anon()
        .expect("anonymous mapping");
    assert!(SharedRingBuffer::from_mmap(mmap).is_err());
}

#[test]
fn over_advanced_read_never_maps_past_storage() {
    let ring = SharedRingBuffer::new_local(8, 1);
    ring.advance_read(1);
    assert_eq!(ring.available_read(), 0);
    let (first, second) = ring.readable_regions(64);
    assert!(first.is_empty() && second.is_empty());

    // Move the counters behind the buffer's back; occupancy is garbage but memory stays bounded.
    ring.controller().advance_read(1);
    let (first, second) = ring.readable_regions(64);
    assert!(first.len() + second.len() <= 8);
    let mut out = vec![0.0; 64];
    assert!(ring.pop(&mut out) <= 8);
}

#[test]
fn frames_cross_threads_in_write_order() {
    const TOTAL: usize = 200_000;
    let ring = std::sync::Arc::new(SharedRingBuffer::new_local(37, 1));

    let producer = {
        let ring = ring.clone();
        std::thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let block: Vec<f32> = (next..(next + 11).min(TOTAL)).map(|v| v as f32).collect();
                next += ring.push(&block, None);
                if ring.available_write() == 0 {
                    std::thread::yield_now();
                }
            }
        })
    };

    let mut expected = 0usize;
    let mut out = vec![0.0f32; 13];
    while expected < TOTAL {
        let frames = ring.pop(&mut out);
        for value in &out[..frames] {
            assert_eq!(*value, expected as f32);
            expected += 1;
        }
        if frames == 0 {
            std::thread::yield_now();
        }
    }
    producer.join().expect("producer thread");
    assert_eq!(ring.available_read(), 0);
    assert!(ring.controller().write_counter() as usize / ring.capacity_frames() > 5_000);
}
