// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// MirrorRing tests: wrap-around contiguity, index bounds, byte fidelity
// across sustained traffic, named create/attach, and error paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use evring::{Error, MirrorRing};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_ring_{}_{n}", std::process::id())
}

const PAGE: usize = 4096;

#[test]
fn capacity_rounds_to_page_pow2() {
    let ring = MirrorRing::anonymous(1, 0).expect("create");
    assert_eq!(ring.capacity(), PAGE);
    let ring = MirrorRing::anonymous(5000, 0).expect("create");
    assert_eq!(ring.capacity(), 8192);
    let ring = MirrorRing::anonymous(PAGE, 0).expect("create");
    assert_eq!(ring.capacity(), PAGE);
}

// Scenario: one-page ring, write 3000, read 2000, write 3000 — the 4000
// unread bytes straddle the wrap point yet read as one contiguous slice.
#[test]
fn wrap_around_is_contiguous() {
    let ring = MirrorRing::anonymous(PAGE, 0).expect("create");
    assert_eq!(ring.capacity(), PAGE);

    assert_eq!(ring.push(&[0x41u8; 3000]), 3000);
    let mut sink = [0u8; 2000];
    assert_eq!(ring.pop_into(&mut sink), 2000);
    assert!(sink.iter().all(|&b| b == 0x41));
    assert_eq!(ring.push(&[0x42u8; 3000]), 3000);

    let window = ring.readable();
    assert_eq!(window.len(), 4000);
    let bytes = unsafe { window.as_slice() };
    assert!(bytes[..1000].iter().all(|&b| b == 0x41));
    assert!(bytes[1000..].iter().all(|&b| b == 0x42));
}

#[test]
fn readable_plus_writable_is_capacity() {
    let ring = MirrorRing::anonymous(PAGE, 0).expect("create");
    let cap = ring.capacity();

    let mut scratch = vec![0u8; 1500];
    for step in 0..40 {
        let n = 37 * (step + 1) % 1400 + 1;
        ring.push(&vec![step as u8; n]);
        assert_eq!(ring.readable().len() + ring.writable().len(), cap);
        assert!(ring.readable().len() <= cap);
        if step % 3 == 0 {
            ring.pop_into(&mut scratch[..n / 2 + 1]);
            assert_eq!(ring.readable().len() + ring.writable().len(), cap);
        }
    }
}

#[test]
fn commit_clamps_to_window() {
    let ring = MirrorRing::anonymous(PAGE, 0).expect("create");
    assert_eq!(ring.push(&vec![1u8; 2 * PAGE]), PAGE);
    assert_eq!(ring.writable().len(), 0);
    let mut out = vec![0u8; 2 * PAGE];
    assert_eq!(ring.pop_into(&mut out), PAGE);
    assert_eq!(ring.readable().len(), 0);
}

// Byte fidelity: feed >10x capacity through the ring in ragged chunks and
// check the output stream equals the input stream.
#[test]
fn sustained_traffic_preserves_bytes() {
    let ring = MirrorRing::anonymous(PAGE, 0).expect("create");
    let total = 10 * ring.capacity() + 777;

    // Deterministic byte stream from a small LCG.
    let mut seed = 0x2545_f491u32;
    let mut byte = move || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (seed >> 16) as u8
    };
    let source: Vec<u8> = (0..total).map(|_| byte()).collect();

    let mut written = 0;
    let mut collected = Vec::with_capacity(total);
    let mut out = [0u8; 613];
    while collected.len() < total {
        if written < total {
            let chunk = (written % 971 + 1).min(total - written);
            written += ring.push(&source[written..written + chunk]);
        }
        let n = ring.pop_into(&mut out);
        collected.extend_from_slice(&out[..n]);
    }
    assert_eq!(collected, source);
}

#[test]
fn spsc_across_threads() {
    let ring = Arc::new(MirrorRing::anonymous(16 * 1024, 0).expect("create"));
    let total: usize = 1 << 20;

    let producer = {
        let ring = Arc::clone(&ring);
        std::thread::spawn(move || {
            let mut sent = 0usize;
            while sent < total {
                let len = (sent % 509 + 1).min(total - sent);
                let chunk: Vec<u8> = (0..len).map(|i| ((sent + i) % 251) as u8).collect();
                let n = ring.push(&chunk);
                if n == 0 {
                    std::thread::yield_now();
                }
                sent += n;
            }
        })
    };

    let mut received = 0usize;
    let mut out = [0u8; 2048];
    while received < total {
        let n = ring.pop_into(&mut out);
        for &b in &out[..n] {
            assert_eq!(b, ((received) % 251) as u8);
            received += 1;
        }
        if n == 0 {
            std::thread::yield_now();
        }
    }
    producer.join().expect("producer");
}

#[test]
fn private_data_region() {
    let ring = MirrorRing::anonymous(PAGE, 32).expect("create");
    let region = ring.private_data().expect("private region");
    assert_eq!(region.len(), 32);
    let bytes = unsafe { region.as_mut_slice() };
    bytes.copy_from_slice(&[0xab; 32]);
    let again = unsafe { ring.private_data().expect("private region").as_slice() };
    assert_eq!(again, &[0xab; 32][..]);

    let plain = MirrorRing::anonymous(PAGE, 0).expect("create");
    assert!(plain.private_data().is_none());
}

#[test]
fn named_create_attach_roundtrip() {
    let name = unique_name("roundtrip");
    let _ = MirrorRing::unlink(&name);

    let producer = MirrorRing::create(&name, PAGE, 16).expect("create");
    assert_eq!(producer.name(), Some(format!("/{name}").as_str()));
    let consumer = MirrorRing::attach(&name).expect("attach");
    assert_eq!(consumer.capacity(), producer.capacity());
    assert_eq!(consumer.private_data().expect("private").len(), 16);

    assert_eq!(producer.push(b"over the wall"), 13);
    let mut out = [0u8; 64];
    let n = consumer.pop_into(&mut out);
    assert_eq!(&out[..n], b"over the wall");

    // Producer sees the consumer's progress through the shared header.
    assert_eq!(producer.writable().len(), producer.capacity());

    consumer.detach();
    producer.destroy();
    assert!(matches!(
        MirrorRing::attach(&name),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn attach_missing_name_is_not_found() {
    let name = unique_name("missing");
    let _ = MirrorRing::unlink(&name);
    assert!(matches!(
        MirrorRing::attach(&name),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn create_duplicate_name_fails() {
    let name = unique_name("dup");
    let _ = MirrorRing::unlink(&name);
    let first = MirrorRing::create(&name, PAGE, 0).expect("create");
    assert!(MirrorRing::create(&name, PAGE, 0).is_err());
    first.destroy();
}

#[test]
fn bad_names_are_rejected() {
    assert!(matches!(
        MirrorRing::create("a/b", PAGE, 0),
        Err(Error::BadName { .. })
    ));
    let long = "x".repeat(80);
    assert!(matches!(
        MirrorRing::create(&long, PAGE, 0),
        Err(Error::BadName { .. })
    ));
}

proptest! {
    // Fidelity under arbitrary interleavings of ragged writes and reads.
    #[test]
    fn prop_interleaved_io_preserves_bytes(
        ops in prop::collection::vec((any::<bool>(), 1usize..2048), 1..64),
        fill in any::<u8>(),
    ) {
        let ring = MirrorRing::anonymous(PAGE, 0).expect("create");
        let mut next_in: u64 = 0;
        let mut next_out: u64 = 0;
        let mut out = [0u8; 2048];

        for (is_write, size) in ops {
            if is_write {
                let chunk: Vec<u8> = (0..size)
                    .map(|i| (next_in + i as u64) as u8 ^ fill)
                    .collect();
                let n = ring.push(&chunk);
                prop_assert!(n <= size);
                next_in += n as u64;
            } else {
                let n = ring.pop_into(&mut out[..size]);
                for &b in &out[..n] {
                    prop_assert_eq!(b, next_out as u8 ^ fill);
                    next_out += 1;
                }
            }
            prop_assert_eq!(
                ring.readable().len() + ring.writable().len(),
                ring.capacity()
            );
            prop_assert_eq!((next_in - next_out) as usize, ring.readable().len());
        }
    }
}
