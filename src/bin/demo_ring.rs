// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Two processes stream bytes through one named mirror ring.
//
// Usage:
//   demo_ring send <name> <records>
//   demo_ring recv <name>
//
// The sender creates the ring, writes <records> newline-terminated
// records and a NUL terminator, waits for the consumer to drain, and
// destroys the ring. The receiver attaches by name and prints what it
// reads until it sees the terminator.

use std::thread;
use std::time::Duration;

use evring::MirrorRing;

const RING_CAPACITY: usize = 1 << 20;

fn do_send(name: &str, records: usize) {
    let ring = MirrorRing::create(name, RING_CAPACITY, 0).expect("create ring");
    println!("send: ring {:?} capacity {}", ring.name(), ring.capacity());

    for i in 0..records {
        let record = format!("record-{i}\n");
        let mut rest = record.as_bytes();
        while !rest.is_empty() {
            let n = ring.push(rest);
            rest = &rest[n..];
            if n == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
    while ring.push(&[0]) == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    // Wait for the consumer before unlinking the name.
    while !ring.readable().is_empty() {
        thread::sleep(Duration::from_millis(10));
    }
    println!("send: done");
    ring.destroy();
}

fn do_recv(name: &str) {
    let ring = loop {
        match MirrorRing::attach(name) {
            Ok(ring) => break ring,
            Err(evring::Error::NotFound { .. }) => thread::sleep(Duration::from_millis(10)),
            Err(err) => {
                eprintln!("attach: {err}");
                std::process::exit(1);
            }
        }
    };

    let mut buf = [0u8; 4096];
    let mut total = 0usize;
    'outer: loop {
        let n = ring.pop_into(&mut buf);
        if n == 0 {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        for &byte in &buf[..n] {
            if byte == 0 {
                break 'outer;
            }
            total += 1;
        }
    }
    println!("recv: {total} payload bytes");
    // The sender owns the name; release only the local mapping.
    ring.detach();
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("send") if args.len() == 4 => {
            let records: usize = args[3].parse().expect("records");
            do_send(&args[2], records);
        }
        Some("recv") if args.len() == 3 => do_recv(&args[2]),
        _ => {
            eprintln!("usage: demo_ring send <name> <records>");
            eprintln!("       demo_ring recv <name>");
            std::process::exit(1);
        }
    }
}
