// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Minimal echo server on the dispatcher.
//
// Usage:
//   demo_echo <addr>
//
// <addr> is either an IPv4 "host:port" or a Unix socket path. Each
// connection is echoed until the client half-closes (or the echo backlog
// drains), then closed. Try: printf 'hello' | nc -N 127.0.0.1 7000

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use evring::{
    ConnCtx, ConnectionHandler, Dispatcher, Event, LoopListener, TcpConnection, TcpListener,
};

const RING_SIZE: usize = 64 * 1024;

struct Echo {
    armed: bool,
}

impl ConnectionHandler for Echo {
    fn on_read(&mut self, ctx: &mut ConnCtx<'_>, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let pushed = match ctx.write_ring() {
            Some(ring) => ring.push(data),
            None => return data.len(),
        };
        if pushed > 0 && !self.armed {
            if let Err(err) = ctx.enable_write() {
                eprintln!("enable_write: {err}");
            }
            self.armed = true;
        }
        pushed
    }

    fn on_write(&mut self, _ctx: &mut ConnCtx<'_>, _buf: &mut [u8]) -> usize {
        // Push-style echo: everything goes through the write ring in
        // on_read. Producing nothing here closes the drained connection.
        0
    }

    fn on_close(&mut self, ctx: &mut ConnCtx<'_>) {
        println!("closed fd {}", ctx.fd());
    }
}

static QUIT: AtomicBool = AtomicBool::new(false);

struct QuitWatch;

impl LoopListener for QuitWatch {
    fn on_loop(&mut self, dispatcher: &mut Dispatcher) {
        if QUIT.load(Ordering::Acquire) {
            dispatcher.stop();
        }
    }
}

extern "C" fn on_signal(_: libc::c_int) {
    QUIT.store(true, Ordering::Release);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_echo <addr>");
        std::process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }

    let sock = TcpListener::listen(&args[1]).expect("listen");
    let listener = TcpListener::new(sock, |sock, peer, dispatcher| {
        println!("accepted {peer:?}");
        match TcpConnection::new(sock, RING_SIZE, RING_SIZE, Echo { armed: false }) {
            Ok(conn) => {
                let conn = Rc::new(RefCell::new(conn));
                if let Err(err) = dispatcher.register_io(conn, Event::Read) {
                    eprintln!("register connection: {err}");
                }
            }
            Err(err) => eprintln!("set up connection: {err}"),
        }
    });

    let mut dispatcher = Dispatcher::new().expect("dispatcher");
    dispatcher
        .register_io(Rc::new(RefCell::new(listener)), Event::Read)
        .expect("register listener");
    dispatcher.register_loop(Rc::new(RefCell::new(QuitWatch)));

    println!("echoing on {}", args[1]);
    if let Err(err) = dispatcher.run_loop(Duration::from_millis(100)) {
        eprintln!("dispatch loop failed: {err}");
        std::process::exit(1);
    }
}
