//! NEXIO ping-pong benchmark client
//!
//! Opens N connections to an echo server, bounces a fixed payload M
//! times on each, then reports throughput and round-trip latency. Each
//! connection is its own connector + connection pair inside one
//! single-threaded reactor.
//!
//! Usage:
//!     cargo build --release -p nexio-pingpong
//!     ./target/release/nexio-pingpong [host:port] [conns] [rounds] [bytes]
//!
//! Pair with:
//!     ./target/release/nexio-echo 9999

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use nexio::{
    ConnConfig, ConnectionEvents, ConnectionFactory, ConnectionOps, PollMode, Reactor,
    ReactorConfig, Reason,
};

static ROUNDS_DONE: AtomicU64 = AtomicU64::new(0);
static FINISHED: AtomicU64 = AtomicU64::new(0);
static FAILED: AtomicU64 = AtomicU64::new(0);

struct PingConn {
    payload: Vec<u8>,
    remaining: u64,
    /// Echoed bytes of the current round seen so far.
    got: usize,
}

impl ConnectionEvents for PingConn {
    fn on_connected(&mut self, conn: &mut dyn ConnectionOps) {
        if conn.send(&self.payload).is_err() {
            conn.shutdown(true);
        }
    }

    fn on_disconnected(&mut self, _remote: bool) {
        FINISHED.fetch_add(1, Ordering::Relaxed);
    }

    fn on_new_data(&mut self, conn: &mut dyn ConnectionOps) {
        let n = conn.recv_data().len();
        conn.consume_recv(n);
        self.got += n;

        // The echo may arrive in pieces; a round ends when the whole
        // payload is back.
        while self.got >= self.payload.len() {
            self.got -= self.payload.len();
            self.remaining -= 1;
            ROUNDS_DONE.fetch_add(1, Ordering::Relaxed);
            if self.remaining == 0 {
                conn.shutdown(false);
                return;
            }
            if conn.send(&self.payload).is_err() {
                conn.shutdown(true);
                return;
            }
        }
    }

    fn on_error(&mut self, reason: Reason) {
        eprintln!("nexio-pingpong: connection error: {}", reason);
    }
}

struct PingFactory {
    rounds: u64,
    bytes: usize,
}

impl ConnectionFactory for PingFactory {
    fn create_connection(&mut self) -> Option<Box<dyn ConnectionEvents>> {
        Some(Box::new(PingConn {
            payload: vec![0x42u8; self.bytes],
            remaining: self.rounds,
            got: 0,
        }))
    }

    fn connect_failed(&mut self, reason: Reason) {
        eprintln!("nexio-pingpong: connect failed: {}", reason);
        FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let addr: SocketAddr = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("127.0.0.1:9999")
        .parse()
        .expect("bad address (want host:port)");
    let conns: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(16);
    let rounds: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(1000);
    let bytes: usize = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(64);

    eprintln!(
        "nexio-pingpong: {} conns x {} rounds x {} bytes -> {}",
        conns, rounds, bytes, addr
    );

    let mut reactor = Reactor::new(ReactorConfig {
        max_handlers: (conns as usize) * 2 + 8,
        ..Default::default()
    })
    .expect("reactor setup failed");

    let start = Instant::now();
    for _ in 0..conns {
        let connector = reactor
            .add_connector(
                Box::new(PingFactory { rounds, bytes }),
                ConnConfig::default(),
            )
            .expect("connector registration failed");
        reactor.connect(connector, addr).expect("connect issue failed");
    }

    while FINISHED.load(Ordering::Relaxed) + FAILED.load(Ordering::Relaxed) < conns {
        if let Err(e) = reactor.poll(PollMode::Wait) {
            eprintln!("nexio-pingpong: poll failed: {}", e);
            break;
        }
    }
    let elapsed = start.elapsed();

    let done = ROUNDS_DONE.load(Ordering::Relaxed);
    let failed = FAILED.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64();
    let total_bytes = done * 2 * bytes as u64; // payload both directions
    eprintln!(
        "nexio-pingpong: {} round-trips in {:.3}s — {:.0} rt/s, {:.2} MiB/s, avg rtt {:.1}us{}",
        done,
        secs,
        done as f64 / secs,
        total_bytes as f64 / secs / (1024.0 * 1024.0),
        secs * 1e6 * conns as f64 / done.max(1) as f64,
        if failed > 0 {
            format!(" ({} connects failed)", failed)
        } else {
            String::new()
        }
    );
}
