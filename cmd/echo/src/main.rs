//! NEXIO echo server
//!
//! Single-threaded TCP echo server driven entirely by the nexio reactor.
//! Every byte received on a connection goes straight back out through the
//! connection's ring buffers; backpressure is handled by leaving unread
//! bytes in the in buffer until the out buffer drains.
//!
//! Usage:
//!     cargo build --release -p nexio-echo
//!     ./target/release/nexio-echo [port] [max_conns]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     ./target/release/nexio-pingpong 127.0.0.1:9999 100 1000 64

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use nexio::{
    AcceptorConfig, ConnectionEvents, ConnectionFactory, ConnectionOps, PollMode, Reactor,
    ReactorConfig, Reason,
};

static RUNNING: AtomicBool = AtomicBool::new(true);

// Stats — hooks run on the reactor thread, atomics keep the counters
// signal-safe for the final print.
static ACCEPTS: AtomicU64 = AtomicU64::new(0);
static CLOSES: AtomicU64 = AtomicU64::new(0);
static ERRORS: AtomicU64 = AtomicU64::new(0);
static BYTES_IN: AtomicU64 = AtomicU64::new(0);
static BYTES_OUT: AtomicU64 = AtomicU64::new(0);
static LIVE: AtomicUsize = AtomicUsize::new(0);

struct EchoConn;

impl EchoConn {
    /// Move as much of the readable prefix as the out buffer accepts.
    fn pump(conn: &mut dyn ConnectionOps) {
        loop {
            let pending = conn.recv_data();
            if pending.is_empty() {
                return;
            }
            let chunk = pending.len().min(conn.out_free());
            if chunk == 0 {
                return; // out buffer full — resume from on_some_data_sent
            }
            let copy = pending[..chunk].to_vec();
            match conn.send(&copy) {
                Ok(n) => conn.consume_recv(n),
                Err(_) => return,
            }
        }
    }
}

impl ConnectionEvents for EchoConn {
    fn on_connected(&mut self, _conn: &mut dyn ConnectionOps) {
        ACCEPTS.fetch_add(1, Ordering::Relaxed);
        LIVE.fetch_add(1, Ordering::Relaxed);
    }

    fn on_disconnected(&mut self, _remote: bool) {
        CLOSES.fetch_add(1, Ordering::Relaxed);
        LIVE.fetch_sub(1, Ordering::Relaxed);
    }

    fn on_new_data(&mut self, conn: &mut dyn ConnectionOps) {
        BYTES_IN.fetch_add(conn.recv_data().len() as u64, Ordering::Relaxed);
        Self::pump(conn);
    }

    fn on_some_data_sent(&mut self, conn: &mut dyn ConnectionOps, bytes: usize) {
        BYTES_OUT.fetch_add(bytes as u64, Ordering::Relaxed);
        // Retry bytes that stalled on a full out buffer.
        Self::pump(conn);
    }

    fn on_error(&mut self, reason: Reason) {
        ERRORS.fetch_add(1, Ordering::Relaxed);
        eprintln!("nexio-echo: connection error: {}", reason);
    }
}

struct EchoFactory;

impl ConnectionFactory for EchoFactory {
    fn create_connection(&mut self) -> Option<Box<dyn ConnectionEvents>> {
        Some(Box::new(EchoConn))
    }
}

fn print_stats(elapsed_secs: f64) {
    eprintln!(
        "[{:.1}s] conns={} accepts={} closes={} bytes_in={} bytes_out={} err={}",
        elapsed_secs,
        LIVE.load(Ordering::Relaxed),
        ACCEPTS.load(Ordering::Relaxed),
        CLOSES.load(Ordering::Relaxed),
        BYTES_IN.load(Ordering::Relaxed),
        BYTES_OUT.load(Ordering::Relaxed),
        ERRORS.load(Ordering::Relaxed),
    );
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let max_conns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1024);

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let mut reactor = Reactor::new(ReactorConfig {
        max_handlers: max_conns + 8,
        ..Default::default()
    })
    .expect("reactor setup failed");

    let acceptor = reactor
        .add_acceptor(Box::new(EchoFactory), AcceptorConfig::default())
        .expect("acceptor registration failed");
    let addr = format!("0.0.0.0:{}", port).parse().unwrap();
    reactor
        .open_acceptor(acceptor, addr)
        .expect("listen failed");

    eprintln!(
        "nexio-echo: listening on 0.0.0.0:{} ({} backend, max {} connections)",
        port,
        reactor.backend(),
        max_conns
    );

    let start = Instant::now();
    let mut last_stats = start;

    while RUNNING.load(Ordering::Relaxed) {
        // One blocking turn: the kernel wakes us the instant a completion
        // arrives. A signal interrupts the wait and re-checks RUNNING.
        if let Err(e) = reactor.poll(PollMode::Wait) {
            eprintln!("nexio-echo: poll failed: {}", e);
            break;
        }

        let now = Instant::now();
        if now.duration_since(last_stats).as_secs() >= 5 {
            print_stats(now.duration_since(start).as_secs_f64());
            last_stats = now;
        }
    }

    eprintln!("\nnexio-echo: shutting down...");
    drop(reactor);
    print_stats(start.elapsed().as_secs_f64());
    eprintln!("nexio-echo: done.");
}
