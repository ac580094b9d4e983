//! evsock Echo Server
//!
//! TCP and UDP echo on one port. One thread pumps the poller, worker
//! threads service the sockets; received packets are sent straight back
//! without copying.
//!
//! Usage:
//!     cargo build --release -p evsock-echo
//!     ./target/release/evsock-echo [port] [workers]
//!
//! Configuration comes from the EVSOCK_* environment variables, e.g.
//!     EVSOCK_INTERFACE=lo EVSOCK_LOG=debug ./target/release/evsock-echo
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     echo "hello" | nc -u -q1 localhost 9999

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use evsock::{
    ActiveSocket, ActiveSocketConfig, ActiveSocketHandlers, InterfaceConfig, ListenerConfig, PassiveSocketHandlers,
    SocketId, Transport, VirtualNetworkInterface,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    packets: AtomicU64,
    bytes: AtomicU64,
    closes: AtomicU64,
    dropped: AtomicU64,
}

impl Stats {
    fn report(&self, sockets: usize, elapsed: Duration) {
        info!(
            elapsed_secs = elapsed.as_secs_f64(),
            sockets,
            accepts = self.accepts.load(Ordering::Relaxed),
            packets = self.packets.load(Ordering::Relaxed),
            bytes = self.bytes.load(Ordering::Relaxed),
            closes = self.closes.load(Ordering::Relaxed),
            dropped = self.dropped.load(Ordering::Relaxed),
            "stats"
        );
    }
}

/// Every socket the server echoes on, by id
type Sockets = Arc<Mutex<HashMap<SocketId, ActiveSocket>>>;

fn echo_handlers(sockets: &Sockets, stats: &Arc<Stats>) -> ActiveSocketHandlers {
    let (on_receive, on_close) = (sockets.clone(), sockets.clone());
    let (rx_stats, close_stats) = (stats.clone(), stats.clone());
    ActiveSocketHandlers::new()
        .on_receive(move |id, packet, from| {
            rx_stats.packets.fetch_add(1, Ordering::Relaxed);
            rx_stats.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
            let sockets = on_receive.lock();
            let Some(socket) = sockets.get(&id) else {
                return;
            };
            let sent = match socket.transport() {
                Transport::Tcp => socket.send(packet),
                Transport::Udp => socket.send_to(from, packet),
            };
            if sent.is_err() {
                rx_stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        })
        .on_close(move |id| {
            close_stats.closes.fetch_add(1, Ordering::Relaxed);
            on_close.lock().remove(&id);
        })
}

fn main() {
    evsock_core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let workers: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(2).max(1);

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
    }

    let vni = match VirtualNetworkInterface::new(InterfaceConfig::from_env()) {
        Ok(vni) => Arc::new(vni),
        Err(e) => {
            error!(error = %e, "failed to create interface");
            std::process::exit(1);
        }
    };
    let socket_config = ActiveSocketConfig::from_env();
    let sockets: Sockets = Arc::default();
    let stats = Arc::new(Stats::default());

    let (accepted_tx, accepted_rx) = mpsc::channel();
    let listener = vni.create_tcp_listener(
        ListenerConfig::new(port),
        PassiveSocketHandlers::new().on_accept(move |_, fd| {
            let _ = accepted_tx.send(fd);
        }),
    );
    let listener = match listener {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "failed to listen");
            std::process::exit(1);
        }
    };
    match vni.create_udp_socket(port, socket_config, echo_handlers(&sockets, &stats)) {
        Ok(udp) => {
            sockets.lock().insert(udp.id(), udp);
        }
        Err(e) => warn!(port, error = %e, "udp echo disabled"),
    }
    info!(ip = %vni.ip_address(), port, workers, "evsock-echo listening");

    // ── Pump threads ──
    let mut threads = Vec::new();
    {
        let vni = vni.clone();
        let spawned = thread::Builder::new().name("evsock-poll".into()).spawn(move || {
            while RUNNING.load(Ordering::Relaxed) {
                if let Err(e) = vni.poll_timeout(Duration::from_millis(10)) {
                    error!(error = %e, "poll failed");
                    break;
                }
            }
        });
        match spawned {
            Ok(t) => threads.push(t),
            Err(e) => {
                error!(error = %e, "failed to spawn poll thread");
                std::process::exit(1);
            }
        }
    }
    for i in 0..workers {
        let vni = vni.clone();
        let spawned = thread::Builder::new().name(format!("evsock-worker-{i}")).spawn(move || {
            while RUNNING.load(Ordering::Relaxed) {
                if vni.service_sockets() == 0 {
                    thread::sleep(Duration::from_micros(50));
                }
            }
        });
        match spawned {
            Ok(t) => threads.push(t),
            Err(e) => warn!(worker = i, error = %e, "failed to spawn worker"),
        }
    }

    // ── Accept loop: wrap descriptors handed over by the listener ──
    let start = Instant::now();
    let mut last_stats = start;
    while RUNNING.load(Ordering::Relaxed) {
        if let Ok(fd) = accepted_rx.recv_timeout(Duration::from_millis(100)) {
            // Hold the map so the first receive finds the socket.
            let mut map = sockets.lock();
            match vni.accept_tcp_socket(fd, socket_config, echo_handlers(&sockets, &stats)) {
                Ok(conn) => {
                    stats.accepts.fetch_add(1, Ordering::Relaxed);
                    map.insert(conn.id(), conn);
                }
                Err(e) => warn!(error = %e, "failed to wrap accepted connection"),
            }
        }
        let now = Instant::now();
        if now.duration_since(last_stats) >= Duration::from_secs(5) {
            stats.report(vni.socket_count(), now.duration_since(start));
            last_stats = now;
        }
    }

    // Shutdown
    info!("shutting down");
    for t in threads {
        let _ = t.join();
    }
    drop(listener);
    sockets.lock().clear();
    vni.stop();
    stats.report(vni.socket_count(), start.elapsed());
}
