//! Exclusive port lock, the final and strongest exclusion layer.
//!
//! A datagram socket bound to a fixed loopback port cannot be shared, so
//! holding it proves sole ownership. The socket is bound with address
//! reuse disabled: for datagram sockets `SO_REUSEADDR`/`SO_REUSEPORT`
//! permit duplicate binds, which would defeat the lock.
//!
//! While the handle is valid a heartbeat task sends an incrementing
//! counter to the bound address and reads it back, so liveness of the
//! socket is observable through [`PortLockHandle::last_beat`]. Missed
//! echoes and stray datagrams from other senders do not stop it; only a
//! released handle or a socket that can no longer send does.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::instance::backoff::Backoff;

/// Errors that can occur while binding the port lock.
#[derive(Debug, thiserror::Error)]
pub enum PortLockError {
    #[error("Port {port} already bound by another process")]
    InUse { port: u16 },

    #[error("Binding port {port} did not complete within {timeout:?}")]
    BindTimeout { port: u16, timeout: Duration },

    #[error("Socket setup for port {port} failed: {reason}")]
    Socket { port: u16, reason: String },

    #[error("Port {port} still unavailable after {attempts} attempts")]
    Exhausted { port: u16, attempts: u32 },
}

/// Parameters for [`acquire_with_retry`].
#[derive(Debug, Clone)]
pub struct PortLockConfig {
    pub port: u16,
    pub attempts: u32,
    /// Pause after each sweep, before creating the socket.
    pub settle: Duration,
    pub bind_timeout: Duration,
    pub backoff: Backoff,
    pub receive_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl PortLockConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Handle on a bound port lock.
///
/// Cloning shares the same socket; [`release`](Self::release) on any clone
/// closes it for all of them and stops the heartbeat.
#[derive(Debug, Clone)]
pub struct PortLockHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    addr: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Held for the whole of a heartbeat round trip, including the wait
    /// for the echo on a cloned descriptor.
    in_flight: Mutex<()>,
    beats: AtomicU64,
}

impl PortLockHandle {
    /// Wrap a freshly bound socket and start its heartbeat.
    ///
    /// Must be called within a Tokio runtime.
    fn start(socket: UdpSocket, addr: SocketAddr, interval: Duration, echo_wait: Duration) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            addr,
            socket: Mutex::new(Some(socket)),
            stop_tx: Mutex::new(Some(stop_tx)),
            in_flight: Mutex::new(()),
            beats: AtomicU64::new(0),
        });
        tokio::spawn(heartbeat(Arc::downgrade(&inner), interval, echo_wait, stop_rx));
        Self { inner }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Whether the socket is still open and bound.
    pub fn is_valid(&self) -> bool {
        lock(&self.inner.socket)
            .as_ref()
            .is_some_and(|s| s.local_addr().is_ok())
    }

    /// Counter value most recently echoed back by the heartbeat, 0 if none.
    pub fn last_beat(&self) -> u64 {
        self.inner.beats.load(Ordering::SeqCst)
    }

    /// Stop the heartbeat and close the socket. Idempotent.
    ///
    /// The port is free again when this returns: a heartbeat waiting for
    /// its echo is woken and its cloned descriptor closed first.
    ///
    /// Returns whether this call closed the socket.
    pub fn release(&self) -> bool {
        if let Some(tx) = lock(&self.inner.stop_tx).take() {
            let _ = tx.send(());
        }
        let socket = lock(&self.inner.socket).take();
        let Some(socket) = socket else {
            return false;
        };
        // An empty datagram to ourselves ends a pending receive.
        let _ = socket.send_to(&[], self.inner.addr);
        drop(socket);
        drop(lock(&self.inner.in_flight));
        tracing::debug!(addr = %self.inner.addr, "Port lock released");
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Beat {
    Echoed,
    Missed,
    /// The handle was released or the socket can no longer send.
    Closed,
}

async fn heartbeat(
    inner: Weak<Inner>,
    interval: Duration,
    echo_wait: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }
        // All handles dropped without an explicit release.
        let Some(beat) = inner.upgrade() else { break };
        seq += 1;
        match tokio::task::spawn_blocking(move || beat_once(&beat, seq, echo_wait)).await {
            Ok(Beat::Echoed) => {}
            Ok(Beat::Missed) => tracing::debug!(seq, "Heartbeat echo missed"),
            Ok(Beat::Closed) | Err(_) => break,
        }
    }
}

/// Send `seq` to the bound address and wait up to `wait` for it to come
/// back. Datagrams from other senders, short datagrams and stale
/// counters are discarded.
fn beat_once(inner: &Inner, seq: u64, wait: Duration) -> Beat {
    let _in_flight = lock(&inner.in_flight);
    let receiver = {
        let guard = lock(&inner.socket);
        let Some(socket) = guard.as_ref() else {
            return Beat::Closed;
        };
        if let Err(e) = socket.send_to(&seq.to_be_bytes(), inner.addr) {
            tracing::debug!(addr = %inner.addr, error = %e, "Heartbeat send failed");
            return Beat::Closed;
        }
        match socket.try_clone() {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::debug!(addr = %inner.addr, error = %e, "Heartbeat socket clone failed");
                return Beat::Closed;
            }
        }
    };

    let deadline = Instant::now() + wait;
    let mut buf = [0u8; 8];
    while Instant::now() < deadline {
        match receiver.recv_from(&mut buf) {
            Ok((n, from)) if n == buf.len() && from == inner.addr => {
                if u64::from_be_bytes(buf) == seq {
                    let guard = lock(&inner.socket);
                    // Nothing lands after a release.
                    if guard.is_none() {
                        return Beat::Closed;
                    }
                    inner.beats.store(seq, Ordering::SeqCst);
                    return Beat::Echoed;
                }
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => tracing::trace!(error = %e, "Heartbeat receive error"),
        }
        if lock(&inner.socket).is_none() {
            return Beat::Closed;
        }
    }
    Beat::Missed
}

/// Create the datagram socket and bind it once, without retries.
fn bind_socket(addr: SocketAddr, receive_timeout: Duration) -> Result<UdpSocket, PortLockError> {
    let port = addr.port();
    let setup = |e: io::Error| PortLockError::Socket {
        port,
        reason: e.to_string(),
    };

    // std never sets SO_REUSEADDR, so a second bind fails with AddrInUse.
    let socket = UdpSocket::bind(addr).map_err(|e| {
        if e.kind() == io::ErrorKind::AddrInUse {
            PortLockError::InUse { port }
        } else {
            setup(e)
        }
    })?;
    socket.set_read_timeout(Some(receive_timeout)).map_err(setup)?;
    Ok(socket)
}

/// One bind attempt on a helper task, abandoned after `timeout`.
pub async fn bind_with_deadline(
    addr: SocketAddr,
    timeout: Duration,
    receive_timeout: Duration,
) -> Result<UdpSocket, PortLockError> {
    let port = addr.port();
    let task = tokio::task::spawn_blocking(move || bind_socket(addr, receive_timeout));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(PortLockError::Socket {
            port,
            reason: join.to_string(),
        }),
        Err(_) => Err(PortLockError::BindTimeout { port, timeout }),
    }
}

/// Bind the port lock with no per-attempt hooks.
pub async fn acquire(config: &PortLockConfig) -> Result<PortLockHandle, PortLockError> {
    acquire_with_retry(config, |_| {}, |_| Ok::<(), PortLockError>(())).await
}

/// Bind the port lock, retrying up to `config.attempts` times.
///
/// `before_attempt` runs at the start of every attempt (the caller sweeps
/// competing processes there). `on_bound` runs once the socket is bound
/// and before the handle is returned; an error from it closes the socket
/// and fails the acquisition.
pub async fn acquire_with_retry<B, A, E>(
    config: &PortLockConfig,
    mut before_attempt: B,
    on_bound: A,
) -> Result<PortLockHandle, E>
where
    B: FnMut(u32),
    A: FnOnce(&SocketAddr) -> Result<(), E>,
    E: From<PortLockError>,
{
    let addr = config.addr();
    let attempts = config.attempts.max(1);

    for attempt in 0..attempts {
        before_attempt(attempt);
        if !config.settle.is_zero() {
            tokio::time::sleep(config.settle).await;
        }

        match bind_with_deadline(addr, config.bind_timeout, config.receive_timeout).await {
            Ok(socket) => {
                on_bound(&addr)?;
                tracing::info!(port = config.port, attempt = attempt + 1, "Port lock acquired");
                return Ok(PortLockHandle::start(
                    socket,
                    addr,
                    config.heartbeat_interval,
                    config.receive_timeout,
                ));
            }
            Err(e) => {
                tracing::warn!(
                    port = config.port,
                    attempt = attempt + 1,
                    error = %e,
                    "Port lock attempt failed"
                );
                if matches!(e, PortLockError::Socket { .. }) {
                    return Err(e.into());
                }
                if attempt + 1 < attempts {
                    tokio::time::sleep(config.backoff.delay(attempt)).await;
                }
            }
        }
    }

    Err(PortLockError::Exhausted {
        port: config.port,
        attempts,
    }
    .into())
}

/// Whether something on this host currently holds `port`.
///
/// Probes by attempting a bind and immediately dropping the socket, so it
/// says nothing about *who* holds the port.
pub fn is_port_bound(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    matches!(
        bind_socket(addr, Duration::from_millis(100)),
        Err(PortLockError::InUse { .. })
    )
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(port: u16) -> PortLockConfig {
        PortLockConfig {
            port,
            attempts: 3,
            settle: Duration::ZERO,
            bind_timeout: Duration::from_secs(2),
            backoff: Backoff::NONE,
            receive_timeout: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn acquire_binds_and_release_frees() {
        let port = free_port();
        let handle = acquire(&config(port)).await.unwrap();
        assert!(handle.is_valid());
        assert!(is_port_bound(port));

        assert!(handle.release());
        assert!(!handle.release(), "second release is a no-op");
        assert!(!handle.is_valid());
        assert!(!is_port_bound(port));
    }

    #[tokio::test]
    async fn second_acquisition_exhausts_budget() {
        let port = free_port();
        let first = acquire(&config(port)).await.unwrap();

        let mut seen = Vec::new();
        let err = acquire_with_retry(&config(port), |a| seen.push(a), |_| Ok::<(), PortLockError>(()))
            .await
            .unwrap_err();
        assert!(matches!(err, PortLockError::Exhausted { attempts: 3, .. }));
        assert_eq!(seen, vec![0, 1, 2], "before_attempt runs every attempt");
        first.release();
    }

    #[tokio::test]
    async fn succeeds_once_holder_goes_away() {
        let port = free_port();
        let squatter = UdpSocket::bind(("127.0.0.1", port)).unwrap();
        let mut cfg = config(port);
        cfg.backoff = Backoff {
            base: Duration::from_millis(50),
            multiplier: 1.0,
            max: Duration::from_millis(50),
            jitter_factor: 0.0,
        };

        let mut squatter = Some(squatter);
        let handle = acquire_with_retry(
            &cfg,
            |attempt| {
                if attempt == 1 {
                    squatter.take();
                }
            },
            |_| Ok::<(), PortLockError>(()),
        )
        .await
        .unwrap();
        assert!(handle.is_valid());
        handle.release();
    }

    #[tokio::test]
    async fn heartbeat_echoes_counter() {
        let port = free_port();
        let handle = acquire(&config(port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.last_beat() >= 1);

        handle.release();
        let after = handle.last_beat();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.last_beat(), after, "heartbeat stops with the handle");
    }

    #[tokio::test]
    async fn stray_datagrams_do_not_stop_the_heartbeat() {
        let port = free_port();
        let handle = acquire(&config(port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        for payload in [&b"hi"[..], &[0u8; 8][..], &[7u8; 32][..]] {
            stranger.send_to(payload, handle.addr()).unwrap();
        }
        let before = handle.last_beat();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(handle.is_valid());
        assert!(
            handle.last_beat() > before,
            "heartbeat kept running: {} -> {}",
            before,
            handle.last_beat()
        );
        handle.release();
    }

    fn inner_for(socket: UdpSocket, addr: SocketAddr) -> Inner {
        Inner {
            addr,
            socket: Mutex::new(Some(socket)),
            stop_tx: Mutex::new(None),
            in_flight: Mutex::new(()),
            beats: AtomicU64::new(0),
        }
    }

    #[test]
    fn stale_echo_is_skipped() {
        let addr = config(free_port()).addr();
        let inner = inner_for(bind_socket(addr, Duration::from_millis(50)).unwrap(), addr);
        lock(&inner.socket)
            .as_ref()
            .unwrap()
            .send_to(&1u64.to_be_bytes(), addr)
            .unwrap();

        assert_eq!(beat_once(&inner, 2, Duration::from_millis(200)), Beat::Echoed);
        assert_eq!(inner.beats.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missed_echo_keeps_the_socket() {
        // Beats go to a sink that never answers.
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let own = config(free_port()).addr();
        let inner = inner_for(
            bind_socket(own, Duration::from_millis(20)).unwrap(),
            sink.local_addr().unwrap(),
        );

        assert_eq!(beat_once(&inner, 1, Duration::from_millis(60)), Beat::Missed);
        assert_eq!(inner.beats.load(Ordering::SeqCst), 0);
        assert!(lock(&inner.socket).is_some());
    }

    #[test]
    fn released_socket_ends_the_beat() {
        let addr = config(free_port()).addr();
        let inner = inner_for(bind_socket(addr, Duration::from_millis(20)).unwrap(), addr);
        lock(&inner.socket).take();
        assert_eq!(beat_once(&inner, 1, Duration::from_millis(60)), Beat::Closed);
    }

    #[tokio::test]
    async fn release_frees_port_even_with_long_echo_wait() {
        let port = free_port();
        let mut cfg = config(port);
        cfg.receive_timeout = Duration::from_secs(5);
        cfg.heartbeat_interval = Duration::from_millis(5);
        let handle = acquire(&cfg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert!(handle.release());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!is_port_bound(port));
    }

    #[tokio::test]
    async fn validity_checks_do_not_wait_on_the_heartbeat() {
        let port = free_port();
        let mut cfg = config(port);
        cfg.receive_timeout = Duration::from_secs(5);
        cfg.heartbeat_interval = Duration::from_millis(5);
        let handle = acquire(&cfg).await.unwrap();

        let started = std::time::Instant::now();
        for _ in 0..50 {
            assert!(handle.is_valid());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.release();
    }

    #[tokio::test]
    async fn on_bound_failure_closes_socket() {
        let port = free_port();
        let err = acquire_with_retry(
            &config(port),
            |_| {},
            |_| {
                Err(PortLockError::Socket {
                    port,
                    reason: "marker".into(),
                })
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PortLockError::Socket { .. }));
        assert!(!is_port_bound(port));
    }
}
