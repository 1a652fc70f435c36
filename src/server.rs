//! TCP server: accepts connections and drains them through a session pool.
//!
//! Lifecycle:
//!
//! ```text
//! Stopped --start()--> Running --stop()--> Stopping --drained--> Stopped
//! ```
//!
//! `start` runs the accept loop on the caller's task and returns once
//! `stop` has been called (or accepting fails). `stop` may be called from
//! any task, any number of times.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ServerSettings;
use crate::error::AcceptorError;
use crate::pool::{DrainOutcome, SessionPool};
use crate::stats::Reporter;

/// Listen backlog for the server socket
const LISTEN_BACKLOG: i32 = 1024;

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
    Stopping,
}

/// What the most recent `start` did with its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listening {
    /// Not bound yet, or closed again.
    Idle,
    Bound(SocketAddr),
    /// Binding failed.
    Failed,
}

/// Server instance
pub struct Server {
    settings: ServerSettings,
    reporter: Arc<dyn Reporter>,
    state: watch::Sender<ServerState>,
    listening: watch::Sender<Listening>,
    pool: Mutex<Option<Arc<SessionPool>>>,
}

impl Server {
    /// Create a new server instance. Nothing is bound until `start`.
    pub fn new(settings: ServerSettings, reporter: Arc<dyn Reporter>) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        let (listening, _) = watch::channel(Listening::Idle);

        Server {
            settings,
            reporter,
            state,
            listening,
            pool: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Address of the bound listener while accepting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.listening.borrow() {
            Listening::Bound(addr) => Some(addr),
            _ => None,
        }
    }

    /// Wait until `start` has bound its listener and return the address.
    ///
    /// Returns `None` if binding failed.
    pub async fn ready(&self) -> Option<SocketAddr> {
        let mut listening = self.listening.subscribe();
        let outcome = listening
            .wait_for(|l| *l != Listening::Idle)
            .await
            .ok()
            .map(|l| *l)?;
        match outcome {
            Listening::Bound(addr) => Some(addr),
            _ => None,
        }
    }

    /// Sessions currently running in the pool.
    pub fn active_sessions(&self) -> usize {
        self.lock_pool().as_ref().map_or(0, |pool| pool.active())
    }

    /// Bind and accept connections until stopped.
    ///
    /// Returns immediately if the server is already running. Errors are
    /// returned for a failed bind or a failed `accept` while running; an
    /// accept failure caused by `stop` is logged and swallowed. After an
    /// accept error the server stays `Running` so that `stop` can still
    /// drain its sessions.
    pub async fn start(&self) -> Result<(), AcceptorError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ServerState::Stopped {
                *state = ServerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = ?self.state(), "Server already started");
            return Ok(());
        }
        self.listening.send_replace(Listening::Idle);

        let pool = Arc::new(SessionPool::new(
            self.settings.pool_size,
            self.settings.buffer_size,
            Arc::clone(&self.reporter),
        ));
        *self.lock_pool() = Some(Arc::clone(&pool));

        let (listener, local_addr) = match bind_listener(&self.settings.listen).await {
            Ok(bound) => bound,
            Err(source) => {
                self.lock_pool().take();
                self.listening.send_replace(Listening::Failed);
                self.state.send_if_modified(|state| {
                    let running = *state == ServerState::Running;
                    if running {
                        *state = ServerState::Stopped;
                    }
                    running
                });
                return Err(AcceptorError::Bind {
                    address: self.settings.listen.clone(),
                    source,
                });
            }
        };

        if self.state() == ServerState::Running {
            self.listening.send_replace(Listening::Bound(local_addr));
        }
        info!(
            address = %local_addr,
            pool_size = pool.capacity(),
            "Server listening"
        );

        let result = self.accept_loop(&listener, &pool).await;
        drop(listener);
        self.release_listener(local_addr);
        result
    }

    /// Mark the listener at `addr` closed, unless a later `start` has
    /// already published its own.
    fn release_listener(&self, addr: SocketAddr) {
        self.listening.send_if_modified(|l| {
            let ours = *l == Listening::Bound(addr);
            if ours {
                *l = Listening::Idle;
            }
            ours
        });
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        pool: &SessionPool,
    ) -> Result<(), AcceptorError> {
        let mut state = self.state.subscribe();

        loop {
            // Wait for a session slot before accepting
            let slot = tokio::select! {
                biased;
                _ = stopping(&mut state) => break,
                slot = pool.acquire() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = stopping(&mut state) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Client connected");
                    if let Err(e) = pool.submit(slot, stream, peer) {
                        debug!(peer = %peer, error = %e, "Session rejected");
                    }
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection failed during accept");
                }
                Err(e) if self.state() == ServerState::Running => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(AcceptorError::Accept(e));
                }
                Err(e) => {
                    debug!(error = %e, "Accept interrupted by shutdown");
                    break;
                }
            }
        }

        info!("Server has stopped accepting new connections");
        Ok(())
    }

    /// Stop accepting, then drain the session pool.
    ///
    /// Returns `None` if the server was not running. Never fails: sessions
    /// that outlast both grace periods are aborted and logged.
    pub async fn stop(&self) -> Option<DrainOutcome> {
        let stopping = self.state.send_if_modified(|state| {
            if *state == ServerState::Running {
                *state = ServerState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            debug!(state = ?self.state(), "Server not running");
            return None;
        }

        info!("Shutting down the server");
        let grace = self.settings.drain_grace;
        let started = Instant::now();

        // The accept loop drops the listener as soon as it sees the new state.
        // Time spent here counts against the first drain phase.
        let mut listening = self.listening.subscribe();
        let closed = tokio::time::timeout(
            grace,
            listening.wait_for(|l| !matches!(l, Listening::Bound(_))),
        )
        .await
        .is_ok();
        if !closed {
            warn!("Listener still open after grace period");
        }

        let drain = grace.saturating_sub(started.elapsed());
        let pool = self.lock_pool().take();
        let outcome = match pool {
            Some(pool) => pool.shutdown_phased(drain, grace).await,
            None => DrainOutcome::Drained,
        };

        match outcome {
            DrainOutcome::Drained => info!("All sessions finished"),
            DrainOutcome::Cancelled { sessions } => info!(sessions, "Cancelled sessions finished"),
            DrainOutcome::Abandoned { sessions } => {
                warn!(sessions, "Pool did not terminate")
            }
        }

        self.state.send_replace(ServerState::Stopped);
        Some(outcome)
    }

    fn lock_pool(&self) -> MutexGuard<'_, Option<Arc<SessionPool>>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once the server leaves `Running`.
async fn stopping(state: &mut watch::Receiver<ServerState>) {
    let _ = state.wait_for(|s| *s != ServerState::Running).await;
}

/// Errors that concern only the connection being accepted.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

async fn bind_listener(listen: &str) -> io::Result<(TcpListener, SocketAddr)> {
    let addr = tokio::net::lookup_host(listen).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {listen}"),
        )
    })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::LogReporter;
    use std::time::Duration;

    fn settings() -> ServerSettings {
        ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            pool_size: 2,
            drain_grace: Duration::from_millis(200),
            buffer_size: 1024,
        }
    }

    fn server() -> Arc<Server> {
        Arc::new(Server::new(settings(), Arc::new(LogReporter)))
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let server = server();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.stop().await, None);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let server = server();
        let run = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start().await }
        });

        let addr = tokio::time::timeout(Duration::from_secs(5), server.ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert_eq!(server.local_addr(), Some(addr));

        // Second start is a no-op
        server.start().await.unwrap();

        assert_eq!(server.stop().await, Some(DrainOutcome::Drained));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);
        run.await.unwrap().unwrap();

        // Second stop is a no-op
        assert_eq!(server.stop().await, None);

        // Listener is gone
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = server();
        for _ in 0..2 {
            let run = tokio::spawn({
                let server = Arc::clone(&server);
                async move { server.start().await }
            });
            tokio::time::timeout(Duration::from_secs(5), server.ready())
                .await
                .unwrap();
            assert!(server.stop().await.is_some());
            run.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = settings();
        settings.listen = taken.local_addr().unwrap().to_string();

        let server = Arc::new(Server::new(settings, Arc::new(LogReporter)));
        let run = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start().await }
        });

        // Waiters learn that no address is coming
        let ready = tokio::time::timeout(Duration::from_secs(5), server.ready())
            .await
            .expect("ready() hung after bind failure");
        assert_eq!(ready, None);

        // A listening socket without SO_REUSEPORT cannot be bound twice
        assert!(matches!(
            run.await.unwrap(),
            Err(AcceptorError::Bind { .. })
        ));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.stop().await, None);
    }

    #[tokio::test]
    async fn test_release_keeps_newer_listener() {
        let server = server();
        let old: SocketAddr = "127.0.0.1:1001".parse().unwrap();
        let new: SocketAddr = "127.0.0.1:1002".parse().unwrap();

        // A restarted server has already published its address
        server.listening.send_replace(Listening::Bound(new));
        server.release_listener(old);
        assert_eq!(server.local_addr(), Some(new));

        server.release_listener(new);
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        let mut settings = settings();
        settings.listen = "not an address".to_string();

        let server = Server::new(settings, Arc::new(LogReporter));
        assert!(matches!(
            server.start().await,
            Err(AcceptorError::Bind { .. })
        ));
    }
}
