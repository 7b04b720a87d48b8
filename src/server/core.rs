// src/server/core.rs
//! Core server implementation.
//!
//! [`VpnServer`] owns the listener lifecycle: it switches on forwarding and
//! masquerading once when serving starts, spawns one pipeline per accepted
//! connection, and puts the host back the way it found it when the accept
//! loop ends.

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::settings::ServerConfig;
use crate::network::configurator::{NetworkConfigurator, NetworkError, OriginalNetworkState};
use crate::network::ip_pool::{AddressPool, PoolError};
use crate::server::session::{serve_connection, SessionContext, SessionError};
use crate::utils::system::{ElevatedScope, PrivilegeError, PrivilegeManager};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server has already been started")]
    AlreadyServing,

    #[error("Failed to {step}: {source}")]
    Setup {
        step: SetupStep,
        #[source]
        source: NetworkError,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("Address pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Privilege error: {0}")]
    Privileges(#[from] PrivilegeError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Host network task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Lifecycle of a server; each server serves at most once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, `serve` not called yet
    Idle,
    /// Global setup applied, accepting connections
    Serving,
    /// Accept loop ended and host settings restored
    Stopped,
}

/// Host-wide changes applied while serving, in application order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Ipv4Forwarding,
    Ipv6Forwarding,
    Masquerading,
}

impl SetupStep {
    const ALL: [SetupStep; 3] = [
        SetupStep::Ipv4Forwarding,
        SetupStep::Ipv6Forwarding,
        SetupStep::Masquerading,
    ];
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4Forwarding => f.write_str("enable IPv4 forwarding"),
            Self::Ipv6Forwarding => f.write_str("enable IPv6 forwarding"),
            Self::Masquerading => f.write_str("enable masquerading"),
        }
    }
}

/// Tunnel server over a host network configurator and privilege bracket
pub struct VpnServer<N, P> {
    ctx: Arc<SessionContext<N, P>>,
    original: OriginalNetworkState,
    keepalive: Option<Duration>,
    state: Mutex<ServerState>,
    shutdown: CancellationToken,
}

impl<N: NetworkConfigurator, P: PrivilegeManager> VpnServer<N, P> {
    /// Build the address pool and snapshot the host forwarding state
    pub fn new(config: &ServerConfig, network: N, privileges: P) -> Result<Self, ServerError> {
        let pool = AddressPool::new(&config.address_ranges)?;

        let original = {
            let _scope = ElevatedScope::enter(&privileges)?;
            network.capture_original_state()?
        };
        info!(
            "Default interface {}, forwarding ipv4={} ipv6={}",
            original.default_interface, original.ipv4_forwarding, original.ipv6_forwarding
        );

        Ok(Self {
            ctx: Arc::new(SessionContext::new(
                network,
                privileges,
                pool,
                config.passcode.clone(),
                config.tun_mtu,
            )),
            original,
            keepalive: config.keepalive(),
            state: Mutex::new(ServerState::Idle),
            shutdown: CancellationToken::new(),
        })
    }

    /// Apply global setup, accept connections until closed or accept fails,
    /// then restore the host.
    ///
    /// Returns `Ok(())` after [`close`](Self::close) and the accept error
    /// otherwise. Only the first call does anything.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Idle {
                return Err(ServerError::AlreadyServing);
            }
            *state = ServerState::Serving;
        }

        let host = self.host_setup();
        let applied = match tokio::task::spawn_blocking(move || host.setup()).await {
            Ok(result) => result,
            Err(e) => Err(ServerError::Task(e)),
        };
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                *self.state.lock() = ServerState::Stopped;
                return Err(e);
            }
        };

        match listener.local_addr() {
            Ok(addr) => info!("Server listening on {}", addr),
            Err(e) => warn!("Server listening on unknown address: {}", e),
        }

        let result = self.accept_loop(&listener).await;

        let host = self.host_setup();
        if let Err(e) = tokio::task::spawn_blocking(move || host.teardown(applied)).await {
            error!("Restoring host network did not complete: {}", e);
        }
        *self.state.lock() = ServerState::Stopped;
        info!("Server stopped");
        result
    }

    /// Stop accepting connections; running sessions are not interrupted
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Closing server");
        }
        self.shutdown.cancel();
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn pool(&self) -> &AddressPool {
        self.ctx.pool()
    }

    pub fn network(&self) -> &N {
        self.ctx.network()
    }

    pub fn original_network_state(&self) -> &OriginalNetworkState {
        &self.original
    }

    fn host_setup(&self) -> HostSetup<N, P> {
        HostSetup {
            ctx: self.ctx.clone(),
            original: self.original.clone(),
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Accept loop cancelled");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        return Err(ServerError::Accept(e));
                    }
                },
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        debug!("Accepted connection from {}", peer);
        if let Some(idle) = self.keepalive {
            if let Err(e) = configure_keepalive(&stream, idle) {
                warn!("Failed to enable keepalive for {}: {}", peer, e);
            }
        }

        let ctx = self.ctx.clone();
        tokio::spawn(
            async move {
                match serve_connection(stream, ctx).await {
                    Ok(_) => {}
                    Err(SessionError::Handshake(e)) => match e.status() {
                        Some(status) => info!("Handshake rejected ({}): {}", status, e),
                        None => debug!("Handshake aborted: {}", e),
                    },
                    Err(e) => warn!("Session failed: {}", e),
                }
            }
            .instrument(info_span!("session", %peer)),
        );
    }
}

/// Host-wide setup and its undo, run on the blocking pool since every step
/// may shell out to `sysctl` or `iptables`
struct HostSetup<N, P> {
    ctx: Arc<SessionContext<N, P>>,
    original: OriginalNetworkState,
}

impl<N: NetworkConfigurator, P: PrivilegeManager> HostSetup<N, P> {
    fn setup(&self) -> Result<Vec<SetupStep>, ServerError> {
        let _scope = ElevatedScope::enter(self.ctx.privileges())?;

        let mut applied = Vec::with_capacity(SetupStep::ALL.len());
        for step in SetupStep::ALL {
            if let Err(source) = self.apply(step) {
                error!("Failed to {}: {}", step, source);
                self.rollback(applied);
                return Err(ServerError::Setup { step, source });
            }
            info!("Setup: {}", step);
            applied.push(step);
        }
        Ok(applied)
    }

    fn teardown(&self, applied: Vec<SetupStep>) {
        let _scope = match ElevatedScope::enter(self.ctx.privileges()) {
            Ok(scope) => Some(scope),
            Err(e) => {
                error!("Restoring host network without privileges: {}", e);
                None
            }
        };
        self.rollback(applied);
    }

    /// Undo `applied` in reverse; a failing step does not stop the rest
    fn rollback(&self, applied: Vec<SetupStep>) {
        for step in applied.into_iter().rev() {
            match self.undo(step) {
                Ok(()) => debug!("Undid: {}", step),
                Err(e) => error!("Failed to undo '{}': {}", step, e),
            }
        }
    }

    fn apply(&self, step: SetupStep) -> Result<(), NetworkError> {
        let network = self.ctx.network();
        match step {
            SetupStep::Ipv4Forwarding => network.enable_ipv4_forwarding(),
            SetupStep::Ipv6Forwarding => network.enable_ipv6_forwarding(),
            SetupStep::Masquerading => {
                network.enable_masquerading(&self.original.default_interface)
            }
        }
    }

    fn undo(&self, step: SetupStep) -> Result<(), NetworkError> {
        let network = self.ctx.network();
        match step {
            SetupStep::Ipv4Forwarding => {
                network.set_ipv4_forwarding(&self.original.ipv4_forwarding)
            }
            SetupStep::Ipv6Forwarding => {
                network.set_ipv6_forwarding(&self.original.ipv6_forwarding)
            }
            SetupStep::Masquerading => {
                network.disable_masquerading(&self.original.default_interface)
            }
        }
    }
}

/// Let the kernel detect dead peers on an otherwise idle connection
fn configure_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle).with_interval(idle);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
