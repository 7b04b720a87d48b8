// src/server/session.rs
//! Per-connection pipeline.
//!
//! Every accepted connection goes through handshake, interface
//! provisioning and relay. Failures end that one session and are logged
//! by the caller; they never reach the accept loop.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, warn};

use crate::config::constants::BLOCK_PREFIX;
use crate::network::configurator::{
    InterfaceSettings, NetworkConfigurator, NetworkError, VirtualInterface,
};
use crate::network::ip_pool::{AddressBlock, AddressPool};
use crate::protocol::codec::ServerCodec;
use crate::server::handshake::{HandshakeCoordinator, HandshakeError};
use crate::server::relay::{relay, RelayOutcome};
use crate::utils::system::{ElevatedScope, PrivilegeError, PrivilegeManager};

/// Error type for a single client session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Privilege error: {0}")]
    Privileges(#[from] PrivilegeError),

    #[error("Interface provisioning failed: {0}")]
    Provisioning(#[from] NetworkError),
}

/// State shared by every session of one server
pub struct SessionContext<N, P> {
    network: N,
    privileges: P,
    pool: AddressPool,
    passcode: Option<String>,
    tun_mtu: u16,
}

impl<N: NetworkConfigurator, P: PrivilegeManager> SessionContext<N, P> {
    pub fn new(
        network: N,
        privileges: P,
        pool: AddressPool,
        passcode: Option<String>,
        tun_mtu: u16,
    ) -> Self {
        Self {
            network,
            privileges,
            pool,
            passcode: passcode.filter(|p| !p.is_empty()),
            tun_mtu,
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn privileges(&self) -> &P {
        &self.privileges
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn passcode(&self) -> Option<&str> {
        self.passcode.as_deref()
    }

    pub fn tun_mtu(&self) -> u16 {
        self.tun_mtu
    }
}

/// A negotiated, provisioned session ready to relay
pub struct TunnelSession<C, I> {
    pub conn: C,
    pub interface: I,
    /// Bytes the client sent after its hello
    pub pending: Bytes,
    pub block: AddressBlock,
}

impl<C, I> fmt::Debug for TunnelSession<C, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("block", &self.block)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<C, I> TunnelSession<C, I>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    I: VirtualInterface,
{
    /// Relay until either side ends
    pub async fn run(self) -> RelayOutcome {
        relay(self.conn, self.interface, self.pending).await
    }
}

/// Create the server-side interface for `block` and bring it up.
///
/// Privileges are held only while the interface is created and configured
/// and are released on every exit path.
pub fn provision<N, P>(
    network: &N,
    privileges: &P,
    block: &AddressBlock,
    mtu: u16,
) -> Result<N::Interface, SessionError>
where
    N: NetworkConfigurator,
    P: PrivilegeManager + ?Sized,
{
    let _scope = ElevatedScope::enter(privileges)?;

    let mut interface = network.create_virtual_interface()?;
    let settings = InterfaceSettings {
        ip: block.server_ip(),
        gateway: block.server_gateway(),
        prefix: BLOCK_PREFIX,
        mtu,
    };
    network.configure_virtual_interface(&mut interface, &settings)?;

    debug!("Provisioned {} for block {}", interface.name(), block);
    Ok(interface)
}

/// Handshake and provision a session on a freshly accepted stream
pub async fn establish<S, N, P>(
    stream: S,
    ctx: &SessionContext<N, P>,
) -> Result<TunnelSession<S, N::Interface>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    N: NetworkConfigurator,
    P: PrivilegeManager,
{
    let mut framed = Framed::new(stream, ServerCodec::new());
    let block = HandshakeCoordinator::new(ctx.passcode(), ctx.pool())
        .run(&mut framed)
        .await?;

    let interface = provision(ctx.network(), ctx.privileges(), &block, ctx.tun_mtu())?;

    let FramedParts { io, read_buf, .. } = framed.into_parts();
    Ok(TunnelSession {
        conn: io,
        interface,
        pending: read_buf.freeze(),
        block,
    })
}

/// Run the whole pipeline for one connection
pub async fn serve_connection<S, N, P>(
    stream: S,
    ctx: Arc<SessionContext<N, P>>,
) -> Result<RelayOutcome, SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    N: NetworkConfigurator,
    P: PrivilegeManager,
{
    let session = establish(stream, &*ctx).await?;
    let block = session.block;
    let interface = session.interface.name();
    info!(
        "Relaying {} through {} ({} bytes pending)",
        block,
        interface,
        session.pending.len()
    );

    let outcome = session.run().await;
    match &outcome.result {
        Ok(bytes) => info!(
            "Session on {} ended: {} closed after {} bytes",
            interface, outcome.direction, bytes
        ),
        Err(e) => warn!(
            "Session on {} ended: {} failed: {}",
            interface, outcome.direction, e
        ),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{CountingPrivileges, FakeNetwork};
    use crate::protocol::codec::ClientCodec;
    use crate::protocol::types::{ClientHello, HandshakeStatus};
    use crate::server::relay::Direction;
    use crate::utils::system::{MockPrivilegeManager, PrivilegeToken};
    use futures::{SinkExt, StreamExt};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use test_case::test_case;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn balanced_privileges() -> MockPrivilegeManager {
        let mut privileges = MockPrivilegeManager::new();
        privileges
            .expect_acquire()
            .times(1)
            .returning(|| Ok(PrivilegeToken::new()));
        privileges.expect_release().times(1).returning(|_| Ok(()));
        privileges
    }

    fn block() -> AddressBlock {
        AddressBlock::containing(Ipv4Addr::new(10, 0, 0, 8))
    }

    #[test]
    fn test_provision_uses_server_addresses() {
        let network = FakeNetwork::new();
        let privileges = balanced_privileges();

        let interface = provision(&network, &privileges, &block(), 1400).unwrap();
        assert_eq!(interface.name(), "tun0");
        assert_eq!(
            network.calls(),
            vec!["create_interface", "configure_interface:10.0.0.10"]
        );
    }

    #[test]
    fn test_provision_releases_privileges_when_configuration_fails() {
        let network = FakeNetwork::new();
        network.fail_on("configure_interface:10.0.0.10");
        let privileges = balanced_privileges();

        let result = provision(&network, &privileges, &block(), 1500);
        assert!(matches!(result, Err(SessionError::Provisioning(_))));
    }

    #[test]
    fn test_provision_without_privileges_touches_nothing() {
        let network = FakeNetwork::new();
        let mut privileges = MockPrivilegeManager::new();
        privileges
            .expect_acquire()
            .times(1)
            .returning(|| Err(PrivilegeError::Acquire("not root".into())));
        privileges.expect_release().never();

        let result = provision(&network, &privileges, &block(), 1500);
        assert!(matches!(result, Err(SessionError::Privileges(_))));
        assert!(network.calls().is_empty());
    }

    fn context(passcode: Option<&str>) -> Arc<SessionContext<FakeNetwork, CountingPrivileges>> {
        Arc::new(SessionContext::new(
            FakeNetwork::new(),
            CountingPrivileges::default(),
            AddressPool::new(&["10.0.0.0/24"]).unwrap(),
            passcode.map(String::from),
            1500,
        ))
    }

    async fn wait_for_host_end(network: &FakeNetwork) -> DuplexStream {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(host) = network.take_host_end() {
                    return host;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_session_relays_both_directions() {
        let ctx = context(Some("pw"));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let pipeline = tokio::spawn(serve_connection(server, ctx.clone()));

        let mut client = Framed::new(client, ClientCodec::new());
        let mut hello = serde_json::to_vec(&ClientHello::new("pw")).unwrap();
        hello.extend_from_slice(b"\x45\x00");
        client.get_mut().write_all(&hello).await.unwrap();

        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.status, HandshakeStatus::Ok);
        assert_eq!(reply.tun_ip, Some(Ipv4Addr::new(10, 0, 0, 4)));
        assert_eq!(reply.tun_gateway, Some(Ipv4Addr::new(10, 0, 0, 3)));
        let mut client = client.into_inner();

        let mut host = wait_for_host_end(ctx.network()).await;
        client.write_all(b"\x00\x14").await.unwrap();
        let mut upstream = [0u8; 4];
        host.read_exact(&mut upstream).await.unwrap();
        assert_eq!(&upstream, b"\x45\x00\x00\x14");

        host.write_all(b"reply").await.unwrap();
        let mut downstream = [0u8; 5];
        client.read_exact(&mut downstream).await.unwrap();
        assert_eq!(&downstream, b"reply");

        drop(client);
        let outcome = pipeline.await.unwrap().unwrap();
        assert_eq!(outcome.direction, Direction::ClientToInterface);
        assert_eq!(outcome.result.unwrap(), 4);

        assert_eq!(ctx.privileges().acquired(), 1);
        assert_eq!(ctx.privileges().released(), 1);
        assert_eq!(
            ctx.network().calls(),
            vec!["create_interface", "configure_interface:10.0.0.2"]
        );
    }

    #[tokio::test]
    async fn test_rejected_handshake_provisions_nothing() {
        let ctx = context(Some("pw"));
        let (client, server) = tokio::io::duplex(4096);
        let pipeline = tokio::spawn(serve_connection(server, ctx.clone()));

        let mut client = Framed::new(client, ClientCodec::new());
        client.send(ClientHello::new("nope")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.status, HandshakeStatus::Forbidden);

        let result = pipeline.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::Forbidden))
        ));
        assert_eq!(ctx.privileges().acquired(), 0);
        assert!(ctx.network().calls().is_empty());
    }

    #[test_case("create_interface" ; "interface creation fails")]
    #[test_case("configure_interface:10.0.0.2" ; "interface configuration fails")]
    #[tokio::test]
    async fn test_provisioning_failure_closes_client_after_ok(failing: &str) {
        let ctx = context(None);
        ctx.network().fail_on(failing);
        let (client, server) = tokio::io::duplex(4096);
        let pipeline = tokio::spawn(serve_connection(server, ctx.clone()));

        let mut client = Framed::new(client, ClientCodec::new());
        client.send(ClientHello::default()).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.status, HandshakeStatus::Ok);

        let result = pipeline.await.unwrap();
        assert!(matches!(result, Err(SessionError::Provisioning(_))));

        // Nothing is relayed; the connection just ends
        let closed = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap();
        assert!(closed.is_none());

        assert_eq!(ctx.privileges().acquired(), 1);
        assert_eq!(ctx.privileges().released(), 1);
        assert_eq!(ctx.network().calls().last().map(String::as_str), Some(failing));
    }
}
