//! SSH local port forwarding
//!
//! A tunnel binds an ephemeral port on `127.0.0.1` and relays every
//! connection accepted there through a `direct-tcpip` channel of one SSH
//! session to a fixed remote endpoint.
//!
//! Opening is behind [`TunnelConnector`] so gateways can be given a
//! different implementation (tests count opens through it).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use russh_keys::key;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SshConfig;
use crate::storage::error::{GatewayError, GatewayResult};

/// Endpoint on the far side of the tunnel, as seen from the SSH server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

/// A live tunnel
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Local address that forwards to the remote endpoint
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting connections and close the SSH session
    async fn stop(self: Box<Self>) -> GatewayResult<()>;
}

/// Something that can open tunnels
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn open(
        &self,
        ssh: &SshConfig,
        remote: &RemoteEndpoint,
        timeout: Duration,
    ) -> GatewayResult<Box<dyn Tunnel>>;
}

/// [`TunnelConnector`] backed by an SSH client with public-key authentication
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl TunnelConnector for SshConnector {
    #[instrument(skip_all, fields(ssh_host = %ssh.host, remote = %remote.host))]
    async fn open(
        &self,
        ssh: &SshConfig,
        remote: &RemoteEndpoint,
        timeout: Duration,
    ) -> GatewayResult<Box<dyn Tunnel>> {
        let tunnel = tokio::time::timeout(timeout, SshTunnel::establish(ssh, remote))
            .await
            .map_err(|_| {
                GatewayError::Tunnel(format!(
                    "timed out after {:?} connecting to {}:{}",
                    timeout, ssh.host, ssh.port
                ))
            })??;

        Ok(Box::new(tunnel))
    }
}

struct TunnelClient {
    host: String,
    port: u16,
    strict_host_key_checking: bool,
}

#[async_trait]
impl client::Handler for TunnelClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.strict_host_key_checking {
            return Ok(true);
        }

        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => {
                if !known {
                    warn!("host key of {}:{} is not in known_hosts", self.host, self.port);
                }
                Ok(known)
            }
            Err(e) => {
                warn!("host key check for {}:{} failed: {}", self.host, self.port, e);
                Ok(false)
            }
        }
    }
}

/// Tunnel over a russh client session
pub struct SshTunnel {
    local_addr: SocketAddr,
    session: Arc<client::Handle<TunnelClient>>,
    forwarder: JoinHandle<()>,
}

impl SshTunnel {
    async fn establish(ssh: &SshConfig, remote: &RemoteEndpoint) -> GatewayResult<Self> {
        let key_pair = russh_keys::load_secret_key(&ssh.key_path, None).map_err(|e| {
            GatewayError::Tunnel(format!(
                "failed to load private key {}: {}",
                ssh.key_path.display(),
                e
            ))
        })?;

        let handler = TunnelClient {
            host: ssh.host.clone(),
            port: ssh.port,
            strict_host_key_checking: ssh.strict_host_key_checking,
        };

        debug!("connecting to SSH server {}:{}", ssh.host, ssh.port);
        let mut session = client::connect(
            Arc::new(client::Config::default()),
            (ssh.host.as_str(), ssh.port),
            handler,
        )
        .await
        .map_err(|e| GatewayError::Tunnel(format!("{}:{}: {}", ssh.host, ssh.port, e)))?;

        let authenticated = session
            .authenticate_publickey(ssh.user.clone(), Arc::new(key_pair))
            .await
            .map_err(|e| GatewayError::Tunnel(format!("authentication failed: {}", e)))?;
        if !authenticated {
            return Err(GatewayError::Tunnel(format!(
                "public key rejected for {}@{}",
                ssh.user, ssh.host
            )));
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| GatewayError::Tunnel(format!("failed to bind local port: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Tunnel(e.to_string()))?;

        let session = Arc::new(session);
        let forwarder = tokio::spawn(forward(listener, session.clone(), remote.clone()));

        info!(
            "SSH tunnel {} -> {}:{} via {}",
            local_addr, remote.host, remote.port, ssh.host
        );

        Ok(Self {
            local_addr,
            session,
            forwarder,
        })
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn stop(self: Box<Self>) -> GatewayResult<()> {
        self.forwarder.abort();
        self.session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| GatewayError::Tunnel(format!("failed to close SSH session: {}", e)))?;

        debug!("SSH tunnel on {} stopped", self.local_addr);
        Ok(())
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        // Dropping the forwarder's JoinSet aborts every relayed connection.
        self.forwarder.abort();
    }
}

async fn forward(
    listener: TcpListener,
    session: Arc<client::Handle<TunnelClient>>,
    remote: RemoteEndpoint,
) {
    let mut connections = JoinSet::new();

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("tunnel listener failed: {}", e);
                break;
            }
        };
        trace!("relaying {} to {}:{}", peer, remote.host, remote.port);

        connections.spawn(relay(socket, peer, session.clone(), remote.clone()));
        while connections.try_join_next().is_some() {}
    }
}

async fn relay(
    mut socket: TcpStream,
    peer: SocketAddr,
    session: Arc<client::Handle<TunnelClient>>,
    remote: RemoteEndpoint,
) {
    let channel = match session
        .channel_open_direct_tcpip(
            remote.host.clone(),
            u32::from(remote.port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("failed to open forwarding channel: {}", e);
            return;
        }
    };

    let mut stream = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        debug!("tunnelled connection from {} ended: {}", peer, e);
    }
}
