//! SSH server implementation using russh.
//!
//! Handles:
//! - Password and public key authentication against the authorization endpoint
//! - `direct-tcpip` channels, routed to the matching backend's handoff queue
//! - Rejection of every other channel type

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{compute_fingerprint_from_pubkey, Authorizer};
use crate::error::TunnelError;
use crate::listener::HandoffSender;
use crate::route::{RouteKey, RouteTable};
use crate::stream::{ConnectionInfo, TunnelStream};
use crate::telemetry::{
    COUNTER_CHANNELS_REJECTED_TOTAL, COUNTER_CONNECTIONS_TOTAL, GAUGE_ACTIVE_CONNECTIONS,
    KEY_REASON,
};
use crate::wire::DirectTcpip;

/// Accepts raw SSH connections and routes their `direct-tcpip` channels to
/// backend handoff queues.
pub struct ChannelRouter {
    config: Arc<russh::server::Config>,
    routes: Arc<RouteTable>,
    /// `None` accepts every client without asking the authorization endpoint.
    authorizer: Option<Arc<Authorizer>>,
    shutdown: CancellationToken,
    disconnect: CancellationToken,
}

impl ChannelRouter {
    pub fn new(
        host_key: russh::keys::PrivateKey,
        routes: Arc<RouteTable>,
        authorizer: Option<Arc<Authorizer>>,
    ) -> Self {
        let mut methods = vec![MethodKind::Password, MethodKind::PublicKey];
        if authorizer.is_none() {
            methods.push(MethodKind::None);
        }

        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::from(&methods[..]),
            keys: vec![host_key],
            ..Default::default()
        });

        Self {
            config,
            routes,
            authorizer,
            shutdown: CancellationToken::new(),
            disconnect: CancellationToken::new(),
        }
    }

    /// Accept raw connections until [`ChannelRouter::shut_down`] is called.
    /// The listener is dropped, and so closed, on return.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("SSH server listening on {}", addr);
        }

        loop {
            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("SSH accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if self.shutdown.is_cancelled() {
                            return Ok(());
                        }
                        warn!(error = %e, "Failed to accept SSH connection");
                        continue;
                    }
                },
            };

            self.spawn_connection(stream, peer_addr);
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Dropping connection without local address");
                return;
            }
        };

        let handler = ConnectionHandler::new(
            self.routes.clone(),
            self.authorizer.clone(),
            peer_addr,
            local_addr,
        );
        let config = self.config.clone();
        let disconnect = self.disconnect.clone();

        tokio::spawn(async move {
            let mut session = match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    let e = TunnelError::Handshake(e.to_string());
                    warn!(peer = %peer_addr, error = %e, "SSH connection setup failed");
                    return;
                }
            };

            tokio::select! {
                result = &mut session => {
                    if let Err(e) = result {
                        debug!(peer = %peer_addr, error = %e, "SSH session ended with error");
                    }
                }
                _ = disconnect.cancelled() => {
                    debug!(peer = %peer_addr, "Disconnecting SSH client");
                    let _ = session
                        .handle()
                        .disconnect(Disconnect::ByApplication, "".into(), "English".into())
                        .await;
                }
            }
        });
    }

    /// Stop accepting connections and close every route's queue, waking
    /// blocked handoffs and letting the virtual listeners report closure.
    /// Safe to call more than once.
    pub fn shut_down(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down channel router");
        }
        self.shutdown.cancel();
        self.routes.close_all();
    }

    #[cfg(test)]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Disconnect every remaining SSH session.
    pub fn disconnect_all(&self) {
        self.disconnect.cancel();
    }
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    routes: Arc<RouteTable>,
    authorizer: Option<Arc<Authorizer>>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Our end of the raw connection.
    local_addr: SocketAddr,

    /// Random identifier used to correlate log lines.
    conn_id: Vec<u8>,

    /// Set once authentication succeeds.
    conn: Option<Arc<ConnectionInfo>>,

    /// Fingerprint of the key the endpoint approved when it was offered.
    approved_key: Option<String>,
}

impl ConnectionHandler {
    fn new(
        routes: Arc<RouteTable>,
        authorizer: Option<Arc<Authorizer>>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            routes,
            authorizer,
            peer_addr,
            local_addr,
            conn_id: rand::random::<[u8; 16]>().to_vec(),
            conn: None,
            approved_key: None,
        }
    }

    fn authenticated(&mut self, user: &str) -> Auth {
        let conn = Arc::new(ConnectionInfo {
            conn_id: self.conn_id.clone(),
            username: user.to_string(),
            local_addr: self.local_addr,
            remote_addr: self.peer_addr,
        });
        info!(
            conn_id = %conn.conn_id_b64(),
            peer = %self.peer_addr,
            user,
            "SSH connection established"
        );
        if self.conn.is_none() {
            gauge!(GAUGE_ACTIVE_CONNECTIONS).increment(1);
            counter!(COUNTER_CONNECTIONS_TOTAL).increment(1);
        }
        self.conn = Some(conn);
        Auth::Accept
    }

    fn rejected(&self, user: &str, err: &TunnelError) -> Auth {
        info!(peer = %self.peer_addr, user, error = %err, "Authentication rejected");
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                &[MethodKind::Password, MethodKind::PublicKey][..],
            )),
            partial_success: false,
        }
    }

    /// Find the handoff queue for a decoded `direct-tcpip` request.
    fn admit(
        &self,
        request: &DirectTcpip,
    ) -> Result<HandoffSender<TunnelStream<russh::ChannelStream<Msg>>>, TunnelError> {
        let key = RouteKey::new(&request.host, request.port);
        Ok(self.routes.lookup(&key)?.clone())
    }

    fn reject_channel(&self, err: &TunnelError, target: Option<String>) -> bool {
        info!(
            conn_id = %self.conn_id_b64(),
            user = self.conn.as_ref().map(|c| c.username.as_str()).unwrap_or_default(),
            route = target.as_deref().unwrap_or_default(),
            reason = ?err.reject_reason(),
            "Rejected channel: {}",
            err
        );
        counter!(COUNTER_CHANNELS_REJECTED_TOTAL, KEY_REASON => err.kind()).increment(1);
        false
    }

    fn conn_id_b64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.conn_id)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if self.conn.is_some() {
            gauge!(GAUGE_ACTIVE_CONNECTIONS).decrement(1);
            debug!(conn_id = %self.conn_id_b64(), peer = %self.peer_addr, "SSH connection closed");
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.authorizer.is_none() {
            return Ok(self.authenticated(user));
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                &[MethodKind::Password, MethodKind::PublicKey][..],
            )),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!("Password auth for user '{}' from {}", user, self.peer_addr);
        let Some(authorizer) = self.authorizer.clone() else {
            return Ok(self.authenticated(user));
        };

        match authorizer.check_password(user, password).await {
            Ok(()) => Ok(self.authenticated(user)),
            Err(e) => Ok(self.rejected(user, &e)),
        }
    }

    /// Ask the endpoint about the key before the client bothers signing.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{}' from {}", user, self.peer_addr);
        let Some(authorizer) = self.authorizer.clone() else {
            return Ok(Auth::Accept);
        };

        match authorizer.check_public_key(user, public_key).await {
            Ok(()) => {
                self.approved_key = Some(format!(
                    "{}:{}",
                    user,
                    compute_fingerprint_from_pubkey(public_key)
                ));
                Ok(Auth::Accept)
            }
            Err(e) => Ok(self.rejected(user, &e)),
        }
    }

    /// Handle verified public key authentication (signature received).
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(authorizer) = self.authorizer.clone() else {
            return Ok(self.authenticated(user));
        };

        let signed = format!("{}:{}", user, compute_fingerprint_from_pubkey(public_key));
        if self.approved_key.as_deref() == Some(signed.as_str()) {
            return Ok(self.authenticated(user));
        }

        // Signed without being offered first: check it now.
        match authorizer.check_public_key(user, public_key).await {
            Ok(()) => Ok(self.authenticated(user)),
            Err(e) => Ok(self.rejected(user, &e)),
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let err = TunnelError::UnsupportedChannelType("session".to_string());
        Ok(self.reject_channel(&err, None))
    }

    /// Route a direct-tcpip channel to its backend.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(conn) = self.conn.clone() else {
            return Ok(false);
        };

        let request = DirectTcpip::new(
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        );
        let target = request.target();
        let sender = match self.admit(&request) {
            Ok(sender) => sender,
            Err(e) => return Ok(self.reject_channel(&e, Some(target))),
        };

        debug!(
            conn_id = %conn.conn_id_b64(),
            user = %conn.username,
            route = %request.target(),
            origin = %request.origin(),
            "Accepted direct-tcpip channel"
        );

        let stream = TunnelStream::new(channel.into_stream(), conn);
        tokio::spawn(async move {
            if let Err(e) = sender.send(stream).await {
                debug!(route = %target, error = %e, "Dropping tunneled stream");
            }
        });

        Ok(true)
    }

    /// Tunneled streams carry raw bytes only.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id)?;
        Ok(())
    }
}

/// Load host key from file or generate a new one.
pub async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        Ok(key)
    } else {
        info!("Generating new Ed25519 host key");
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("Failed to generate host key")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key_bytes = key
            .to_openssh(LineEnding::LF)
            .context("Failed to encode host key")?;
        tokio::fs::write(path, key_bytes.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        info!("Saved host key to {}", path.display());
        Ok(key)
    }
}

#[cfg(test)]
pub(crate) mod test_client {
    //! A minimal russh client for driving the router in tests.

    use std::net::SocketAddr;
    use std::sync::Arc;

    use russh::client;
    use russh::keys::PublicKey;
    use tokio::net::TcpStream;

    pub struct TestClient;

    impl client::Handler for TestClient {
        type Error = anyhow::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    /// Connect to `addr`, returning the session handle and our local address.
    pub async fn connect(addr: SocketAddr) -> (client::Handle<TestClient>, SocketAddr) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let local = stream.local_addr().unwrap();
        let config = Arc::new(client::Config::default());
        let handle = client::connect_stream(config, stream, TestClient).await.unwrap();
        (handle, local)
    }

    /// Connect and authenticate with a password.
    pub async fn connect_password(
        addr: SocketAddr,
        user: &str,
        password: &str,
    ) -> (client::Handle<TestClient>, SocketAddr) {
        let (mut handle, local) = connect(addr).await;
        let result = handle.authenticate_password(user, password).await.unwrap();
        assert!(result.success(), "password auth should succeed");
        (handle, local)
    }
}

#[cfg(test)]
mod tests {
    use super::test_client::{connect, connect_password};
    use super::*;
    use std::collections::HashMap;

    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
    use russh::ChannelOpenFailure;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::listener::{handoff, VirtualListener};
    use crate::stream::Connection;

    type Listener = VirtualListener<TunnelStream<russh::ChannelStream<Msg>>>;

    struct Harness {
        router: Arc<ChannelRouter>,
        addr: SocketAddr,
        listener: Listener,
    }

    async fn start(authorizer: Option<Arc<Authorizer>>) -> Harness {
        let (tx, listener) = handoff();
        let mut routes = HashMap::new();
        routes.insert(RouteKey::new("host-a", 2222), tx);
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let router = Arc::new(ChannelRouter::new(
            host_key,
            Arc::new(RouteTable::new(routes)),
            authorizer,
        ));

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(router.clone().serve(tcp));
        Harness {
            router,
            addr,
            listener,
        }
    }

    async fn start_with_auth(keys: Vec<String>) -> Harness {
        let endpoint = crate::auth::mock::spawn("hunter2", keys).await;
        let authorizer = Authorizer::new(
            &format!("http://{}/authorize", endpoint),
            Duration::from_secs(2),
        )
        .unwrap();
        start(Some(Arc::new(authorizer))).await
    }

    #[tokio::test]
    async fn test_routes_registered_target() {
        let harness = start_with_auth(Vec::new()).await;
        let (handle, local) = connect_password(harness.addr, "alice", "hunter2").await;

        let channel = handle
            .channel_open_direct_tcpip("host-a", 2222, "203.0.113.9", 51000)
            .await
            .unwrap();
        let mut accepted = harness.listener.next().await.unwrap();
        assert_eq!(
            accepted.remote_addr().to_string(),
            format!("alice@{}", local)
        );
        assert_eq!(accepted.local_addr(), Some(harness.addr));

        let mut client_stream = channel.into_stream();
        client_stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.write_all(b"pong").await.unwrap();
        client_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_target_matching_is_case_insensitive() {
        let harness = start(None).await;
        let (mut handle, _) = connect(harness.addr).await;
        assert!(handle.authenticate_none("bob").await.unwrap().success());

        let _channel = handle
            .channel_open_direct_tcpip("HOST-A", 2222, "127.0.0.1", 1)
            .await
            .unwrap();
        let accepted = harness.listener.next().await.unwrap();
        assert_eq!(accepted.connection().username, "bob");
    }

    #[tokio::test]
    async fn test_unregistered_target_is_prohibited() {
        let harness = start_with_auth(Vec::new()).await;
        let (handle, _) = connect_password(harness.addr, "alice", "hunter2").await;

        let err = handle
            .channel_open_direct_tcpip("host-b", 2222, "203.0.113.9", 51000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            russh::Error::ChannelOpenFailure(ChannelOpenFailure::AdministrativelyProhibited)
        ));

        // The connection survives a rejected channel.
        handle
            .channel_open_direct_tcpip("host-a", 2222, "203.0.113.9", 51000)
            .await
            .unwrap();
        harness.listener.next().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_channel_rejected() {
        let harness = start_with_auth(Vec::new()).await;
        let (handle, _) = connect_password(harness.addr, "alice", "hunter2").await;
        assert!(handle.channel_open_session().await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_password_denied() {
        let harness = start_with_auth(Vec::new()).await;
        let (mut handle, _) = connect(harness.addr).await;
        let result = handle.authenticate_password("alice", "nope").await.unwrap();
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_public_key_auth() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let encoded = crate::auth::encode_public_key(key.public_key());
        let harness = start_with_auth(vec![encoded]).await;

        let (mut handle, _) = connect(harness.addr).await;
        let result = handle
            .authenticate_publickey("alice", PrivateKeyWithHashAlg::new(Arc::new(key), None))
            .await
            .unwrap();
        assert!(result.success());

        let stranger = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let (mut handle, _) = connect(harness.addr).await;
        let result = handle
            .authenticate_publickey("alice", PrivateKeyWithHashAlg::new(Arc::new(stranger), None))
            .await
            .unwrap();
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_shut_down_stops_accepting_and_closes_routes() {
        let harness = start(None).await;
        harness.router.shut_down();
        harness.router.shut_down();
        assert!(harness.router.is_shut_down());

        assert!(matches!(
            harness.listener.next().await,
            Err(TunnelError::ListenerClosed)
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(harness.addr).await.is_err());
    }
}
