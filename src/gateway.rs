//! Lifecycle coordination: brings the router, the per-backend bridges and
//! the auxiliary servers up in order, and takes them down in order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use http::HeaderName;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authorizer;
use crate::bridge::ProxyBridge;
use crate::config::GatewayConfig;
use crate::http_server::{key_service, metrics_service, serve, ServeOptions};
use crate::listener::handoff;
use crate::route::RouteTable;
use crate::ssh::ChannelRouter;
use crate::token::{TokenCache, TokenSigner};

/// Key material loaded before startup.
pub struct Keys {
    pub host_key: russh::keys::PrivateKey,
    pub signer: Arc<TokenSigner>,
}

/// A started gateway.
pub struct Gateway {
    router: Arc<ChannelRouter>,
    router_task: JoinHandle<Result<()>>,
    servers: Vec<JoinHandle<()>>,
    http_shutdown: CancellationToken,
    fatal: CancellationToken,
    ssh_addr: SocketAddr,
    key_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
}

impl Gateway {
    /// Build routes and listeners, bind every socket and start serving.
    ///
    /// The metrics server only starts when both `metrics_listen_addr` is set
    /// and a recorder handle is supplied.
    pub async fn start(
        config: &GatewayConfig,
        keys: Keys,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Self> {
        let backends = config.backends()?;
        let header = HeaderName::from_bytes(config.token.header.as_bytes())
            .with_context(|| format!("Invalid token header name: {}", config.token.header))?;
        let ttl = chrono::Duration::seconds(
            i64::try_from(config.token.ttl_secs).context("token.ttl_secs out of range")?,
        );
        let options = ServeOptions {
            grace: config.timeouts.shutdown_grace(),
            connection_timeout: config.timeouts.connection(),
        };

        keys.signer
            .probe()
            .context("Token signing key cannot sign")?;

        let fatal = CancellationToken::new();
        let http_shutdown = CancellationToken::new();
        let client = ProxyBridge::client().context("Failed to create upstream HTTP client")?;

        // Routes first, then the listeners that consume them.
        let mut senders = HashMap::new();
        let mut bridges = Vec::with_capacity(backends.len());
        for backend in backends {
            let (tx, listener) = handoff();
            senders.insert(backend.route.clone(), tx);

            let tokens = TokenCache::new(
                keys.signer.clone(),
                backend.audience,
                config.token.issuer.clone(),
                ttl,
            );
            info!(route = %backend.route, backend = %backend.url, "Registered backend");
            let bridge = ProxyBridge::new(
                backend.url,
                backend.route,
                header.clone(),
                tokens,
                client.clone(),
                fatal.clone(),
            );
            bridges.push((Arc::new(bridge), listener));
        }
        let routes = Arc::new(RouteTable::new(senders));

        let ssh_listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind SSH listener on {}", config.listen_addr))?;
        let ssh_addr = ssh_listener.local_addr()?;

        let key_listener = match &config.key_listen_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind key listener on {}", addr))?,
            ),
            None => None,
        };
        let metrics_listener = match (&config.metrics_listen_addr, &prometheus) {
            (Some(addr), Some(_)) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind metrics listener on {}", addr))?,
            ),
            _ => None,
        };

        let authorizer = if config.no_auth {
            warn!("Authentication is disabled; every client is accepted");
            None
        } else {
            Some(Arc::new(Authorizer::new(
                &config.authorization_endpoint,
                config.timeouts.auth(),
            )?))
        };

        let router = Arc::new(ChannelRouter::new(keys.host_key, routes, authorizer));
        let router_task = tokio::spawn(router.clone().serve(ssh_listener));

        let mut servers = Vec::new();
        for (bridge, listener) in bridges {
            servers.push(tokio::spawn(bridge.serve(
                listener,
                http_shutdown.clone(),
                options,
            )));
        }

        let key_addr = match key_listener {
            Some(listener) => {
                let addr = listener.local_addr().ok();
                let public_key: Arc<str> = Arc::from(keys.signer.public_key_b64());
                servers.push(tokio::spawn(serve(
                    "key".to_string(),
                    listener,
                    move |_| key_service(public_key.clone()),
                    http_shutdown.clone(),
                    options,
                )));
                addr
            }
            None => None,
        };

        let metrics_addr = match (metrics_listener, prometheus) {
            (Some(listener), Some(handle)) => {
                let addr = listener.local_addr().ok();
                servers.push(tokio::spawn(serve(
                    "metrics".to_string(),
                    listener,
                    move |_| metrics_service(handle.clone()),
                    http_shutdown.clone(),
                    options,
                )));
                addr
            }
            _ => None,
        };

        Ok(Self {
            router,
            router_task,
            servers,
            http_shutdown,
            fatal,
            ssh_addr,
            key_addr,
            metrics_addr,
        })
    }

    pub fn ssh_addr(&self) -> SocketAddr {
        self.ssh_addr
    }

    pub fn key_addr(&self) -> Option<SocketAddr> {
        self.key_addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// Cancelled when the gateway hits a condition it must not keep
    /// serving through.
    pub fn fatal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Stop the router, drain every HTTP server, then disconnect whatever
    /// SSH sessions remain.
    pub async fn shut_down(self) {
        self.router.shut_down();
        match self.router_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Channel router failed"),
            Err(e) => warn!(error = %e, "Channel router task panicked"),
        }

        self.http_shutdown.cancel();
        for result in join_all(self.servers).await {
            if let Err(e) = result {
                warn!(error = %e, "HTTP server task panicked");
            }
        }
        debug!("All HTTP servers stopped");

        self.router.disconnect_all();
        info!("Gateway stopped");
    }
}
