//! Proxy bridge: serves one backend's HTTP traffic off its virtual
//! listener and forwards every request to the real backend with an
//! identity token attached.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::TunnelError;
use crate::http_server::{serve, status_response, BoxError, ResponseBody, ServeOptions};
use crate::listener::Listener;
use crate::route::RouteKey;
use crate::stream::{Connection, TunnelAddr};
use crate::telemetry::{COUNTER_REQUESTS_TOTAL, KEY_BACKEND};
use crate::token::TokenCache;

/// Headers that only make sense for a single hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

pub struct ProxyBridge {
    backend: Url,
    route: RouteKey,
    header: HeaderName,
    tokens: TokenCache,
    client: reqwest::Client,
    fatal: CancellationToken,
}

impl ProxyBridge {
    /// `fatal` is cancelled if a token can't be signed; the process is
    /// expected to stop rather than forward unsigned traffic.
    pub fn new(
        backend: Url,
        route: RouteKey,
        header: HeaderName,
        tokens: TokenCache,
        client: reqwest::Client,
        fatal: CancellationToken,
    ) -> Self {
        Self {
            backend,
            route,
            header,
            tokens,
            client,
            fatal,
        }
    }

    /// Upstream client shared by all bridges.
    pub fn client() -> anyhow::Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(client)
    }

    /// Serve HTTP on `listener` until it reports closure or `shutdown` fires.
    pub async fn serve<L>(
        self: Arc<Self>,
        listener: L,
        shutdown: CancellationToken,
        options: ServeOptions,
    ) where
        L: Listener,
        L::Conn: Connection<Addr = TunnelAddr>,
    {
        let name = self.route.to_string();
        let bridge = self;
        serve(
            name,
            listener,
            move |remote: TunnelAddr| {
                let bridge = bridge.clone();
                service_fn(move |req: Request<Incoming>| {
                    let bridge = bridge.clone();
                    let remote = remote.clone();
                    async move { Ok::<_, Infallible>(bridge.handle(req, &remote).await) }
                })
            },
            shutdown,
            options,
        )
        .await;
    }

    /// Rewrite an inbound request for the backend: point it at the
    /// backend's scheme and authority, drop per-hop headers, record the
    /// client in `X-Forwarded-For` and attach a token for the tunnel
    /// principal. Returns the upstream URL.
    pub fn direct(&self, parts: &mut Parts, remote: &TunnelAddr) -> Result<Url, TunnelError> {
        let token = self.tokens.mint(&remote.to_string())?;
        let value = HeaderValue::from_str(&token)
            .map_err(|e| TunnelError::Signing(format!("token is not a valid header value: {}", e)))?;

        let mut url = self.backend.clone();
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        append_forwarded_for(&mut parts.headers, remote.addr.ip());
        parts.headers.insert(self.header.clone(), value);

        counter!(COUNTER_REQUESTS_TOTAL, KEY_BACKEND => self.route.to_string()).increment(1);
        Ok(url)
    }

    async fn handle(&self, req: Request<Incoming>, remote: &TunnelAddr) -> Response<ResponseBody> {
        let (mut parts, body) = req.into_parts();

        let url = match self.direct(&mut parts, remote) {
            Ok(url) => url,
            Err(e) => {
                error!(backend = %self.route, error = %e, "Cannot sign identity token, stopping");
                self.fatal.cancel();
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        debug!(backend = %self.route, remote_addr = %remote, method = %parts.method, %url, "Forwarding request");
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(reqwest::Body::wrap(body))
            .send()
            .await;

        match upstream {
            Ok(response) => {
                let mut response = Response::from(response);
                strip_hop_by_hop(response.headers_mut());
                response.map(|body| body.map_err(BoxError::from).boxed_unsync())
            }
            Err(e) => {
                warn!(backend = %self.route, remote_addr = %remote, error = %e, "Upstream request failed");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Backend that reports what it received.

    use std::net::SocketAddr;

    use bytes::Bytes;
    use http::{Request, Response};
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto;
    use tokio::net::TcpListener;

    /// Responds with the `x-identity` header as body, echoing the path in
    /// `x-seen-path`, the host in `x-seen-host` and the request body length
    /// in `x-seen-len`.
    pub async fn spawn_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let identity = req
                        .headers()
                        .get("x-identity")
                        .map(|v| v.to_str().unwrap().to_string())
                        .unwrap_or_default();
                    let path = req.uri().to_string();
                    let host = req
                        .headers()
                        .get("host")
                        .map(|v| v.to_str().unwrap().to_string())
                        .unwrap_or_default();
                    let len = req.into_body().collect().await.unwrap().to_bytes().len();
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .header("x-seen-path", path)
                            .header("x-seen-host", host)
                            .header("x-seen-len", len.to_string())
                            .header("connection", "x-private")
                            .header("x-private", "1")
                            .body(Full::new(Bytes::from(identity)))
                            .unwrap(),
                    )
                });
                tokio::spawn(async move {
                    let _ = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }
}
