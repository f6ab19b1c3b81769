//! HTTP serving over any [`Listener`], plus the small auxiliary services
//! (key publishing and metrics scraping).

use std::convert::Infallible;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::{service_fn, Service};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::listener::Listener;
use crate::stream::Connection;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Response body shared by every service in the gateway.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(full(status.canonical_reason().unwrap_or_default()));
    *response.status_mut() = status;
    response
}

/// Limits applied by [`serve`].
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// How long in-flight connections may keep running after shutdown.
    pub grace: Duration,

    /// Cap on the lifetime of one connection. Needed for listeners whose
    /// connections have no deadlines of their own.
    pub connection_timeout: Option<Duration>,
}

/// Serve HTTP/1 and HTTP/2 on `listener` until it closes or `shutdown`
/// fires, then drain in-flight connections for at most `options.grace`.
///
/// `make_service` is called once per accepted connection with that
/// connection's remote address.
pub async fn serve<L, F, S>(
    name: String,
    listener: L,
    make_service: F,
    shutdown: CancellationToken,
    options: ServeOptions,
) where
    L: Listener,
    F: Fn(<L::Conn as Connection>::Addr) -> S + Send,
    S: Service<Request<Incoming>, Response = Response<ResponseBody>, Error = Infallible>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();

    if let Some(addr) = listener.local_addr() {
        info!(server = %name, %addr, "HTTP server listening");
    } else {
        info!(server = %name, "HTTP server attached to tunnel listener");
    }

    let connection_timeout = options.connection_timeout;
    if connection_timeout.is_none() && !<L::Conn as Connection>::SUPPORTS_DEADLINES {
        debug!(server = %name, "Connections have no deadlines and no lifetime cap");
    }

    loop {
        let conn = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(server = %name, "HTTP server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) if e.is_closed() => {
                    debug!(server = %name, "Listener closed");
                    break;
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let remote_addr = conn.remote_addr();
        let service = make_service(remote_addr.clone());
        let connection = builder
            .serve_connection_with_upgrades(TokioIo::new(conn), service)
            .into_owned();
        let watched = graceful.watch(connection);
        let name = name.clone();

        tokio::spawn(async move {
            let result = match connection_timeout {
                Some(limit) => match tokio::time::timeout(limit, watched).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(server = %name, %remote_addr, "Connection lifetime exceeded");
                        return;
                    }
                },
                None => watched.await,
            };
            if let Err(e) = result {
                debug!(server = %name, %remote_addr, error = %e, "Connection ended with error");
            }
        });
    }

    tokio::select! {
        _ = graceful.shutdown() => {
            debug!(server = %name, "All connections drained");
        }
        _ = tokio::time::sleep(options.grace) => {
            warn!(server = %name, "Grace period elapsed with connections still open");
        }
    }
}

/// Service publishing the identity token public key at `GET /key`.
pub fn key_service(
    public_key_b64: Arc<str>,
) -> impl Service<
    Request<Incoming>,
    Response = Response<ResponseBody>,
    Error = Infallible,
    Future = impl Send + 'static,
> + Send
+ Clone
+ 'static {
    service_fn(move |req: Request<Incoming>| {
        let response = route_get(&req, "/key", || {
            text_response(public_key_b64.as_bytes().to_vec())
        });
        async move { Ok(response) }
    })
}

/// Service exposing Prometheus metrics at `GET /metrics`.
pub fn metrics_service(
    handle: PrometheusHandle,
) -> impl Service<
    Request<Incoming>,
    Response = Response<ResponseBody>,
    Error = Infallible,
    Future = impl Send + 'static,
> + Send
+ Clone
+ 'static {
    service_fn(move |req: Request<Incoming>| {
        let response = route_get(&req, "/metrics", || text_response(handle.render()));
        async move { Ok(response) }
    })
}

fn route_get<B>(
    req: &Request<B>,
    path: &str,
    handler: impl FnOnce() -> Response<ResponseBody>,
) -> Response<ResponseBody> {
    if req.uri().path() != path {
        return status_response(StatusCode::NOT_FOUND);
    }
    if req.method() != Method::GET {
        let mut response = status_response(StatusCode::METHOD_NOT_ALLOWED);
        response
            .headers_mut()
            .insert(header::ALLOW, header::HeaderValue::from_static("GET"));
        return response;
    }
    handler()
}

fn text_response(body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
