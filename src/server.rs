//! HTTP serving: a per-instance route table and an accept loop with a
//! shutdown guard.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, info, warn};

use crate::Result;

/// Response type produced by every route.
pub type Reply = Response<Full<Bytes>>;

type Route = Arc<dyn Fn(Request<Bytes>) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Empty-bodied reply with the given status.
pub fn status(code: StatusCode) -> Reply {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = code;
    response
}

/// JSON reply with the given status.
pub fn json(code: StatusCode, body: Bytes) -> Reply {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = code;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Reject anything but POST with 405.
pub(crate) fn require_post(request: &Request<Bytes>) -> std::result::Result<(), Reply> {
    if request.method() == Method::POST {
        Ok(())
    } else {
        Err(status(StatusCode::METHOD_NOT_ALLOWED))
    }
}

/// Path table owned by one broker or node.
///
/// Exact paths win. Anything else falls through to the `/` route when one
/// is registered, and is answered 404 otherwise.
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<HashMap<&'static str, Route>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("paths", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `path`.
    pub fn route<F, Fut>(mut self, path: &'static str, handler: F) -> Self
    where
        F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Reply> + Send + 'static,
    {
        let route: Route = Arc::new(move |request| Box::pin(handler(request)));
        Arc::make_mut(&mut self.routes).insert(path, route);
        self
    }

    /// Dispatch a request whose body has already been collected.
    pub async fn dispatch(&self, request: Request<Bytes>) -> Reply {
        let route = self
            .routes
            .get(request.uri().path())
            .or_else(|| self.routes.get("/"))
            .cloned();
        match route {
            Some(route) => route(request).await,
            None => status(StatusCode::NOT_FOUND),
        }
    }
}

impl tower::Service<Request<Incoming>> for Router {
    type Response = Reply;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Reply, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Incoming>) -> Self::Future {
        let router = self.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    debug!(error = %err, "failed to read request body");
                    return Ok(status(StatusCode::BAD_REQUEST));
                }
            };
            Ok(router.dispatch(Request::from_parts(parts, body)).await)
        })
    }
}

/// Start serving `router` on an already bound listener.
///
/// Each connection runs on its own task. The returned guard stops the
/// accept loop and drains open connections on shutdown or drop.
pub fn serve(listener: TcpListener, router: Router) -> Result<ServerGuard> {
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let notify = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        let mut incoming = TcpListenerStream::new(listener);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                next = incoming.next() => match next {
                    Some(Ok(stream)) => {
                        connections.spawn(serve_connection(stream, router.clone(), notify.subscribe()));
                    }
                    Some(Err(err)) => warn!(%local_addr, error = %err, "accept failed"),
                    None => break,
                },
            }
        }
        drop(incoming);
        debug!(%local_addr, open = connections.len(), "accept loop stopped, draining");
        while connections.join_next().await.is_some() {}
    });

    info!(%local_addr, "listening");
    Ok(ServerGuard {
        local_addr,
        shutdown_tx,
        handle: Some(handle),
    })
}

async fn serve_connection(stream: TcpStream, router: Router, mut shutdown: broadcast::Receiver<()>) {
    let peer = stream.peer_addr().ok();
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(err) = result {
        debug!(?peer, error = %err, "connection closed with error");
    }
}

/// Guard for a running server.
pub struct ServerGuard {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerGuard")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl ServerGuard {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close idle connections and wait for in-flight
    /// requests to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
