//! Service nodes: serve one handler under one pattern, and call other
//! patterns through [`ActClient`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, StatusCode};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cache::CacheHandle;
use crate::client::Forwarder;
use crate::config::NodeConfig;
use crate::envelope::{self, RequestEnvelope, ResponseEnvelope, ServiceRecord};
use crate::pattern;
use crate::server::{self, json, require_post, status, Reply, Router, ServerGuard};
use crate::{Error, Result};

/// Business logic behind a pattern.
///
/// Receives the raw request body and returns the payload to send back.
/// Implemented for any `Fn(Bytes) -> impl Future<Output = Result<Bytes>>`.
pub trait Handler: Send + Sync + 'static {
    /// Process one request body.
    fn call(&self, body: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    fn call(&self, body: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        Box::pin(self(body))
    }
}

/// A node that has not registered yet.
#[derive(Debug)]
pub struct ServiceNode {
    config: NodeConfig,
    client: ActClient,
}

impl ServiceNode {
    /// Create a node. Must be called inside a tokio runtime.
    pub fn new(config: NodeConfig) -> Self {
        let client = ActClient::new(config.broker.clone(), Forwarder::new(config.forward_timeout));
        Self { config, client }
    }

    /// Client sharing this node's cache, usable from inside its handler.
    pub fn client(&self) -> ActClient {
        self.client.clone()
    }

    /// Bind, register `pattern` with the broker, then start serving `handler`.
    ///
    /// Registration failures are returned before the listener accepts a
    /// single request.
    pub async fn add<H: Handler>(self, pattern: impl Into<String>, handler: H) -> Result<NodeGuard> {
        let listener = TcpListener::bind(self.config.bind).await?;
        let record = ServiceRecord::new(
            pattern,
            self.config.advertised_address(listener.local_addr()?),
            self.config.broker.clone(),
        );

        self.client.register(&record).await?;
        info!(
            pattern = %record.pattern,
            address = %record.service_address,
            broker = %record.broker_address,
            "node registered"
        );

        let endpoint = Endpoint {
            record: record.clone(),
            handler: Arc::new(handler),
        };
        let router = Router::new().route("/", move |request| {
            let endpoint = endpoint.clone();
            async move { endpoint.handle(request).await }
        });
        let server = server::serve(listener, router)?;

        Ok(NodeGuard {
            record,
            server,
            client: self.client,
        })
    }
}

/// Inbound side of a registered node.
#[derive(Clone)]
struct Endpoint {
    record: ServiceRecord,
    handler: Arc<dyn Handler>,
}

impl Endpoint {
    async fn handle(&self, request: Request<Bytes>) -> Reply {
        if let Err(reply) = require_post(&request) {
            return reply;
        }
        let body = request.into_body();
        let envelope: RequestEnvelope = match envelope::decode(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "undecodable request");
                return status(StatusCode::BAD_REQUEST);
            }
        };
        if !pattern::accepts(&self.record.pattern, &envelope.pattern) {
            debug!(
                requested = %envelope.pattern,
                registered = %self.record.pattern,
                "pattern mismatch"
            );
            return status(StatusCode::BAD_REQUEST);
        }

        let payload = match self.handler.call(body).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(pattern = %self.record.pattern, error = %err, "handler failed");
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        if !envelope.broker_request {
            return json(StatusCode::OK, payload);
        }
        let answer = ResponseEnvelope {
            service: self.record.clone(),
            payload,
        };
        match envelope::encode(&answer) {
            Ok(body) => json(StatusCode::OK, body),
            Err(err) => {
                warn!(error = %err, "failed to encode response envelope");
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Guard for a registered, serving node.
#[derive(Debug)]
pub struct NodeGuard {
    record: ServiceRecord,
    server: ServerGuard,
    client: ActClient,
}

impl NodeGuard {
    /// Record this node registered with.
    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Address the node listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Client sharing this node's cache.
    pub fn client(&self) -> ActClient {
        self.client.clone()
    }

    /// Stop serving.
    pub async fn shutdown(self) -> Result<()> {
        self.server.shutdown().await
    }
}

/// Caller-side resolution: local cache first, the broker as fallback.
#[derive(Clone, Debug)]
pub struct ActClient {
    broker: String,
    cache: CacheHandle<ServiceRecord>,
    forwarder: Forwarder,
}

impl ActClient {
    /// Client talking to the broker at `broker` (`host:port`). Must be called
    /// inside a tokio runtime.
    pub fn new(broker: impl Into<String>, forwarder: Forwarder) -> Self {
        Self {
            broker: broker.into(),
            cache: CacheHandle::spawn(),
            forwarder,
        }
    }

    /// Send `body` to whichever node serves `pattern` and return its payload.
    ///
    /// `body` must be a request envelope with `ServiceRequest` set, so that
    /// the answer carries the responder's record. A cached responder is tried
    /// first, then the broker that responder trusts; if both are unreachable
    /// the entry is evicted and the transport error returned. Without a cache
    /// entry the request goes to this client's broker. An answer that breaks
    /// off after the request was delivered is returned as is, never retried.
    pub async fn act(&self, body: impl Into<Bytes>, pattern: &str) -> Result<Bytes> {
        let body = body.into();

        // `stale` is the cache key whose record has just failed us.
        let (forwarded, cache_hit, stale) = match self.cache.lookup(pattern).await {
            None => {
                debug!(%pattern, broker = %self.broker, "cache miss, asking broker");
                (self.forwarder.post(&self.broker, "/", body).await?, false, None)
            }
            Some((matched, record)) => {
                match self.forwarder.post(&record.service_address, "/", body.clone()).await {
                    Ok(forwarded) => (forwarded, true, None),
                    Err(err) if err.is_delivered() => return Err(err),
                    Err(err) => {
                        warn!(
                            %pattern,
                            address = %record.service_address,
                            error = %err,
                            "cached service unreachable, trying its broker"
                        );
                        match self.forwarder.post(&record.broker_address, "/", body).await {
                            Ok(forwarded) => (forwarded, true, Some(matched)),
                            Err(err) if err.is_delivered() => return Err(err),
                            Err(err) => {
                                warn!(
                                    %pattern,
                                    broker = %record.broker_address,
                                    error = %err,
                                    "broker unreachable too, evicting"
                                );
                                self.cache.remove(matched);
                                return Err(err);
                            }
                        }
                    }
                }
            }
        };

        if !forwarded.status.is_success() {
            return Err(Error::Status(forwarded.status));
        }
        let answer: ResponseEnvelope = envelope::decode(&forwarded.body)?;

        let learned = !answer.service.service_address.is_empty();
        if learned && (!cache_hit || stale.is_some()) {
            if let Some(stale) = stale.filter(|key| *key != answer.service.pattern) {
                debug!(pattern = %stale, "dropping superseded entry");
                self.cache.remove(stale);
            }
            debug!(
                pattern = %answer.service.pattern,
                address = %answer.service.service_address,
                "caching responder"
            );
            self.cache
                .insert(answer.service.pattern.clone(), answer.service);
        }
        Ok(answer.payload)
    }

    /// Wait until queued cache updates have been applied.
    pub async fn settle(&self) {
        self.cache.settle().await;
    }

    /// Current cache entry covering `pattern`, if any.
    pub async fn cached(&self, pattern: &str) -> Option<(String, ServiceRecord)> {
        self.cache.lookup(pattern).await
    }

    async fn register(&self, record: &ServiceRecord) -> Result<()> {
        let forwarded = self
            .forwarder
            .post(&self.broker, "/register", envelope::encode(record)?)
            .await?;
        if forwarded.status != StatusCode::OK {
            return Err(Error::Registration {
                status: forwarded.status,
            });
        }
        Ok(())
    }
}
