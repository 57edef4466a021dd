//! Broker: registers nodes and proxies pattern-addressed requests.
//!
//! Resolution goes through the in-memory prefix cache first and falls back
//! to the durable [`Registry`]. The cache is only a hint. A cached address
//! that fails to answer is evicted, and every answer obtained through the
//! registry re-warms the cache with the address that actually responded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cache::CacheHandle;
use crate::client::{Forwarded, Forwarder};
use crate::config::BrokerConfig;
use crate::envelope::{self, RequestEnvelope, ServiceRecord};
use crate::registry::{RedisStore, Registry};
use crate::server::{self, json, require_post, status, Reply, Router, ServerGuard};
use crate::Result;

/// Why the registry fallback produced no answer.
enum Fallback {
    /// No stored prefix for the pattern.
    NotFound,
    /// Registry resolved an address but it did not answer.
    Unreachable,
    /// The resolved service took the request but its answer broke off.
    Incomplete,
}

/// Pattern broker. Cheap to clone; clones share cache and registry.
#[derive(Clone, Debug)]
pub struct Broker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cache: CacheHandle<ServiceRecord>,
    registry: Registry,
    forwarder: Forwarder,
}

impl Broker {
    /// Create a broker over `registry`. Must be called inside a tokio runtime.
    pub fn new(registry: Registry, forward_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: CacheHandle::spawn(),
                registry,
                forwarder: Forwarder::new(forward_timeout),
            }),
        }
    }

    /// Connect to the configured redis server and build a broker on it.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let store = RedisStore::connect(&config.redis_connection_url()).await?;
        info!(redis = %config.redis_address, db = config.redis_db, "broker initialised");
        Ok(Self::new(Registry::new(store), config.forward_timeout))
    }

    /// Route table: `/register` and the catch-all proxy at `/`.
    pub fn router(&self) -> Router {
        let register = self.clone();
        let proxy = self.clone();
        Router::new()
            .route("/register", move |request| {
                let broker = register.clone();
                async move { broker.register(request).await }
            })
            .route("/", move |request| {
                let broker = proxy.clone();
                async move { broker.proxy(request).await }
            })
    }

    /// Bind `addr` and serve until the guard is shut down or dropped.
    pub async fn serve(&self, addr: SocketAddr) -> Result<ServerGuard> {
        let listener = TcpListener::bind(addr).await?;
        server::serve(listener, self.router())
    }

    /// Wait until queued cache updates have been applied.
    pub async fn settle(&self) {
        self.inner.cache.settle().await;
    }

    /// Current cache entry covering `pattern`, if any.
    pub async fn cached(&self, pattern: &str) -> Option<(String, ServiceRecord)> {
        self.inner.cache.lookup(pattern).await
    }

    /// Handle `POST /register` with a [`ServiceRecord`] body.
    pub async fn register(&self, request: Request<Bytes>) -> Reply {
        if let Err(reply) = require_post(&request) {
            return reply;
        }
        let record: ServiceRecord = match envelope::decode(request.body()) {
            Ok(record) => record,
            Err(err) => {
                debug!(error = %err, "undecodable registration");
                return status(StatusCode::BAD_REQUEST);
            }
        };

        if let Err(err) = self
            .inner
            .registry
            .set(&record.pattern, &record.service_address)
            .await
        {
            error!(pattern = %record.pattern, error = %err, "failed to persist registration");
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }

        info!(
            pattern = %record.pattern,
            address = %record.service_address,
            "service registered"
        );
        self.inner.cache.insert(record.pattern.clone(), record);
        status(StatusCode::OK)
    }

    /// Handle `POST /` with a [`RequestEnvelope`] body.
    ///
    /// The inbound body is forwarded untouched and the resolved service's
    /// status and body are passed back verbatim.
    pub async fn proxy(&self, request: Request<Bytes>) -> Reply {
        if let Err(reply) = require_post(&request) {
            return reply;
        }
        let body = request.into_body();
        let pattern = match envelope::decode::<RequestEnvelope>(&body) {
            Ok(envelope) if !envelope.pattern.is_empty() => envelope.pattern,
            Ok(_) => {
                debug!("request without pattern");
                return status(StatusCode::BAD_REQUEST);
            }
            Err(err) => {
                debug!(error = %err, "undecodable request");
                return status(StatusCode::BAD_REQUEST);
            }
        };

        let Some((matched, record)) = self.inner.cache.lookup(&pattern).await else {
            debug!(%pattern, "cache miss");
            return match self.forward_via_registry(&pattern, body).await {
                Ok(forwarded) => passthrough(forwarded),
                Err(Fallback::NotFound) => status(StatusCode::NOT_FOUND),
                Err(Fallback::Unreachable | Fallback::Incomplete) => {
                    status(StatusCode::INTERNAL_SERVER_ERROR)
                }
            };
        };

        debug!(%pattern, %matched, address = %record.service_address, "cache hit");
        match self
            .inner
            .forwarder
            .post(&record.service_address, "/", body.clone())
            .await
        {
            Ok(forwarded) => passthrough(forwarded),
            Err(err) if err.is_delivered() => {
                warn!(
                    %pattern,
                    address = %record.service_address,
                    error = %err,
                    "cached service answer incomplete"
                );
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Err(err) => {
                warn!(
                    %pattern,
                    address = %record.service_address,
                    error = %err,
                    "cached service unreachable, evicting"
                );
                self.inner.cache.remove(matched);
                match self.forward_via_registry(&pattern, body).await {
                    Ok(forwarded) => passthrough(forwarded),
                    Err(Fallback::Incomplete) => status(StatusCode::INTERNAL_SERVER_ERROR),
                    Err(Fallback::NotFound | Fallback::Unreachable) => {
                        status(StatusCode::NOT_FOUND)
                    }
                }
            }
        }
    }

    /// Resolve through the registry, forward, and re-warm the cache with the
    /// address that answered.
    async fn forward_via_registry(
        &self,
        pattern: &str,
        body: Bytes,
    ) -> std::result::Result<Forwarded, Fallback> {
        let resolved = self
            .inner
            .registry
            .longest_prefix_lookup(pattern)
            .await
            .ok_or(Fallback::NotFound)?;

        match self.inner.forwarder.post(&resolved.address, "/", body).await {
            Ok(forwarded) => {
                let record = ServiceRecord::new(pattern, resolved.address, String::new());
                self.inner.cache.insert(pattern, record);
                Ok(forwarded)
            }
            Err(err) => {
                warn!(
                    %pattern,
                    matched = %resolved.pattern,
                    address = %resolved.address,
                    error = %err,
                    "registry-resolved service failed"
                );
                if err.is_delivered() {
                    Err(Fallback::Incomplete)
                } else {
                    Err(Fallback::Unreachable)
                }
            }
        }
    }
}

fn passthrough(forwarded: Forwarded) -> Reply {
    json(forwarded.status, forwarded.body)
}
