//! Outgoing HTTP hops: forwarding envelopes to nodes and brokers.

use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::{Error, Result};

/// Status and body returned by a downstream hop.
#[derive(Debug, Clone)]
pub struct Forwarded {
    /// Status line of the answer.
    pub status: StatusCode,
    /// Full response body.
    pub body: Bytes,
}

/// Pooled HTTP client used for every forwarding hop.
///
/// Without a timeout a hung downstream blocks the caller until the
/// connection drops.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Forwarder {
    /// Create a forwarder with an optional per-hop deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }

    /// POST a JSON body to `http://{address}{path}` and collect the answer.
    ///
    /// Failing to get response headers, including the deadline passing
    /// first, is a transport error. Once headers have arrived the request
    /// counts as delivered, so a body that breaks off or outlives the
    /// deadline is [`Error::Body`] instead. Non-2xx answers are not errors.
    pub async fn post(&self, address: &str, path: &str, body: Bytes) -> Result<Forwarded> {
        let uri: Uri = format!("http://{address}{path}").parse()?;
        let request = Request::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))?;
        let deadline = self.timeout.map(|limit| (limit, Instant::now() + limit));

        let response = match deadline {
            Some((limit, at)) => time::timeout_at(at, self.client.request(request))
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => self.client.request(request).await?,
        };
        let status = response.status();

        let collect = response.into_body().collect();
        let body = match deadline {
            Some((_, at)) => time::timeout_at(at, collect)
                .await
                .map_err(|elapsed| Error::Body(elapsed.into()))?,
            None => collect.await,
        }
        .map_err(|err| Error::Body(err.into()))?
        .to_bytes();

        debug!(%address, %path, %status, "hop answered");
        Ok(Forwarded { status, body })
    }
}
