use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use nano_mesh::envelope::{self, RequestEnvelope, ResponseEnvelope};
use nano_mesh::{
    ActClient, Broker, Error, Forwarded, Forwarder, MemoryStore, NodeConfig, NodeGuard, Registry,
    ServerGuard, ServiceNode, ServiceRecord, Store,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const SUM: &str = "role:math,cmd:sum";
const SUM_ZERO: &str = "role:math,cmd:sum,return:zero";

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Start a broker over `store` on an ephemeral port.
async fn start_broker(store: impl Store) -> (Broker, ServerGuard) {
    let broker = Broker::new(Registry::new(store), None);
    let guard = broker.serve(localhost()).await.expect("broker should bind");
    (broker, guard)
}

/// Start a node under `pattern` whose handler answers with `reply`.
async fn start_node(broker: &ServerGuard, pattern: &str, reply: &'static [u8]) -> NodeGuard {
    ServiceNode::new(NodeConfig::new(localhost(), broker.local_addr().to_string()))
        .add(pattern, move |_body: Bytes| async move {
            Ok::<_, Error>(Bytes::from_static(reply))
        })
        .await
        .expect("node should register")
}

/// Start a node under `pattern` that echoes the envelope payload back.
async fn start_echo_node(broker: &ServerGuard, pattern: &str) -> NodeGuard {
    ServiceNode::new(NodeConfig::new(localhost(), broker.local_addr().to_string()))
        .add(pattern, |body: Bytes| async move {
            let request: RequestEnvelope = envelope::decode(&body)?;
            Ok::<_, Error>(request.payload)
        })
        .await
        .expect("node should register")
}

async fn post(address: SocketAddr, body: impl Into<Bytes>) -> Forwarded {
    timeout(
        Duration::from_secs(5),
        Forwarder::default().post(&address.to_string(), "/", body.into()),
    )
    .await
    .expect("request timed out")
    .expect("request failed")
}

/// Register `record` through the broker's `/register` endpoint.
async fn register(broker: &ServerGuard, record: &ServiceRecord) {
    let answer = Forwarder::default()
        .post(
            &broker.local_addr().to_string(),
            "/register",
            envelope::encode(record).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(answer.status, StatusCode::OK);
}

/// Read one request head plus its content-length body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }
}

/// Raw HTTP service. The first `whole` requests get `answer(own_address)` in
/// full; every later one gets headers promising 100 bytes and only a few of
/// them. Returns the address and how many requests it has executed.
async fn cut_short_service<F>(whole: usize, answer: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(&str) -> Vec<u8> + Send + 'static,
{
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let executions = Arc::new(AtomicUsize::new(0));

    let own = address.clone();
    let count = executions.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            read_request(&mut socket).await;
            let seen = count.fetch_add(1, Ordering::SeqCst);
            let response = if seen < whole {
                let body = answer(&own);
                let mut response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(&body);
                response
            } else {
                b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial".to_vec()
            };
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        }
    });
    (address, executions)
}

fn broker_request(pattern: &str, payload: &'static [u8]) -> Bytes {
    envelope::encode(&RequestEnvelope::new(pattern, payload).broker_request(true)).unwrap()
}

/// Store that refuses every operation.
struct Broken;

#[async_trait]
impl Store for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn get(&self, _key: &str) -> nano_mesh::Result<Option<String>> {
        Err(Error::Store("unavailable".into()))
    }

    async fn set(&self, _key: &str, _value: &str) -> nano_mesh::Result<()> {
        Err(Error::Store("unavailable".into()))
    }
}

#[test_log::test(tokio::test)]
async fn proxy_forwards_payload_unchanged() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let node = ServiceNode::new(NodeConfig::new(
        localhost(),
        broker_guard.local_addr().to_string(),
    ))
    .add(SUM, |body: Bytes| async move { Ok::<_, Error>(body) })
    .await
    .unwrap();
    assert_eq!(node.record().pattern, SUM);
    assert_eq!(node.record().service_address, node.local_addr().to_string());

    let body: &'static [u8] = br#"{"Pattern":"role:math,cmd:sum","Left":1,"Right":2}"#;
    let answer = post(broker_guard.local_addr(), body).await;
    assert_eq!(answer.status, StatusCode::OK);
    assert_eq!(&answer.body[..], body);
}

#[test_log::test(tokio::test)]
async fn unregistered_pattern_is_not_found() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let _node = start_node(&broker_guard, SUM, b"{}").await;

    let answer = post(
        broker_guard.local_addr(),
        r#"{"Pattern":"role:weather,cmd:forecast"}"#,
    )
    .await;
    assert_eq!(answer.status, StatusCode::NOT_FOUND);
}

#[test_log::test(tokio::test)]
async fn longer_pattern_routes_to_registered_prefix() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let _node = start_node(&broker_guard, SUM, br#"{"Result":0}"#).await;

    let answer = post(
        broker_guard.local_addr(),
        r#"{"Pattern":"role:math,cmd:sum,return:zero"}"#,
    )
    .await;
    assert_eq!(answer.status, StatusCode::OK);
    assert_eq!(&answer.body[..], br#"{"Result":0}"#);
}

#[test_log::test(tokio::test)]
async fn most_specific_registration_wins() {
    let store = MemoryStore::new();
    let (_broker, broker_guard) = start_broker(store.clone()).await;
    let _generic = start_node(&broker_guard, SUM, b"generic").await;
    let _zero = start_node(&broker_guard, SUM_ZERO, br#"{"Result":0}"#).await;

    // Cached resolution on the registering broker, then durable resolution
    // on a fresh broker over the same store.
    let (_fresh, fresh_guard) = start_broker(store).await;
    for guard in [&broker_guard, &fresh_guard] {
        let zero = post(guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum,return:zero"}"#).await;
        assert_eq!(&zero.body[..], br#"{"Result":0}"#);

        let plain = post(guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
        assert_eq!(&plain.body[..], b"generic");

        let other = post(guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum,return:one"}"#).await;
        assert_eq!(&other.body[..], b"generic");
    }
}

#[test_log::test(tokio::test)]
async fn cut_short_answer_is_server_error_and_not_redelivered() {
    let store = MemoryStore::new();
    let (broker, broker_guard) = start_broker(store.clone()).await;
    let (address, executions) = cut_short_service(0, |_| Vec::new()).await;
    register(
        &broker_guard,
        &ServiceRecord::new(SUM, address, broker_guard.local_addr().to_string()),
    )
    .await;

    // Cached address.
    let answer = post(broker_guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    broker.settle().await;
    assert!(broker.cached(SUM).await.is_some(), "answering service kept");

    // Registry-resolved address.
    let (_fresh, fresh_guard) = start_broker(store).await;
    let answer = post(fresh_guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn service_status_is_passed_through() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let _node = ServiceNode::new(NodeConfig::new(
        localhost(),
        broker_guard.local_addr().to_string(),
    ))
    .add(SUM, |_body: Bytes| async move {
        Err::<Bytes, _>(Error::handler("parsing error"))
    })
    .await
    .unwrap();

    let answer = post(broker_guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[test_log::test(tokio::test)]
async fn broker_request_reveals_serving_node() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let node = start_echo_node(&broker_guard, SUM).await;

    let answer = post(broker_guard.local_addr(), broker_request(SUM, b"hello")).await;
    assert_eq!(answer.status, StatusCode::OK);

    let response: ResponseEnvelope = envelope::decode(&answer.body).unwrap();
    assert_eq!(response.service.pattern, SUM);
    assert_eq!(response.service.service_address, node.record().service_address);
    assert_eq!(
        response.service.broker_address,
        broker_guard.local_addr().to_string()
    );
    assert_eq!(&response.payload[..], b"hello");
}

#[test_log::test(tokio::test)]
async fn stale_cache_falls_back_to_registry_and_is_repaired() {
    // Two brokers share one durable store; only the first caches node A.
    let store = MemoryStore::new();
    let (broker, broker_guard) = start_broker(store.clone()).await;
    let (_other, other_guard) = start_broker(store.clone()).await;

    let node_a = start_node(&broker_guard, SUM, b"from-a").await;
    broker.settle().await;
    let (_, cached) = broker.cached(SUM).await.expect("registration warms cache");
    assert_eq!(cached.service_address, node_a.record().service_address);

    // Successor registers through the other broker, then A goes away.
    let node_b = start_node(&other_guard, SUM, b"from-b").await;
    assert_eq!(store.len().await, 1);
    node_a.shutdown().await.unwrap();

    let answer = post(broker_guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
    assert_eq!(answer.status, StatusCode::OK);
    assert_eq!(&answer.body[..], b"from-b");

    broker.settle().await;
    let (key, repaired) = broker.cached(SUM).await.expect("cache repaired");
    assert_eq!(key, SUM);
    assert_eq!(repaired.service_address, node_b.record().service_address);

    // Next call goes straight to B through the repaired cache.
    let answer = post(broker_guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
    assert_eq!(&answer.body[..], b"from-b");
}

#[test_log::test(tokio::test)]
async fn stale_cache_with_dead_registry_address_is_not_found() {
    let (broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let node = start_node(&broker_guard, SUM, b"{}").await;
    node.shutdown().await.unwrap();

    let answer = post(broker_guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
    assert_eq!(answer.status, StatusCode::NOT_FOUND);

    broker.settle().await;
    assert!(broker.cached(SUM).await.is_none(), "stale entry evicted");
}

#[test_log::test(tokio::test)]
async fn registry_address_unreachable_on_cache_miss_is_server_error() {
    let store = MemoryStore::new();
    let dead = {
        let listener = tokio::net::TcpListener::bind(localhost()).await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    store.set(SUM, &dead).await.unwrap();
    let (_broker, broker_guard) = start_broker(store).await;

    let answer = post(broker_guard.local_addr(), r#"{"Pattern":"role:math,cmd:sum"}"#).await;
    assert_eq!(answer.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[test_log::test(tokio::test)]
async fn act_learns_responder_through_broker() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let sum = start_echo_node(&broker_guard, SUM).await;
    let caller = start_node(&broker_guard, "role:math,cmd:positive", b"{}").await;
    let client = caller.client();

    let payload = timeout(
        Duration::from_secs(5),
        client.act(broker_request(SUM, b"1+2"), SUM),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&payload[..], b"1+2");

    client.settle().await;
    let (key, record) = client.cached(SUM).await.expect("responder cached");
    assert_eq!(key, SUM);
    assert_eq!(record.service_address, sum.record().service_address);
    assert_eq!(record.broker_address, broker_guard.local_addr().to_string());
}

#[test_log::test(tokio::test)]
async fn act_falls_back_to_records_broker_then_updates_cache() {
    // The node trusts the first broker; the client only knows the second.
    let store = MemoryStore::new();
    let (_home, home_guard) = start_broker(store.clone()).await;
    let (_local, local_guard) = start_broker(store.clone()).await;
    let first = start_echo_node(&home_guard, SUM).await;
    let client = ActClient::new(local_guard.local_addr().to_string(), Forwarder::default());

    client.act(broker_request(SUM, b"x"), SUM).await.unwrap();
    client.settle().await;
    let (_, record) = client.cached(SUM).await.unwrap();
    assert_eq!(record.service_address, first.record().service_address);
    assert_eq!(record.broker_address, home_guard.local_addr().to_string());

    // Only the record's broker is left to ask.
    first.shutdown().await.unwrap();
    local_guard.shutdown().await.unwrap();
    let second = start_echo_node(&home_guard, SUM).await;

    let payload = timeout(
        Duration::from_secs(5),
        client.act(broker_request(SUM, b"y"), SUM),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&payload[..], b"y");

    client.settle().await;
    assert_eq!(
        client.cached(SUM).await.unwrap().1.service_address,
        second.record().service_address
    );
}

#[test_log::test(tokio::test)]
async fn act_drops_superseded_entry_on_refresh() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let generic = start_echo_node(&broker_guard, SUM).await;
    let client = ActClient::new(broker_guard.local_addr().to_string(), Forwarder::default());

    // Learned under the generic node's own pattern.
    client.act(broker_request(SUM_ZERO, b"x"), SUM_ZERO).await.unwrap();
    client.settle().await;
    assert_eq!(client.cached(SUM_ZERO).await.unwrap().0, SUM);

    generic.shutdown().await.unwrap();
    let specific = start_echo_node(&broker_guard, SUM_ZERO).await;

    let payload = client.act(broker_request(SUM_ZERO, b"y"), SUM_ZERO).await.unwrap();
    assert_eq!(&payload[..], b"y");

    client.settle().await;
    let (key, record) = client.cached(SUM_ZERO).await.unwrap();
    assert_eq!(key, SUM_ZERO);
    assert_eq!(record.service_address, specific.record().service_address);
    assert!(client.cached(SUM).await.is_none(), "dead entry left behind");
}

#[test_log::test(tokio::test)]
async fn act_evicts_when_service_and_broker_both_fail() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let node = start_echo_node(&broker_guard, SUM).await;
    let client = ActClient::new(broker_guard.local_addr().to_string(), Forwarder::default());

    client.act(broker_request(SUM, b"x"), SUM).await.unwrap();
    client.settle().await;
    assert!(client.cached(SUM).await.is_some());

    node.shutdown().await.unwrap();
    broker_guard.shutdown().await.unwrap();

    let err = client.act(broker_request(SUM, b"x"), SUM).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {err}");

    client.settle().await;
    assert!(client.cached(SUM).await.is_none());
}

#[test_log::test(tokio::test)]
async fn act_does_not_retry_cut_short_answer() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let broker_address = broker_guard.local_addr().to_string();
    let home = broker_address.clone();
    let (address, executions) = cut_short_service(1, move |own| {
        let answer = ResponseEnvelope {
            service: ServiceRecord::new(SUM, own, home.clone()),
            payload: Bytes::from_static(b"3"),
        };
        envelope::encode(&answer).unwrap().to_vec()
    })
    .await;
    register(
        &broker_guard,
        &ServiceRecord::new(SUM, address.clone(), broker_address.clone()),
    )
    .await;
    let client = ActClient::new(broker_address, Forwarder::default());

    let payload = client.act(broker_request(SUM, b"1+2"), SUM).await.unwrap();
    assert_eq!(&payload[..], b"3");
    client.settle().await;
    assert_eq!(client.cached(SUM).await.unwrap().1.service_address, address);

    let err = client.act(broker_request(SUM, b"1+2"), SUM).await.unwrap_err();
    assert!(err.is_delivered(), "unexpected error: {err}");
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    client.settle().await;
    assert!(client.cached(SUM).await.is_some());
}

#[test_log::test(tokio::test)]
async fn act_with_unknown_pattern_reports_status() {
    let (_broker, broker_guard) = start_broker(MemoryStore::new()).await;
    let client = ActClient::new(broker_guard.local_addr().to_string(), Forwarder::default());

    let err = client
        .act(broker_request("role:weather,cmd:forecast", b""), "role:weather,cmd:forecast")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Status(StatusCode::NOT_FOUND)));
}

#[test_log::test(tokio::test)]
async fn registration_failure_is_returned_not_fatal() {
    let (_broker, broker_guard) = start_broker(Broken).await;
    let result = ServiceNode::new(NodeConfig::new(
        localhost(),
        broker_guard.local_addr().to_string(),
    ))
    .add(SUM, |body: Bytes| async move { Ok::<_, Error>(body) })
    .await;

    match result {
        Err(Error::Registration { status }) => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR)
        }
        other => panic!("expected registration error, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn registration_without_broker_fails() {
    let dead = {
        let listener = tokio::net::TcpListener::bind(localhost()).await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let result = ServiceNode::new(NodeConfig::new(localhost(), dead))
        .add(SUM, |body: Bytes| async move { Ok::<_, Error>(body) })
        .await;
    assert!(result.unwrap_err().is_transport());
}
