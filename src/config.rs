//! Start-up parameters for brokers and nodes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Broker parameters.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Address the broker listens on.
    pub bind: SocketAddr,
    /// `host:port` of the redis server.
    pub redis_address: String,
    /// Optional redis password.
    pub redis_password: Option<String>,
    /// Logical redis database index.
    pub redis_db: i64,
    /// Deadline for each forwarding hop. `None` waits indefinitely.
    pub forward_timeout: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            redis_address: "127.0.0.1:6379".to_string(),
            redis_password: None,
            redis_db: 0,
            forward_timeout: None,
        }
    }
}

impl BrokerConfig {
    /// Set the listen address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    /// Set the redis `host:port`.
    pub fn redis_address(mut self, address: impl Into<String>) -> Self {
        self.redis_address = address.into();
        self
    }

    /// Set the redis password.
    pub fn redis_password(mut self, password: impl Into<String>) -> Self {
        self.redis_password = Some(password.into());
        self
    }

    /// Set the redis database index.
    pub fn redis_db(mut self, db: i64) -> Self {
        self.redis_db = db;
        self
    }

    /// Set the per-hop forwarding deadline.
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = Some(timeout);
        self
    }

    /// Connection URL combining address, password and database index.
    pub fn redis_connection_url(&self) -> String {
        match self.redis_password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{password}@{}/{}",
                self.redis_address, self.redis_db
            ),
            None => format!("redis://{}/{}", self.redis_address, self.redis_db),
        }
    }
}

/// Service node parameters.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Address the node listens on.
    pub bind: SocketAddr,
    /// `host:port` advertised to the broker. Defaults to the bound address,
    /// with an unspecified IP replaced by loopback.
    pub advertise: Option<String>,
    /// `host:port` of the broker.
    pub broker: String,
    /// Deadline for each outgoing hop. `None` waits indefinitely.
    pub forward_timeout: Option<Duration>,
}

impl NodeConfig {
    /// Node bound to `bind`, registering with `broker`.
    pub fn new(bind: SocketAddr, broker: impl Into<String>) -> Self {
        Self {
            bind,
            advertise: None,
            broker: broker.into(),
            forward_timeout: None,
        }
    }

    /// Set the advertised `host:port`.
    pub fn advertise(mut self, address: impl Into<String>) -> Self {
        self.advertise = Some(address.into());
        self
    }

    /// Set the per-hop deadline.
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = Some(timeout);
        self
    }

    /// Address to put in the node's service record.
    pub fn advertised_address(&self, bound: SocketAddr) -> String {
        if let Some(address) = &self.advertise {
            return address.clone();
        }
        let ip: IpAddr = match bound {
            SocketAddr::V4(v4) if v4.ip().is_unspecified() => Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(v6) if v6.ip().is_unspecified() => Ipv6Addr::LOCALHOST.into(),
            other => other.ip(),
        };
        SocketAddr::new(ip, bound.port()).to_string()
    }
}
