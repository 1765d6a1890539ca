use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const ONE_DAY: u64 = 24 * 3600;

pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Ssl,
}

impl Protocol {
    #[must_use]
    pub fn code(self) -> char {
        match self {
            Protocol::Tcp => 't',
            Protocol::Ssl => 's',
        }
    }

    #[must_use]
    pub fn from_code(code: char) -> Option<Protocol> {
        match code {
            't' => Some(Protocol::Tcp),
            's' => Some(Protocol::Ssl),
            _ => None,
        }
    }

    #[must_use]
    pub fn text(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Ssl => "SSL",
        }
    }
}

/// The run-time state of a server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(skip)]
    pub banner: String,
    #[serde(skip)]
    pub donation_address: String,
    pub last_try: u64,
    pub last_good: u64,
    pub last_blacklisted: u64,
    #[serde(skip)]
    pub retry_delay: u64,
}

impl ServerState {
    #[must_use]
    pub fn is_blacklisted(&self, now: u64) -> bool {
        self.last_blacklisted > now.saturating_sub(ONE_DAY)
    }

    #[must_use]
    pub fn can_retry(&self, now: u64) -> bool {
        !self.is_blacklisted(now) && self.last_try + self.retry_delay <= now
    }

    /// Doubles the backoff ahead of a reconnect attempt. Starting from
    /// zero the sequence runs 10, 21, 43, 87, 175, 351, 600, 600, ...
    pub fn bump_retry_delay(&mut self) {
        self.retry_delay = (self.retry_delay * 2 + 1).clamp(10, 600);
    }
}

/// A smart wrapper around a (host, port, protocol) identity. Instances
/// are interned by the registry: equal identities are the same `Arc`.
#[derive(Debug)]
pub struct SvServer {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub state: Mutex<ServerState>,
}

pub(crate) type ServerKey = (String, u16, Protocol);

impl SvServer {
    fn new(host: String, port: u16, protocol: Protocol) -> Self {
        SvServer {
            host,
            port,
            protocol,
            state: Mutex::new(ServerState::default()),
        }
    }

    pub(crate) fn key(&self) -> ServerKey {
        (self.host.clone(), self.port, self.protocol)
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state.lock().unwrap().clone()
    }
}

impl fmt::Display for SvServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.protocol.code())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerSpecError {
    #[error("bad host: {0:?}")]
    BadHost(String),
    #[error("bad port: {0:?}")]
    BadPort(String),
    #[error("unknown protocol: {0:?}")]
    BadProtocol(String),
}

/// The set of every server this network instance has ever heard of,
/// interned so identity comparisons are pointer comparisons.
#[derive(Default)]
pub struct ServerRegistry {
    servers: Mutex<HashMap<ServerKey, Arc<SvServer>>>,
}

impl ServerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the interned instance for the identity, creating it on
    /// first sight.
    pub fn unique(
        &self,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> Result<Arc<SvServer>, ServerSpecError> {
        if host.is_empty() {
            return Err(ServerSpecError::BadHost(host.to_string()));
        }
        let key = (host.to_string(), port, protocol);
        let mut servers = self.servers.lock().unwrap();
        Ok(servers
            .entry(key)
            .or_insert_with(|| Arc::new(SvServer::new(host.to_string(), port, protocol)))
            .clone())
    }

    /// As `unique`, with the port as a decimal string and the protocol as
    /// its single-character code.
    pub fn unique_from_parts(
        &self,
        host: &str,
        port: &str,
        protocol: &str,
    ) -> Result<Arc<SvServer>, ServerSpecError> {
        let port: u16 = port
            .parse()
            .map_err(|_| ServerSpecError::BadPort(port.to_string()))?;
        let mut chars = protocol.chars();
        let protocol = match (chars.next().and_then(Protocol::from_code), chars.next()) {
            (Some(p), None) => p,
            _ => return Err(ServerSpecError::BadProtocol(protocol.to_string())),
        };
        self.unique(host, port, protocol)
    }

    /// Parses the canonical "host:port:protocol" form.
    pub fn from_string(&self, s: &str) -> Result<Arc<SvServer>, ServerSpecError> {
        let mut parts = s.splitn(3, ':');
        let host = parts.next().unwrap_or("");
        let port = parts.next().unwrap_or("");
        let protocol = parts.next().unwrap_or("");
        self.unique_from_parts(host, port, protocol)
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<SvServer>> {
        self.servers.lock().unwrap().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat list of (host, port, protocol, state) for the external config
    /// store.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let servers = self.servers.lock().unwrap();
        let mut entries: Vec<Value> = servers
            .values()
            .map(|server| {
                let state = serde_json::to_value(server.state.lock().unwrap().clone())
                    .unwrap_or(Value::Null);
                Value::Array(vec![
                    Value::from(server.host.clone()),
                    Value::from(server.port),
                    Value::from(server.protocol.code().to_string()),
                    state,
                ])
            })
            .collect();
        entries.sort_by_key(|v| v[0].as_str().map(str::to_owned));
        Value::Array(entries)
    }

    /// Reconstitutes servers saved by `to_json`, overwriting the state of
    /// any already-interned entries.
    pub fn load_json(&self, value: &Value) -> Result<usize, ServerSpecError> {
        let entries = match value.as_array() {
            Some(entries) => entries,
            None => return Ok(0),
        };
        let mut count = 0;
        for entry in entries {
            let (host, port, protocol, state) = match (
                entry.get(0).and_then(Value::as_str),
                entry.get(1).and_then(Value::as_u64),
                entry.get(2).and_then(Value::as_str),
                entry.get(3),
            ) {
                (Some(h), Some(p), Some(c), Some(s)) => (h, p, c, s),
                _ => continue,
            };
            let port = u16::try_from(port)
                .map_err(|_| ServerSpecError::BadPort(port.to_string()))?;
            let server = self.unique_from_parts(host, &port.to_string(), protocol)?;
            if let Ok(state) = serde_json::from_value::<ServerState>(state.clone()) {
                let mut current = server.state.lock().unwrap();
                current.last_try = state.last_try;
                current.last_good = state.last_good;
                current.last_blacklisted = state.last_blacklisted;
            }
            count += 1;
        }
        Ok(count)
    }
}

/// A SOCKS proxy in front of every connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
    pub auth: Option<UserAuth>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    Socks4a,
    Socks5,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAuth {
    pub username: String,
    pub password: String,
}

impl Proxy {
    /// Parses the "kind:host:port:username:password" config form; the
    /// auth fields may be empty.
    #[must_use]
    pub fn from_string(s: &str) -> Option<Proxy> {
        let parts: Vec<&str> = s.splitn(5, ':').collect();
        if parts.len() < 3 {
            return None;
        }
        let kind = match parts[0].to_uppercase().as_str() {
            "SOCKS4" => ProxyKind::Socks4a,
            "SOCKS5" => ProxyKind::Socks5,
            _ => return None,
        };
        let port: u16 = parts[2].parse().ok()?;
        let auth = match (parts.get(3), parts.get(4)) {
            (Some(user), Some(pass)) if !user.is_empty() => Some(UserAuth {
                username: (*user).to_string(),
                password: (*pass).to_string(),
            }),
            _ => None,
        };
        Some(Proxy {
            host: parts[1].to_string(),
            port,
            kind,
            auth,
        })
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ProxyKind::Socks4a => "SOCKS4",
            ProxyKind::Socks5 => "SOCKS5",
        };
        write!(f, "{}:{}:{}", kind, self.host, self.port)
    }
}
