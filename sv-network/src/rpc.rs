//! Newline-delimited JSON-RPC 2.0 over TCP, TLS or a SOCKS proxy.
//! Requests are correlated by a per-connection id sequence; notifications
//! are queued for the session to dispatch sequentially.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::socks4::Socks4Stream;
use tokio_socks::tcp::socks5::Socks5Stream;

use crate::error::SessionError;
use crate::server::{Protocol, Proxy, ProxyKind, SvServer};

pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A server-initiated message; never answered.
#[derive(Debug)]
pub(crate) struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Debug)]
struct RpcFailure {
    code: i64,
    message: String,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcFailure>>>>>;

pub(crate) struct RpcConnection {
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn Transport>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    last_send: Mutex<Instant>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl RpcConnection {
    /// Establishes the transport for a server, optionally through a SOCKS
    /// proxy, wrapping in TLS for SSL servers.
    pub(crate) async fn connect(
        server: &SvServer,
        proxy: Option<&Proxy>,
    ) -> Result<RpcConnection, io::Error> {
        let host = server.host.as_str();
        let port = server.port;

        let stream: Box<dyn Transport> = match proxy {
            None => Box::new(TcpStream::connect((host, port)).await?),
            Some(proxy) => {
                let proxy_addr = (proxy.host.as_str(), proxy.port);
                match (proxy.kind, &proxy.auth) {
                    (ProxyKind::Socks5, None) => Box::new(
                        Socks5Stream::connect(proxy_addr, (host, port))
                            .await
                            .map_err(socks_error)?,
                    ),
                    (ProxyKind::Socks5, Some(auth)) => Box::new(
                        Socks5Stream::connect_with_password(
                            proxy_addr,
                            (host, port),
                            &auth.username,
                            &auth.password,
                        )
                        .await
                        .map_err(socks_error)?,
                    ),
                    (ProxyKind::Socks4a, _) => Box::new(
                        Socks4Stream::connect(proxy_addr, (host, port))
                            .await
                            .map_err(socks_error)?,
                    ),
                }
            }
        };

        let stream: Box<dyn Transport> = match server.protocol {
            Protocol::Tcp => stream,
            Protocol::Ssl => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Box::new(tls_connector().connect(name, stream).await?)
            }
        };

        Ok(Self::from_transport(stream))
    }

    pub(crate) fn from_transport(stream: Box<dyn Transport>) -> RpcConnection {
        let (read, write) = tokio::io::split(stream);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let reader = tokio::spawn(read_loop(
            read,
            pending.clone(),
            notif_tx,
            closed_tx.clone(),
        ));

        RpcConnection {
            writer: tokio::sync::Mutex::new(write),
            pending,
            next_id: AtomicU64::new(0),
            last_send: Mutex::new(Instant::now()),
            notifications: Mutex::new(Some(notif_rx)),
            closed_tx,
            closed_rx,
            reader,
        }
    }

    /// The queue of server notifications; taken once by the session.
    pub(crate) fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.lock().unwrap().take()
    }

    pub(crate) fn last_send(&self) -> Instant {
        *self.last_send.lock().unwrap()
    }

    pub(crate) async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(failure)) => Err(SessionError::Rpc {
                code: failure.code,
                message: failure.message,
            }),
            Err(_) => Err(connection_lost()),
        }
    }

    /// Sends every request in one frame and awaits every response. Any
    /// member error fails the whole batch.
    pub(crate) async fn send_batch(
        &self,
        requests: &[(&str, Value)],
    ) -> Result<Vec<Value>, SessionError> {
        let mut frames = Vec::with_capacity(requests.len());
        let mut receivers = Vec::with_capacity(requests.len());
        {
            let mut pending = self.pending.lock().unwrap();
            for (method, params) in requests {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                pending.insert(id, tx);
                receivers.push((id, rx));
                frames.push(json!({
                    "jsonrpc": "2.0", "id": id, "method": method, "params": params,
                }));
            }
        }

        if let Err(e) = self.write_frame(&Value::Array(frames)).await {
            let mut pending = self.pending.lock().unwrap();
            for (id, _) in &receivers {
                pending.remove(id);
            }
            return Err(e);
        }

        let mut results = Vec::with_capacity(receivers.len());
        for (_, rx) in receivers {
            match rx.await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(failure)) => {
                    return Err(SessionError::Batch(failure.message));
                }
                Err(_) => return Err(connection_lost()),
            }
        }
        Ok(results)
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), SessionError> {
        let mut line = serde_json::to_string(frame)
            .map_err(|e| SessionError::Transport(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        *self.last_send.lock().unwrap() = Instant::now();
        Ok(())
    }

    /// Resolves when the transport is gone, whichever side closed it.
    pub(crate) fn closed(&self) -> impl Future<Output = ()> {
        let mut rx = self.closed_rx.clone();
        async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub(crate) async fn close(&self) {
        let _ = self.closed_tx.send(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.reader.abort();
        self.pending.lock().unwrap().clear();
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    read: ReadHalf<Box<dyn Transport>>,
    pending: PendingMap,
    notifications: mpsc::UnboundedSender<Notification>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(Value::Array(items)) => {
                        for item in items {
                            dispatch_message(&pending, &notifications, item);
                        }
                    }
                    Ok(item) => dispatch_message(&pending, &notifications, item),
                    Err(e) => {
                        warn!("undecodable frame from server: {e}");
                        break;
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    let _ = closed.send(true);
    // Dropping the senders wakes every in-flight request with an error.
    pending.lock().unwrap().clear();
}

fn dispatch_message(
    pending: &PendingMap,
    notifications: &mpsc::UnboundedSender<Notification>,
    item: Value,
) {
    if item.get("method").is_some() && item.get("id").is_none() {
        let method = item
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = item.get("params").cloned().unwrap_or(Value::Null);
        let _ = notifications.send(Notification { method, params });
        return;
    }

    let id = match item.get("id").and_then(Value::as_u64) {
        Some(id) => id,
        None => {
            debug!("response without a usable id: {item}");
            return;
        }
    };
    let sender = match pending.lock().unwrap().remove(&id) {
        Some(sender) => sender,
        None => {
            debug!("response for unknown request id {id}");
            return;
        }
    };

    let outcome = match item.get("error") {
        Some(error) if !error.is_null() => Err(RpcFailure {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string()),
        }),
        _ => Ok(item.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = sender.send(outcome);
}

fn connection_lost() -> SessionError {
    SessionError::Transport(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "connection lost",
    ))
}

fn socks_error(e: tokio_socks::Error) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, e)
}

/// One TLS client config per process, rooted in the platform trust store.
fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                roots.add_parsable_certificates(certs);
            }
            Err(e) => warn!("failed to load platform CA bundle: {e}"),
        }
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(config.clone())
}

/// Applies a deadline, mapping expiry to the session timeout error.
pub(crate) async fn timeout_after<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(duration)),
    }
}
