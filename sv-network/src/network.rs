//! The top-level supervisor: owns the connection fleet, elects and
//! switches the main server, watches for lagging sessions and main-chain
//! reorgs, and runs the per-wallet maintainers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};

use sv_types::Net;

use crate::config::NetworkOptions;
use crate::error::{broadcast_failure_reason, SessionError};
use crate::rpc::RpcConnection;
use crate::server::{unix_time, Protocol, Proxy, ServerKey, ServerRegistry, SvServer};
use crate::session::{ProtocolVersion, SvSession};
use crate::store::{ChainId, HeaderStore};
use crate::subscriptions::{SubscriptionTable, WalletRef};
use crate::sync::SyncState;
use crate::wallet::{maintain_wallet, Wallet};

const LAGGING_TICK: Duration = Duration::from_secs(20);
const SERVER_POLL: Duration = Duration::from_secs(10);
const SESSION_COUNT: u64 = 10;

/// Why the main server was changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchReason {
    Disconnected,
    Lagging,
    UserSet,
}

impl fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwitchReason::Disconnected => "disconnected",
            SwitchReason::Lagging => "lagging",
            SwitchReason::UserSet => "user_set",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub enum NetworkEvent {
    Sessions,
    Status,
    Banner,
    Updated,
    MainChain {
        old: Option<ChainId>,
        new: ChainId,
    },
    NewTransaction {
        tx_hex: String,
        wallet: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Sessions,
    Status,
    Banner,
    Updated,
    MainChain,
    NewTransaction,
}

impl NetworkEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            NetworkEvent::Sessions => EventKind::Sessions,
            NetworkEvent::Status => EventKind::Status,
            NetworkEvent::Banner => EventKind::Banner,
            NetworkEvent::Updated => EventKind::Updated,
            NetworkEvent::MainChain { .. } => EventKind::MainChain,
            NetworkEvent::NewTransaction { .. } => EventKind::NewTransaction,
        }
    }
}

pub type Callback = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

pub(crate) enum WalletJob {
    Add(WalletRef),
    Remove(u64),
    UndoVerifications(u64),
}

pub(crate) struct NetworkInner {
    pub(crate) options: NetworkOptions,
    pub(crate) store: Arc<dyn HeaderStore>,
    pub(crate) registry: ServerRegistry,
    pub(crate) subs: Arc<SubscriptionTable>,
    pub(crate) sync: Arc<SyncState>,
    sessions: Mutex<Vec<Arc<SvSession>>>,
    chosen_servers: Mutex<HashSet<ServerKey>>,
    main_server: Mutex<Option<Arc<SvServer>>>,
    proxy: Mutex<Option<Proxy>>,
    auto_connect: AtomicBool,
    stopped: AtomicBool,
    pub(crate) sessions_changed: Notify,
    check_main_chain: Notify,
    stop_network: Notify,
    wallet_jobs: mpsc::UnboundedSender<WalletJob>,
    jobs_rx: Mutex<Option<mpsc::UnboundedReceiver<WalletJob>>>,
    wallet_tasks: Mutex<HashMap<u64, (WalletRef, JoinHandle<()>)>>,
    callbacks: Mutex<Vec<(u64, Vec<EventKind>, Callback)>>,
    next_callback_id: AtomicU64,
    next_wallet_id: AtomicU64,
}

impl NetworkInner {
    pub(crate) fn main_server(&self) -> Option<Arc<SvServer>> {
        self.main_server.lock().unwrap().clone()
    }

    pub(crate) fn is_main_server(&self, server: &Arc<SvServer>) -> bool {
        match self.main_server.lock().unwrap().as_ref() {
            Some(main) => Arc::ptr_eq(main, server),
            None => false,
        }
    }

    pub(crate) fn sessions_snapshot(&self) -> Vec<Arc<SvSession>> {
        self.sessions.lock().unwrap().clone()
    }

    /// The session connected to the main server, if any.
    pub(crate) fn main_session(&self) -> Option<Arc<SvSession>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .iter()
            .find(|session| self.is_main_server(&session.server))
            .cloned()
    }

    /// Waits until a main session exists.
    pub(crate) async fn main_session_wait(&self) -> Arc<SvSession> {
        loop {
            let changed = self.sessions_changed.notified();
            if let Some(session) = self.main_session() {
                return session;
            }
            changed.await;
        }
    }

    pub(crate) fn auto_connect(&self) -> bool {
        self.auto_connect.load(Ordering::Relaxed)
    }

    pub(crate) fn trigger_callback(&self, event: &NetworkEvent) {
        // Invoke on a snapshot so a callback cannot re-enter the registry
        // under the lock.
        let snapshot: Vec<Callback> = {
            let callbacks = self.callbacks.lock().unwrap();
            callbacks
                .iter()
                .filter(|(_, kinds, _)| kinds.contains(&event.kind()))
                .map(|(_, _, callback)| callback.clone())
                .collect()
        };
        for callback in snapshot {
            callback(event);
        }
    }

    fn note_check_main_chain(&self) {
        self.check_main_chain.notify_one();
    }

    async fn cleanup_sessions(&self) {
        let sessions: Vec<Arc<SvSession>> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain(..).collect()
        };
        for session in &sessions {
            session.close().await;
        }
        self.chosen_servers.lock().unwrap().clear();
        if !sessions.is_empty() {
            self.sessions_changed.notify_waiters();
            self.trigger_callback(&NetworkEvent::Sessions);
        }
    }
}

/// The capability surface a session gets instead of the whole network; a
/// weak reference, so sessions never keep the network alive.
#[derive(Clone)]
pub(crate) struct NetHandle(Weak<NetworkInner>);

impl NetHandle {
    pub(crate) fn new(inner: &Arc<NetworkInner>) -> NetHandle {
        NetHandle(Arc::downgrade(inner))
    }

    /// Adds an established session to the fleet. Returns whether it is
    /// the main session.
    pub(crate) fn session_established(&self, session: &Arc<SvSession>) -> bool {
        let Some(inner) = self.0.upgrade() else {
            return false;
        };
        inner.sessions.lock().unwrap().push(session.clone());
        inner.sessions_changed.notify_waiters();
        inner.trigger_callback(&NetworkEvent::Sessions);
        if inner.is_main_server(&session.server) {
            inner.trigger_callback(&NetworkEvent::Status);
            true
        } else {
            false
        }
    }

    pub(crate) fn session_closed(&self, session: &Arc<SvSession>) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        {
            let mut sessions = inner.sessions.lock().unwrap();
            sessions.retain(|existing| !Arc::ptr_eq(existing, session));
        }
        inner.sessions_changed.notify_waiters();
        if inner.is_main_server(&session.server) {
            inner.trigger_callback(&NetworkEvent::Status);
        }
        inner.trigger_callback(&NetworkEvent::Sessions);
    }

    pub(crate) fn note_check_main_chain(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.note_check_main_chain();
        }
    }

    pub(crate) fn trigger_banner(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.trigger_callback(&NetworkEvent::Banner);
        }
    }

    /// Interns a peer-advertised server identity.
    pub(crate) fn intern_peer(&self, host: &str, port: u16, protocol: Protocol) -> bool {
        match self.0.upgrade() {
            Some(inner) => inner.registry.unique(host, port, protocol).is_ok(),
            None => false,
        }
    }
}

/// Manages a set of connections to remote Electrum servers. All
/// operations are asynchronous.
pub struct Network {
    inner: Arc<NetworkInner>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    #[must_use]
    pub fn new(store: Arc<dyn HeaderStore>, options: NetworkOptions) -> Network {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let auto_connect = options.auto_connect;
        let inner = Arc::new(NetworkInner {
            options,
            store,
            registry: ServerRegistry::new(),
            subs: Arc::new(SubscriptionTable::new()),
            sync: Arc::new(SyncState::new()),
            sessions: Mutex::new(Vec::new()),
            chosen_servers: Mutex::new(HashSet::new()),
            main_server: Mutex::new(None),
            proxy: Mutex::new(None),
            auto_connect: AtomicBool::new(auto_connect),
            stopped: AtomicBool::new(false),
            sessions_changed: Notify::new(),
            check_main_chain: Notify::new(),
            stop_network: Notify::new(),
            wallet_jobs: jobs_tx,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            wallet_tasks: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            next_wallet_id: AtomicU64::new(1),
        });
        Network {
            inner,
            supervisors: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the four supervisor tasks. Idempotent.
    pub fn start(&self) {
        let mut supervisors = self.supervisors.lock().unwrap();
        if !supervisors.is_empty() {
            return;
        }
        let jobs_rx = match self.inner.jobs_rx.lock().unwrap().take() {
            Some(jobs_rx) => jobs_rx,
            None => return,
        };
        supervisors.push(tokio::spawn(start_network(self.inner.clone())));
        supervisors.push(tokio::spawn(monitor_lagging_sessions(self.inner.clone())));
        supervisors.push(tokio::spawn(monitor_main_chain(self.inner.clone())));
        supervisors.push(tokio::spawn(monitor_wallets(self.inner.clone(), jobs_rx)));
    }

    /// Stops every supervisor and closes every session.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.stop_network.notify_one();
        let supervisors: Vec<JoinHandle<()>> = {
            let mut supervisors = self.supervisors.lock().unwrap();
            supervisors.drain(..).collect()
        };
        for supervisor in &supervisors {
            supervisor.abort();
        }
        for supervisor in supervisors {
            let _ = supervisor.await;
        }
        let wallet_tasks: Vec<(WalletRef, JoinHandle<()>)> = {
            let mut tasks = self.inner.wallet_tasks.lock().unwrap();
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        for (_, task) in &wallet_tasks {
            task.abort();
        }
        self.inner.cleanup_sessions().await;
        warn!("stopped");
    }

    pub fn add_wallet(&self, wallet: Arc<dyn Wallet>) -> u64 {
        let id = self.inner.next_wallet_id.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .inner
            .wallet_jobs
            .send(WalletJob::Add(WalletRef { id, wallet }));
        id
    }

    pub fn remove_wallet(&self, wallet_id: u64) {
        let _ = self.inner.wallet_jobs.send(WalletJob::Remove(wallet_id));
    }

    pub fn register_callback(&self, kinds: &[EventKind], callback: Callback) -> u64 {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .push((id, kinds.to_vec(), callback));
        id
    }

    pub fn unregister_callback(&self, callback_id: u64) {
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .retain(|(id, _, _)| *id != callback_id);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.main_session().is_some()
    }

    #[must_use]
    pub fn main_server(&self) -> Option<Arc<SvServer>> {
        self.inner.main_server()
    }

    #[must_use]
    pub fn get_servers(&self) -> Vec<Arc<SvServer>> {
        self.inner.registry.all()
    }

    /// Interns a server so it can be passed to `set_server`.
    pub fn server_from_string(&self, s: &str) -> Result<Arc<SvServer>, crate::server::ServerSpecError> {
        self.inner.registry.from_string(s)
    }

    #[must_use]
    pub fn servers_to_json(&self) -> Value {
        self.inner.registry.to_json()
    }

    pub fn load_servers_json(&self, value: &Value) {
        if let Err(e) = self.inner.registry.load_json(value) {
            warn!("could not load saved servers: {e}");
        }
    }

    /// User-directed main server change.
    pub async fn set_server(&self, server: Arc<SvServer>, auto_connect: bool) {
        self.inner
            .auto_connect
            .store(auto_connect, Ordering::Relaxed);
        set_main_server(&self.inner, server, SwitchReason::UserSet).await;
    }

    /// Changing the proxy tears down and restarts every connection.
    pub fn set_proxy(&self, proxy: Option<Proxy>) {
        {
            let mut current = self.inner.proxy.lock().unwrap();
            if *current == proxy {
                return;
            }
            *current = proxy;
        }
        info!("proxy changed, restarting connections");
        self.inner.stop_network.notify_one();
    }

    /// The chain the main session follows, or the longest known.
    #[must_use]
    pub fn chain(&self) -> ChainId {
        self.inner
            .main_session()
            .and_then(|session| session.chain())
            .unwrap_or_else(|| self.inner.store.longest_chain())
    }

    #[must_use]
    pub fn get_local_height(&self) -> u64 {
        self.inner.store.chain_height(self.chain())
    }

    #[must_use]
    pub fn get_server_height(&self) -> u64 {
        self.inner
            .main_session()
            .and_then(|session| session.tip_height())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn status(&self) -> Value {
        json!({
            "server": self.inner.main_server().map(|s| s.to_string()),
            "blockchain_height": self.get_local_height(),
            "server_height": self.get_server_height(),
            "spv_nodes": self.inner.sessions_snapshot().len(),
            "connected": self.is_connected(),
            "auto_connect": self.inner.auto_connect(),
        })
    }

    /// Broadcasts a raw transaction through the main session. Failures
    /// come back with the user-facing reason attached.
    pub async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String, BroadcastFailure> {
        let session = self.inner.main_session_wait().await;
        match session
            .send_request("blockchain.transaction.broadcast", json!([raw_hex]))
            .await
        {
            Ok(result) => match result.as_str() {
                Some(tx_hash) => Ok(tx_hash.to_string()),
                None => Err(BroadcastFailure {
                    reason: "reason unknown",
                    error: SessionError::disconnect("bad broadcast response"),
                }),
            },
            Err(error) => Err(BroadcastFailure {
                reason: broadcast_failure_reason(&error),
                error,
            }),
        }
    }

    pub async fn get_utxos(&self, script_hash: &str) -> Result<Value, SessionError> {
        let session = self.inner.main_session_wait().await;
        session
            .send_request("blockchain.scripthash.listunspent", json!([script_hash]))
            .await
    }

    /// A map chain -> session tags for each chain being followed.
    #[must_use]
    pub fn sessions_by_chain(&self) -> HashMap<ChainId, Vec<String>> {
        let mut result: HashMap<ChainId, Vec<String>> = HashMap::new();
        for session in self.inner.sessions_snapshot() {
            if let Some(chain) = session.chain() {
                result
                    .entry(chain)
                    .or_default()
                    .push(session.tag().to_string());
            }
        }
        result
    }
}

/// Broadcast rejection with the mapped user-facing reason.
#[derive(Debug)]
pub struct BroadcastFailure {
    pub reason: &'static str,
    pub error: SessionError,
}

impl fmt::Display for BroadcastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broadcast failed: {}", self.reason)
    }
}

impl std::error::Error for BroadcastFailure {}

/// Owns the connection fleet; restarts it whenever `stop_network` fires
/// (proxy changes) until the network is stopped for good.
async fn start_network(inner: Arc<NetworkInner>) {
    while !inner.stopped.load(Ordering::SeqCst) {
        // Treat all servers as unused so reconnects are not delayed.
        for server in inner.registry.all() {
            server.state.lock().unwrap().retry_delay = 0;
        }

        if inner.main_server().is_none() {
            match read_config(&inner) {
                Ok((main_server, proxy)) => {
                    info!("main server: {main_server}; proxy: {}", display_proxy(&proxy));
                    *inner.main_server.lock().unwrap() = Some(main_server);
                    *inner.proxy.lock().unwrap() = proxy;
                }
                Err(e) => {
                    error!("no usable servers: {e}");
                    tokio::time::sleep(SERVER_POLL).await;
                    continue;
                }
            }
        }

        debug!("starting...");
        tokio::select! {
            () = maintain_connections(inner.clone()) => {}
            () = inner.stop_network.notified() => {}
        }
        inner.cleanup_sessions().await;
    }
}

fn display_proxy(proxy: &Option<Proxy>) -> String {
    match proxy {
        Some(proxy) => proxy.to_string(),
        None => "none".to_string(),
    }
}

/// Seeds the registry and picks the initial main server and proxy from
/// the options.
fn read_config(
    inner: &Arc<NetworkInner>,
) -> Result<(Arc<SvServer>, Option<Proxy>), SessionError> {
    if inner.registry.len() < 5 {
        for entry in Net::selected().default_servers {
            if let Err(e) = inner.registry.from_string(entry) {
                warn!("bad seed server {entry}: {e}");
            }
        }
    }
    info!("read {} servers", inner.registry.len());

    let main_server = match &inner.options.main_server {
        Some(spec) => inner
            .registry
            .from_string(spec)
            .map_err(|e| SessionError::disconnect(format!("bad configured server: {e}")))?,
        None => {
            info!("choosing an SSL server randomly; none in config");
            random_server_nowait(inner, Protocol::Ssl)
                .ok_or_else(|| SessionError::disconnect("no servers available"))?
        }
    };
    let proxy = inner
        .options
        .proxy
        .as_deref()
        .and_then(Proxy::from_string);
    Ok((main_server, proxy))
}

async fn maintain_connections(inner: Arc<NetworkInner>) {
    let count = if inner.options.oneserver {
        1
    } else {
        SESSION_COUNT
    };
    let mut connections = JoinSet::new();
    for n in 0..count {
        connections.spawn(maintain_connection(inner.clone(), n));
    }
    while connections.join_next().await.is_some() {}
}

/// One slot in the fleet: connect, run the session to completion,
/// reconnect somewhere else. Slot 0 sticks to the main server.
async fn maintain_connection(inner: Arc<NetworkInner>, n: u64) {
    let mut server: Option<Arc<SvServer>> = if n == 0 { inner.main_server() } else { None };
    loop {
        let current = match server.take() {
            Some(server) if inner.is_main_server(&server) => {
                inner.trigger_callback(&NetworkEvent::Status);
                server
            }
            _ => {
                let protocol = inner
                    .main_server()
                    .map(|main| main.protocol)
                    .unwrap_or(Protocol::Ssl);
                random_server(&inner, protocol).await
            }
        };

        inner.chosen_servers.lock().unwrap().insert(current.key());
        connect_and_run(&inner, &current, n).await;
        inner.chosen_servers.lock().unwrap().remove(&current.key());

        if inner.is_main_server(&current) {
            maybe_switch_main_server(&inner, SwitchReason::Disconnected).await;
        }
        server = Some(current);
    }
}

/// Dials the server after its backoff, then drives a session over the
/// connection, translating terminal errors into a disconnect.
async fn connect_and_run(inner: &Arc<NetworkInner>, server: &Arc<SvServer>, n: u64) {
    let delay = server.state.lock().unwrap().retry_delay;
    tokio::time::sleep(Duration::from_secs(delay)).await;
    {
        let mut state = server.state.lock().unwrap();
        state.bump_retry_delay();
        state.last_try = unix_time();
    }

    info!("[{}:{} {} #{n}] connecting...", server.host, server.port, server.protocol.text());
    let proxy = inner.proxy.lock().unwrap().clone();
    let conn = match RpcConnection::connect(server, proxy.as_ref()).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("{server} connection error: {e}");
            return;
        }
    };

    let session = SvSession::new(
        server.clone(),
        NetHandle::new(inner),
        inner.store.clone(),
        inner.subs.clone(),
        inner.sync.clone(),
        conn,
        n,
    );
    match session.clone().run().await {
        Ok(()) => {}
        Err(SessionError::Disconnect { reason, blacklist }) => {
            session.disconnect(&reason, blacklist).await;
        }
        Err(error) => {
            session.disconnect(&error.to_string(), false).await;
        }
    }
    if !session.is_closed() {
        session.close().await;
    }
    info!("[{}:{} {} #{n}] disconnected", server.host, server.port, server.protocol.text());
}

fn random_server_nowait(inner: &Arc<NetworkInner>, protocol: Protocol) -> Option<Arc<SvServer>> {
    let now = unix_time();
    let chosen = inner.chosen_servers.lock().unwrap();
    let available: Vec<Arc<SvServer>> = inner
        .registry
        .all()
        .into_iter()
        .filter(|server| server.protocol == protocol)
        .filter(|server| !chosen.contains(&server.key()))
        .filter(|server| server.state.lock().unwrap().can_retry(now))
        .collect();
    available.choose(&mut rand::thread_rng()).cloned()
}

async fn random_server(inner: &Arc<NetworkInner>, protocol: Protocol) -> Arc<SvServer> {
    loop {
        if let Some(server) = random_server_nowait(inner, protocol) {
            return server;
        }
        tokio::time::sleep(SERVER_POLL).await;
    }
}

/// Refreshes `last_good` for sessions within two blocks of the best tip,
/// then moves the main server onto a good one when it is not itself good.
async fn maybe_switch_main_server(inner: &Arc<NetworkInner>, reason: SwitchReason) {
    let now = unix_time();
    let sessions = inner.sessions_snapshot();
    let max_height = sessions
        .iter()
        .filter_map(|session| session.tip_height())
        .max()
        .unwrap_or(0);
    for session in &sessions {
        if session.tip_height().unwrap_or(0) + 2 > max_height {
            session.server.state.lock().unwrap().last_good = now;
        }
    }

    // Give a lagging server a 60-second breather to catch up.
    let good_servers: Vec<Arc<SvServer>> = sessions
        .iter()
        .map(|session| session.server.clone())
        .filter(|server| server.state.lock().unwrap().last_good > now.saturating_sub(60))
        .collect();

    if good_servers.is_empty() {
        warn!("no good servers available");
    } else if !good_servers.iter().any(|server| inner.is_main_server(server)) {
        if inner.auto_connect() {
            let choice = good_servers
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or_else(|| good_servers[0].clone());
            set_main_server(inner, choice, reason).await;
        } else if let Some(main) = inner.main_server() {
            warn!(
                "main server {main} is not good, but retaining it because auto-connect is off"
            );
        }
    }
}

/// Installs a new main server, hands the subscription set to its session,
/// and closes the old main session so the server releases its
/// script-hash subscriptions.
pub(crate) async fn set_main_server(
    inner: &Arc<NetworkInner>,
    server: Arc<SvServer>,
    reason: SwitchReason,
) {
    info!("switching main server to {server}: {reason}");
    let old_main_session = inner.main_session();
    *inner.main_server.lock().unwrap() = Some(server);
    inner.note_check_main_chain();

    if let Some(session) = inner.main_session() {
        if let Err(e) = session.subscribe_wallets().await {
            let blacklist = e.wants_blacklist();
            session.disconnect(&e.to_string(), blacklist).await;
        }
    }
    if let Some(old) = old_main_session {
        if reason == SwitchReason::UserSet {
            old.server.state.lock().unwrap().retry_delay = 0;
        }
        old.close().await;
    }
    inner.trigger_callback(&NetworkEvent::Status);
}

/// Every 20 seconds, or as soon as the session set changes, re-evaluate
/// which sessions lag the best tip.
async fn monitor_lagging_sessions(inner: Arc<NetworkInner>) {
    loop {
        let changed = inner.sessions_changed.notified();
        let _ = tokio::time::timeout(LAGGING_TICK, changed).await;
        maybe_switch_main_server(&inner, SwitchReason::Lagging).await;
    }
}

/// Watches for the main chain changing; a reorg rewinds wallet
/// verifications above the fork point.
async fn monitor_main_chain(inner: Arc<NetworkInner>) {
    let mut main_chain: Option<ChainId> = None;
    loop {
        inner.check_main_chain.notified().await;
        let session = inner.main_session_wait().await;
        let new_main_chain = match session.chain() {
            Some(chain) => chain,
            None => continue,
        };
        if let Some(old) = main_chain {
            if old != new_main_chain {
                let (_, above_height) = inner.store.common_chain_and_height(old, new_main_chain);
                info!(
                    "main chain updated; undoing wallet verifications above height {above_height}"
                );
                let _ = inner
                    .wallet_jobs
                    .send(WalletJob::UndoVerifications(above_height));
            }
        }
        let old = main_chain;
        main_chain = Some(new_main_chain);
        inner.trigger_callback(&NetworkEvent::Updated);
        inner.trigger_callback(&NetworkEvent::MainChain {
            old,
            new: new_main_chain,
        });
    }
}

/// Serializes wallet lifecycle jobs: add and remove maintainers, fan out
/// verification rewinds.
async fn monitor_wallets(inner: Arc<NetworkInner>, mut jobs: mpsc::UnboundedReceiver<WalletJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            WalletJob::Add(wallet) => {
                let mut tasks = inner.wallet_tasks.lock().unwrap();
                if !tasks.contains_key(&wallet.id) {
                    let task = tokio::spawn(maintain_wallet(inner.clone(), wallet.clone()));
                    tasks.insert(wallet.id, (wallet, task));
                }
            }
            WalletJob::Remove(wallet_id) => {
                let removed = inner.wallet_tasks.lock().unwrap().remove(&wallet_id);
                if let Some((wallet, task)) = removed {
                    task.abort();
                    let _ = task.await;
                    release_wallet_subscriptions(&inner, wallet_id).await;
                    info!("stopped maintaining wallet {}", wallet.wallet.name());
                }
            }
            WalletJob::UndoVerifications(above_height) => {
                let wallets: Vec<WalletRef> = {
                    let tasks = inner.wallet_tasks.lock().unwrap();
                    tasks.values().map(|(wallet, _)| wallet.clone()).collect()
                };
                for wallet in wallets {
                    wallet.wallet.undo_verifications(above_height);
                }
            }
        }
    }
}

/// Releases a removed wallet's exclusively-held subscriptions on the
/// main session, when the negotiated protocol allows it.
pub(crate) async fn release_wallet_subscriptions(inner: &Arc<NetworkInner>, wallet_id: u64) {
    let exclusive = inner.subs.unsubscribe_wallet(wallet_id);
    if exclusive.is_empty() {
        return;
    }
    let Some(session) = inner.main_session() else {
        return;
    };
    if session.ptuple() < ProtocolVersion::UNSUBSCRIBE_MIN {
        debug!("negotiated protocol does not support unsubscribing");
        return;
    }
    debug!("unsubscribing {} subscriptions", exclusive.len());
    let jobs = exclusive
        .iter()
        .map(|script_hash| session.unsubscribe_from_script_hash(script_hash));
    for result in join_all(jobs).await {
        if let Err(e) = result {
            debug!("unsubscribe failed: {e}");
        }
    }
}
