//! One live connection to one server: protocol negotiation, checkpoint
//! header fetch, tip subscription and catch-up, the ping loop, script-hash
//! subscription traffic and the main-server extras.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use sv_types::{Address, Header, H256};

use crate::error::SessionError;
use crate::network::NetHandle;
use crate::rpc::{timeout_after, Notification, RpcConnection};
use crate::server::{unix_time, Protocol, SvServer};
use crate::store::{ChainId, HeaderError, HeaderStore};
use crate::subscriptions::{history_status, SubscriptionTable, WalletRef};
use crate::sync::{
    catch_up_heights, check_header_proof, claim_tip, connect_chunk, connect_header, release_tip,
    required_checkpoint_headers, SyncState, TipClaim, CHUNK_SIZE, HEADER_SIZE,
};

pub(crate) const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
pub(crate) const REQUEST_MERKLE_PROOF: &str = "blockchain.transaction.get_merkle";
pub(crate) const SCRIPTHASH_HISTORY: &str = "blockchain.scripthash.get_history";
pub(crate) const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub(crate) const SCRIPTHASH_UNSUBSCRIBE: &str = "blockchain.scripthash.unsubscribe";

const PING_INTERVAL: Duration = Duration::from_secs(300);
const BATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A dotted protocol version, ordered numerically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const MIN: ProtocolVersion = ProtocolVersion::new(1, 4, 0);
    pub const MAX: ProtocolVersion = ProtocolVersion::new(1, 4, 3);
    /// scripthash.unsubscribe needs at least this.
    pub const UNSUBSCRIBE_MIN: ProtocolVersion = ProtocolVersion::new(1, 4, 2);

    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        ProtocolVersion {
            major,
            minor,
            patch,
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<ProtocolVersion> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(part) => part.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(ProtocolVersion::new(major, minor, patch))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

fn client_version() -> String {
    format!("sv-light-client {}", env!("CARGO_PKG_VERSION"))
}

/// The server's current best header as this session last saw it.
#[derive(Clone, Debug)]
pub struct Tip {
    pub height: u64,
    pub header: Header,
    pub raw: Vec<u8>,
}

#[derive(Default)]
struct SessionState {
    chain: Option<ChainId>,
    tip: Option<Tip>,
    ptuple: ProtocolVersion,
}

pub struct SvSession {
    pub server: Arc<SvServer>,
    net: NetHandle,
    store: Arc<dyn HeaderStore>,
    subs: Arc<SubscriptionTable>,
    sync: Arc<SyncState>,
    conn: RpcConnection,
    state: Mutex<SessionState>,
    tag: String,
}

impl SvSession {
    pub(crate) fn new(
        server: Arc<SvServer>,
        net: NetHandle,
        store: Arc<dyn HeaderStore>,
        subs: Arc<SubscriptionTable>,
        sync: Arc<SyncState>,
        conn: RpcConnection,
        n: u64,
    ) -> Arc<SvSession> {
        let tag = format!(
            "[{}:{} {} #{}]",
            server.host,
            server.port,
            server.protocol.text(),
            n
        );
        Arc::new(SvSession {
            server,
            net,
            store,
            subs,
            sync,
            conn,
            state: Mutex::new(SessionState::default()),
            tag,
        })
    }

    #[must_use]
    pub fn tip(&self) -> Option<Tip> {
        self.state.lock().unwrap().tip.clone()
    }

    #[must_use]
    pub fn tip_height(&self) -> Option<u64> {
        self.state.lock().unwrap().tip.as_ref().map(|t| t.height)
    }

    #[must_use]
    pub fn chain(&self) -> Option<ChainId> {
        self.state.lock().unwrap().chain
    }

    #[must_use]
    pub fn ptuple(&self) -> ProtocolVersion {
        self.state.lock().unwrap().ptuple
    }

    /// Manages the connection after the transport is up. Raises every
    /// session error for the caller to translate into a disconnect.
    pub(crate) async fn run(self: Arc<Self>) -> Result<(), SessionError> {
        // Negotiate the protocol before doing anything else.
        self.negotiate_protocol().await?;
        // Checkpoint headers are essential to attempting tip connection.
        self.get_checkpoint_headers().await?;
        // Then subscribe headers and connect the server's tip.
        self.subscribe_headers().await?;
        // Only once the tip is connected do we consider the session good
        // and let the network see it: from here 'tip' and 'chain' are set.
        let is_main = self.net.session_established(&self);
        let result = self.run_established(is_main).await;
        self.net.session_closed(&self);
        result
    }

    async fn run_established(&self, is_main: bool) -> Result<(), SessionError> {
        self.server.state.lock().unwrap().retry_delay = 0;

        let mut notifications = match self.conn.take_notifications() {
            Some(notifications) => notifications,
            None => return Err(SessionError::disconnect("notification queue already taken")),
        };

        let notification_work = async {
            while let Some(notification) = notifications.recv().await {
                self.dispatch_notification(notification).await?;
            }
            Ok(())
        };

        let main_work = async {
            if is_main {
                info!("{} using as main server", self.tag);
                let (subs, batch) =
                    tokio::join!(self.subscribe_wallets(), self.main_server_batch());
                subs?;
                batch?;
            }
            futures::future::pending::<()>().await;
            Ok(())
        };

        tokio::select! {
            r = notification_work => r,
            r = self.ping_loop() => r,
            r = main_work => r,
            () = self.conn.closed() => Ok(()),
        }
    }

    /// Notifications are processed one at a time, in arrival order.
    async fn dispatch_notification(&self, notification: Notification) -> Result<(), SessionError> {
        match notification.method.as_str() {
            HEADERS_SUBSCRIBE => {
                let first = notification
                    .params
                    .as_array()
                    .and_then(|items| items.first().cloned());
                let tip = match first {
                    Some(tip) => tip,
                    None => notification.params,
                };
                self.on_new_tip(tip).await
            }
            SCRIPTHASH_SUBSCRIBE => {
                let items = notification.params.as_array().cloned().unwrap_or_default();
                let script_hash = items.first().and_then(Value::as_str);
                match script_hash {
                    Some(script_hash) => {
                        let status = match items.get(1) {
                            Some(Value::String(s)) => Some(s.clone()),
                            _ => None,
                        };
                        self.on_status_changed(script_hash, status).await
                    }
                    None => Err(SessionError::blacklist(format!(
                        "bad scripthash notification: {items:?}"
                    ))),
                }
            }
            other => {
                debug!("{} ignoring notification {other}", self.tag);
                Ok(())
            }
        }
    }

    async fn negotiate_protocol(&self) -> Result<(), SessionError> {
        let method = "server.version";
        let args = json!([
            client_version(),
            [ProtocolVersion::MIN.to_string(), ProtocolVersion::MAX.to_string()],
        ]);
        let result = self.conn.send_request(method, args).await?;

        let parsed = (|| {
            let items = result.as_array()?;
            let server_string = items.first()?.as_str()?.to_string();
            let ptuple = ProtocolVersion::parse(items.get(1)?.as_str()?)?;
            Some((server_string, ptuple))
        })();

        match parsed {
            Some((server_string, ptuple))
                if (ProtocolVersion::MIN..=ProtocolVersion::MAX).contains(&ptuple) =>
            {
                debug!("{} server string: {server_string}", self.tag);
                debug!("{} negotiated protocol: {ptuple}", self.tag);
                self.state.lock().unwrap().ptuple = ptuple;
                Ok(())
            }
            _ => Err(SessionError::blacklist(format!(
                "{method} failed: unusable response {result}"
            ))),
        }
    }

    async fn get_checkpoint_headers(&self) -> Result<(), SessionError> {
        loop {
            let (start_height, count) = required_checkpoint_headers(&self.sync, &*self.store);
            if count == 0 {
                return Ok(());
            }
            info!("{} {count} checkpoint headers needed", self.tag);
            self.request_chunk(start_height, count).await?;
        }
    }

    /// Requests `count` headers from `height` and connects them. Returns
    /// the greatest height actually received, which may be lower than
    /// asked when the server truncates the response.
    async fn request_chunk(&self, height: u64, count: u64) -> Result<u64, SessionError> {
        info!("{} requesting {count} headers from height {height}", self.tag);
        let method = "blockchain.block.headers";
        let checkpoint = self.store.checkpoint();
        // The proof is only available for ranges ending at or before the
        // checkpoint.
        let cp_arg = if height + count <= checkpoint.height + 1 {
            checkpoint.height
        } else {
            0
        };

        let result = self
            .conn
            .send_request(method, json!([height, count, cp_arg]))
            .await?;

        let violation = |detail: &str| {
            SessionError::blacklist(format!("{method} failed: {detail}: {result}"))
        };

        let rec_count = result
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| violation("missing count"))?;
        if rec_count == 0 {
            return Err(violation("empty chunk"));
        }
        let raw_chunk = result
            .get("hex")
            .and_then(Value::as_str)
            .and_then(|hex| hex::decode(hex).ok())
            .ok_or_else(|| violation("bad hex"))?;
        if raw_chunk.len() != rec_count as usize * HEADER_SIZE {
            return Err(violation("length mismatch"));
        }
        let last_height = height + rec_count - 1;
        if rec_count != count {
            info!("{} received just {rec_count} headers", self.tag);
        }

        if cp_arg > 0 {
            let hex_root = result
                .get("root")
                .and_then(Value::as_str)
                .ok_or_else(|| violation("missing root"))?;
            let branch = parse_branch(result.get("branch"))
                .ok_or_else(|| violation("bad branch"))?;
            check_header_proof(
                &checkpoint,
                hex_root,
                &branch,
                &raw_chunk[raw_chunk.len() - HEADER_SIZE..],
                last_height,
            )?;
        }

        match connect_chunk(&*self.store, height, &raw_chunk, cp_arg > 0) {
            Ok(chain) => self.state.lock().unwrap().chain = Some(chain),
            Err(e) => {
                return Err(SessionError::blacklist(format!("{method} failed: {e}")));
            }
        }

        info!(
            "{} connected {rec_count} headers up to height {last_height}",
            self.tag
        );
        Ok(last_height)
    }

    async fn subscribe_headers(&self) -> Result<(), SessionError> {
        let tip = self.conn.send_request(HEADERS_SUBSCRIBE, json!([])).await?;
        self.on_new_tip(tip).await
    }

    async fn on_new_tip(&self, json_tip: Value) -> Result<(), SessionError> {
        let parsed = (|| {
            let obj = json_tip.as_object()?;
            let raw = hex::decode(obj.get("hex")?.as_str()?).ok()?;
            let height = obj.get("height")?.as_u64()?;
            let header = Header::from_bytes(&raw).ok()?;
            Some(Tip {
                height,
                header,
                raw,
            })
        })();
        let tip = match parsed {
            Some(tip) => tip,
            None => {
                return Err(SessionError::blacklist(format!(
                    "error connecting tip: {json_tip}"
                )))
            }
        };

        let checkpoint = self.store.checkpoint();
        if tip.height < checkpoint.height {
            return Err(SessionError::blacklist(format!(
                "server tip height {} below checkpoint",
                tip.height
            )));
        }

        {
            let mut state = self.state.lock().unwrap();
            state.chain = None;
            state.tip = None;
        }

        loop {
            match connect_header(&*self.store, tip.height, &tip.raw) {
                Ok((header, chain)) => {
                    let mut state = self.state.lock().unwrap();
                    state.tip = Some(Tip {
                        height: tip.height,
                        header,
                        raw: tip.raw.clone(),
                    });
                    state.chain = Some(chain);
                    drop(state);
                    debug!("{} connected tip at height {}", self.tag, tip.height);
                    self.net.note_check_main_chain();
                    return Ok(());
                }
                Err(HeaderError::MissingHeader) => {}
                Err(e) => {
                    return Err(SessionError::blacklist(format!("bad header provided: {e}")));
                }
            }
            // Try to connect and then re-check.
            self.catch_up_to_tip_throttled(&tip).await?;
        }
    }

    /// One session catches up per tip; the rest wait on its completion.
    async fn catch_up_to_tip_throttled(&self, tip: &Tip) -> Result<(), SessionError> {
        match claim_tip(&self.sync, &tip.raw) {
            TipClaim::Waiter(mut done) => {
                debug!(
                    "{} another session is connecting my tip {}",
                    self.tag,
                    tip.header.block_hash().to_rev_hex()
                );
                let _ = done.changed().await;
                Ok(())
            }
            TipClaim::Owner(owner) => {
                debug!(
                    "{} connecting my own tip {}",
                    self.tag,
                    tip.header.block_hash().to_rev_hex()
                );
                let result = self.catch_up_to_tip(tip).await;
                release_tip(&self.sync, &tip.raw, owner);
                result
            }
        }
    }

    async fn catch_up_to_tip(&self, tip: &Tip) -> Result<(), SessionError> {
        let checkpoint = self.store.checkpoint();
        let max_height = self
            .store
            .chains()
            .into_iter()
            .map(|chain| self.store.chain_height(chain))
            .max()
            .unwrap_or(0);
        let heights = catch_up_heights(checkpoint.height, tip.height, max_height);

        let mut height = self.request_headers_at_heights(&heights).await?;
        while height < tip.height as i64 {
            height = self.request_chunk((height + 1) as u64, CHUNK_SIZE).await? as i64;
        }
        Ok(())
    }

    /// Requests single headers as a batch and connects them, lowest
    /// height first. Returns the greatest connected height (-1 if none).
    async fn request_headers_at_heights(&self, heights: &[u64]) -> Result<i64, SessionError> {
        let mut heights: Vec<u64> = heights.to_vec();
        heights.sort_unstable();
        heights.dedup();
        debug!("{} requesting headers at heights {heights:?}", self.tag);
        let method = "blockchain.block.header";
        let checkpoint = self.store.checkpoint();

        let requests: Vec<(&str, Value)> = heights
            .iter()
            .map(|height| {
                let cp_arg = if *height <= checkpoint.height {
                    checkpoint.height
                } else {
                    0
                };
                (method, json!([height, cp_arg]))
            })
            .collect();
        let results = timeout_after(BATCH_TIMEOUT, self.conn.send_batch(&requests)).await?;

        let min_good_height = heights
            .iter()
            .filter(|height| **height <= checkpoint.height)
            .max()
            .map(|height| *height as i64)
            .unwrap_or(-1);
        let mut good_height: i64 = -1;

        for (result, height) in results.iter().zip(&heights) {
            let violation =
                |detail: &str| SessionError::blacklist(format!("bad {method} response: {detail}"));
            let raw = if *height <= checkpoint.height {
                let obj = result.as_object().ok_or_else(|| violation("not an object"))?;
                let hex_root = obj
                    .get("root")
                    .and_then(Value::as_str)
                    .ok_or_else(|| violation("missing root"))?;
                let branch =
                    parse_branch(obj.get("branch")).ok_or_else(|| violation("bad branch"))?;
                let raw = obj
                    .get("header")
                    .and_then(Value::as_str)
                    .and_then(|hex| hex::decode(hex).ok())
                    .ok_or_else(|| violation("bad header hex"))?;
                check_header_proof(&checkpoint, hex_root, &branch, &raw, *height)?;
                raw
            } else {
                result
                    .as_str()
                    .and_then(|hex| hex::decode(hex).ok())
                    .ok_or_else(|| violation("bad header hex"))?
            };

            match connect_header(&*self.store, *height, &raw) {
                Ok((_, chain)) => {
                    self.state.lock().unwrap().chain = Some(chain);
                    good_height = *height as i64;
                }
                Err(HeaderError::MissingHeader) => {
                    info!(
                        "{} failed to connect at height {height}, hash {}, last good {good_height}",
                        self.tag,
                        merkle_proofs::header_hash(&raw).to_rev_hex()
                    );
                    break;
                }
                Err(e) => {
                    return Err(SessionError::blacklist(format!("bad header provided: {e}")));
                }
            }
        }

        if good_height < min_good_height {
            return Err(SessionError::blacklist("cannot connect to checkpoint"));
        }
        Ok(good_height)
    }

    async fn ping_loop(&self) -> Result<(), SessionError> {
        let method = "server.ping";
        loop {
            tokio::time::sleep_until(self.conn.last_send() + PING_INTERVAL).await;
            if self.conn.last_send().elapsed() + Duration::from_secs(1) >= PING_INTERVAL {
                debug!("{} sending {method}", self.tag);
                self.conn.send_request(method, json!([])).await?;
            }
        }
    }

    /// Banner, donation address and the peer list, fetched once from the
    /// main server under one deadline.
    async fn main_server_batch(&self) -> Result<(), SessionError> {
        let requests = [
            ("server.banner", json!([])),
            ("server.donation_address", json!([])),
            ("server.peers.subscribe", json!([])),
        ];
        let results = timeout_after(BATCH_TIMEOUT, self.conn.send_batch(&requests)).await?;

        let banner = results[0]
            .as_str()
            .ok_or_else(|| SessionError::disconnect("main server requests bad batch response"))?;
        let donation = results[1]
            .as_str()
            .ok_or_else(|| SessionError::disconnect("main server requests bad batch response"))?;
        let peers = parse_peers(&results[2])?;

        {
            let mut state = self.server.state.lock().unwrap();
            state.banner = banner.to_string();
            state.donation_address = donation.to_string();
        }

        let mut added = 0;
        for (host, port, protocol) in &peers {
            if self.net.intern_peer(host, *port, *protocol) {
                added += 1;
            }
        }
        info!(
            "{} {added} servers returned from server.peers.subscribe",
            self.tag
        );
        self.net.trigger_banner();
        Ok(())
    }

    /// Headers for the given heights on this session's chain, fetching
    /// any the store does not yet hold.
    pub(crate) async fn headers_at_heights(
        &self,
        heights: &[u64],
    ) -> Result<HashMap<u64, Header>, SessionError> {
        let mut wanted: Vec<u64> = heights.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let chain = || {
            self.state
                .lock()
                .unwrap()
                .chain
                .unwrap_or_else(|| self.store.longest_chain())
        };

        let mut result = HashMap::new();
        let mut missing = Vec::new();
        for height in &wanted {
            match self.store.header_at_height(chain(), *height) {
                Ok(header) => {
                    result.insert(*height, header);
                }
                Err(_) => missing.push(*height),
            }
        }
        if !missing.is_empty() {
            self.request_headers_at_heights(&missing).await?;
            for height in &missing {
                let header = self
                    .store
                    .header_at_height(chain(), *height)
                    .map_err(|_| {
                        SessionError::disconnect(format!("header at height {height} still missing"))
                    })?;
                result.insert(*height, header);
            }
        }
        Ok(result)
    }

    pub(crate) async fn request_tx(&self, tx_hash: &str) -> Result<String, SessionError> {
        let result = self
            .conn
            .send_request("blockchain.transaction.get", json!([tx_hash]))
            .await?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| SessionError::blacklist("bad transaction.get response"))
    }

    pub(crate) async fn request_proof(
        &self,
        tx_hash: &str,
        height: u64,
    ) -> Result<Value, SessionError> {
        self.conn
            .send_request(REQUEST_MERKLE_PROOF, json!([tx_hash, height]))
            .await
    }

    pub(crate) async fn request_history(&self, script_hash: &str) -> Result<Value, SessionError> {
        self.conn
            .send_request(SCRIPTHASH_HISTORY, json!([script_hash]))
            .await
    }

    pub(crate) async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, SessionError> {
        self.conn.send_request(method, params).await
    }

    /// Re-issues the whole subscription table on this session, used when
    /// it becomes the main session.
    pub(crate) async fn subscribe_wallets(&self) -> Result<(), SessionError> {
        debug!("{} subscribe_wallets", self.tag);
        let snapshot = self.subs.take_all();
        let jobs = snapshot.into_iter().map(|(wallet, pairs)| async move {
            // If the wallet was unsubscribed in the meantime keep it that
            // way.
            if !self.subs.is_registered(wallet.id) {
                return Ok(());
            }
            info!(
                "{} subscribing to {} addresses for {}",
                self.tag,
                pairs.len(),
                wallet.wallet.name()
            );
            self.subscribe_to_pairs(&wallet, pairs).await
        });
        for result in futures::future::join_all(jobs).await {
            result?;
        }
        Ok(())
    }

    /// Subscribes every pair, registering them in the shared table. The
    /// request is sent even for script hashes another wallet already
    /// subscribed, so this wallet still observes a status reply.
    pub(crate) async fn subscribe_to_pairs(
        &self,
        wallet: &WalletRef,
        pairs: Vec<(Address, String)>,
    ) -> Result<(), SessionError> {
        self.subs.register_wallet(wallet);
        wallet.wallet.add_request_count(pairs.len());

        let mut jobs = Vec::with_capacity(pairs.len());
        for (address, script_hash) in pairs {
            self.subs.record(wallet, &script_hash, address);
            let wallet = wallet.clone();
            jobs.push(async move {
                let result = self.subscribe_to_script_hash(&script_hash).await;
                wallet.wallet.add_response_count(1);
                result
            });
        }
        for result in futures::future::join_all(jobs).await {
            result?;
        }
        Ok(())
    }

    async fn subscribe_to_script_hash(&self, script_hash: &str) -> Result<(), SessionError> {
        let status = self
            .conn
            .send_request(SCRIPTHASH_SUBSCRIBE, json!([script_hash]))
            .await?;
        let status = match status {
            Value::Null => None,
            Value::String(status) => Some(status),
            other => {
                return Err(SessionError::blacklist(format!(
                    "bad scripthash.subscribe response: {other}"
                )))
            }
        };
        self.on_status_changed(script_hash, status).await
    }

    /// Unsubscribes the pairs this wallet holds exclusively; pairs shared
    /// with another wallet stay subscribed.
    pub(crate) async fn unsubscribe_from_pairs(
        &self,
        wallet: &WalletRef,
        pairs: Vec<(Address, String)>,
    ) -> Result<(), SessionError> {
        if self.ptuple() < ProtocolVersion::UNSUBSCRIBE_MIN {
            debug!("{} negotiated protocol does not support unsubscribing", self.tag);
            return Ok(());
        }
        let exclusive = self.subs.exclusive_subs(wallet.id);
        let mut jobs = Vec::new();
        for (_address, script_hash) in pairs {
            if !exclusive.contains(&script_hash) {
                continue;
            }
            // Check again at the moment of iteration; another task may
            // have removed it while we were not looking.
            if !self.subs.remove_pair(wallet.id, &script_hash) {
                continue;
            }
            jobs.push(async move { self.unsubscribe_from_script_hash(&script_hash).await });
        }
        for result in futures::future::join_all(jobs).await {
            result?;
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe_from_script_hash(
        &self,
        script_hash: &str,
    ) -> Result<(), SessionError> {
        self.conn
            .send_request(SCRIPTHASH_UNSUBSCRIBE, json!([script_hash]))
            .await
            .map(|_| ())
    }

    async fn on_status_changed(
        &self,
        script_hash: &str,
        status: Option<String>,
    ) -> Result<(), SessionError> {
        let address = match self.subs.address_for(script_hash) {
            Some(address) => address,
            None => {
                error!(
                    "{} received status notification for unsubscribed {script_hash}",
                    self.tag
                );
                return Ok(());
            }
        };

        let stale = self
            .subs
            .wallets_with_stale_status(script_hash, status.as_deref());
        if stale.is_empty() {
            return Ok(());
        }

        // Status has changed; get the full history.
        let result = self.request_history(script_hash).await?;
        let (history, tx_fees) = parse_history(&result, &address)?;
        debug!(
            "{} received history of {address} length {}",
            self.tag,
            history.len()
        );

        // The status can change legitimately between the notification and
        // the history request.
        let recomputed = history_status(&history);
        if recomputed.as_deref() != status.as_deref() {
            warn!(
                "{} history status mismatch {recomputed:?} vs {status:?} for {address}",
                self.tag
            );
        }

        for (wallet, address) in stale {
            wallet
                .set_address_history(&address, history.clone(), tx_fees.clone())
                .await;
        }
        Ok(())
    }

    pub(crate) async fn disconnect(&self, reason: &str, blacklist: bool) {
        if blacklist {
            self.server.state.lock().unwrap().last_blacklisted = unix_time();
            error!("{} disconnecting and blacklisting: {reason}", self.tag);
        } else {
            error!("{} disconnecting: {reason}", self.tag);
        }
        self.conn.close().await;
    }

    pub(crate) async fn close(&self) {
        self.conn.close().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }
}

fn parse_branch(value: Option<&Value>) -> Option<Vec<H256>> {
    value?
        .as_array()?
        .iter()
        .map(|item| item.as_str().and_then(|s| H256::from_rev_hex(s).ok()))
        .collect()
}

/// Peer entries look like `[ip, host, [features...]]`; a feature of the
/// form `s50002` or `t50001` names a port for that transport. Entries
/// with bad ports are silently skipped.
fn parse_peers(result: &Value) -> Result<Vec<(String, u16, Protocol)>, SessionError> {
    let entries = result
        .as_array()
        .ok_or_else(|| SessionError::disconnect("main server requests bad batch response"))?;
    let mut peers = Vec::new();
    for entry in entries {
        let items = entry
            .as_array()
            .ok_or_else(|| SessionError::disconnect("bad peers.subscribe entry"))?;
        let host = items
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::disconnect("bad peers.subscribe entry"))?;
        let features = items
            .get(2)
            .and_then(Value::as_array)
            .ok_or_else(|| SessionError::disconnect("bad peers.subscribe entry"))?;
        for feature in features {
            let feature = feature
                .as_str()
                .ok_or_else(|| SessionError::disconnect("bad peers.subscribe entry"))?;
            let mut chars = feature.chars();
            let protocol = match chars.next().and_then(Protocol::from_code) {
                Some(protocol) => protocol,
                None => continue,
            };
            let rest = chars.as_str();
            if !rest.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(port) = rest.parse::<u16>() {
                peers.push((host.to_string(), port, protocol));
            }
        }
    }
    Ok(peers)
}

/// History entries are `{tx_hash, height, fee?}` with unique hashes.
fn parse_history(
    result: &Value,
    address: &Address,
) -> Result<(Vec<(String, i64)>, HashMap<String, u64>), SessionError> {
    let entries = result
        .as_array()
        .ok_or_else(|| SessionError::blacklist("bad history returned: not a list"))?;
    let mut history = Vec::with_capacity(entries.len());
    let mut tx_fees = HashMap::new();
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        let tx_hash = entry
            .get("tx_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::blacklist("bad history returned: missing tx_hash"))?;
        let height = entry
            .get("height")
            .and_then(Value::as_i64)
            .ok_or_else(|| SessionError::blacklist("bad history returned: missing height"))?;
        if !seen.insert(tx_hash.to_string()) {
            return Err(SessionError::blacklist(format!(
                "server history for {address} has duplicate transactions"
            )));
        }
        if let Some(fee) = entry.get("fee").and_then(Value::as_u64) {
            tx_fees.insert(tx_hash.to_string(), fee);
        }
        history.push((tx_hash.to_string(), height));
    }
    Ok((history, tx_fees))
}
