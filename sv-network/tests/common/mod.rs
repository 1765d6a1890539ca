//! An in-process Electrum server speaking newline-delimited JSON-RPC,
//! scripted by the tests, plus chain-building helpers and a mock wallet.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use merkle_proofs::merkle_branch;
use sv_types::{double_sha256, Address, Checkpoint, Header, PowParams, H256, U256};

use sv_network::Wallet;

pub const TEST_BITS: u32 = 0x207f_ffff;

pub fn pow_params() -> PowParams {
    PowParams {
        blocks_per_adjustment: 2016,
        target_spacing_secs: 600,
        target_timespan_secs: 2016 * 600,
        proof_of_work_limit_bits: TEST_BITS,
        allow_min_difficulty_blocks: false,
    }
}

/// Finds a nonce whose hash meets the claimed bits.
pub fn mine_header(prev_block_hash: H256, seed: u32, bits: u32) -> Header {
    let mut header = Header {
        version: 0x2000_0000,
        prev_block_hash,
        merkle_root: double_sha256(&seed.to_le_bytes()),
        time: 1_600_000_000 + seed,
        bits,
        nonce: 0,
    };
    let target = header.target();
    while U256::from_le_bytes(&header.block_hash().0) > target {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// A linked, mined chain rooted at a synthetic genesis; `headers[h]` is
/// the header at height `h`.
pub fn mined_chain(length: u64) -> Vec<Header> {
    let mut headers = Vec::with_capacity(length as usize);
    let mut prev = double_sha256(b"before genesis");
    for i in 0..length {
        let header = mine_header(prev, i as u32, TEST_BITS);
        prev = header.block_hash();
        headers.push(header);
    }
    headers
}

/// Extends `headers` from the block at `fork_height` with `count` new
/// mined blocks, returning only the new branch.
pub fn fork_from(headers: &[Header], fork_height: u64, count: u64, seed: u32) -> Vec<Header> {
    let mut prev = headers[fork_height as usize].block_hash();
    let mut branch = Vec::with_capacity(count as usize);
    for i in 0..count {
        let header = mine_header(prev, seed + i as u32, TEST_BITS);
        prev = header.block_hash();
        branch.push(header);
    }
    branch
}

/// The checkpoint for a chain: the header at `cp_height` plus the merkle
/// root over all block hashes up to and including it.
pub fn checkpoint_for(headers: &[Header], cp_height: u64) -> Checkpoint {
    Checkpoint {
        height: cp_height,
        raw_header: headers[cp_height as usize].to_bytes().to_vec(),
        verification_root: verification_root(headers, cp_height),
    }
}

pub fn verification_root(headers: &[Header], cp_height: u64) -> H256 {
    let leaves = proof_leaves(headers, cp_height);
    let position = cp_height as usize;
    let branch = merkle_branch(leaves.clone(), position);
    merkle_proofs::merkle_root_from_branch(leaves[position], &branch, cp_height).unwrap()
}

fn proof_leaves(headers: &[Header], cp_height: u64) -> Vec<H256> {
    headers[..=cp_height as usize]
        .iter()
        .map(Header::block_hash)
        .collect()
}

pub struct FakeChain {
    pub cp_height: u64,
    pub headers: Vec<Header>,
    pub tip_height: u64,
}

type ClientHandle = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct FakeState {
    chain: Mutex<FakeChain>,
    calls: Mutex<Vec<(String, Value)>>,
    clients: tokio::sync::Mutex<Vec<ClientHandle>>,
    protocol_string: String,
    broadcast_error: Option<(i64, String)>,
    history: Mutex<Value>,
}

impl FakeState {
    /// Sends a line to every client that ever connected; gone clients
    /// are skipped silently.
    async fn send_to_all(&self, line: &str) {
        let clients = self.clients.lock().await.clone();
        for client in clients {
            let _ = client.lock().await.write_all(line.as_bytes()).await;
        }
    }
}

/// One fake server on a loopback port.
pub struct FakeServer {
    pub host: String,
    pub port: u16,
    state: Arc<FakeState>,
}

impl FakeServer {
    pub async fn start(chain: FakeChain) -> FakeServer {
        Self::start_with(chain, "1.4.3", None).await
    }

    pub async fn start_with(
        chain: FakeChain,
        protocol_string: &str,
        broadcast_error: Option<(i64, String)>,
    ) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(FakeState {
            chain: Mutex::new(chain),
            calls: Mutex::new(Vec::new()),
            clients: tokio::sync::Mutex::new(Vec::new()),
            protocol_string: protocol_string.to_string(),
            broadcast_error,
            history: Mutex::new(json!([])),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (read, write) = stream.into_split();
                let client: ClientHandle = Arc::new(tokio::sync::Mutex::new(write));
                accept_state.clients.lock().await.push(client.clone());
                let conn_state = accept_state.clone();
                tokio::spawn(serve_connection(conn_state, read, client));
            }
        });

        FakeServer {
            host: addr.ip().to_string(),
            port: addr.port(),
            state,
        }
    }

    /// The "host:port:t" form the registry parses.
    pub fn spec(&self) -> String {
        format!("{}:{}:t", self.host, self.port)
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn set_chain(&self, chain: FakeChain) {
        *self.state.chain.lock().unwrap() = chain;
    }

    pub fn set_tip_height(&self, tip_height: u64) {
        self.state.chain.lock().unwrap().tip_height = tip_height;
    }

    pub fn set_history(&self, history: Value) {
        *self.state.history.lock().unwrap() = history;
    }

    /// Pushes a headers.subscribe notification for the current tip to
    /// every connected client.
    pub async fn notify_tip(&self) {
        let payload = {
            let chain = self.state.chain.lock().unwrap();
            tip_payload(&chain)
        };
        let line = format!(
            "{}\n",
            json!({
                "jsonrpc": "2.0",
                "method": "blockchain.headers.subscribe",
                "params": [payload],
            })
        );
        self.state.send_to_all(&line).await;
    }

    /// Pushes a scripthash status notification to every client.
    pub async fn notify_status(&self, script_hash: &str, status: Option<&str>) {
        let status = match status {
            Some(status) => Value::String(status.to_string()),
            None => Value::Null,
        };
        let line = format!(
            "{}\n",
            json!({
                "jsonrpc": "2.0",
                "method": "blockchain.scripthash.subscribe",
                "params": [script_hash, status],
            })
        );
        self.state.send_to_all(&line).await;
    }
}

async fn serve_connection(
    state: Arc<FakeState>,
    read: tokio::net::tcp::OwnedReadHalf,
    client: ClientHandle,
) {
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
            return;
        };
        let reply = match frame {
            Value::Array(items) => {
                let replies: Vec<Value> =
                    items.iter().map(|item| respond(&state, item)).collect();
                Value::Array(replies)
            }
            item => respond(&state, &item),
        };
        let line = format!("{reply}\n");
        if client.lock().await.write_all(line.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn respond(state: &Arc<FakeState>, request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    state
        .calls
        .lock()
        .unwrap()
        .push((method.clone(), params.clone()));

    match handle(state, &method, &params) {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0", "id": id,
            "error": {"code": code, "message": message},
        }),
    }
}

fn tip_payload(chain: &FakeChain) -> Value {
    let header = &chain.headers[chain.tip_height as usize];
    json!({
        "hex": hex::encode(header.to_bytes()),
        "height": chain.tip_height,
    })
}

fn handle(state: &Arc<FakeState>, method: &str, params: &Value) -> Result<Value, (i64, String)> {
    let chain = state.chain.lock().unwrap();
    match method {
        "server.version" => Ok(json!(["FakeServer 1.0", state.protocol_string])),
        "server.ping" => Ok(Value::Null),
        "server.banner" => Ok(json!("welcome to the fake server")),
        "server.donation_address" => Ok(json!("1FakeDonationAddress")),
        "server.peers.subscribe" => Ok(json!([])),
        "blockchain.headers.subscribe" => Ok(tip_payload(&chain)),
        "blockchain.block.header" => {
            let height = params[0].as_u64().ok_or((1, "bad height".to_string()))?;
            let cp_height = params.get(1).and_then(Value::as_u64).unwrap_or(0);
            if height > chain.tip_height {
                return Err((1, format!("height {height} out of range")));
            }
            let header = &chain.headers[height as usize];
            if cp_height > 0 {
                let leaves: Vec<H256> = chain.headers[..=cp_height as usize]
                    .iter()
                    .map(Header::block_hash)
                    .collect();
                let branch = merkle_branch(leaves.clone(), height as usize);
                let root = merkle_proofs::merkle_root_from_branch(
                    leaves[height as usize],
                    &branch,
                    height,
                )
                .unwrap();
                Ok(json!({
                    "header": hex::encode(header.to_bytes()),
                    "root": root.to_rev_hex(),
                    "branch": branch.iter().map(H256::to_rev_hex).collect::<Vec<_>>(),
                }))
            } else {
                Ok(json!(hex::encode(header.to_bytes())))
            }
        }
        "blockchain.block.headers" => {
            let start = params[0].as_u64().ok_or((1, "bad height".to_string()))?;
            let count = params[1].as_u64().ok_or((1, "bad count".to_string()))?;
            let cp_height = params.get(2).and_then(Value::as_u64).unwrap_or(0);
            let last = (start + count - 1).min(chain.tip_height);
            if start > last {
                return Err((1, "start beyond tip".to_string()));
            }
            let mut raw = String::new();
            for height in start..=last {
                raw.push_str(&hex::encode(chain.headers[height as usize].to_bytes()));
            }
            let rec_count = last - start + 1;
            let mut result = json!({"count": rec_count, "hex": raw, "max": 2016});
            if cp_height > 0 {
                let leaves: Vec<H256> = chain.headers[..=cp_height as usize]
                    .iter()
                    .map(Header::block_hash)
                    .collect();
                let branch = merkle_branch(leaves.clone(), last as usize);
                let root = merkle_proofs::merkle_root_from_branch(
                    leaves[last as usize],
                    &branch,
                    last,
                )
                .unwrap();
                result["root"] = json!(root.to_rev_hex());
                result["branch"] = json!(branch.iter().map(H256::to_rev_hex).collect::<Vec<_>>());
            }
            Ok(result)
        }
        "blockchain.scripthash.subscribe" => Ok(Value::Null),
        "blockchain.scripthash.unsubscribe" => Ok(json!(true)),
        "blockchain.scripthash.get_history" => Ok(state.history.lock().unwrap().clone()),
        "blockchain.transaction.get" => Ok(json!("00010203")),
        "blockchain.transaction.get_merkle" => Ok(json!({"merkle": [], "pos": 0})),
        "blockchain.transaction.broadcast" => match &state.broadcast_error {
            Some((code, message)) => Err((*code, message.clone())),
            None => Ok(json!(double_sha256(b"tx").to_rev_hex())),
        },
        other => Err((-32601, format!("unknown method {other}"))),
    }
}

/// A scriptable wallet for end-to-end tests.
pub struct TestWallet {
    name: String,
    observed: Vec<Address>,
    history: Mutex<HashMap<Address, Vec<(String, i64)>>>,
    pub undone: Mutex<Vec<u64>>,
    request_count: AtomicUsize,
    response_count: AtomicUsize,
    never: Notify,
}

impl TestWallet {
    pub fn new(name: &str, observed: Vec<Address>) -> Arc<TestWallet> {
        Arc::new(TestWallet {
            name: name.to_string(),
            observed,
            history: Mutex::new(HashMap::new()),
            undone: Mutex::new(Vec::new()),
            request_count: AtomicUsize::new(0),
            response_count: AtomicUsize::new(0),
            never: Notify::new(),
        })
    }

    pub fn counts(&self) -> (usize, usize) {
        (
            self.request_count.load(Ordering::SeqCst),
            self.response_count.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl Wallet for TestWallet {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn get_observed_addresses(&self) -> Vec<Address> {
        self.observed.clone()
    }

    async fn new_addresses(&self) -> Vec<Address> {
        self.never.notified().await;
        Vec::new()
    }

    async fn used_addresses(&self) -> Vec<Address> {
        self.never.notified().await;
        Vec::new()
    }

    fn get_address_history(&self, address: &Address) -> Vec<(String, i64)> {
        self.history
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    async fn set_address_history(
        &self,
        address: &Address,
        history: Vec<(String, i64)>,
        _tx_fees: HashMap<String, u64>,
    ) {
        self.history.lock().unwrap().insert(*address, history);
    }

    fn missing_transactions(&self) -> Vec<String> {
        Vec::new()
    }

    fn unverified_transactions(&self) -> HashMap<String, u64> {
        HashMap::new()
    }

    fn add_transaction(&self, _tx_hash: &str, _tx_hex: &str) {}

    fn add_verified_tx(
        &self,
        _tx_hash: &str,
        _height: u64,
        _timestamp: u32,
        _position: u64,
        _branch: Vec<H256>,
    ) {
    }

    fn undo_verifications(&self, above_height: u64) {
        self.undone.lock().unwrap().push(above_height);
    }

    fn add_request_count(&self, n: usize) {
        self.request_count.fetch_add(n, Ordering::SeqCst);
    }

    fn add_response_count(&self, n: usize) {
        self.response_count.fetch_add(n, Ordering::SeqCst);
    }

    async fn wait_txs_changed(&self) {
        self.never.notified().await;
    }

    async fn synchronize_loop(&self) {
        self.never.notified().await;
    }
}

/// Polls `predicate` until it holds or `secs` elapse.
pub async fn wait_for(what: &str, secs: u64, mut predicate: impl FnMut() -> bool) {
    for _ in 0..secs * 40 {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
