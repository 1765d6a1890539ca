//! The wallet collaborator contract and the per-wallet maintainer that
//! keeps a wallet synchronized through the main session: fetching missing
//! transactions, verifying merkle proofs, and rolling subscriptions
//! forward as addresses are observed and used up.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};

use merkle_proofs::merkle_root_from_branch;
use sv_types::{Address, H256};

use crate::error::SessionError;
use crate::network::{NetworkEvent, NetworkInner};
use crate::subscriptions::WalletRef;

/// What the network core needs from a wallet. Everything else about the
/// wallet (derivation, signing, UTXO accounting) stays behind this line.
#[async_trait]
pub trait Wallet: Send + Sync {
    fn name(&self) -> String;

    /// Addresses the wallet currently watches.
    fn get_observed_addresses(&self) -> Vec<Address>;
    /// Waits for and returns the next batch of newly observed addresses.
    async fn new_addresses(&self) -> Vec<Address>;
    /// Waits for and returns the next batch of fully used addresses.
    async fn used_addresses(&self) -> Vec<Address>;

    fn get_address_history(&self, address: &Address) -> Vec<(String, i64)>;
    async fn set_address_history(
        &self,
        address: &Address,
        history: Vec<(String, i64)>,
        tx_fees: HashMap<String, u64>,
    );

    /// Transaction hashes the wallet references but does not hold.
    fn missing_transactions(&self) -> Vec<String>;
    /// tx_hash -> height for transactions lacking an SPV proof.
    fn unverified_transactions(&self) -> HashMap<String, u64>;
    fn add_transaction(&self, tx_hash: &str, tx_hex: &str);
    fn add_verified_tx(
        &self,
        tx_hash: &str,
        height: u64,
        timestamp: u32,
        position: u64,
        branch: Vec<H256>,
    );
    fn undo_verifications(&self, above_height: u64);

    /// Progress counters surfaced in the UI.
    fn add_request_count(&self, n: usize);
    fn add_response_count(&self, n: usize);

    /// Resolves when the wallet's transaction set changes.
    async fn wait_txs_changed(&self);
    /// The wallet's own synchronization loop; runs for the lifetime of
    /// the maintainer.
    async fn synchronize_loop(&self);
}

/// Runs all monitors for one wallet, restarting them on the next main
/// session after any recoverable session error.
pub(crate) async fn maintain_wallet(inner: Arc<NetworkInner>, wallet: WalletRef) {
    info!("maintaining wallet {}", wallet.wallet.name());
    loop {
        let result = tokio::select! {
            r = monitor_txs(&inner, &wallet) => r,
            r = monitor_new_addresses(&inner, &wallet) => r,
            r = monitor_used_addresses(&inner, &wallet) => r,
            () = wallet.wallet.synchronize_loop() => Ok(()),
        };
        if let Err(err) = result {
            let blacklist = err.wants_blacklist();
            if let Some(session) = inner.main_session() {
                session.disconnect(&err.to_string(), blacklist).await;
            }
        }
    }
}

async fn monitor_txs(inner: &Arc<NetworkInner>, wallet: &WalletRef) -> Result<(), SessionError> {
    loop {
        let (txs, proofs) = tokio::join!(
            request_transactions(inner, wallet),
            request_proofs(inner, wallet),
        );
        // Try again right away if either half timed out.
        if txs? | proofs? {
            continue;
        }
        wallet.wallet.wait_txs_changed().await;
    }
}

/// Fetches the wallet's missing transactions through the main session.
/// Returns whether any request timed out.
pub(crate) async fn request_transactions(
    inner: &Arc<NetworkInner>,
    wallet: &WalletRef,
) -> Result<bool, SessionError> {
    let missing = wallet.wallet.missing_transactions();
    if missing.is_empty() {
        return Ok(false);
    }
    wallet.wallet.add_request_count(missing.len());
    let session = inner.main_session_wait().await;
    debug!("requesting {} missing transactions", missing.len());

    let fetches = missing.iter().map(|tx_hash| {
        let session = &session;
        async move { (tx_hash, session.request_tx(tx_hash).await) }
    });
    let mut had_timeout = false;
    for (tx_hash, result) in futures::future::join_all(fetches).await {
        wallet.wallet.add_response_count(1);
        match result {
            Ok(tx_hex) => {
                debug!("received tx {tx_hash} bytes: {}", tx_hex.len() / 2);
                wallet.wallet.add_transaction(tx_hash, &tx_hex);
                inner.trigger_callback(&NetworkEvent::NewTransaction {
                    tx_hex,
                    wallet: wallet.wallet.name(),
                });
            }
            Err(SessionError::Timeout(_)) => had_timeout = true,
            Err(e) => error!("fetching transaction {tx_hash}: {e}"),
        }
    }
    Ok(had_timeout)
}

/// Fetches and checks merkle proofs for the wallet's unverified
/// transactions. Returns whether any request timed out.
pub(crate) async fn request_proofs(
    inner: &Arc<NetworkInner>,
    wallet: &WalletRef,
) -> Result<bool, SessionError> {
    let wanted: HashMap<String, u64> = wallet.wallet.unverified_transactions();
    if wanted.is_empty() {
        return Ok(false);
    }
    let session = inner.main_session_wait().await;
    debug!("requesting {} proofs", wanted.len());

    let heights: Vec<u64> = wanted.values().copied().collect();
    let headers = session.headers_at_heights(&heights).await?;

    let fetches = wanted.iter().map(|(tx_hash, height)| {
        let session = &session;
        async move { (tx_hash, *height, session.request_proof(tx_hash, *height).await) }
    });
    let mut had_timeout = false;
    for (tx_hash, height, result) in futures::future::join_all(fetches).await {
        match result {
            Ok(proof) => {
                let parsed = (|| {
                    let obj = proof.as_object()?;
                    let position = obj.get("pos")?.as_u64()?;
                    let branch: Option<Vec<H256>> = obj
                        .get("merkle")?
                        .as_array()?
                        .iter()
                        .map(|item| item.as_str().and_then(|s| H256::from_rev_hex(s).ok()))
                        .collect();
                    Some((position, branch?))
                })();
                let (position, branch) = match parsed {
                    Some(parsed) => parsed,
                    None => {
                        error!("getting proof for {tx_hash}: malformed response");
                        continue;
                    }
                };
                let leaf = match H256::from_rev_hex(tx_hash) {
                    Ok(leaf) => leaf,
                    Err(_) => {
                        error!("getting proof for {tx_hash}: bad transaction hash");
                        continue;
                    }
                };
                let proven_root = match merkle_root_from_branch(leaf, &branch, position) {
                    Ok(root) => root,
                    Err(e) => {
                        error!("getting proof for {tx_hash}: {e}");
                        continue;
                    }
                };
                let header = match headers.get(&height) {
                    Some(header) => header,
                    None => continue,
                };
                if header.merkle_root == proven_root {
                    debug!("received valid proof for {tx_hash}");
                    wallet.wallet.add_verified_tx(
                        tx_hash,
                        height,
                        header.time,
                        position,
                        branch,
                    );
                } else {
                    error!(
                        "invalid proof for tx {tx_hash} in block {}; got {} expected {}",
                        header.block_hash().to_rev_hex(),
                        proven_root.to_rev_hex(),
                        header.merkle_root.to_rev_hex()
                    );
                }
            }
            Err(SessionError::Timeout(_)) => had_timeout = true,
            Err(e) => error!("getting proof for {tx_hash}: {e}"),
        }
    }
    Ok(had_timeout)
}

async fn monitor_new_addresses(
    inner: &Arc<NetworkInner>,
    wallet: &WalletRef,
) -> Result<(), SessionError> {
    let mut addresses = wallet.wallet.get_observed_addresses();
    loop {
        let session = inner.main_session_wait().await;
        info!(
            "subscribing to {} new addresses for {}",
            addresses.len(),
            wallet.wallet.name()
        );
        // Newest first, so the gap limit slides forward with fewer full
        // re-sync passes.
        let mut pairs: Vec<(Address, String)> = addresses
            .iter()
            .map(|address| (*address, address.script_hash_hex()))
            .collect();
        pairs.reverse();
        session.subscribe_to_pairs(wallet, pairs).await?;
        addresses = wallet.wallet.new_addresses().await;
    }
}

async fn monitor_used_addresses(
    inner: &Arc<NetworkInner>,
    wallet: &WalletRef,
) -> Result<(), SessionError> {
    loop {
        let addresses = wallet.wallet.used_addresses().await;
        let session = inner.main_session_wait().await;
        info!(
            "unsubscribing from {} used addresses for {}",
            addresses.len(),
            wallet.wallet.name()
        );
        let pairs: Vec<(Address, String)> = addresses
            .iter()
            .map(|address| (*address, address.script_hash_hex()))
            .collect();
        session.unsubscribe_from_pairs(wallet, pairs).await?;
    }
}
