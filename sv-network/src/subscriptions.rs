use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use sv_types::{sha256, Address};

use crate::wallet::Wallet;

/// A wallet registered with the network, addressed by the id assigned at
/// `add_wallet` time.
#[derive(Clone)]
pub struct WalletRef {
    pub id: u64,
    pub wallet: Arc<dyn Wallet>,
}

struct WalletSubs {
    wallet: Arc<dyn Wallet>,
    subs: Vec<String>,
}

#[derive(Default)]
struct Tables {
    by_wallet: HashMap<u64, WalletSubs>,
    address_map: HashMap<String, Address>,
}

/// Which wallet is subscribed to which script hash, and which address a
/// script hash stands for. Shared by every session of one network so a
/// main-server handover starts from the same subscription set.
#[derive(Default)]
pub struct SubscriptionTable {
    tables: Mutex<Tables>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_wallet(&self, wallet: &WalletRef) {
        let mut tables = self.tables.lock().unwrap();
        tables.by_wallet.entry(wallet.id).or_insert_with(|| WalletSubs {
            wallet: wallet.wallet.clone(),
            subs: Vec::new(),
        });
    }

    #[must_use]
    pub fn is_registered(&self, wallet_id: u64) -> bool {
        self.tables.lock().unwrap().by_wallet.contains_key(&wallet_id)
    }

    /// Records a pair for a wallet. The subscription request is still
    /// issued even when another wallet already holds the script hash.
    pub fn record(&self, wallet: &WalletRef, script_hash: &str, address: Address) {
        let mut tables = self.tables.lock().unwrap();
        let entry = tables.by_wallet.entry(wallet.id).or_insert_with(|| WalletSubs {
            wallet: wallet.wallet.clone(),
            subs: Vec::new(),
        });
        if !entry.subs.iter().any(|s| s == script_hash) {
            entry.subs.push(script_hash.to_string());
        }
        tables.address_map.insert(script_hash.to_string(), address);
    }

    #[must_use]
    pub fn address_for(&self, script_hash: &str) -> Option<Address> {
        self.tables.lock().unwrap().address_map.get(script_hash).copied()
    }

    #[must_use]
    pub fn subscription_count(&self, wallet_id: u64) -> usize {
        self.tables
            .lock()
            .unwrap()
            .by_wallet
            .get(&wallet_id)
            .map(|w| w.subs.len())
            .unwrap_or(0)
    }

    /// Wallets subscribed to the script hash whose stored history hashes
    /// to something other than the notified status.
    #[must_use]
    pub fn wallets_with_stale_status(
        &self,
        script_hash: &str,
        status: Option<&str>,
    ) -> Vec<(Arc<dyn Wallet>, Address)> {
        let tables = self.tables.lock().unwrap();
        let address = match tables.address_map.get(script_hash) {
            Some(address) => *address,
            None => return Vec::new(),
        };
        tables
            .by_wallet
            .values()
            .filter(|entry| entry.subs.iter().any(|s| s == script_hash))
            .filter(|entry| {
                let history = entry.wallet.get_address_history(&address);
                history_status(&history).as_deref() != status
            })
            .map(|entry| (entry.wallet.clone(), address))
            .collect()
    }

    /// Script hashes held by this wallet and no other: the only ones whose
    /// network unsubscribe is safe.
    #[must_use]
    pub fn exclusive_subs(&self, wallet_id: u64) -> HashSet<String> {
        let tables = self.tables.lock().unwrap();
        Self::exclusive_locked(&tables, wallet_id)
    }

    fn exclusive_locked(tables: &Tables, wallet_id: u64) -> HashSet<String> {
        let mut set: HashSet<String> = match tables.by_wallet.get(&wallet_id) {
            Some(entry) => entry.subs.iter().cloned().collect(),
            None => return HashSet::new(),
        };
        for (other_id, other) in &tables.by_wallet {
            if *other_id == wallet_id {
                continue;
            }
            for sub in &other.subs {
                set.remove(sub);
            }
        }
        set
    }

    /// Drops one pair if the wallet still holds it at this moment.
    pub fn remove_pair(&self, wallet_id: u64, script_hash: &str) -> bool {
        let mut tables = self.tables.lock().unwrap();
        let removed = match tables.by_wallet.get_mut(&wallet_id) {
            Some(entry) => {
                let before = entry.subs.len();
                entry.subs.retain(|s| s != script_hash);
                entry.subs.len() != before
            }
            None => false,
        };
        if removed {
            tables.address_map.remove(script_hash);
        }
        removed
    }

    /// Removes the wallet entirely. Returns the script hashes that no
    /// other wallet still needs, for the caller to unsubscribe remotely.
    pub fn unsubscribe_wallet(&self, wallet_id: u64) -> Vec<String> {
        let mut tables = self.tables.lock().unwrap();
        let exclusive = Self::exclusive_locked(&tables, wallet_id);
        if tables.by_wallet.remove(&wallet_id).is_none() {
            return Vec::new();
        }
        for script_hash in &exclusive {
            tables.address_map.remove(script_hash);
        }
        exclusive.into_iter().collect()
    }

    /// Atomically reseats the tables for a main-server handover: the new
    /// session starts from empty per-wallet sets and re-subscribes from
    /// the returned snapshot.
    #[must_use]
    pub fn take_all(&self) -> Vec<(WalletRef, Vec<(Address, String)>)> {
        let mut tables = self.tables.lock().unwrap();
        let mut snapshot = Vec::new();
        let address_map = std::mem::take(&mut tables.address_map);
        for (id, entry) in tables.by_wallet.iter_mut() {
            let pairs: Vec<(Address, String)> = entry
                .subs
                .drain(..)
                .filter_map(|script_hash| {
                    address_map
                        .get(&script_hash)
                        .map(|address| (*address, script_hash))
                })
                .collect();
            snapshot.push((
                WalletRef {
                    id: *id,
                    wallet: entry.wallet.clone(),
                },
                pairs,
            ));
        }
        snapshot
    }
}

/// The Electrum status of a history: sha256 over the concatenation of
/// "tx_hash:height:" in server order, lowercase hex. Empty history has no
/// status.
#[must_use]
pub fn history_status(history: &[(String, i64)]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut status = String::new();
    for (tx_hash, height) in history {
        status.push_str(tx_hash);
        status.push(':');
        status.push_str(&height.to_string());
        status.push(':');
    }
    Some(sha256(status.as_bytes()).to_hex())
}
