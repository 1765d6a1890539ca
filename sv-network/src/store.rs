use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use sv_types::{target_from_bits, Checkpoint, ExtendedHeader, Header, PowParams, H256, U256};

pub type ChainId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("missing header")]
    MissingHeader,
    #[error("incorrect bits: expected {expected:#010x}, got {got:#010x}")]
    IncorrectBits { expected: u32, got: u32 },
    #[error("insufficient proof of work: hash {hash} above target for bits {bits:#010x}")]
    InsufficientPoW { hash: H256, bits: u32 },
    #[error("prev_hash does not connect")]
    ChainBreak,
    #[error("headers below the checkpoint lack a checkpoint proof")]
    UnprovenHeaders,
    #[error("header must be 80 bytes")]
    BadEncoding,
}

/// The persistent header database, consumed by the network core through
/// this interface. Chains are addressed by opaque ids; every chain shares
/// ancestry with the base chain rooted at the checkpoint.
pub trait HeaderStore: Send + Sync {
    fn checkpoint(&self) -> Checkpoint;
    fn longest_chain(&self) -> ChainId;
    fn chains(&self) -> Vec<ChainId>;
    fn chain_height(&self, chain: ChainId) -> u64;
    fn header_at_height(&self, chain: ChainId, height: u64) -> Result<Header, HeaderError>;
    /// The latest chain both arguments descend from, and the greatest
    /// height common to both.
    fn common_chain_and_height(&self, a: ChainId, b: ChainId) -> (ChainId, u64);
    /// Records a header in the trusted pre-checkpoint region. The caller
    /// has already proven it against the checkpoint root.
    fn set_one(&self, height: u64, raw: &[u8]) -> Result<(), HeaderError>;
    /// Connects a header above the checkpoint, verifying bits, proof of
    /// work and ancestry.
    fn connect(&self, raw: &[u8]) -> Result<(ExtendedHeader, ChainId), HeaderError>;
    fn flush(&self) -> Result<(), HeaderError>;
}

struct ChainInfo {
    parent: Option<ChainId>,
    /// First height owned by this chain; lower heights live on ancestors.
    base_height: u64,
    tip_height: u64,
}

struct StoreInner {
    checkpoint: Checkpoint,
    pow: PowParams,
    skip_pow_verification: bool,
    pool: HashMap<H256, ExtendedHeader>,
    by_height: HashMap<(ChainId, u64), H256>,
    chains: Vec<ChainInfo>,
    flushes: u64,
}

/// Reference in-memory store. Keeps every submitted header keyed by hash
/// with its accumulated chain work, tracks forks as child chains, and
/// elects the longest chain by most accumulated work.
pub struct MemoryHeaderStore {
    inner: Mutex<StoreInner>,
}

impl MemoryHeaderStore {
    /// Seeds the base chain with the checkpoint header so connection can
    /// proceed upward from it.
    ///
    /// # Panics
    /// * the checkpoint header is not 80 bytes
    #[must_use]
    pub fn new(checkpoint: Checkpoint, pow: PowParams, skip_pow_verification: bool) -> Self {
        let header = Header::from_bytes(&checkpoint.raw_header)
            .expect("checkpoint header must be 80 bytes");
        let hash = header.block_hash();
        let extended = ExtendedHeader {
            block_header: header,
            block_hash: hash,
            chain_work: header.work(),
            block_height: checkpoint.height,
        };

        let mut pool = HashMap::new();
        pool.insert(hash, extended);
        let mut by_height = HashMap::new();
        by_height.insert((0, checkpoint.height), hash);

        MemoryHeaderStore {
            inner: Mutex::new(StoreInner {
                pow,
                skip_pow_verification,
                pool,
                by_height,
                chains: vec![ChainInfo {
                    parent: None,
                    base_height: 0,
                    tip_height: checkpoint.height,
                }],
                flushes: 0,
                checkpoint,
            }),
        }
    }

    /// How many times `flush` has been called; exposed for tests.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.inner.lock().unwrap().flushes
    }
}

impl StoreInner {
    fn hash_at(&self, chain: ChainId, height: u64) -> Option<H256> {
        let mut chain = chain;
        loop {
            let info = self.chains.get(chain as usize)?;
            if height >= info.base_height {
                return self.by_height.get(&(chain, height)).copied();
            }
            chain = info.parent?;
        }
    }

    fn tip_work(&self, chain: ChainId) -> U256 {
        let info = &self.chains[chain as usize];
        self.hash_at(chain, info.tip_height)
            .and_then(|hash| self.pool.get(&hash))
            .map(|h| h.chain_work)
            .unwrap_or(U256::ZERO)
    }

    fn longest(&self) -> ChainId {
        let mut best = 0;
        let mut best_work = self.tip_work(0);
        for id in 1..self.chains.len() as ChainId {
            let work = self.tip_work(id);
            if work > best_work {
                best = id;
                best_work = work;
            }
        }
        best
    }

    /// The chain owning the entry for `hash` at `height`, if any.
    fn owning_chain(&self, hash: &H256, height: u64) -> Option<ChainId> {
        (0..self.chains.len() as ChainId)
            .find(|id| self.by_height.get(&(*id, height)) == Some(hash))
    }

    fn prev_extended(&self, header: &Header) -> Option<&ExtendedHeader> {
        self.pool.get(&header.prev_block_hash)
    }

    /// The bits required of a header extending `prev`, per the 2016-block
    /// retarget rule. Falls back to the previous bits when the adjustment
    /// window predates the stored history.
    fn next_required_bits(&self, prev: &ExtendedHeader, header: &Header, chain: ChainId) -> u32 {
        let pow = &self.pow;
        if (prev.block_height + 1) % pow.blocks_per_adjustment != 0 {
            if pow.allow_min_difficulty_blocks {
                if header.time > prev.block_header.time + 2 * pow.target_spacing_secs {
                    return pow.proof_of_work_limit_bits;
                }
                let mut current = prev.clone();
                while current.block_header.bits == pow.proof_of_work_limit_bits
                    && current.block_height % pow.blocks_per_adjustment != 0
                {
                    match self.prev_extended(&current.block_header) {
                        Some(earlier) => current = earlier.clone(),
                        None => break,
                    }
                }
                return current.block_header.bits;
            }
            return prev.block_header.bits;
        }

        let first_height = prev.block_height - (pow.blocks_per_adjustment - 1);
        let first = self
            .hash_at(chain, first_height)
            .and_then(|hash| self.pool.get(&hash));
        match first {
            Some(first) => {
                calculate_next_work_required(pow, prev, i64::from(first.block_header.time))
            }
            None => prev.block_header.bits,
        }
    }
}

fn calculate_next_work_required(pow: &PowParams, prev: &ExtendedHeader, first_time: i64) -> u32 {
    let prev_time = i64::from(prev.block_header.time);
    let mut actual_timespan = prev_time - first_time;
    if actual_timespan < pow.target_timespan_secs / 4 {
        actual_timespan = pow.target_timespan_secs / 4;
    }
    if actual_timespan > pow.target_timespan_secs * 4 {
        actual_timespan = pow.target_timespan_secs * 4;
    }

    let target = target_from_bits(prev.block_header.bits);
    let (mut new_target, overflow) = target.overflowing_mul(actual_timespan as u64);
    if overflow {
        return pow.proof_of_work_limit_bits;
    }
    new_target = new_target / U256::from(pow.target_timespan_secs as u64);

    let limit = target_from_bits(pow.proof_of_work_limit_bits);
    if new_target > limit {
        new_target = limit;
    }
    new_target.target_to_bits()
}

impl HeaderStore for MemoryHeaderStore {
    fn checkpoint(&self) -> Checkpoint {
        self.inner.lock().unwrap().checkpoint.clone()
    }

    fn longest_chain(&self) -> ChainId {
        self.inner.lock().unwrap().longest()
    }

    fn chains(&self) -> Vec<ChainId> {
        let inner = self.inner.lock().unwrap();
        (0..inner.chains.len() as ChainId).collect()
    }

    fn chain_height(&self, chain: ChainId) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .chains
            .get(chain as usize)
            .map(|c| c.tip_height)
            .unwrap_or(0)
    }

    fn header_at_height(&self, chain: ChainId, height: u64) -> Result<Header, HeaderError> {
        let inner = self.inner.lock().unwrap();
        inner
            .hash_at(chain, height)
            .and_then(|hash| inner.pool.get(&hash))
            .map(|extended| extended.block_header)
            .ok_or(HeaderError::MissingHeader)
    }

    fn common_chain_and_height(&self, a: ChainId, b: ChainId) -> (ChainId, u64) {
        let inner = self.inner.lock().unwrap();
        let lineage = |id: ChainId| -> Vec<(ChainId, u64)> {
            let mut out = Vec::new();
            let mut chain = id;
            let mut top = inner
                .chains
                .get(chain as usize)
                .map(|c| c.tip_height)
                .unwrap_or(0);
            loop {
                out.push((chain, top));
                let info = match inner.chains.get(chain as usize) {
                    Some(info) => info,
                    None => break,
                };
                match info.parent {
                    Some(parent) => {
                        top = info.base_height.saturating_sub(1);
                        chain = parent;
                    }
                    None => break,
                }
            }
            out
        };

        let ours = lineage(a);
        for (chain, their_top) in lineage(b) {
            if let Some((_, our_top)) = ours.iter().find(|(id, _)| *id == chain) {
                return (chain, (*our_top).min(their_top));
            }
        }
        (0, 0)
    }

    fn set_one(&self, height: u64, raw: &[u8]) -> Result<(), HeaderError> {
        let header = Header::from_bytes(raw).map_err(|_| HeaderError::BadEncoding)?;
        let hash = header.block_hash();
        let mut inner = self.inner.lock().unwrap();
        if height > inner.checkpoint.height {
            // Trust stops at the checkpoint; anything above must connect.
            return Err(HeaderError::MissingHeader);
        }
        let extended = ExtendedHeader {
            block_header: header,
            block_hash: hash,
            chain_work: header.work(),
            block_height: height,
        };
        inner.pool.insert(hash, extended);
        inner.by_height.insert((0, height), hash);
        Ok(())
    }

    fn connect(&self, raw: &[u8]) -> Result<(ExtendedHeader, ChainId), HeaderError> {
        let header = Header::from_bytes(raw).map_err(|_| HeaderError::BadEncoding)?;
        let hash = header.block_hash();
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.pool.get(&hash).cloned() {
            if let Some(chain) = inner.owning_chain(&hash, existing.block_height) {
                return Ok((existing, chain));
            }
        }

        let prev = inner
            .prev_extended(&header)
            .cloned()
            .ok_or(HeaderError::MissingHeader)?;
        let height = prev.block_height + 1;
        let prev_chain = inner
            .owning_chain(&prev.block_hash, prev.block_height)
            .ok_or(HeaderError::MissingHeader)?;

        if !inner.skip_pow_verification {
            let expected = inner.next_required_bits(&prev, &header, prev_chain);
            if header.bits != expected {
                return Err(HeaderError::IncorrectBits {
                    expected,
                    got: header.bits,
                });
            }
            let target = header.target();
            if target.is_zero() || U256::from_le_bytes(&hash.0) > target {
                return Err(HeaderError::InsufficientPoW {
                    hash,
                    bits: header.bits,
                });
            }
        }

        let chain_work = prev.chain_work.wrapping_add(header.work());
        let extended = ExtendedHeader {
            block_header: header,
            block_hash: hash,
            chain_work,
            block_height: height,
        };

        let extends_tip = inner.chains[prev_chain as usize].tip_height == prev.block_height;
        let chain = if extends_tip {
            inner.chains[prev_chain as usize].tip_height = height;
            prev_chain
        } else {
            inner.chains.push(ChainInfo {
                parent: Some(prev_chain),
                base_height: height,
                tip_height: height,
            });
            (inner.chains.len() - 1) as ChainId
        };

        inner.pool.insert(hash, extended.clone());
        inner.by_height.insert((chain, height), hash);
        Ok((extended, chain))
    }

    fn flush(&self) -> Result<(), HeaderError> {
        self.inner.lock().unwrap().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{checkpoint_at, mine_header, pow_params, REGTEST_BITS};

    fn store() -> MemoryHeaderStore {
        MemoryHeaderStore::new(checkpoint_at(100), pow_params(), false)
    }

    #[test]
    fn connect_extends_the_base_chain() {
        let store = store();
        let cp_header = Header::from_bytes(&store.checkpoint().raw_header).unwrap();
        let next = mine_header(cp_header.block_hash(), 1, REGTEST_BITS);

        let (extended, chain) = store.connect(&next.to_bytes()).unwrap();
        assert_eq!(chain, 0);
        assert_eq!(extended.block_height, 101);
        assert_eq!(store.chain_height(0), 101);
        assert_eq!(store.longest_chain(), 0);
        assert_eq!(store.header_at_height(0, 101).unwrap(), next);
    }

    #[test]
    fn connect_is_idempotent() {
        let store = store();
        let cp_header = Header::from_bytes(&store.checkpoint().raw_header).unwrap();
        let next = mine_header(cp_header.block_hash(), 1, REGTEST_BITS);

        let (_, first) = store.connect(&next.to_bytes()).unwrap();
        let (_, second) = store.connect(&next.to_bytes()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.chain_height(0), 101);
    }

    #[test]
    fn unknown_parent_is_missing_header() {
        let store = store();
        let orphan = mine_header(sv_types::double_sha256(b"nowhere"), 1, REGTEST_BITS);
        assert_eq!(
            store.connect(&orphan.to_bytes()).unwrap_err(),
            HeaderError::MissingHeader
        );
    }

    #[test]
    fn wrong_bits_are_rejected() {
        let store = store();
        let cp_header = Header::from_bytes(&store.checkpoint().raw_header).unwrap();
        let bad = mine_header(cp_header.block_hash(), 1, 0x2000_ffff);
        assert!(matches!(
            store.connect(&bad.to_bytes()).unwrap_err(),
            HeaderError::IncorrectBits { .. }
        ));
    }

    #[test]
    fn hash_above_target_is_rejected() {
        let store = store();
        let cp_header = Header::from_bytes(&store.checkpoint().raw_header).unwrap();
        // Claim regtest bits but craft a header whose hash was never mined
        // against them: bits participate in the hash, so find a nonce whose
        // hash FAILS the target.
        let mut header = mine_header(cp_header.block_hash(), 1, REGTEST_BITS);
        let target = header.target();
        loop {
            header.nonce = header.nonce.wrapping_add(1);
            if U256::from_le_bytes(&header.block_hash().0) > target {
                break;
            }
        }
        assert!(matches!(
            store.connect(&header.to_bytes()).unwrap_err(),
            HeaderError::InsufficientPoW { .. }
        ));
    }

    #[test]
    fn fork_with_more_work_wins() {
        let store = store();
        let cp_header = Header::from_bytes(&store.checkpoint().raw_header).unwrap();

        // Main chain: two blocks.
        let a1 = mine_header(cp_header.block_hash(), 1, REGTEST_BITS);
        let a2 = mine_header(a1.block_hash(), 2, REGTEST_BITS);
        store.connect(&a1.to_bytes()).unwrap();
        store.connect(&a2.to_bytes()).unwrap();
        assert_eq!(store.longest_chain(), 0);

        // Fork from the checkpoint: one block, less total work.
        let b1 = mine_header(cp_header.block_hash(), 100, REGTEST_BITS);
        let (_, fork) = store.connect(&b1.to_bytes()).unwrap();
        assert_ne!(fork, 0);
        assert_eq!(store.longest_chain(), 0);

        // Extend the fork past the main chain.
        let b2 = mine_header(b1.block_hash(), 101, REGTEST_BITS);
        let b3 = mine_header(b2.block_hash(), 102, REGTEST_BITS);
        store.connect(&b2.to_bytes()).unwrap();
        store.connect(&b3.to_bytes()).unwrap();
        assert_eq!(store.longest_chain(), fork);
        assert_eq!(store.chain_height(fork), 103);
    }

    #[test]
    fn common_chain_of_fork_and_base() {
        let store = store();
        let cp_header = Header::from_bytes(&store.checkpoint().raw_header).unwrap();

        let mut prev = cp_header.block_hash();
        for i in 0..4 {
            let h = mine_header(prev, i, REGTEST_BITS);
            prev = h.block_hash();
            store.connect(&h.to_bytes()).unwrap();
        }
        // Fork at height 101: shares heights 100..=101 with the base chain.
        let shared = store.header_at_height(0, 101).unwrap();
        let f1 = mine_header(shared.block_hash(), 50, REGTEST_BITS);
        let (_, fork) = store.connect(&f1.to_bytes()).unwrap();

        assert_eq!(store.common_chain_and_height(0, fork), (0, 101));
        assert_eq!(store.common_chain_and_height(fork, 0), (0, 101));
        assert_eq!(store.common_chain_and_height(0, 0), (0, 104));
    }

    #[test]
    fn set_one_only_writes_the_trusted_region() {
        let store = store();
        let header = mine_header(sv_types::double_sha256(b"trusted"), 7, REGTEST_BITS);
        store.set_one(42, &header.to_bytes()).unwrap();
        assert_eq!(store.header_at_height(0, 42).unwrap(), header);

        assert_eq!(
            store.set_one(101, &header.to_bytes()).unwrap_err(),
            HeaderError::MissingHeader
        );
        assert_eq!(store.set_one(42, &[0u8; 12]).unwrap_err(), HeaderError::BadEncoding);
    }

    #[test]
    fn flush_is_counted() {
        let store = store();
        store.flush().unwrap();
        store.flush().unwrap();
        assert_eq!(store.flush_count(), 2);
    }
}
