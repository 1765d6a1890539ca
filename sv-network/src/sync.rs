//! Header synchronization: bringing a session's view of the chain up to a
//! server's tip with every header verified, either against the checkpoint
//! proof or by proof of work through the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, error};
use tokio::sync::watch;

use merkle_proofs::{header_hash, merkle_root_from_branch};
use sv_types::{Checkpoint, Header, H256};

use crate::error::SessionError;
use crate::store::{ChainId, HeaderError, HeaderStore};

pub(crate) const HEADER_SIZE: usize = 80;
/// Headers immediately preceding the checkpoint needed for difficulty
/// retargeting above it.
pub(crate) const CHECKPOINT_DAA_WINDOW: u64 = 146;
pub(crate) const CHUNK_SIZE: u64 = 2016;

/// Sync state shared by every session of one network: the cached
/// checkpoint-headers check and the per-tip catch-up throttle.
pub(crate) struct SyncState {
    need_checkpoint_headers: AtomicBool,
    connecting_tips: Mutex<HashMap<Vec<u8>, watch::Receiver<bool>>>,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        SyncState {
            need_checkpoint_headers: AtomicBool::new(true),
            connecting_tips: Mutex::new(HashMap::new()),
        }
    }
}

/// Returns (start_height, count) of the pre-checkpoint headers still
/// missing, or (0, 0) once they are all present. The all-present answer
/// is cached.
pub(crate) fn required_checkpoint_headers(
    state: &SyncState,
    store: &dyn HeaderStore,
) -> (u64, u64) {
    if !state.need_checkpoint_headers.load(Ordering::Acquire) {
        return (0, 0);
    }
    let checkpoint = store.checkpoint();
    if checkpoint.height == 0 {
        state.need_checkpoint_headers.store(false, Ordering::Release);
        return (0, 0);
    }
    let chain = store.longest_chain();
    let start = checkpoint.height.saturating_sub(CHECKPOINT_DAA_WINDOW);
    for height in start..checkpoint.height {
        if store.header_at_height(chain, height).is_err() {
            return (height, checkpoint.height - height);
        }
    }
    state.need_checkpoint_headers.store(false, Ordering::Release);
    (0, 0)
}

/// Records one header. At or below the checkpoint the caller has already
/// proven it; above, the store verifies bits, proof of work and ancestry.
pub(crate) fn connect_header(
    store: &dyn HeaderStore,
    height: u64,
    raw: &[u8],
) -> Result<(Header, ChainId), HeaderError> {
    let checkpoint = store.checkpoint();
    if height <= checkpoint.height {
        store.set_one(height, raw)?;
        store.flush()?;
        let header = Header::from_bytes(raw).map_err(|_| HeaderError::BadEncoding)?;
        Ok((header, store.longest_chain()))
    } else {
        store
            .connect(raw)
            .map(|(extended, chain)| (extended.block_header, chain))
    }
}

/// Connects a contiguous chunk of raw headers starting at `start_height`.
/// `last_header_proven` says whether the caller verified the chunk's final
/// header against the checkpoint root; only then may headers below the
/// checkpoint be trusted on nothing but their prev_hash links. Everything
/// above the checkpoint goes through the store's verifying path. The
/// store is flushed on every exit path.
pub(crate) fn connect_chunk(
    store: &dyn HeaderStore,
    start_height: u64,
    raw_chunk: &[u8],
    last_header_proven: bool,
) -> Result<ChainId, HeaderError> {
    let result = connect_chunk_inner(store, start_height, raw_chunk, last_header_proven);
    match result {
        Ok(chain) => {
            store.flush()?;
            Ok(chain)
        }
        Err(e) => {
            let _ = store.flush();
            Err(e)
        }
    }
}

fn connect_chunk_inner(
    store: &dyn HeaderStore,
    start_height: u64,
    raw_chunk: &[u8],
    last_header_proven: bool,
) -> Result<ChainId, HeaderError> {
    if raw_chunk.len() % HEADER_SIZE != 0 {
        return Err(HeaderError::BadEncoding);
    }
    let count = (raw_chunk.len() / HEADER_SIZE) as u64;
    if count == 0 {
        return Ok(store.longest_chain());
    }
    let checkpoint = store.checkpoint();
    let end_height = start_height + count;

    let extract = |height: u64| -> &[u8] {
        let offset = ((height - start_height) as usize) * HEADER_SIZE;
        &raw_chunk[offset..offset + HEADER_SIZE]
    };

    // Walks backward from a trusted header, verifying each prev_hash link
    // and recording heights [start_height, to_height).
    let verify_backward_and_set = |trusted_raw: &[u8], to_height: u64| -> Result<(), HeaderError> {
        let mut next: Vec<u8> = trusted_raw.to_vec();
        for height in (start_height..to_height).rev() {
            let raw = extract(height);
            let next_header =
                Header::from_bytes(&next).map_err(|_| HeaderError::BadEncoding)?;
            if next_header.prev_block_hash != header_hash(raw) {
                return Err(HeaderError::ChainBreak);
            }
            store.set_one(height, raw)?;
            next = raw.to_vec();
        }
        Ok(())
    };

    // At or below the checkpoint with a verified proof on the last
    // header: everything earlier only has to chain to it.
    if last_header_proven && end_height - 1 <= checkpoint.height {
        let last = extract(end_height - 1);
        store.set_one(end_height - 1, last)?;
        verify_backward_and_set(last, end_height - 1)?;
        return Ok(store.longest_chain());
    }

    // Without a proof, a chunk that falls short of the checkpoint has
    // nothing to anchor its trust. A server can legitimately truncate a
    // response, but the truncated tail must still reach the checkpoint.
    if end_height - 1 < checkpoint.height {
        return Err(HeaderError::UnprovenHeaders);
    }

    // Reaching or crossing the checkpoint: the prefix must link to the
    // known-good checkpoint header.
    if start_height <= checkpoint.height {
        if extract(checkpoint.height) != checkpoint.raw_header.as_slice() {
            return Err(HeaderError::ChainBreak);
        }
        store.set_one(checkpoint.height, &checkpoint.raw_header)?;
        verify_backward_and_set(&checkpoint.raw_header, checkpoint.height)?;
    }

    // Remaining headers go through full verification, one at a time.
    let mut chain = None;
    for height in (checkpoint.height + 1).max(start_height)..end_height {
        let (_, connected) = store.connect(extract(height))?;
        chain = Some(connected);
    }
    Ok(chain.unwrap_or_else(|| store.longest_chain()))
}

/// Verifies a server-provided checkpoint proof for the header at
/// `height`. Failures carry both digests and blacklist the server.
pub(crate) fn check_header_proof(
    checkpoint: &Checkpoint,
    hex_root: &str,
    branch: &[H256],
    raw_header: &[u8],
    height: u64,
) -> Result<(), SessionError> {
    let expected = checkpoint.verification_root;
    let received = H256::from_rev_hex(hex_root)
        .map_err(|_| SessionError::blacklist(format!("bad header merkle root {hex_root}")))?;
    if received != expected {
        error!(
            "bad header merkle root {} expected {}",
            received.to_rev_hex(),
            expected.to_rev_hex()
        );
        return Err(SessionError::blacklist(format!(
            "bad header merkle root {} expected {}",
            received.to_rev_hex(),
            expected.to_rev_hex()
        )));
    }

    let leaf = header_hash(raw_header);
    let proven = merkle_root_from_branch(leaf, branch, height)
        .map_err(|e| SessionError::blacklist(format!("invalid header proof: {e}")))?;
    if proven != expected {
        error!(
            "invalid header proof {} expected {}",
            proven.to_rev_hex(),
            expected.to_rev_hex()
        );
        return Err(SessionError::blacklist(format!(
            "invalid header proof {} expected {}",
            proven.to_rev_hex(),
            expected.to_rev_hex()
        )));
    }
    debug!("good header proof for height {height}");
    Ok(())
}

/// The probe heights used to find where a server's chain meets ours:
/// checkpoint + 1, then the tip walking down by doubling steps.
pub(crate) fn catch_up_heights(cp_height: u64, tip_height: u64, max_chain_height: u64) -> Vec<u64> {
    let mut heights = vec![cp_height + 1];
    let mut step = 1u64;
    let mut height = tip_height.min(max_chain_height);
    while height > cp_height {
        heights.push(height);
        height = height.saturating_sub(step);
        step += step;
    }
    heights
}

pub(crate) enum TipClaim {
    /// This session owns the catch-up for the tip and must call
    /// `release_tip` when done.
    Owner(watch::Sender<bool>),
    /// Another session is already connecting this tip.
    Waiter(watch::Receiver<bool>),
}

/// First claimant for a raw tip becomes the owner; everyone else waits on
/// the owner's completion instead of duplicating the work.
pub(crate) fn claim_tip(state: &SyncState, raw_tip: &[u8]) -> TipClaim {
    let mut tips = state.connecting_tips.lock().unwrap();
    if let Some(rx) = tips.get(raw_tip) {
        return TipClaim::Waiter(rx.clone());
    }
    let (tx, rx) = watch::channel(false);
    tips.insert(raw_tip.to_vec(), rx);
    TipClaim::Owner(tx)
}

pub(crate) fn release_tip(state: &SyncState, raw_tip: &[u8], owner: watch::Sender<bool>) {
    state.connecting_tips.lock().unwrap().remove(raw_tip);
    let _ = owner.send(true);
}
