//! Helpers for building small verifiable chains in tests.

use sv_types::{double_sha256, Checkpoint, Header, PowParams, H256, U256};

/// Regtest-grade difficulty: roughly every second nonce hashes under the
/// target, so "mining" in tests is a handful of hash calls.
pub(crate) const REGTEST_BITS: u32 = 0x207f_ffff;

pub(crate) fn pow_params() -> PowParams {
    PowParams {
        blocks_per_adjustment: 2016,
        target_spacing_secs: 600,
        target_timespan_secs: 2016 * 600,
        proof_of_work_limit_bits: REGTEST_BITS,
        allow_min_difficulty_blocks: false,
    }
}

/// Finds a nonce whose hash meets the claimed bits.
pub(crate) fn mine_header(prev_block_hash: H256, seed: u32, bits: u32) -> Header {
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

/// A checkpoint whose header is mined against the regtest target. The
/// verification root is a placeholder; tests exercising checkpoint proofs
/// construct their own.
pub(crate) fn checkpoint_at(height: u64) -> Checkpoint {
    let header = mine_header(double_sha256(b"checkpoint parent"), 0xc0de, REGTEST_BITS);
    Checkpoint {
        height,
        raw_header: header.to_bytes().to_vec(),
        verification_root: double_sha256(b"verification root"),
    }
}

/// A straight run of `count` mined headers starting directly above the
/// checkpoint header.
pub(crate) fn mined_chain(checkpoint: &Checkpoint, count: u64) -> Vec<Header> {
    let mut prev = Header::from_bytes(&checkpoint.raw_header)
        .expect("checkpoint header is well formed")
        .block_hash();
    let mut headers = Vec::with_capacity(count as usize);
    for i in 0..count {
        let header = mine_header(prev, i as u32 + 1, REGTEST_BITS);
        prev = header.block_hash();
        headers.push(header);
    }
    headers
}
