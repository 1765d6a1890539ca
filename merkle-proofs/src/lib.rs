use std::fmt;

pub use sv_types::hash::{double_sha256, H256};

/// The claimed position does not fit the branch: bits of the index were
/// left over after every sibling was consumed.
#[derive(Debug, PartialEq, Eq)]
pub struct BranchError {
    pub leftover_index: u64,
    pub branch_len: usize,
}

impl fmt::Display for BranchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index {} out of range for proof of length {}",
            self.leftover_index, self.branch_len
        )
    }
}

impl std::error::Error for BranchError {}

/// Recomputes the merkle root from a leaf, its sibling branch and its
/// position index. Each branch element is combined on the side selected
/// by the low bit of the index, which is then shifted out.
pub fn merkle_root_from_branch(
    leaf: H256,
    branch: &[H256],
    index: u64,
) -> Result<H256, BranchError> {
    let mut current = leaf;
    let mut position = index;

    for sibling in branch {
        let mut concat = Vec::with_capacity(64);
        if position & 1 == 1 {
            concat.extend_from_slice(&sibling.0);
            concat.extend_from_slice(&current.0);
        } else {
            concat.extend_from_slice(&current.0);
            concat.extend_from_slice(&sibling.0);
        }
        current = double_sha256(&concat);
        position >>= 1;
    }

    if position != 0 {
        return Err(BranchError {
            leftover_index: position,
            branch_len: branch.len(),
        });
    }
    Ok(current)
}

/// Hash of an 80-byte serialized block header.
#[must_use]
pub fn header_hash(raw: &[u8]) -> H256 {
    double_sha256(raw)
}

/// Builds the sibling branch for `position` over `leaves`. Odd levels
/// duplicate their last element, as the block merkle tree does.
#[must_use]
pub fn merkle_branch(leaves: Vec<H256>, position: usize) -> Vec<H256> {
    let mut branch = Vec::new();
    let mut level = leaves;
    let mut position = position;

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1]);
        }

        branch.push(level[position ^ 1]);

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut concat = Vec::with_capacity(64);
            concat.extend_from_slice(&pair[0].0);
            concat.extend_from_slice(&pair[1].0);
            next.push(double_sha256(&concat));
        }
        level = next;
        position /= 2;
    }

    branch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> H256 {
        double_sha256(&[n])
    }

    fn root_of(leaves: &[H256]) -> H256 {
        let mut level = leaves.to_vec();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(level[level.len() - 1]);
            }
            let mut next = Vec::new();
            for pair in level.chunks(2) {
                let mut concat = Vec::with_capacity(64);
                concat.extend_from_slice(&pair[0].0);
                concat.extend_from_slice(&pair[1].0);
                next.push(double_sha256(&concat));
            }
            level = next;
        }
        level[0]
    }

    #[test]
    fn empty_branch_is_identity() {
        let h = leaf(1);
        assert_eq!(merkle_root_from_branch(h, &[], 0).unwrap(), h);
    }

    #[test]
    fn branch_proves_every_position() {
        let leaves: Vec<H256> = (0..8).map(leaf).collect();
        let root = root_of(&leaves);
        for (position, &l) in leaves.iter().enumerate() {
            let branch = merkle_branch(leaves.clone(), position);
            assert_eq!(branch.len(), 3);
            assert_eq!(
                merkle_root_from_branch(l, &branch, position as u64).unwrap(),
                root
            );
        }
    }

    #[test]
    fn odd_leaf_count_duplicates_tail() {
        let leaves: Vec<H256> = (0..5).map(leaf).collect();
        let root = root_of(&leaves);
        let branch = merkle_branch(leaves.clone(), 4);
        assert_eq!(
            merkle_root_from_branch(leaves[4], &branch, 4).unwrap(),
            root
        );
    }

    #[test]
    fn short_branch_for_index_fails() {
        // A proof of length 0 cannot place a leaf at position 3.
        let err = merkle_root_from_branch(leaf(9), &[], 3).unwrap_err();
        assert_eq!(err.leftover_index, 3);

        // One sibling only shifts out one bit.
        let err = merkle_root_from_branch(leaf(9), &[leaf(1)], 3).unwrap_err();
        assert_eq!(err.leftover_index, 1);
        assert_eq!(err.branch_len, 1);
    }

    #[test]
    fn combination_order_follows_index_bits() {
        // At height h = 0b101, the first level combines sibling-first.
        let l = leaf(0);
        let b0 = leaf(1);
        let b1 = leaf(2);
        let b2 = leaf(3);

        let mut step = Vec::with_capacity(64);
        step.extend_from_slice(&b0.0);
        step.extend_from_slice(&l.0);
        let mut acc = double_sha256(&step);

        let mut step = Vec::with_capacity(64);
        step.extend_from_slice(&acc.0);
        step.extend_from_slice(&b1.0);
        acc = double_sha256(&step);

        let mut step = Vec::with_capacity(64);
        step.extend_from_slice(&b2.0);
        step.extend_from_slice(&acc.0);
        acc = double_sha256(&step);

        assert_eq!(
            merkle_root_from_branch(l, &[b0, b1, b2], 0b101).unwrap(),
            acc
        );
    }

    #[test]
    fn header_hash_is_double_sha() {
        let raw = [0x5a_u8; 80];
        assert_eq!(header_hash(&raw), double_sha256(&raw));
    }
}
