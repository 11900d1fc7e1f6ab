//! RFC 6962 Merkle tree hashing and proof verification.
//!
//! The verification algorithms follow RFC 9162 §2.1.3.2 (inclusion) and
//! §2.1.4.2 (consistency). The proof *builders* exist for release tooling
//! and tests; the device only ever verifies.

use sha2::{Digest, Sha256};

use vdrive_core::{VdriveError, VdriveResult};

pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update(leaf);
    h.finalize().into()
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = Sha256::new();
    h.update([NODE_PREFIX]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Verify that `leaf` is the `index`-th of `size` leaves under `root`.
pub fn verify_inclusion(
    leaf: &Hash,
    index: u64,
    size: u64,
    proof: &[Hash],
    root: &Hash,
) -> VdriveResult<()> {
    if index >= size {
        return Err(VdriveError::Ota("inclusion index beyond tree size".into()));
    }

    let mut fnode = index;
    let mut snode = size - 1;
    let mut hash = *leaf;

    for p in proof {
        if snode == 0 {
            return Err(VdriveError::Ota("inclusion proof too long".into()));
        }

        if fnode & 1 == 1 || fnode == snode {
            hash = node_hash(p, &hash);

            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            hash = node_hash(&hash, p);
        }

        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(VdriveError::Ota("inclusion proof too short".into()));
    }

    if &hash != root {
        return Err(VdriveError::Ota("inclusion proof mismatch".into()));
    }

    Ok(())
}

/// Verify that the tree of `new_size` leaves under `new_root` is an
/// append-only extension of the tree of `old_size` under `old_root`.
pub fn verify_consistency(
    old_size: u64,
    new_size: u64,
    old_root: &Hash,
    new_root: &Hash,
    proof: &[Hash],
) -> VdriveResult<()> {
    if old_size == 0 || old_size > new_size {
        return Err(VdriveError::Ota("invalid consistency sizes".into()));
    }

    if old_size == new_size {
        if old_root == new_root && proof.is_empty() {
            return Ok(());
        }
        return Err(VdriveError::Ota("consistency proof mismatch".into()));
    }

    // when the old size is a power of two, the old root seeds the walk
    let mut path = proof.iter();
    let seed = if old_size.is_power_of_two() {
        old_root
    } else {
        path.next()
            .ok_or_else(|| VdriveError::Ota("empty consistency proof".into()))?
    };

    let mut fnode = old_size - 1;
    let mut snode = new_size - 1;

    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut fr = *seed;
    let mut sr = *seed;

    for c in path {
        if snode == 0 {
            return Err(VdriveError::Ota("consistency proof too long".into()));
        }

        if fnode & 1 == 1 || fnode == snode {
            fr = node_hash(c, &fr);
            sr = node_hash(c, &sr);

            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            sr = node_hash(&sr, c);
        }

        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(VdriveError::Ota("consistency proof too short".into()));
    }

    if &fr != old_root || &sr != new_root {
        return Err(VdriveError::Ota("consistency proof mismatch".into()));
    }

    Ok(())
}

/// Merkle tree hash of a leaf batch (release tooling and tests).
pub fn tree_hash(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Sha256::digest([]).into(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&tree_hash(&leaves[..k]), &tree_hash(&leaves[k..]))
        }
    }
}

/// Inclusion path for leaf `index` (release tooling and tests).
pub fn inclusion_proof(leaves: &[Hash], index: usize) -> Vec<Hash> {
    let n = leaves.len();

    if n <= 1 {
        return Vec::new();
    }

    let k = split_point(n);

    if index < k {
        let mut proof = inclusion_proof(&leaves[..k], index);
        proof.push(tree_hash(&leaves[k..]));
        proof
    } else {
        let mut proof = inclusion_proof(&leaves[k..], index - k);
        proof.push(tree_hash(&leaves[..k]));
        proof
    }
}

/// Consistency path between the first `old` leaves and the whole batch
/// (release tooling and tests).
pub fn consistency_proof(leaves: &[Hash], old: usize) -> Vec<Hash> {
    subproof(leaves, old, true)
}

fn subproof(leaves: &[Hash], m: usize, complete: bool) -> Vec<Hash> {
    let n = leaves.len();

    if m == n {
        if complete {
            return Vec::new();
        }
        return vec![tree_hash(leaves)];
    }

    let k = split_point(n);

    if m <= k {
        let mut proof = subproof(&leaves[..k], m, complete);
        proof.push(tree_hash(&leaves[k..]));
        proof
    } else {
        let mut proof = subproof(&leaves[k..], m - k, false);
        proof.push(tree_hash(&leaves[..k]));
        proof
    }
}

/// Largest power of two strictly less than `n`.
fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    1 << (usize::BITS - 1 - (n - 1).leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| leaf_hash(&[i as u8])).collect()
    }

    #[test]
    fn test_split_point() {
        assert_eq!(split_point(2), 1);
        assert_eq!(split_point(3), 2);
        assert_eq!(split_point(4), 2);
        assert_eq!(split_point(5), 4);
        assert_eq!(split_point(8), 4);
        assert_eq!(split_point(9), 8);
    }

    #[test]
    fn test_known_small_trees() {
        let l = leaves(3);

        // RFC 6962 structure: MTH = H(0x01 || H(0x01 || l0 || l1) || l2)
        let expected = node_hash(&node_hash(&l[0], &l[1]), &l[2]);
        assert_eq!(tree_hash(&l), expected);
    }

    #[test]
    fn test_inclusion_all_positions() {
        for n in 1..=20usize {
            let l = leaves(n);
            let root = tree_hash(&l);

            for i in 0..n {
                let proof = inclusion_proof(&l, i);
                verify_inclusion(&l[i], i as u64, n as u64, &proof, &root)
                    .unwrap_or_else(|e| panic!("n={n} i={i}: {e}"));
            }
        }
    }

    #[test]
    fn test_inclusion_rejects_wrong_leaf() {
        let l = leaves(7);
        let root = tree_hash(&l);
        let proof = inclusion_proof(&l, 3);

        assert!(verify_inclusion(&l[4], 3, 7, &proof, &root).is_err());
        assert!(verify_inclusion(&l[3], 4, 7, &proof, &root).is_err());
        assert!(verify_inclusion(&l[3], 3, 7, &proof[..proof.len() - 1], &root).is_err());
    }

    #[test]
    fn test_consistency_all_prefixes() {
        for n in 2..=16usize {
            let l = leaves(n);
            let new_root = tree_hash(&l);

            for m in 1..n {
                let old_root = tree_hash(&l[..m]);
                let proof = consistency_proof(&l, m);

                verify_consistency(m as u64, n as u64, &old_root, &new_root, &proof)
                    .unwrap_or_else(|e| panic!("m={m} n={n}: {e}"));
            }
        }
    }

    #[test]
    fn test_consistency_same_size() {
        let l = leaves(5);
        let root = tree_hash(&l);

        verify_consistency(5, 5, &root, &root, &[]).unwrap();
        assert!(verify_consistency(5, 5, &root, &leaf_hash(b"x"), &[]).is_err());
    }

    #[test]
    fn test_consistency_rejects_forked_log() {
        let honest = leaves(8);
        let mut forked = honest.clone();
        forked[2] = leaf_hash(b"rewritten history");

        let old_root = tree_hash(&honest[..4]);
        let new_root = tree_hash(&forked);
        let proof = consistency_proof(&forked, 4);

        assert!(verify_consistency(4, 8, &old_root, &new_root, &proof).is_err());
    }
}
