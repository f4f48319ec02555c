//! Merkle inclusion proofs over a block's transaction id list
//!
//! Proofs are built over ids in the byte order the source node reports
//! them, and the hashing convention is supplied by a [`NodeHasher`]. The
//! encoded form submitted to the transport contract is:
//!
//! ```text
//! leaf_index (32 bytes, big-endian) || sibling_0 || sibling_1 || ... || sibling_n
//! ```
//!
//! with siblings ordered from the leaf level up to the level below the root.

use thiserror::Error;

use crate::hash::double_sha256;

/// Width of the leaf index prefix in the encoded proof
pub const INDEX_WIDTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("cannot build a proof over an empty transaction list")]
    EmptyTree,
    #[error("leaf index {index} out of range for {len} transactions")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("malformed proof encoding of {0} bytes")]
    Malformed(usize),
}

/// Combines two child nodes into their parent
pub trait NodeHasher {
    fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32];
}

/// Bitcoin-family convention: ids are displayed byte-reversed, nodes are
/// double SHA-256 over the internal-order concatenation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayOrderSha256d;

impl NodeHasher for DisplayOrderSha256d {
    fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
        let mut buf = [0u8; 64];
        for i in 0..32 {
            buf[i] = left[31 - i];
            buf[32 + i] = right[31 - i];
        }
        let mut out = double_sha256(&buf);
        out.reverse();
        out
    }
}

/// Sibling path proving one transaction's inclusion under a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_index: u64,
    /// Leaf level first
    pub siblings: Vec<[u8; 32]>,
    /// Root the proof was built against
    pub root: [u8; 32],
}

fn next_level<H: NodeHasher>(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => H::hash_pair(left, right),
            // Odd level: the lone node pairs with itself
            [single] => H::hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

/// Compute the Merkle root of an ordered id list
pub fn compute_root<H: NodeHasher>(leaves: &[[u8; 32]]) -> Result<[u8; 32], MerkleError> {
    if leaves.is_empty() {
        return Err(MerkleError::EmptyTree);
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level::<H>(&level);
    }
    Ok(level[0])
}

/// Build the inclusion proof for `leaves[index]`
pub fn build_proof<H: NodeHasher>(
    leaves: &[[u8; 32]],
    index: usize,
) -> Result<MerkleProof, MerkleError> {
    if leaves.is_empty() {
        return Err(MerkleError::EmptyTree);
    }
    if index >= leaves.len() {
        return Err(MerkleError::IndexOutOfRange {
            index,
            len: leaves.len(),
        });
    }

    let mut siblings = Vec::new();
    let mut level = leaves.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = position ^ 1;
        // Lone trailing node is its own sibling
        siblings.push(*level.get(sibling).unwrap_or(&level[position]));
        level = next_level::<H>(&level);
        position >>= 1;
    }

    Ok(MerkleProof {
        leaf_index: index as u64,
        siblings,
        root: level[0],
    })
}

impl MerkleProof {
    /// Fold the sibling path over `leaf`, choosing sides by index parity
    pub fn root_for<H: NodeHasher>(&self, leaf: &[u8; 32]) -> [u8; 32] {
        let mut node = *leaf;
        let mut position = self.leaf_index;
        for sibling in &self.siblings {
            node = if position & 1 == 0 {
                H::hash_pair(&node, sibling)
            } else {
                H::hash_pair(sibling, &node)
            };
            position >>= 1;
        }
        node
    }

    /// Check the proof links `leaf` to `root`
    pub fn verify<H: NodeHasher>(&self, leaf: &[u8; 32], root: &[u8; 32]) -> bool {
        &self.root_for::<H>(leaf) == root
    }

    /// Wire encoding expected by the transport contract
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INDEX_WIDTH + self.siblings.len() * 32);
        let mut index = [0u8; INDEX_WIDTH];
        index[INDEX_WIDTH - 8..].copy_from_slice(&self.leaf_index.to_be_bytes());
        out.extend_from_slice(&index);
        for sibling in &self.siblings {
            out.extend_from_slice(sibling);
        }
        out
    }

    /// Parse the wire encoding. The root is not part of it and must be
    /// supplied by the caller.
    pub fn decode(bytes: &[u8], root: [u8; 32]) -> Result<Self, MerkleError> {
        if bytes.len() < INDEX_WIDTH || (bytes.len() - INDEX_WIDTH) % 32 != 0 {
            return Err(MerkleError::Malformed(bytes.len()));
        }
        let (index, path) = bytes.split_at(INDEX_WIDTH);
        // Indices beyond u64 cannot address a real block
        if index[..INDEX_WIDTH - 8].iter().any(|b| *b != 0) {
            return Err(MerkleError::Malformed(bytes.len()));
        }
        let mut low = [0u8; 8];
        low.copy_from_slice(&index[INDEX_WIDTH - 8..]);

        let siblings = path
            .chunks_exact(32)
            .map(|chunk| {
                let mut s = [0u8; 32];
                s.copy_from_slice(chunk);
                s
            })
            .collect();

        Ok(Self {
            leaf_index: u64::from_be_bytes(low),
            siblings,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::parse_bytes32;

    type H = DisplayOrderSha256d;

    // Bitcoin mainnet block 100000
    const BLOCK_100000_TXIDS: [&str; 4] = [
        "8c14f0db3df150123e6f3dbbf30f8b955a8249b62ac1d1ff16284aefa3d06d87",
        "fff2525b8931402dd09222c50775608f75787bd2b87e56995a7bdd30f79702c4",
        "6359f0868171b1d194cbee1af2f16ea598ae8fad666d9b012c8ed2b79a236ec4",
        "e9a66845e05d5abc0ad04ec80f774a7e585c6e8db975962d069a522137b80c1d",
    ];
    const BLOCK_100000_ROOT: &str =
        "f3e94742aca4b5ef85488dc37c06c3282295ffec960994b2c0d5ac2a25a95766";

    fn txids(list: &[&str]) -> Vec<[u8; 32]> {
        list.iter().map(|s| parse_bytes32(s).unwrap()).collect()
    }

    fn synthetic(n: usize) -> Vec<[u8; 32]> {
        (0..n)
            .map(|i| crate::hash::double_sha256(&(i as u64).to_le_bytes()))
            .collect()
    }

    #[test]
    fn test_root_matches_mainnet_block() {
        let leaves = txids(&BLOCK_100000_TXIDS);
        let root = compute_root::<H>(&leaves).unwrap();
        assert_eq!(hex::encode(root), BLOCK_100000_ROOT);
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let leaves = txids(&BLOCK_100000_TXIDS[..3]);
        let root = compute_root::<H>(&leaves).unwrap();
        assert_eq!(
            hex::encode(root),
            "fa435470825de273081dcc706b25514c936fa6dc80ab965ce6970d68ddd0b553"
        );

        // Last leaf's first sibling is itself
        let proof = build_proof::<H>(&leaves, 2).unwrap();
        assert_eq!(proof.siblings[0], leaves[2]);
        assert!(proof.verify::<H>(&leaves[2], &root));
        for (i, leaf) in leaves.iter().enumerate() {
            let proof = build_proof::<H>(&leaves, i).unwrap();
            assert!(proof.verify::<H>(leaf, &root), "index {}", i);
        }
    }

    #[test]
    fn test_proof_verifies_for_every_index() {
        for n in 1..=17 {
            let leaves = synthetic(n);
            let root = compute_root::<H>(&leaves).unwrap();
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = build_proof::<H>(&leaves, i).unwrap();
                assert_eq!(proof.root, root);
                assert!(proof.verify::<H>(leaf, &root), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_single_leaf_has_empty_path() {
        let leaves = synthetic(1);
        let proof = build_proof::<H>(&leaves, 0).unwrap();
        assert!(proof.siblings.is_empty());
        assert_eq!(proof.root, leaves[0]);
        assert_eq!(proof.encode().len(), INDEX_WIDTH);
    }

    #[test]
    fn test_tampered_sibling_fails() {
        let leaves = txids(&BLOCK_100000_TXIDS);
        let root = compute_root::<H>(&leaves).unwrap();
        let mut proof = build_proof::<H>(&leaves, 1).unwrap();
        proof.siblings[0][5] ^= 0x01;
        assert!(!proof.verify::<H>(&leaves[1], &root));
    }

    #[test]
    fn test_wrong_leaf_or_root_fails() {
        let leaves = synthetic(6);
        let root = compute_root::<H>(&leaves).unwrap();
        let proof = build_proof::<H>(&leaves, 3).unwrap();
        assert!(!proof.verify::<H>(&leaves[2], &root));
        assert!(!proof.verify::<H>(&leaves[3], &[0u8; 32]));
    }

    #[test]
    fn test_out_of_range_and_empty() {
        assert_eq!(build_proof::<H>(&[], 0), Err(MerkleError::EmptyTree));
        assert_eq!(
            build_proof::<H>(&synthetic(3), 3),
            Err(MerkleError::IndexOutOfRange { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_encoding_layout() {
        let leaves = synthetic(5);
        let proof = build_proof::<H>(&leaves, 4).unwrap();
        let encoded = proof.encode();

        assert_eq!(encoded.len(), INDEX_WIDTH + 32 * proof.siblings.len());
        assert!(encoded[..31].iter().all(|b| *b == 0));
        assert_eq!(encoded[31], 4);
        assert_eq!(&encoded[32..64], &proof.siblings[0]);

        let decoded = MerkleProof::decode(&encoded, proof.root).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        assert!(MerkleProof::decode(&[0u8; 31], [0u8; 32]).is_err());
        assert!(MerkleProof::decode(&[0u8; 40], [0u8; 32]).is_err());
        let mut huge = [0u8; 32];
        huge[0] = 1;
        assert!(MerkleProof::decode(&huge, [0u8; 32]).is_err());
    }
}
