//! Cryptographic fingerprints for transactions and blocks using Blake3

use crate::error::HashError;
use blake3::Hasher as Blake3Hasher;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte digest identifying a transaction, block or Merkle node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Available hash primitives. Blake3 is the only provider today; the
/// indirection keeps the digest format replaceable without touching callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashProvider {
    Blake3,
}

/// Fingerprinter computes content digests for the engine
///
/// All identity in the chain funnels through this type: transaction hashes,
/// block header hashes and Merkle roots. A node with an unset provider must
/// fail loudly rather than fall back to anything platform dependent.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    provider: Option<HashProvider>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            provider: Some(HashProvider::Blake3),
        }
    }

    /// A fingerprinter with no configured provider. Every hashing call
    /// fails; used to exercise misconfiguration handling.
    pub fn unset() -> Self {
        Self { provider: None }
    }

    /// Compute the digest of arbitrary bytes
    ///
    /// Empty input is accepted: the hash of nothing is well defined, and
    /// callers that care record the oddity in their audit log.
    pub fn hash(&self, data: &[u8]) -> Result<Digest, HashError> {
        match self.provider {
            Some(HashProvider::Blake3) => {
                let mut hasher = Blake3Hasher::new();
                hasher.update(data);
                Ok(Digest(*hasher.finalize().as_bytes()))
            }
            None => Err(HashError::ProviderUnset),
        }
    }

    /// Apply the base hash twice
    ///
    /// Block and Merkle-node identity uses the doubled form to resist
    /// length-extension style collisions on the underlying primitive.
    pub fn double_hash(&self, data: &[u8]) -> Result<Digest, HashError> {
        let first = self.hash(data)?;
        self.hash(&first.0)
    }

    /// Compute the Merkle root over an ordered list of byte strings
    ///
    /// The inputs form level 0 verbatim. At every level adjacent pairs are
    /// combined with `double_hash(left || right)` and a trailing odd node is
    /// promoted unchanged to the next level, so a single input comes back
    /// untouched. The empty list yields `double_hash(b"0")`. Reordering the
    /// inputs changes the root.
    pub fn merkle_root(&self, items: &[Vec<u8>]) -> Result<Vec<u8>, HashError> {
        if self.provider.is_none() {
            return Err(HashError::ProviderUnset);
        }
        if items.is_empty() {
            return Ok(self.double_hash(b"0")?.0.to_vec());
        }
        let mut level: Vec<Vec<u8>> = items.to_vec();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / 2 + 1);
            let mut chunks = level.chunks_exact(2);
            for pair in &mut chunks {
                let mut joined = pair[0].clone();
                joined.extend_from_slice(&pair[1]);
                next.push(self.double_hash(&joined)?.0.to_vec());
            }
            if let [odd] = chunks.remainder() {
                next.push(odd.clone());
            }
            level = next;
        }
        Ok(level.remove(0))
    }

    /// Double-hash every transaction body of a block, order preserved
    ///
    /// These digests identify the transactions and are the Merkle leaves of
    /// the block body. Leaf hashing is data parallel; the output order is
    /// the input order, so the result is identical on every node.
    pub fn tx_fingerprints(&self, bodies: &[Vec<u8>]) -> Result<Vec<Digest>, HashError> {
        bodies
            .par_iter()
            .map(|body| self.double_hash(body))
            .collect()
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}
