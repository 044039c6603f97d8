//! # Chain View
//!
//! The slice of chain state the network layer needs: block identifiers,
//! the heaviest tip set and the genesis block. Block validation and sync
//! live elsewhere; this module only describes what a node claims about
//! itself.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Cid
// ---------------------------------------------------------------------------

/// Content-addressed block identifier. Opaque to this crate; carried on the
/// wire as its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ---------------------------------------------------------------------------
// Tip Set
// ---------------------------------------------------------------------------

/// The set of blocks at a chain head, in canonical order, plus its height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSet {
    pub cids: Vec<Cid>,
    pub height: u64,
}

impl TipSet {
    pub fn new(cids: Vec<Cid>, height: u64) -> Self {
        Self { cids, height }
    }

    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }

    /// Canonical head descriptor, e.g. `{c1,c2}`. Two nodes on the same head
    /// produce the same key.
    pub fn key(&self) -> String {
        let inner: Vec<&str> = self.cids.iter().map(Cid::as_str).collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// Chain Reader
// ---------------------------------------------------------------------------

/// Read-only view of the local chain, supplied by the node.
///
/// Implementations are called from many tasks at once and must not block
/// for long.
pub trait ChainReader: Send + Sync {
    /// Hash of the genesis block this node is running.
    fn genesis(&self) -> Cid;

    /// Current heaviest tip set, or `None` before the chain is loaded.
    fn heaviest_tip_set(&self) -> Option<TipSet>;
}

/// A chain view held in memory and updated by whoever owns the chain.
/// Used by the node binary and tests; real nodes plug in their chain store.
#[derive(Debug)]
pub struct MemoryChain {
    genesis: Cid,
    head: RwLock<Option<TipSet>>,
}

impl MemoryChain {
    pub fn new(genesis: Cid) -> Self {
        Self {
            genesis,
            head: RwLock::new(None),
        }
    }

    pub fn with_head(genesis: Cid, head: TipSet) -> Self {
        Self {
            genesis,
            head: RwLock::new(Some(head)),
        }
    }

    /// Replaces the heaviest tip set.
    pub fn set_head(&self, head: TipSet) {
        *self.head.write() = Some(head);
    }
}

impl ChainReader for MemoryChain {
    fn genesis(&self) -> Cid {
        self.genesis.clone()
    }

    fn heaviest_tip_set(&self) -> Option<TipSet> {
        self.head.read().clone()
    }
}
