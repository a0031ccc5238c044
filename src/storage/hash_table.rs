//! Concurrent Chained Hash Table
//!
//! This module implements the default storage engine: a fixed array of
//! buckets, each holding a chain of nodes whose keys hash to that slot.
//!
//! ## Design Decisions
//!
//! 1. **Rolling Hash**: Polynomial string hash with multiplier 131 over the
//!    key bytes, each byte offset by `'!'`, reduced modulo the bucket count.
//! 2. **Chains as Vectors**: A chain is a `Vec<Node>` rather than linked heap
//!    nodes. Nodes are addressed by position under the bucket lock.
//! 3. **Two Lock Levels**: The bucket `RwLock` guards the chain's structure
//!    (append, unlink); each node's `Mutex` guards its value, so overwriting
//!    an existing key only needs the bucket's read lock.
//! 4. **Optional Growth**: With a max load factor configured, the table
//!    rehashes into the next prime at least twice its size. The outer table
//!    lock is taken for writing only while that happens.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                RwLock<Table>  (write only on resize)        │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐     ┌──────────┐    │
//! │  │ Bucket 0 │ │ Bucket 1 │ │ Bucket 2 │ ... │ Bucket H │    │
//! │  │ RwLock   │ │ RwLock   │ │ RwLock   │     │ RwLock   │    │
//! │  │ [n][n]   │ │ []       │ │ [n]      │     │ [n][n][n]│    │
//! │  └──────────┘ └──────────┘ └──────────┘     └──────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!        each n = key + Mutex<value>
//! ```
//!
//! Searches on the same bucket run in parallel. An insert of a new key, or
//! any delete, holds the bucket exclusively, so a reader never observes a
//! half-modified chain. The first insert into an empty bucket is covered by
//! the same bucket lock: there is no node yet, but there is always a lock.

use crate::storage::{OpContext, Record, Storage, StorageError, StorageResult};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Default number of buckets (prime).
pub const DEFAULT_BUCKETS: usize = 1_048_573;

/// Multiplier of the rolling hash.
const HASH_MULTIPLIER: u128 = 131;

/// How many buckets an export walks between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 4096;

/// One record in a chain.
#[derive(Debug)]
struct Node {
    key: String,
    value: Mutex<String>,
}

impl Node {
    fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Mutex::new(value.to_string()),
        }
    }
}

/// A bucket: the chain of nodes hashing to one slot.
type Chain = RwLock<Vec<Node>>;

/// The bucket array.
struct Table {
    buckets: Box<[Chain]>,
}

impl Table {
    fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            buckets: (0..count).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    #[inline]
    fn chain(&self, key: &str) -> &Chain {
        &self.buckets[hash(key.as_bytes(), self.buckets.len())]
    }
}

/// Computes the bucket index of `key` for a table of `modulus` buckets.
///
/// `h = Σ (byte - '!' + 1) · 131^i  mod modulus`
pub fn hash(key: &[u8], modulus: usize) -> usize {
    let m = modulus.max(1) as u128;
    let mut hash = 0u128;
    let mut power = 1u128;

    for &byte in key {
        let code = (byte as u32).wrapping_sub(b'!' as u32).wrapping_add(1) as u128;
        hash = (hash + (power * code) % m) % m;
        power = (power * HASH_MULTIPLIER) % m;
    }

    hash as usize
}

/// Smallest prime greater than or equal to `n`.
fn next_prime(n: usize) -> usize {
    let is_prime = |c: usize| {
        if c < 2 {
            return false;
        }
        let mut d = 2;
        while d * d <= c {
            if c % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    };

    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

fn read_lock<'a, T>(lock: &'a RwLock<T>, what: &'static str) -> StorageResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| StorageError::LockPoisoned(what))
}

fn write_lock<'a, T>(lock: &'a RwLock<T>, what: &'static str) -> StorageResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| StorageError::LockPoisoned(what))
}

fn node_lock(node: &Node) -> StorageResult<MutexGuard<'_, String>> {
    node.value.lock().map_err(|_| StorageError::LockPoisoned("node"))
}

/// The in-process storage engine.
///
/// Designed to be wrapped in an `Arc` and shared by every connection.
///
/// # Example
///
/// ```
/// use keyval::storage::{HashTable, OpContext, Storage};
///
/// let table = HashTable::with_buckets(1021);
/// let ctx = OpContext::background();
///
/// table.insert(&ctx, "key100000", "value100000").unwrap();
/// assert_eq!(table.search(&ctx, "key100000").unwrap(), "value100000");
///
/// assert!(table.delete(&ctx, "key100000").unwrap());
/// assert_eq!(table.search(&ctx, "key100000").unwrap(), "");
/// ```
pub struct HashTable {
    table: RwLock<Table>,
    /// Number of distinct keys
    len: AtomicUsize,
    /// Resize threshold (`None` = never resize)
    max_load_factor: Option<f64>,
    /// Statistics: number of completed resizes
    resizes: AtomicU64,
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("buckets", &self.bucket_count())
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("max_load_factor", &self.max_load_factor)
            .finish()
    }
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTable {
    /// Creates a fixed-size table with [`DEFAULT_BUCKETS`] buckets.
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    /// Creates a fixed-size table with `buckets` buckets.
    pub fn with_buckets(buckets: usize) -> Self {
        Self {
            table: RwLock::new(Table::new(buckets)),
            len: AtomicUsize::new(0),
            max_load_factor: None,
            resizes: AtomicU64::new(0),
        }
    }

    /// Creates a table that doubles (to the next prime) whenever the number
    /// of keys per bucket exceeds `max_load_factor`.
    pub fn with_max_load_factor(buckets: usize, max_load_factor: f64) -> Self {
        Self {
            max_load_factor: Some(max_load_factor),
            ..Self::with_buckets(buckets)
        }
    }

    /// Current number of buckets.
    pub fn bucket_count(&self) -> usize {
        // A poisoned outer lock still holds a valid bucket array
        match self.table.read() {
            Ok(table) => table.buckets.len(),
            Err(poisoned) => poisoned.into_inner().buckets.len(),
        }
    }

    /// Keys per bucket.
    pub fn load_factor(&self) -> f64 {
        self.len.load(Ordering::Relaxed) as f64 / self.bucket_count() as f64
    }

    /// Number of resizes performed so far.
    pub fn resize_count(&self) -> u64 {
        self.resizes.load(Ordering::Relaxed)
    }

    /// Resizes the table if the load factor crossed its threshold.
    fn maybe_grow(&self) {
        let Some(max) = self.max_load_factor else {
            return;
        };

        let observed = self.bucket_count();
        if (self.len.load(Ordering::Relaxed) as f64) / (observed as f64) <= max {
            return;
        }

        if let Err(e) = self.grow(observed) {
            warn!(error = %e, "Hash table resize failed");
        }
    }

    /// Rehashes every node into a table of the next prime ≥ 2 × `observed`.
    fn grow(&self, observed: usize) -> StorageResult<()> {
        let mut table = write_lock(&self.table, "table")?;

        // Another inserter already resized while we waited for the lock
        if table.buckets.len() != observed {
            return Ok(());
        }

        let new_count = next_prime(observed * 2 + 1);
        let mut grown: Vec<Vec<Node>> = (0..new_count).map(|_| Vec::new()).collect();

        let old = std::mem::replace(&mut *table, Table::new(1));
        for chain in old.buckets.into_vec() {
            let nodes = chain
                .into_inner()
                .map_err(|_| StorageError::LockPoisoned("bucket"))?;
            for node in nodes {
                grown[hash(node.key.as_bytes(), new_count)].push(node);
            }
        }

        *table = Table {
            buckets: grown.into_iter().map(RwLock::new).collect(),
        };
        self.resizes.fetch_add(1, Ordering::Relaxed);

        info!(
            from = observed,
            to = new_count,
            keys = self.len.load(Ordering::Relaxed),
            "Hash table resized"
        );
        Ok(())
    }
}

impl Storage for HashTable {
    fn search(&self, ctx: &OpContext, key: &str) -> StorageResult<String> {
        ctx.check()?;

        let table = read_lock(&self.table, "table")?;
        let nodes = read_lock(table.chain(key), "bucket")?;

        match nodes.iter().find(|n| n.key == key) {
            Some(node) => Ok(node_lock(node)?.clone()),
            None => Ok(String::new()),
        }
    }

    fn insert(&self, ctx: &OpContext, key: &str, value: &str) -> StorageResult<bool> {
        ctx.check()?;

        let created = {
            let table = read_lock(&self.table, "table")?;
            let chain = table.chain(key);

            // Fast path: the key exists, update its value under the node lock
            {
                let nodes = read_lock(chain, "bucket")?;
                if let Some(node) = nodes.iter().find(|n| n.key == key) {
                    *node_lock(node)? = value.to_string();
                    return Ok(true);
                }
            }

            // Slow path: structural change, take the bucket exclusively
            let mut nodes = write_lock(chain, "bucket")?;

            // Another inserter may have appended the key between the two locks
            match nodes.iter().find(|n| n.key == key) {
                Some(node) => {
                    *node_lock(node)? = value.to_string();
                    false
                }
                None => {
                    nodes.push(Node::new(key, value));
                    self.len.fetch_add(1, Ordering::Relaxed);
                    true
                }
            }
        };

        if created {
            self.maybe_grow();
        }
        Ok(true)
    }

    fn delete(&self, ctx: &OpContext, key: &str) -> StorageResult<bool> {
        ctx.check()?;

        let table = read_lock(&self.table, "table")?;
        let mut nodes = write_lock(table.chain(key), "bucket")?;

        match nodes.iter().position(|n| n.key == key) {
            Some(index) => {
                nodes.swap_remove(index);
                self.len.fetch_sub(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn export(&self, ctx: &OpContext) -> StorageResult<Vec<Record>> {
        ctx.check()?;

        let table = read_lock(&self.table, "table")?;
        let mut records = Vec::with_capacity(self.len.load(Ordering::Relaxed));

        // Each bucket is copied under its own read lock: the result is a
        // per-bucket consistent, weakly consistent overall snapshot.
        for (index, chain) in table.buckets.iter().enumerate() {
            if index % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check()?;
            }

            let nodes = read_lock(chain, "bucket")?;
            for node in nodes.iter() {
                records.push(Record {
                    key: node.key.clone(),
                    value: node_lock(node)?.clone(),
                });
            }
        }

        debug!(records = records.len(), "Hash table exported");
        Ok(records)
    }

    fn len(&self) -> StorageResult<usize> {
        Ok(self.len.load(Ordering::Relaxed))
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}
