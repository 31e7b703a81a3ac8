//! Per-run shared resources: a tiered byte-buffer pool and an in-memory cache
//! for remote file reads. Both are safe for concurrent use from multiple
//! target executors and are never persisted across runs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

const SMALL: usize = 1024;
const MEDIUM: usize = 8 * 1024;
const LARGE: usize = 64 * 1024;

/// A pooled scratch buffer. Returned to its tier's free list on drop, after
/// being cleared.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    tier: Tier,
    pool: Arc<BufferPoolInner>,
}

impl PooledBuffer {
    pub fn as_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken")
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.pool.free_lists.lock()[self.tier as usize].push(buf);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tier {
    Small = 0,
    Medium = 1,
    Large = 2,
}

impl Tier {
    fn capacity(self) -> usize {
        match self {
            Tier::Small => SMALL,
            Tier::Medium => MEDIUM,
            Tier::Large => LARGE,
        }
    }

    fn for_size(size: usize) -> Option<Tier> {
        if size <= SMALL {
            Some(Tier::Small)
        } else if size <= MEDIUM {
            Some(Tier::Medium)
        } else if size <= LARGE {
            Some(Tier::Large)
        } else {
            None
        }
    }
}

struct BufferPoolInner {
    // One free list per tier: Small, Medium, Large.
    free_lists: Mutex<[Vec<Vec<u8>>; 3]>,
}

/// Tiered buffer pool with three size classes. Allocations larger than the
/// largest tier fall back to a plain, unpooled `Vec`.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                free_lists: Mutex::new([Vec::new(), Vec::new(), Vec::new()]),
            }),
        }
    }

    /// Acquire a buffer with at least `size_hint` bytes of capacity. Buffers
    /// bigger than the largest tier are allocated directly and not pooled.
    pub fn acquire(&self, size_hint: usize) -> PooledBuffer {
        match Tier::for_size(size_hint) {
            Some(tier) => {
                let mut free_lists = self.inner.free_lists.lock();
                let buf = free_lists[tier as usize]
                    .pop()
                    .unwrap_or_else(|| Vec::with_capacity(tier.capacity()));
                drop(free_lists);
                PooledBuffer {
                    buf: Some(buf),
                    tier,
                    pool: self.inner.clone(),
                }
            }
            None => PooledBuffer {
                buf: Some(Vec::with_capacity(size_hint)),
                tier: Tier::Large,
                pool: self.inner.clone(),
            },
        }
    }
}

/// Key for the per-run remote-file-read cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repo: String,
    pub git_ref: String,
    pub path: String,
}

impl CacheKey {
    pub fn new(repo: impl Into<String>, git_ref: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            git_ref: git_ref.into(),
            path: path.into(),
        }
    }
}

/// Per-run in-memory cache of `(repo, ref, path) -> bytes`. Bounded by the
/// lifetime of the run: constructed fresh by the Orchestrator and dropped at
/// the end, never written to disk.
#[derive(Clone)]
pub struct ReadCache {
    entries: Arc<Mutex<HashMap<CacheKey, Arc<Vec<u8>>>>>,
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, bytes: Arc<Vec<u8>>) {
        self.entries.lock().insert(key, bytes);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The bundle of shared, process-wide-for-one-run resources threaded through
/// the Orchestrator and every Target Sync Executor.
#[derive(Clone)]
pub struct Pools {
    pub buffers: BufferPool,
    pub read_cache: ReadCache,
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}

impl Pools {
    pub fn new() -> Self {
        Self {
            buffers: BufferPool::new(),
            read_cache: ReadCache::new(),
        }
    }
}
