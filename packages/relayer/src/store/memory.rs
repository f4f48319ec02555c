use std::collections::HashMap;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::Result;
use tokio::sync::Mutex;

use super::HeaderStore;
use crate::types::SourceBlockHeader;

const DEFAULT_HEADER_CACHE_SIZE: usize = 10_000;
const DEFAULT_HEADER_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

struct CachedHeader {
    header: SourceBlockHeader,
    inserted: Instant,
}

#[derive(Default)]
struct Inner {
    headers: HashMap<[u8; 32], CachedHeader>,
    by_height: HashMap<u64, [u8; 32]>,
    cursors: HashMap<(String, Address), u64>,
}

/// In-memory store used when no database is configured.
///
/// - **Max capacity:** when full, the oldest header is evicted on insert.
/// - **TTL:** expired headers are treated as absent and dropped on insert.
/// - Cursors are never evicted.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_size: usize,
    ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_CACHE_SIZE, DEFAULT_HEADER_CACHE_TTL_SECS)
    }
}

impl MemoryStore {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.headers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn remove(inner: &mut Inner, hash: &[u8; 32]) {
        if let Some(old) = inner.headers.remove(hash) {
            if inner.by_height.get(&old.header.height) == Some(hash) {
                inner.by_height.remove(&old.header.height);
            }
        }
    }
}

#[async_trait]
impl HeaderStore for MemoryStore {
    async fn header_by_hash(&self, hash: &[u8; 32]) -> Result<Option<SourceBlockHeader>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .headers
            .get(hash)
            .filter(|c| c.inserted.elapsed() < self.ttl)
            .map(|c| c.header.clone()))
    }

    async fn header_by_height(&self, height: u64) -> Result<Option<SourceBlockHeader>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_height
            .get(&height)
            .and_then(|hash| inner.headers.get(hash))
            .filter(|c| c.inserted.elapsed() < self.ttl)
            .map(|c| c.header.clone()))
    }

    async fn save_header(&self, header: &SourceBlockHeader) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let expired: Vec<[u8; 32]> = inner
            .headers
            .iter()
            .filter(|(_, c)| now.duration_since(c.inserted) >= self.ttl)
            .map(|(h, _)| *h)
            .collect();
        for hash in expired {
            Self::remove(&mut inner, &hash);
        }

        Self::remove(&mut inner, &header.hash);
        while inner.headers.len() >= self.max_size {
            let oldest = inner
                .headers
                .iter()
                .min_by_key(|(_, c)| c.inserted)
                .map(|(h, _)| *h);
            match oldest {
                Some(hash) => Self::remove(&mut inner, &hash),
                None => break,
            }
        }

        inner.by_height.insert(header.height, header.hash);
        inner.headers.insert(
            header.hash,
            CachedHeader {
                header: header.clone(),
                inserted: now,
            },
        );
        Ok(())
    }

    async fn evict_header(&self, hash: &[u8; 32]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::remove(&mut inner, hash);
        Ok(())
    }

    async fn cursor(&self, listener: &str, contract: Address) -> Result<Option<u64>> {
        let inner = self.inner.lock().await;
        Ok(inner.cursors.get(&(listener.to_string(), contract)).copied())
    }

    async fn set_cursor(&self, listener: &str, contract: Address, value: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.cursors.insert((listener.to_string(), contract), value);
        Ok(())
    }
}
