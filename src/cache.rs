use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    time::SystemTime,
};

use anyhow::Context as _;

use crate::{
    convert::RenderedAsset,
    error::{TexcastError, TexcastResult},
    request::{CacheKey, OutputFormat},
};

/// One stored asset plus bookkeeping for LRU eviction.
struct StoredEntry {
    asset: Arc<RenderedAsset>,
    #[allow(dead_code)]
    created: SystemTime,
    last_access: u64,
}

/// Shared slot for one in-flight production; waiters block on `cond` until
/// the winner publishes a result.
struct FlightSlot {
    result: Mutex<Option<Result<Arc<RenderedAsset>, TexcastError>>>,
    cond: Condvar,
}

impl FlightSlot {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) -> TexcastResult<Arc<RenderedAsset>> {
        let mut guard = self
            .result
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            match guard.as_ref() {
                Some(Ok(asset)) => return Ok(asset.clone()),
                Some(Err(e)) => return Err(e.clone_for_waiter()),
                None => {
                    guard = self
                        .cond
                        .wait(guard)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            }
        }
    }

    fn publish(&self, result: Result<Arc<RenderedAsset>, TexcastError>) {
        let mut guard = self
            .result
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(result);
        }
        self.cond.notify_all();
    }
}

struct CacheInner {
    entries: HashMap<String, StoredEntry>,
    inflight: HashMap<String, Arc<FlightSlot>>,
    /// Monotonic access counter driving LRU order.
    tick: u64,
}

/// Content-addressed store of rendered assets.
///
/// Owns the stored bytes; callers receive `Arc` references. Initialized once
/// at process start and injected into the pipeline, never a global.
pub struct RenderCache {
    inner: Mutex<CacheInner>,
    /// Maximum in-memory entries; 0 means unbounded.
    capacity: usize,
    /// Optional persistence root; entries land at `<root>/<prefix>/<hash>.<ext>`.
    disk_root: Option<PathBuf>,
}

/// Outcome of claiming a key for production.
pub enum Claim<'a> {
    /// Asset already available (stored, or produced by a coalesced flight we
    /// waited on).
    Hit(Arc<RenderedAsset>),
    /// Caller is the producer for this key and must resolve the ticket.
    Miss(ProductionTicket<'a>),
}

impl std::fmt::Debug for Claim<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit(asset) => f.debug_tuple("Hit").field(asset).finish(),
            Self::Miss(_) => f.debug_tuple("Miss").finish(),
        }
    }
}

impl RenderCache {
    pub fn new(capacity: usize, disk_root: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                tick: 0,
            }),
            capacity,
            disk_root,
        }
    }

    /// Unbounded in-memory cache.
    pub fn in_memory() -> Self {
        Self::new(0, None)
    }

    /// Non-blocking lookup. Absence is not an error.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<RenderedAsset>> {
        let mut inner = self.lock();
        if let Some(asset) = self.lookup_memory(&mut inner, key) {
            return Some(asset);
        }
        drop(inner);
        self.lookup_disk(key)
    }

    /// Claim `key` for production, coalescing concurrent claims.
    ///
    /// Exactly one concurrent caller per key receives `Miss`; the rest block
    /// until that producer resolves its ticket and then share the result (or
    /// its error, kind preserved).
    pub fn claim(&self, key: &CacheKey) -> TexcastResult<Claim<'_>> {
        let hex = key.hex();
        let slot = {
            let mut inner = self.lock();
            if let Some(asset) = self.lookup_memory(&mut inner, key) {
                return Ok(Claim::Hit(asset));
            }
            match inner.inflight.get(&hex).cloned() {
                Some(slot) => slot,
                None => {
                    // Disk probe happens outside the lock; only the producer
                    // pays for it.
                    let slot = Arc::new(FlightSlot::new());
                    inner.inflight.insert(hex.clone(), slot.clone());
                    drop(inner);

                    if let Some(asset) = self.lookup_disk(key) {
                        self.finish_flight(key, &slot, Ok(asset.clone()));
                        return Ok(Claim::Hit(asset));
                    }
                    return Ok(Claim::Miss(ProductionTicket {
                        cache: self,
                        key: key.clone(),
                        slot,
                        resolved: false,
                    }));
                }
            }
        };

        tracing::debug!(key = %key, "coalescing onto in-flight render");
        slot.wait().map(Claim::Hit)
    }

    /// Store an asset under `key`.
    ///
    /// Idempotent for identical bytes. Differing bytes under the same key
    /// mean request normalization is broken upstream, and fail loudly instead
    /// of overwriting.
    pub fn store(&self, key: &CacheKey, asset: Arc<RenderedAsset>) -> TexcastResult<()> {
        let hex = key.hex();
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.entries.get(&hex) {
                if existing.asset.bytes == asset.bytes {
                    return Ok(());
                }
                return Err(TexcastError::cache_consistency(format!(
                    "key {hex} already holds {} bytes, refusing to overwrite with {} differing bytes",
                    existing.asset.byte_len(),
                    asset.byte_len()
                )));
            }
        }

        // The disk tier participates in the divergence check; nothing becomes
        // visible in memory until it passes, so the tiers never disagree.
        self.persist(key, &asset)?;

        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.entry(hex).or_insert(StoredEntry {
            asset,
            created: SystemTime::now(),
            last_access: tick,
        });
        self.evict_locked(&mut inner);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lookup_memory(
        &self,
        inner: &mut CacheInner,
        key: &CacheKey,
    ) -> Option<Arc<RenderedAsset>> {
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(&key.hex())?;
        entry.last_access = tick;
        Some(entry.asset.clone())
    }

    fn lookup_disk(&self, key: &CacheKey) -> Option<Arc<RenderedAsset>> {
        let root = self.disk_root.as_ref()?;
        for format in [OutputFormat::Svg, OutputFormat::Png, OutputFormat::Mp4] {
            let path = root
                .join(key.shard_prefix())
                .join(format!("{}.{}", key.hex(), format.extension()));
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let asset = Arc::new(RenderedAsset {
                format,
                bytes,
                pixel_size: None,
                key: key.clone(),
            });
            let mut inner = self.lock();
            inner.tick += 1;
            let tick = inner.tick;
            inner.entries.entry(key.hex()).or_insert(StoredEntry {
                asset: asset.clone(),
                created: SystemTime::now(),
                last_access: tick,
            });
            self.evict_locked(&mut inner);
            return Some(asset);
        }
        None
    }

    /// Drop least-recently-used entries above capacity. Keys with an
    /// in-flight claim are never evicted out from under their waiters.
    fn evict_locked(&self, inner: &mut CacheInner) {
        if self.capacity == 0 {
            return;
        }
        while inner.entries.len() > self.capacity {
            let victim = inner
                .entries
                .iter()
                .filter(|(hex, _)| !inner.inflight.contains_key(*hex))
                .min_by_key(|(_, e)| e.last_access)
                .map(|(hex, _)| hex.clone());
            match victim {
                Some(hex) => {
                    tracing::debug!(key = %hex, "evicting cache entry");
                    inner.entries.remove(&hex);
                }
                None => break,
            }
        }
    }

    fn persist(&self, key: &CacheKey, asset: &RenderedAsset) -> TexcastResult<()> {
        let Some(root) = &self.disk_root else {
            return Ok(());
        };
        let dir = root.join(key.shard_prefix());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create cache shard '{}'", dir.display()))?;

        let final_path = dir.join(format!("{}.{}", key.hex(), asset.format.extension()));
        match std::fs::read(&final_path) {
            Ok(existing) if existing == asset.bytes => return Ok(()),
            Ok(existing) => {
                return Err(TexcastError::cache_consistency(format!(
                    "key {} holds {} differing bytes on disk, refusing to overwrite with {}",
                    key.hex(),
                    existing.len(),
                    asset.byte_len()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TexcastError::Other(anyhow::Error::new(e).context(format!(
                    "read cache entry '{}'",
                    final_path.display()
                ))));
            }
        }
        // Write-then-rename so concurrent readers never see a partial file.
        let tmp_path = dir.join(format!("{}.tmp", key.hex()));
        std::fs::write(&tmp_path, &asset.bytes)
            .with_context(|| format!("write cache entry '{}'", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("publish cache entry '{}'", final_path.display()))?;
        Ok(())
    }

    fn finish_flight(
        &self,
        key: &CacheKey,
        slot: &Arc<FlightSlot>,
        result: Result<Arc<RenderedAsset>, TexcastError>,
    ) {
        {
            let mut inner = self.lock();
            inner.inflight.remove(&key.hex());
        }
        slot.publish(result);
    }
}

/// Exclusive right to produce the asset for one key.
///
/// Must be resolved with [`complete`](Self::complete) or
/// [`fail`](Self::fail); dropping it unresolved releases waiters with a
/// cancellation error so nobody blocks forever.
pub struct ProductionTicket<'a> {
    cache: &'a RenderCache,
    key: CacheKey,
    slot: Arc<FlightSlot>,
    resolved: bool,
}

impl ProductionTicket<'_> {
    pub fn complete(mut self, asset: Arc<RenderedAsset>) -> TexcastResult<()> {
        self.resolved = true;
        match self.cache.store(&self.key, asset.clone()) {
            Ok(()) => {
                self.cache.finish_flight(&self.key, &self.slot, Ok(asset));
                Ok(())
            }
            Err(e) => {
                self.cache
                    .finish_flight(&self.key, &self.slot, Err(e.clone_for_waiter()));
                Err(e)
            }
        }
    }

    pub fn fail(mut self, err: &TexcastError) {
        self.resolved = true;
        self.cache
            .finish_flight(&self.key, &self.slot, Err(err.clone_for_waiter()));
    }
}

impl Drop for ProductionTicket<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.cache.finish_flight(
                &self.key,
                &self.slot,
                Err(TexcastError::cancelled("producer abandoned the render")),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CompileErrorKind, TexcastError};
    use crate::request::{OutputFormat, RenderRequest};

    fn asset_for(source: &str) -> (CacheKey, Arc<RenderedAsset>) {
        let key = RenderRequest::image(source, OutputFormat::Svg, 300).cache_key();
        let asset = Arc::new(RenderedAsset {
            format: OutputFormat::Svg,
            bytes: format!("<svg><!--{source}--></svg>").into_bytes(),
            pixel_size: Some((10, 10)),
            key: key.clone(),
        });
        (key, asset)
    }

    #[test]
    fn store_then_lookup_returns_the_same_asset() {
        let cache = RenderCache::in_memory();
        let (key, asset) = asset_for("$a$");
        cache.store(&key, asset.clone()).unwrap();
        let found = cache.lookup(&key).unwrap();
        assert!(Arc::ptr_eq(&found, &asset));
        assert!(cache.lookup(&asset_for("$b$").0).is_none());
    }

    #[test]
    fn identical_restore_is_a_noop_but_divergent_bytes_fail() {
        let cache = RenderCache::in_memory();
        let (key, asset) = asset_for("$a$");
        cache.store(&key, asset.clone()).unwrap();
        cache.store(&key, asset.clone()).unwrap();
        assert_eq!(cache.len(), 1);

        let divergent = Arc::new(RenderedAsset {
            bytes: b"<svg>other</svg>".to_vec(),
            ..(*asset).clone()
        });
        let err = cache.store(&key, divergent).unwrap_err();
        assert!(matches!(err, TexcastError::CacheConsistency(_)));
    }

    #[test]
    fn lru_eviction_keeps_recently_used_entries() {
        let cache = RenderCache::new(2, None);
        let (k1, a1) = asset_for("$1$");
        let (k2, a2) = asset_for("$2$");
        let (k3, a3) = asset_for("$3$");

        cache.store(&k1, a1).unwrap();
        cache.store(&k2, a2).unwrap();
        // Touch k1 so k2 becomes the LRU victim.
        assert!(cache.lookup(&k1).is_some());
        cache.store(&k3, a3).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&k1).is_some());
        assert!(cache.lookup(&k2).is_none());
        assert!(cache.lookup(&k3).is_some());
    }

    #[test]
    fn disk_persistence_round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (key, asset) = asset_for("$disk$");
        {
            let cache = RenderCache::new(0, Some(dir.path().to_path_buf()));
            cache.store(&key, asset.clone()).unwrap();
        }
        let expected = dir
            .path()
            .join(key.shard_prefix())
            .join(format!("{}.svg", key.hex()));
        assert!(expected.exists());

        let fresh = RenderCache::new(0, Some(dir.path().to_path_buf()));
        let found = fresh.lookup(&key).unwrap();
        assert_eq!(found.bytes, asset.bytes);
        assert_eq!(found.format, OutputFormat::Svg);
    }

    #[test]
    fn divergence_with_the_disk_tier_fails_loudly_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (key, asset) = asset_for("$persisted$");
        {
            let cache = RenderCache::new(0, Some(dir.path().to_path_buf()));
            cache.store(&key, asset.clone()).unwrap();
        }

        // A fresh process has an empty memory tier; the disk copy still vetoes
        // divergent bytes under the same key.
        let fresh = RenderCache::new(0, Some(dir.path().to_path_buf()));
        let divergent = Arc::new(RenderedAsset {
            bytes: b"<svg>divergent</svg>".to_vec(),
            ..(*asset).clone()
        });
        let err = fresh.store(&key, divergent).unwrap_err();
        assert!(matches!(err, TexcastError::CacheConsistency(_)));

        // The rejected bytes never became visible in either tier.
        let found = fresh.lookup(&key).unwrap();
        assert_eq!(found.bytes, asset.bytes);

        // Identical bytes stay a no-op across instances.
        let again = RenderCache::new(0, Some(dir.path().to_path_buf()));
        again.store(&key, asset.clone()).unwrap();
        assert_eq!(again.lookup(&key).unwrap().bytes, asset.bytes);
    }

    #[test]
    fn concurrent_claims_coalesce_to_one_producer() {
        let cache = RenderCache::in_memory();
        let (key, asset) = asset_for("$coalesce$");
        let producers = std::sync::atomic::AtomicUsize::new(0);
        let barrier = std::sync::Barrier::new(4);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    match cache.claim(&key).unwrap() {
                        Claim::Miss(ticket) => {
                            producers.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            // Give the other threads time to pile onto the flight.
                            std::thread::sleep(std::time::Duration::from_millis(50));
                            ticket.complete(asset.clone()).unwrap();
                        }
                        Claim::Hit(found) => {
                            assert_eq!(found.bytes, asset.bytes);
                        }
                    }
                });
            }
        });

        assert_eq!(producers.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(cache.lookup(&key).is_some());
    }

    #[test]
    fn waiters_receive_the_producers_error_with_kind_preserved() {
        let cache = RenderCache::in_memory();
        let (key, _) = asset_for("$fail$");

        let Claim::Miss(ticket) = cache.claim(&key).unwrap() else {
            panic!("expected miss");
        };

        std::thread::scope(|s| {
            let waiter = s.spawn(|| cache.claim(&key));
            std::thread::sleep(std::time::Duration::from_millis(50));
            ticket.fail(&TexcastError::compile(
                CompileErrorKind::SyntaxError,
                "! Undefined control sequence.",
            ));
            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(
                err,
                TexcastError::Compile {
                    kind: CompileErrorKind::SyntaxError,
                    ..
                }
            ));
        });
    }

    #[test]
    fn dropped_ticket_releases_waiters() {
        let cache = RenderCache::in_memory();
        let (key, _) = asset_for("$abandon$");

        let Claim::Miss(ticket) = cache.claim(&key).unwrap() else {
            panic!("expected miss");
        };

        std::thread::scope(|s| {
            let waiter = s.spawn(|| cache.claim(&key));
            std::thread::sleep(std::time::Duration::from_millis(50));
            drop(ticket);
            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(err, TexcastError::Cancelled(_)));
        });
    }

    #[test]
    fn failed_flight_leaves_no_cached_entry() {
        let cache = RenderCache::in_memory();
        let (key, _) = asset_for("$nopartial$");
        let Claim::Miss(ticket) = cache.claim(&key).unwrap() else {
            panic!("expected miss");
        };
        ticket.fail(&TexcastError::validation("boom"));
        assert!(cache.lookup(&key).is_none());
        // The key can be produced again afterwards.
        assert!(matches!(cache.claim(&key).unwrap(), Claim::Miss(_)));
    }
}
