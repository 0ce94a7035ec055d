//! Downloads shard manifests and blobs, then places every record into the
//! module's shard cache.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value as JsonValue};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use sandlink_bridge::{call_async, Bridge, Device, Sandbox, Tensor, Value};

use crate::cache::DiskCache;
use crate::error::{Result, ShardError};
use crate::fetch::{ArtifactFetcher, ReqwestFetcher};
use crate::manifest::{ShardManifest, ShardRecord};
use crate::progress::{LoadProgress, ProgressTracker};

/// Number of concurrent download ranges.
pub const DOWNLOAD_CONCURRENCY: usize = 4;

const BYTES_PER_MB: u64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// File name of the manifest relative to the base URL.
    pub manifest_name: String,
    /// Timeout for each HTTP request.
    pub request_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            manifest_name: "ndarray-cache.json".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    ManifestFetched,
    Downloading,
    Placing,
    Done,
    Error,
}

/// Cancels an in-progress load or prefetch before its next network fetch.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with `Aborted` once the signal has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(ShardError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Split `len` items into `parts` contiguous ranges of `len / parts` items,
/// the last range taking the remainder.
pub fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.max(1);
    let per = len / parts;
    (0..parts)
        .map(|i| {
            let start = i * per;
            let end = if i + 1 == parts { len } else { start + per };
            start..end
        })
        .collect()
}

/// Base URLs name a directory; make sure joins resolve inside it.
fn directory_url(base: &Url) -> Url {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fetch_text(fetched: usize, total: usize, bytes: u64, tracker: &ProgressTracker) -> String {
    format!(
        "Fetching shard cache[{fetched}/{total}]: {}MB fetched. {}% completed, {} secs elapsed.",
        bytes / BYTES_PER_MB,
        (tracker.fraction() * 100.0).floor() as u32,
        tracker.elapsed_secs().round() as u64,
    )
}

pub struct ShardLoader {
    fetcher: Arc<dyn ArtifactFetcher>,
    cache: DiskCache,
    config: LoaderConfig,
    state: LoadState,
    metadata: Map<String, JsonValue>,
}

impl std::fmt::Debug for ShardLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardLoader")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ShardLoader {
    /// A loader fetching over HTTP(S).
    pub fn new(cache: DiskCache, config: LoaderConfig) -> Result<Self> {
        let fetcher = Arc::new(ReqwestFetcher::new(&config)?);
        Ok(Self::with_fetcher(cache, config, fetcher))
    }

    pub fn with_fetcher(
        cache: DiskCache,
        config: LoaderConfig,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            fetcher,
            cache,
            config,
            state: LoadState::Idle,
            metadata: Map::new(),
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Metadata merged from every manifest fetched so far.
    pub fn metadata(&self) -> &Map<String, JsonValue> {
        &self.metadata
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    fn set_state(&mut self, state: LoadState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "loader state changed");
            self.state = state;
        }
    }

    /// `Error` is only entered once a load got past `Idle`; a load that
    /// fails before its manifest arrives leaves an idle loader idle.
    fn fail(&mut self) {
        if self.state != LoadState::Idle {
            self.set_state(LoadState::Error);
        }
    }

    fn manifest_url(&self, base: &Url) -> Result<Url> {
        Ok(directory_url(base).join(&self.config.manifest_name)?)
    }

    /// Fetch the manifest through the disk cache and merge its metadata.
    pub async fn fetch_manifest(&mut self, base: &Url, abort: &AbortSignal) -> Result<ShardManifest> {
        let url = self.manifest_url(base)?;
        let bytes = match self.cache.get(&url).await? {
            Some(bytes) => {
                debug!(url = %url, "manifest served from cache");
                bytes
            }
            None => {
                abort.check()?;
                let bytes = self.fetcher.fetch(&url).await?;
                self.cache.put(&url, &bytes).await?;
                bytes
            }
        };
        let manifest = ShardManifest::from_json(&bytes)?;
        self.metadata
            .extend(manifest.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(manifest)
    }

    /// Whether the manifest and every blob it lists are cached. Never
    /// touches the network.
    pub async fn has_all_in_cache(&self, base: &Url) -> Result<bool> {
        let url = self.manifest_url(base)?;
        let Some(bytes) = self.cache.get(&url).await? else {
            return Ok(false);
        };
        let manifest = ShardManifest::from_json(&bytes)?;
        self.blobs_cached(base, &manifest).await
    }

    async fn blobs_cached(&self, base: &Url, manifest: &ShardManifest) -> Result<bool> {
        let base = directory_url(base);
        for blob in &manifest.records {
            if !self.cache.contains(&base.join(&blob.data_path)?).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove the manifest and its blobs from the disk cache.
    pub async fn delete_from_cache(&self, base: &Url) -> Result<()> {
        let url = self.manifest_url(base)?;
        if let Some(bytes) = self.cache.get(&url).await? {
            let base = directory_url(base);
            match ShardManifest::from_json(&bytes) {
                Ok(manifest) => {
                    for blob in &manifest.records {
                        self.cache.delete(&base.join(&blob.data_path)?).await?;
                    }
                }
                Err(e) => warn!(url = %url, error = %e, "cached manifest is unreadable"),
            }
        }
        self.cache.delete(&url).await?;
        info!(url = %url, "deleted shard cache");
        Ok(())
    }

    /// Download the manifest and every blob into the disk cache without
    /// touching a module.
    pub async fn prefetch(
        &mut self,
        base: &Url,
        abort: &AbortSignal,
        mut on_progress: impl FnMut(&LoadProgress),
    ) -> Result<ShardManifest> {
        let started = Instant::now();
        let result = async {
            let manifest = self.fetch_manifest(base, abort).await?;
            self.set_state(LoadState::ManifestFetched);
            let mut tracker = ProgressTracker::new(manifest.total_bytes(), 1, started);
            self.set_state(LoadState::Downloading);
            self.download(base, &manifest, abort, &mut tracker, &mut on_progress)
                .await?;
            Ok::<_, ShardError>(manifest)
        }
        .await;
        match result {
            Ok(manifest) => {
                self.set_state(LoadState::Done);
                on_progress(&LoadProgress {
                    progress: 1.0,
                    time_elapsed: started.elapsed().as_secs_f64(),
                    text: "Finished fetching shard cache.".to_string(),
                });
                Ok(manifest)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Load every record listed under `base` into the module's shard cache
    /// on `device`.
    pub async fn load<S: Sandbox + ?Sized>(
        &mut self,
        sandbox: &mut S,
        base: &Url,
        device: Device,
        abort: &AbortSignal,
        mut on_progress: impl FnMut(&LoadProgress),
    ) -> Result<()> {
        let started = Instant::now();
        match self.run_load(sandbox, base, device, abort, started, &mut on_progress).await {
            Ok(()) => {
                self.set_state(LoadState::Done);
                on_progress(&LoadProgress {
                    progress: 1.0,
                    time_elapsed: started.elapsed().as_secs_f64(),
                    text: "Finished loading...".to_string(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(base = %base, error = %e, "shard load failed");
                self.fail();
                Err(e)
            }
        }
    }

    async fn run_load<S: Sandbox + ?Sized>(
        &mut self,
        sandbox: &mut S,
        base: &Url,
        device: Device,
        abort: &AbortSignal,
        started: Instant,
        on_progress: &mut dyn FnMut(&LoadProgress),
    ) -> Result<()> {
        let manifest = self.fetch_manifest(base, abort).await?;
        self.set_state(LoadState::ManifestFetched);

        let cached = self.blobs_cached(base, &manifest).await?;
        let passes = if cached { 1 } else { 2 };
        let mut tracker = ProgressTracker::new(manifest.total_bytes(), passes, started);
        if !cached {
            self.set_state(LoadState::Downloading);
            self.download(base, &manifest, abort, &mut tracker, on_progress)
                .await?;
        } else {
            debug!(base = %base, "every blob is cached; skipping the network");
        }

        self.set_state(LoadState::Placing);
        let base = directory_url(base);
        let total = manifest.record_count();
        let mut placed = 0;
        for blob in &manifest.records {
            let url = base.join(&blob.data_path)?;
            let bytes = self.cache.get(&url).await?.ok_or_else(|| {
                ShardError::InvalidManifest(format!("blob {} is missing from the cache", blob.data_path))
            })?;
            let mut consumed = 0;
            for record in &blob.records {
                place_record(sandbox, record, record.slice(&bytes)?, device).await?;
                placed += 1;
                consumed += record.nbytes;
                tracker.advance(record.nbytes);
                on_progress(&tracker.report(format!("Loading shards into runtime[{placed}/{total}]...")));
            }
            tracker.advance(blob.nbytes.saturating_sub(consumed));
            on_progress(&tracker.report(format!("Loading shards into runtime[{placed}/{total}]...")));
            debug!(blob = %blob.data_path, records = blob.records.len(), "placed blob");
        }
        Ok(())
    }

    /// Fetch every uncached blob in [`DOWNLOAD_CONCURRENCY`] concurrent
    /// ranges. The first failure aborts the remaining ranges.
    async fn download(
        &self,
        base: &Url,
        manifest: &ShardManifest,
        abort: &AbortSignal,
        tracker: &mut ProgressTracker,
        on_progress: &mut dyn FnMut(&LoadProgress),
    ) -> Result<()> {
        let base = directory_url(base);
        let blobs = manifest
            .records
            .iter()
            .map(|blob| Ok((base.join(&blob.data_path)?, blob.nbytes)))
            .collect::<Result<Vec<_>>>()?;
        let total = blobs.len();

        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut tasks = JoinSet::new();
        for range in partition(total, DOWNLOAD_CONCURRENCY) {
            if range.is_empty() {
                continue;
            }
            let batch = blobs[range].to_vec();
            let fetcher = Arc::clone(&self.fetcher);
            let cache = self.cache.clone();
            let abort = abort.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                for (url, nbytes) in batch {
                    if !cache.contains(&url).await {
                        abort.check()?;
                        let bytes = fetcher.fetch(&url).await?;
                        cache.put(&url, &bytes).await?;
                        debug!(url = %url, bytes = bytes.len(), "downloaded blob");
                    }
                    // The receiver only closes when the load is abandoned.
                    let _ = tx.send(nbytes);
                }
                Ok::<(), ShardError>(())
            });
        }
        drop(tx);

        let mut fetched = 0;
        let mut fetched_bytes = 0;
        let mut on_blob = |nbytes: u64, tracker: &mut ProgressTracker| {
            fetched += 1;
            fetched_bytes += nbytes;
            tracker.advance(nbytes);
            let text = fetch_text(fetched, total, fetched_bytes, tracker);
            on_progress(&tracker.report(text));
        };

        loop {
            tokio::select! {
                Some(nbytes) = rx.recv() => on_blob(nbytes, &mut *tracker),
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(ShardError::Task(e.to_string()));
                    }
                },
            }
        }
        while let Ok(nbytes) = rx.try_recv() {
            on_blob(nbytes, &mut *tracker);
        }
        info!(blobs = total, bytes = fetched_bytes, "download finished");
        Ok(())
    }
}

/// Decode one record and hand it to the module's shard cache. Every
/// intermediate array is released before returning.
async fn place_record<S: Sandbox + ?Sized>(
    sandbox: &mut S,
    record: &ShardRecord,
    bytes: &[u8],
    device: Device,
) -> Result<()> {
    sandbox.begin_scope();
    let placed = place_in_scope(sandbox, record, bytes, device).await;
    let ended = sandbox.end_scope();
    placed?;
    ended?;
    Ok(())
}

fn empty_args(record: &ShardRecord, device: Device) -> Vec<Value> {
    let mut args = vec![Value::Str(record.dtype.clone()), Value::Device(device)];
    args.extend(record.shape.iter().map(|&dim| Value::Int(dim)));
    args
}

async fn place_in_scope<S: Sandbox + ?Sized>(
    sandbox: &mut S,
    record: &ShardRecord,
    bytes: &[u8],
    device: Device,
) -> Result<()> {
    let staging = sandbox
        .call("runtime.array.empty", &empty_args(record, Device::cpu()))?
        .into_array()?;
    sandbox.call(
        "runtime.array.decode_storage",
        &[
            Value::Array(staging.clone()),
            Value::Bytes(bytes.to_vec()),
            Value::Str(record.format.clone()),
            Value::Str(record.dtype.clone()),
        ],
    )?;

    if device.is_host_visible() {
        update_cache(sandbox, &record.name, staging)?;
        return Ok(());
    }

    let target = sandbox
        .call("runtime.array.empty", &empty_args(record, device))?
        .into_array()?;
    sandbox.call(
        "runtime.array.copy_from",
        &[Value::Array(target.clone()), Value::Array(staging.clone())],
    )?;
    sandbox.dispose(&staging)?;

    let sync = sandbox.cached_function("runtime.device.sync")?;
    call_async(sandbox, &sync, &[Value::Device(device)]).await?;

    update_cache(sandbox, &record.name, target.clone())?;
    sandbox.dispose(&target)?;
    Ok(())
}

fn update_cache<S: Sandbox + ?Sized>(sandbox: &mut S, name: &str, array: Tensor) -> Result<()> {
    sandbox.call(
        "runtime.shard_cache.update",
        &[Value::Str(name.to_string()), Value::Array(array), Value::Bool(true)],
    )?;
    Ok(())
}

/// Look up a placed array in the module's shard cache. A found array joins
/// the current scope.
pub fn cached_array<S: Sandbox + ?Sized>(sandbox: &mut S, name: &str) -> Result<Option<Tensor>> {
    match sandbox.call("runtime.shard_cache.get", &[Value::Str(name.to_string())])? {
        Value::None => Ok(None),
        value => Ok(Some(value.into_array()?)),
    }
}

/// Drop one array from the module's shard cache.
pub fn evict<S: Sandbox + ?Sized>(sandbox: &mut S, name: &str) -> Result<()> {
    sandbox.call("runtime.shard_cache.remove", &[Value::Str(name.to_string())])?;
    debug!(name, "evicted cached array");
    Ok(())
}

/// Empty the module's shard cache.
pub fn clear_module_cache<S: Sandbox + ?Sized>(sandbox: &mut S) -> Result<()> {
    sandbox.call("runtime.shard_cache.clear", &[])?;
    info!("cleared module shard cache");
    Ok(())
}
