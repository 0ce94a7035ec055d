//! Shard cache loading for sandboxed tensor modules.
//!
//! A model's parameters are published as a manifest (`ndarray-cache.json`)
//! plus a set of binary blobs. [`ShardLoader`] fetches both through a
//! [`DiskCache`], then decodes every record into an array and hands it to
//! the module's shard cache over the bridge.
//!
//! ```ignore
//! use sandlink_shards::{AbortSignal, DiskCache, LoaderConfig, ShardLoader};
//!
//! let mut loader = ShardLoader::new(DiskCache::new("/tmp/shards"), LoaderConfig::default())?;
//! loader
//!     .load(&mut sandbox, &base_url, Device::webgpu(0), &AbortSignal::new(), |p| {
//!         println!("{}", p.text)
//!     })
//!     .await?;
//! ```

pub mod cache;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod manifest;
pub mod progress;

pub use cache::DiskCache;
pub use error::{Result, ShardError};
pub use fetch::{ArtifactFetcher, ReqwestFetcher};
pub use loader::{
    cached_array, clear_module_cache, evict, partition, AbortSignal, LoadState, LoaderConfig,
    ShardLoader, DOWNLOAD_CONCURRENCY,
};
pub use manifest::{BlobEntry, ShardManifest, ShardRecord};
pub use progress::{LoadProgress, ProgressTracker};
