use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use url::Url;

use sandlink_shards::{AbortSignal, DiskCache, LoadProgress, LoaderConfig, ShardLoader};

/// Download a shard manifest and its blobs into the local cache
#[derive(Parser, Debug)]
#[command(name = "sandlink-prefetch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the shard directory
    url: Url,

    /// Cache directory (defaults to the per-user cache)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Manifest file name relative to the base URL
    #[arg(long, default_value = "ndarray-cache.json")]
    manifest: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Only report whether everything is already cached
    #[arg(long, conflicts_with = "delete")]
    check: bool,

    /// Remove the manifest and its blobs from the cache
    #[arg(long)]
    delete: bool,

    /// Print progress reports as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_progress(report: &LoadProgress, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("Error: {e}"),
        }
    } else {
        println!("{}", report.text);
    }
}

async fn run(args: Args) -> sandlink_shards::Result<bool> {
    let root = match args.cache_dir {
        Some(dir) => dir,
        None => DiskCache::default_location().unwrap_or_else(|| PathBuf::from(".sandlink-cache")),
    };
    let config = LoaderConfig {
        manifest_name: args.manifest,
        request_timeout: Duration::from_secs(args.timeout_secs),
    };
    let mut loader = ShardLoader::new(DiskCache::new(root), config)?;

    if args.check {
        let cached = loader.has_all_in_cache(&args.url).await?;
        println!("{}", if cached { "cached" } else { "missing" });
        return Ok(cached);
    }
    if args.delete {
        loader.delete_from_cache(&args.url).await?;
        return Ok(true);
    }

    let json = args.json;
    let manifest = loader
        .prefetch(&args.url, &AbortSignal::new(), |report| print_progress(report, json))
        .await?;
    if !json {
        println!(
            "{} blobs, {} records, {} bytes in {}",
            manifest.records.len(),
            manifest.record_count(),
            manifest.total_bytes(),
            loader.cache().root().display()
        );
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
