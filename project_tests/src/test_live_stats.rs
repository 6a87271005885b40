//! # Live Stats Test
//!
//! Attaches to the demo metrics feed, prints the resolved metrics of every
//! known entity, then keeps printing them as live changes arrive.
//! With `--dry-run` the backend is replaced by in-memory collaborators.

use clap::Parser;
use lib_statsync::configs::defaults_catalog::DefaultsCatalog;
use lib_statsync::sources::{ColumnMap, MemoryFeed, MemorySnapshot, PostgrestSnapshot, RealtimeConfig, RealtimeFeed};
use lib_statsync::{
    ChangeFeed, FeedState, LifecycleOptions, MetricRow, MetricStore, RawChangeEvent, SnapshotSource,
    SubscriptionLifecycle,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(about = "Live demo metrics runner")]
struct Args {
    #[clap(long, env = "STATS_BACKEND_URL")]
    backend_url: Option<String>,

    #[clap(long, env = "STATS_ANON_KEY")]
    anon_key: Option<String>,

    #[clap(long, default_value = "demo_stats")]
    table: String,

    #[clap(long, default_value = "demo-stats")]
    topic: String,

    #[clap(long, default_value_t = 30, help = "Seconds to keep watching for changes.")]
    seconds: u64,

    #[clap(long, help = "Use in-memory collaborators instead of the backend.")]
    dry_run: bool,
}

fn init_logging() -> anyhow::Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}][{}] {}", record.target(), record.level(), message)))
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

fn print_stats(store: &Arc<MetricStore>, catalog: &DefaultsCatalog) -> anyhow::Result<()> {
    let resolver = lib_statsync::MetricResolver::new(Arc::clone(store));
    let resolved: Vec<_> = catalog
        .entities()
        .filter_map(|entity| {
            catalog
                .get(entity)
                .map(|defaults| serde_json::json!({"entity": entity, "resolved": resolver.resolve_tagged(entity, defaults)}))
        })
        .collect();
    println!("-----------------------------------------------");
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    println!("-----------------------------------------------");
    Ok(())
}

async fn watch<S: SnapshotSource, F: ChangeFeed>(
    lifecycle: &SubscriptionLifecycle<S, F>,
    topic: &str,
    seconds: u64,
    catalog: &DefaultsCatalog,
) -> anyhow::Result<()> {
    println!("[*] Attaching '{}'...", topic);
    let mut handle = lifecycle.attach(topic).await?;

    if handle.ready().await != FeedState::Attached {
        anyhow::bail!("feed detached before the snapshot phase ended");
    }
    while let Some(warning) = handle.try_warning() {
        eprintln!("[WARN] {}", warning);
    }

    println!("\n[SUCCESS] Initial state:");
    print_stats(lifecycle.store(), catalog)?;

    let mut last = lifecycle.store().snapshot();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let current = lifecycle.store().snapshot();
        if current != last {
            println!("\n[INFO] Change observed:");
            print_stats(lifecycle.store(), catalog)?;
            last = current;
        }
    }

    lifecycle.detach(&handle);
    println!("[*] Detached '{}'.", topic);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    init_logging()?;

    let args = Args::parse();
    let catalog = DefaultsCatalog::builtin();
    let store = Arc::new(MetricStore::new());

    if args.dry_run {
        let source = Arc::new(MemorySnapshot::new(vec![MetricRow::new("analytics", "queries", "1.2M/day")]));
        let feed = Arc::new(MemoryFeed::new(16));
        let lifecycle = SubscriptionLifecycle::new(Arc::clone(&store), source, Arc::clone(&feed), LifecycleOptions::default());

        let topic = args.topic.clone();
        let publisher = Arc::clone(&feed);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            publisher.publish(&topic, RawChangeEvent::insert("segmentation", "segments", "14")).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            publisher.publish(&topic, RawChangeEvent::update("analytics", "queries", "2M/day")).await;
        });

        return watch(&lifecycle, &args.topic, args.seconds.min(5), &catalog).await;
    }

    let (Some(backend_url), Some(anon_key)) = (args.backend_url, args.anon_key) else {
        eprintln!("\n[ERROR] --backend-url and --anon-key (or STATS_BACKEND_URL / STATS_ANON_KEY) are required.");
        std::process::exit(1);
    };

    let source = PostgrestSnapshot::new(&backend_url, &anon_key, &args.table, ColumnMap::default())?;
    let feed = RealtimeFeed::new(RealtimeConfig {
        base_url: backend_url,
        api_key: anon_key,
        table: args.table.clone(),
        ..RealtimeConfig::default()
    });
    let lifecycle = SubscriptionLifecycle::new(Arc::clone(&store), Arc::new(source), Arc::new(feed), LifecycleOptions::default());

    if let Err(e) = watch(&lifecycle, &args.topic, args.seconds, &catalog).await {
        eprintln!("\n[ERROR] Live stats run failed:");
        eprintln!(">>> {}", e);
        std::process::exit(1);
    }
    Ok(())
}
