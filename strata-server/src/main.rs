//! Strata block server: hosts a span of transformer blocks over HTTP.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata_backend_cpu::CpuBackend;
use strata_block::{load_block, SafeTensorsLoader, TransformerBlock};
use strata_cache::MemoryCache;
use strata_core::BlockConfig;
use strata_runtime::{Runtime, TransformerBackend};
use strata_server::api::{self, blocks::AppState};

#[derive(Parser)]
#[command(name = "strata-server", about = "Strata transformer block server")]
struct Cli {
    /// Path to the block config (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Directory of SafeTensors weights; blocks are randomly initialized when omitted
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Blocks to serve, as `start:end` (end exclusive)
    #[arg(long, default_value = "0:1")]
    block_indices: String,

    /// Tensor name prefix; block `i` is read from `{prefix}{i}.`
    #[arg(long, default_value = "h.")]
    prefix: String,

    /// Seed for random initialization
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Maximum rows per forward/backward batch
    #[arg(long, default_value = "16")]
    max_batch_size: usize,

    /// Attention cache budget in bytes, shared by all blocks (unbounded if omitted)
    #[arg(long)]
    cache_size_bytes: Option<usize>,

    /// Seconds a session may sit idle before its cache entry is reclaimed (0 disables)
    #[arg(long, default_value = "600")]
    session_idle_secs: u64,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,
}

fn parse_block_indices(arg: &str) -> anyhow::Result<Range<usize>> {
    let (start, end) = arg
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("block indices must look like start:end, got {arg:?}"))?;
    let range = start.trim().parse::<usize>()?..end.trim().parse::<usize>()?;
    if range.is_empty() {
        anyhow::bail!("block indices {arg:?} select no blocks");
    }
    Ok(range)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // --- Load config ---
    let config_text = std::fs::read_to_string(&cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", cli.config.display()))?;
    let config: BlockConfig = serde_json::from_str(&config_text)?;
    config.validate()?;
    let indices = parse_block_indices(&cli.block_indices)?;
    info!(
        "Block config: hidden {}, {} heads, intermediate {}, max length {}",
        config.hidden_size, config.num_attention_heads, config.intermediate_size, config.max_length,
    );

    let backend = CpuBackend::new();
    let memory_cache = Arc::new(MemoryCache::new(backend.clone(), cli.cache_size_bytes));
    let mut runtime = Runtime::new();

    // --- Load blocks ---
    let loader = match &cli.weights {
        Some(dir) => {
            info!("Loading weights from {}...", dir.display());
            Some(SafeTensorsLoader::new(dir)?)
        }
        None => None,
    };
    let mut blocks = Vec::new();
    for index in indices {
        let name = format!("{}{index}", cli.prefix);
        let block = match &loader {
            Some(loader) => load_block(loader, &format!("{name}."), config.clone(), &backend)?,
            None => TransformerBlock::random(config.clone(), cli.seed + index as u64, &backend)?,
        };
        let served = TransformerBackend::new(
            name,
            block,
            memory_cache.clone(),
            backend.clone(),
            cli.max_batch_size,
            runtime.notifier(),
        )?;
        runtime.add_pools(served.get_pools());
        blocks.push(Arc::new(served));
    }
    info!("{} blocks ready", blocks.len());

    // --- Spawn runtime ---
    let runtime = Arc::new(runtime);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run(shutdown_rx).await })
    };

    // --- Start HTTP server ---
    let state = Arc::new(AppState::new(backend, blocks));
    if cli.session_idle_secs > 0 {
        let state = state.clone();
        let max_idle = Duration::from_secs(cli.session_idle_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle.min(Duration::from_secs(60)));
            loop {
                ticker.tick().await;
                let evicted = state.evict_idle(max_idle);
                if evicted > 0 {
                    info!("Expired {evicted} idle sessions");
                }
            }
        });
    }
    let app = api::router(state);
    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Strata serving on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    shutdown_tx.send(true)?;
    worker.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_block_indices;

    #[test]
    fn test_parse_block_indices() {
        assert_eq!(parse_block_indices("2:5").unwrap(), 2..5);
        assert!(parse_block_indices("3").is_err());
        assert!(parse_block_indices("4:4").is_err());
        assert!(parse_block_indices("a:b").is_err());
    }
}
