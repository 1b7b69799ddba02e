use anyhow::{Context, Result};
use colored::Colorize;
use log::{info, warn};
use std::{collections::HashSet, sync::Arc};

use zeus_holders::{
    api::{router, AppState},
    cache::ResultCache,
    chain::{ChainReader, EthChainReader},
    clock::{Clock, SystemClock},
    config::{AppConfig, RuntimeConfig},
    holders::{HolderService, HolderSettings},
    kv::{FallbackKv, KvStore, MemoryKv, RestKv},
    metrics,
    names::{NameCache, NameResolver, NameService, NamestoneClient},
    price::PriceOracle,
    utils::{address_key, setup_logger},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Load and validate configurations
    let config = AppConfig::from_env()?;
    config.validate_all()?;
    let runtime = RuntimeConfig::from_env()?;

    setup_logger(&config.log_level)?;
    info!("{}", "Starting Zeus holder service".bold().green());

    if let Some(addr) = config.metrics_addr {
        metrics::install_exporter(addr)?;
    }

    let kv: Arc<dyn KvStore> = match config.kv_backend() {
        Some((url, token)) => {
            info!("Using REST KV store at {}", url);
            Arc::new(FallbackKv::new(Arc::new(RestKv::new(url, token)?)))
        }
        None => {
            warn!("No KV store configured, caches are local to this process");
            Arc::new(MemoryKv::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let chain: Arc<dyn ChainReader> =
        Arc::new(EthChainReader::new(&config.rpc_url, runtime.balance_batch_size)?);
    let prices = Arc::new(PriceOracle::with_default_feeds(runtime.fallback_price_usd)?);

    let name_service: Option<Arc<dyn NameService>> = match &config.namestone_api_key {
        Some(key) => Some(Arc::new(NamestoneClient::new(&config.namestone_url, key)?)),
        None => {
            warn!("NAMESTONE_API_KEY not set, names come from reverse records only");
            None
        }
    };

    let name_cache = Arc::new(NameCache::new(
        name_service.clone(),
        config.ens_domain.clone(),
        kv.clone(),
        clock.clone(),
        runtime.name_cache_ttl,
    ));
    let resolver = Arc::new(NameResolver::new(
        name_cache,
        chain.clone(),
        runtime.reverse_lookup_timeout,
    ));
    let cache = Arc::new(ResultCache::new(kv.clone(), clock));

    let settings = HolderSettings {
        token: config.token_address,
        wrapped_token: config.wrapped_token_address,
        lp_pool: config.lp_pool_address,
        excluded: config.all_excluded().into_iter().collect::<HashSet<_>>(),
        lookback_blocks: runtime.lookback_blocks,
        candidate_cap: runtime.candidate_cap,
        result_ttl: runtime.result_cache_ttl,
    };
    info!(
        "Tracking {} (wrapped: {}, pool: {}), {} excluded addresses",
        address_key(&settings.token),
        settings.wrapped_token.as_ref().map(address_key).unwrap_or_else(|| "-".to_string()),
        settings.lp_pool.as_ref().map(address_key).unwrap_or_else(|| "-".to_string()),
        settings.excluded.len()
    );

    let holders = Arc::new(HolderService::new(chain, resolver, prices, cache, kv, settings));
    let names = name_service.zip(config.ens_domain.clone());
    let app = router(Arc::new(AppState { holders, names }));

    info!("Listening on {}", config.bind_addr.to_string().cyan());
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .await
        .context("HTTP server failed")?;

    Ok(())
}
