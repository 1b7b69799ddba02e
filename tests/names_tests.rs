mod common;

use anyhow::Result;
use common::*;
use ethers::types::Address;
use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use test_log::test;
use zeus_holders::{
    clock::ManualClock,
    kv::MemoryKv,
    names::{NameCache, NameResolver, NameService, NAME_PAGE_SIZE},
};

fn name_cache(
    names: Option<Arc<FakeNames>>,
    kv: Arc<MemoryKv>,
    clock: Arc<ManualClock>,
) -> Arc<NameCache> {
    let domain = names.as_ref().map(|_| DOMAIN.to_string());
    let service = names.map(|n| n as Arc<dyn NameService>);
    Arc::new(NameCache::new(service, domain, kv, clock, NAME_TTL))
}

fn resolver(cache: Arc<NameCache>, chain: FakeChain) -> NameResolver {
    NameResolver::new(cache, Arc::new(chain), LOOKUP_TIMEOUT)
}

#[test(tokio::test)]
async fn test_slow_reverse_lookup_resolves_to_none() -> Result<()> {
    let chain = FakeChain::new()
        .with_reverse_name(addr(1), "slow.eth")
        .with_reverse_delay(Duration::from_secs(5));
    let clock = Arc::new(ManualClock::new(START_MS));
    let resolver = resolver(name_cache(None, Arc::new(MemoryKv::new()), clock), chain);

    let snapshot = resolver.snapshot().await;
    let started = Instant::now();
    let resolved = resolver.resolve_all(&snapshot, &[addr(1), addr(2), addr(3)]).await;

    assert_eq!(resolved, vec![None, None, None]);
    // Lookups share one timeout window rather than queueing behind each other.
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[test(tokio::test)]
async fn test_resolve_prefers_subname_then_reverse_record() -> Result<()> {
    let names = Arc::new(FakeNames::with(&[("bolt", addr(1))]));
    let chain = FakeChain::new()
        .with_reverse_name(addr(1), "ignored.eth")
        .with_reverse_name(addr(2), "vitalik.eth");
    let clock = Arc::new(ManualClock::new(START_MS));
    let cache = name_cache(Some(names.clone()), Arc::new(MemoryKv::new()), clock);
    let resolver = resolver(cache, chain);

    assert_eq!(resolver.resolve(addr(1)).await.as_deref(), Some("bolt.zeusarmy.eth"));
    assert_eq!(resolver.resolve(addr(2)).await.as_deref(), Some("vitalik.eth"));
    assert_eq!(resolver.resolve(addr(3)).await, None);
    assert_eq!(names.list_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test(tokio::test)]
async fn test_second_instance_adopts_shared_snapshot() -> Result<()> {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::new(START_MS));

    let first_names = Arc::new(FakeNames::with(&[("bolt", addr(1)), ("thunder", addr(2))]));
    let first = name_cache(Some(first_names.clone()), kv.clone(), clock.clone());
    let built = first.ensure_fresh().await;
    assert_eq!(first_names.list_calls.load(Ordering::SeqCst), 1);

    clock.advance(NAME_TTL.as_millis() as u64 / 2);
    let second_names = Arc::new(FakeNames::default());
    let second = name_cache(Some(second_names.clone()), kv.clone(), clock.clone());
    let adopted = second.ensure_fresh().await;

    assert_eq!(second_names.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(adopted.epoch(), built.epoch());
    assert_eq!(adopted.names.len(), 2);
    assert_eq!(adopted.get(&addr(2)).map(String::as_str), Some("thunder.zeusarmy.eth"));

    // Once the shared copy is stale the second instance lists for itself.
    clock.advance(NAME_TTL.as_millis() as u64);
    let rebuilt = second.ensure_fresh().await;
    assert_eq!(second_names.list_calls.load(Ordering::SeqCst), 1);
    assert!(rebuilt.names.is_empty());
    assert!(rebuilt.epoch() > built.epoch());
    Ok(())
}

#[test(tokio::test)]
async fn test_rebuild_pages_through_every_record() -> Result<()> {
    let total = NAME_PAGE_SIZE * 2 + 500;
    let labels: Vec<(String, Address)> = (0..total as u64)
        .map(|i| (format!("holder{}", i), addr(10_000 + i)))
        .collect();
    let records: Vec<(&str, Address)> = labels.iter().map(|(l, a)| (l.as_str(), *a)).collect();
    let names = Arc::new(FakeNames::with(&records));

    let clock = Arc::new(ManualClock::new(START_MS));
    let cache = name_cache(Some(names.clone()), Arc::new(MemoryKv::new()), clock);
    let snapshot = cache.ensure_fresh().await;

    assert_eq!(snapshot.names.len(), total);
    assert_eq!(names.list_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        snapshot.get(&addr(10_000 + total as u64 - 1)).map(String::as_str),
        Some("holder2499.zeusarmy.eth")
    );
    Ok(())
}
