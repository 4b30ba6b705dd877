//! Integration tests for the shared store backends
//!
//! The SQLite tests open several independent connections to one database file, the way
//! separate crawler processes would. The Redis tests do the same against the server named
//! by `REDIS_URL` and are skipped when it is unset. They clear that server's crawl keys,
//! so point it at a disposable instance.

use driftnet::crawler::Reservation;
use driftnet::state::FrontierEntry;
use driftnet::store::{MemoryStore, RedisStore, SharedStore, SqliteStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

const URLS: usize = 200;
const CLAIMERS: usize = 8;

fn sqlite_stores(dir: &TempDir, count: usize) -> Vec<Arc<dyn SharedStore>> {
    let path = dir.path().join("frontier.db");
    (0..count)
        .map(|_| Arc::new(SqliteStore::open(&path).unwrap()) as Arc<dyn SharedStore>)
        .collect()
}

async fn fill(store: &dyn SharedStore) {
    for i in 0..URLS {
        let url = format!("https://site{}.com/page/{}", i % 7, i);
        assert!(store.admit(&FrontierEntry::new(url, 0, 0)).await.unwrap());
    }
}

/// Drains the frontier from every store handle at once and returns all claimed URLs
async fn drain_concurrently(stores: Vec<Arc<dyn SharedStore>>) -> Vec<String> {
    let mut claimers = JoinSet::new();
    for store in stores {
        claimers.spawn(async move {
            let mut claimed = Vec::new();
            while let Some(entry) = store.pop_ready(1_000).await.unwrap() {
                claimed.push(entry.url);
            }
            claimed
        });
    }

    let mut all = Vec::new();
    while let Some(joined) = claimers.join_next().await {
        all.extend(joined.unwrap());
    }
    all
}

fn assert_claimed_once(claimed: &[String]) {
    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(unique.len(), claimed.len(), "a URL was claimed twice");
    assert_eq!(claimed.len(), URLS, "a URL was never claimed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_store_claims_at_most_once() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    fill(store.as_ref()).await;

    let claimed = drain_concurrently(vec![store.clone(); CLAIMERS]).await;

    assert_claimed_once(&claimed);
    assert_eq!(store.frontier_len().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_connections_claim_at_most_once() {
    let dir = TempDir::new().unwrap();
    let stores = sqlite_stores(&dir, CLAIMERS);
    fill(stores[0].as_ref()).await;
    assert_eq!(stores[3].frontier_len().await.unwrap(), URLS as u64);

    let claimed = drain_concurrently(stores.clone()).await;

    assert_claimed_once(&claimed);
    assert_eq!(stores[0].frontier_len().await.unwrap(), 0);
    // Claiming never forgets that a URL was seen
    assert_eq!(stores[5].seen_count().await.unwrap(), URLS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_admission_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let stores = sqlite_stores(&dir, 4);

    let mut admits = JoinSet::new();
    for store in stores.iter().cloned() {
        admits.spawn(async move {
            let entry = FrontierEntry::new("https://dup.com/page", 0, 0);
            store.admit(&entry).await.unwrap()
        });
    }

    let mut admitted = 0;
    while let Some(joined) = admits.join_next().await {
        if joined.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(stores[0].frontier_len().await.unwrap(), 1);
    assert_eq!(stores[1].seen_count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_reservation_grants_one_per_window() {
    let dir = TempDir::new().unwrap();
    let stores = sqlite_stores(&dir, 6);

    let mut reservations = JoinSet::new();
    for store in stores.iter().cloned() {
        reservations.spawn(async move { store.reserve_domain("a.com", 10_000, 2_000).await.unwrap() });
    }

    let mut ready = 0;
    while let Some(joined) = reservations.join_next().await {
        match joined.unwrap() {
            Reservation::Ready => ready += 1,
            Reservation::Deferred { until } => assert_eq!(until, 12_000),
        }
    }
    assert_eq!(ready, 1);

    // The window opens for exactly one caller at its boundary
    assert_eq!(
        stores[2].reserve_domain("a.com", 11_999, 2_000).await.unwrap(),
        Reservation::Deferred { until: 12_000 }
    );
    assert_eq!(
        stores[3].reserve_domain("a.com", 12_000, 2_000).await.unwrap(),
        Reservation::Ready
    );
}

#[tokio::test]
async fn test_sqlite_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("frontier.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store
            .admit(&FrontierEntry::new("https://a.com/", 500, 0))
            .await
            .unwrap();
        store.record_robots("a.com", "User-agent: *\nDisallow: /x", 0, 60_000).await.unwrap();
        store.incr("metrics:pages_fetched").await.unwrap();
        store.bump_attempts("https://a.com/", "timeout").await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert!(store.is_seen("https://a.com/").await.unwrap());
    assert!(store.pop_ready(499).await.unwrap().is_none());
    assert_eq!(
        store.pop_ready(500).await.unwrap(),
        Some(FrontierEntry::new("https://a.com/", 500, 0))
    );

    let domain = store.domain_state("a.com").await.unwrap().unwrap();
    assert_eq!(domain.fresh_robots(1_000), Some("User-agent: *\nDisallow: /x"));
    assert_eq!(store.counter("metrics:pages_fetched").await.unwrap(), 1);
    assert_eq!(
        store.bump_attempts("https://a.com/", "timeout").await.unwrap().attempts,
        2
    );

    store.clear().await.unwrap();
    assert!(!store.is_seen("https://a.com/").await.unwrap());
    assert_eq!(store.counter("metrics:pages_fetched").await.unwrap(), 0);
}

/// Redis tests share one keyspace, so they take turns
static REDIS_SERIAL: Mutex<()> = Mutex::new(());

/// Opens `count` connections to a freshly cleared Redis, or `None` without `REDIS_URL`
async fn redis_stores(
    count: usize,
) -> Option<(MutexGuard<'static, ()>, Vec<Arc<dyn SharedStore>>)> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping");
        return None;
    };
    let guard = REDIS_SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut stores: Vec<Arc<dyn SharedStore>> = Vec::with_capacity(count);
    for _ in 0..count {
        stores.push(Arc::new(RedisStore::connect(&url).await.unwrap()));
    }
    stores[0].clear().await.unwrap();
    Some((guard, stores))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_connections_claim_at_most_once() {
    let Some((_serial, stores)) = redis_stores(CLAIMERS).await else {
        return;
    };
    fill(stores[0].as_ref()).await;
    assert_eq!(stores[3].frontier_len().await.unwrap(), URLS as u64);

    let claimed = drain_concurrently(stores.clone()).await;

    assert_claimed_once(&claimed);
    assert_eq!(stores[0].frontier_len().await.unwrap(), 0);
    assert_eq!(stores[5].seen_count().await.unwrap(), URLS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_concurrent_admission_is_idempotent() {
    let Some((_serial, stores)) = redis_stores(4).await else {
        return;
    };

    let mut admits = JoinSet::new();
    for store in stores.iter().cloned() {
        admits.spawn(async move {
            let entry = FrontierEntry::new("https://dup.com/page", 0, 0);
            store.admit(&entry).await.unwrap()
        });
    }

    let mut admitted = 0;
    while let Some(joined) = admits.join_next().await {
        if joined.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(stores[0].frontier_len().await.unwrap(), 1);
    assert_eq!(stores[1].seen_count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_reservation_grants_one_per_window() {
    let Some((_serial, stores)) = redis_stores(6).await else {
        return;
    };

    let mut reservations = JoinSet::new();
    for store in stores.iter().cloned() {
        reservations.spawn(async move { store.reserve_domain("a.com", 10_000, 2_000).await.unwrap() });
    }

    let mut ready = 0;
    while let Some(joined) = reservations.join_next().await {
        match joined.unwrap() {
            Reservation::Ready => ready += 1,
            Reservation::Deferred { until } => assert_eq!(until, 12_000),
        }
    }
    assert_eq!(ready, 1);

    assert_eq!(
        stores[2].reserve_domain("a.com", 11_999, 2_000).await.unwrap(),
        Reservation::Deferred { until: 12_000 }
    );
    assert_eq!(
        stores[3].reserve_domain("a.com", 12_000, 2_000).await.unwrap(),
        Reservation::Ready
    );
}

#[tokio::test]
async fn test_redis_pop_order_breaks_ties_by_priority_then_url() {
    let Some((_serial, stores)) = redis_stores(1).await else {
        return;
    };
    let store = &stores[0];

    for entry in [
        FrontierEntry::new("https://c.com/", 100, 1),
        FrontierEntry::new("https://b.com/", 100, 0),
        FrontierEntry::new("https://a.com/", 100, 1),
        FrontierEntry::new("https://z.com/", 50, 9),
    ] {
        assert!(store.admit(&entry).await.unwrap());
    }

    assert!(store.pop_ready(49).await.unwrap().is_none());

    let mut order = Vec::new();
    while let Some(entry) = store.pop_ready(1_000).await.unwrap() {
        order.push((entry.url, entry.ready_at, entry.priority));
    }
    assert_eq!(
        order,
        vec![
            ("https://z.com/".to_string(), 50, 9),
            ("https://b.com/".to_string(), 100, 0),
            ("https://a.com/".to_string(), 100, 1),
            ("https://c.com/".to_string(), 100, 1),
        ]
    );
}

#[tokio::test]
async fn test_redis_lock_expires() {
    let Some((_serial, stores)) = redis_stores(2).await else {
        return;
    };

    assert!(stores[0].try_lock("robots:a.com", 0, 200).await.unwrap());
    assert!(!stores[1].try_lock("robots:a.com", 0, 200).await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(stores[1].try_lock("robots:a.com", 0, 200).await.unwrap());

    stores[1].release_lock("robots:a.com").await.unwrap();
    assert!(stores[0].try_lock("robots:a.com", 0, 60_000).await.unwrap());
}
