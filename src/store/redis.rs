//! Redis shared store
//!
//! Any number of hosts can share one Redis server. Operations that need more than one
//! command run as Lua scripts, which Redis executes without interleaving.
//!
//! # Layout
//!
//! - `frontier:zset`: members `{priority:010}\t{url}` scored by ready-at milliseconds, so
//!   ties on ready time break by priority then URL
//! - `seen:set`: every admitted URL
//! - `domain:{domain}`: hash with `next_allowed_at` and the robots fields
//! - `retry:attempts`, `retry:errors`: hashes keyed by URL
//! - `lock:{name}`: plain keys with a PX expiry
//! - `counter:{name}`: integers

use crate::clock::Millis;
use crate::state::{DomainState, FrontierEntry, RetryState};
use crate::store::traits::{Reservation, SharedStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

const FRONTIER_KEY: &str = "frontier:zset";
const SEEN_KEY: &str = "seen:set";
const RETRY_ATTEMPTS_KEY: &str = "retry:attempts";
const RETRY_ERRORS_KEY: &str = "retry:errors";

const POP_READY_SCRIPT: &str = r"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #items == 0 then
    return false
end
local score = redis.call('ZSCORE', KEYS[1], items[1])
redis.call('ZREM', KEYS[1], items[1])
return {items[1], score}
";

const ADMIT_SCRIPT: &str = r"
if redis.call('SADD', KEYS[1], ARGV[1]) == 1 then
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
    return 1
end
return 0
";

const RESERVE_SCRIPT: &str = r"
local next_allowed = tonumber(redis.call('HGET', KEYS[1], 'next_allowed_at') or '0')
if tonumber(ARGV[1]) >= next_allowed then
    redis.call('HSET', KEYS[1], 'next_allowed_at', ARGV[2])
    return {1, 0}
end
return {0, next_allowed}
";

fn domain_key(domain: &str) -> String {
    format!("domain:{}", domain)
}

fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

fn counter_key(name: &str) -> String {
    format!("counter:{}", name)
}

fn encode_member(entry: &FrontierEntry) -> String {
    format!("{:010}\t{}", entry.priority, entry.url)
}

fn decode_member(member: &str, score: &str) -> StoreResult<FrontierEntry> {
    let (priority, url) = member
        .split_once('\t')
        .ok_or_else(|| StoreError::Corrupt(format!("frontier member without priority: {}", member)))?;
    let priority = priority
        .parse::<u32>()
        .map_err(|e| StoreError::Corrupt(format!("bad priority in '{}': {}", member, e)))?;
    let ready_at = score
        .parse::<f64>()
        .map_err(|e| StoreError::Corrupt(format!("bad frontier score '{}': {}", score, e)))?
        as Millis;

    Ok(FrontierEntry {
        url: url.to_string(),
        ready_at,
        priority,
    })
}

fn parse_millis(fields: &HashMap<String, String>, name: &str) -> StoreResult<Option<Millis>> {
    fields
        .get(name)
        .map(|value| {
            value
                .parse::<Millis>()
                .map_err(|e| StoreError::Corrupt(format!("bad {} '{}': {}", name, value, e)))
        })
        .transpose()
}

/// Redis-backed shared store
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    pop_ready: Script,
    admit: Script,
    reserve: Script,
}

impl RedisStore {
    /// Connects to the Redis server at `url` (`redis://` or `rediss://`)
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            pop_ready: Script::new(POP_READY_SCRIPT),
            admit: Script::new(ADMIT_SCRIPT),
            reserve: Script::new(RESERVE_SCRIPT),
        })
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                conn.del::<_, ()>(keys).await?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn admit(&self, entry: &FrontierEntry) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .admit
            .key(SEEN_KEY)
            .key(FRONTIER_KEY)
            .arg(&entry.url)
            .arg(entry.ready_at)
            .arg(encode_member(entry))
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn requeue(&self, entry: &FrontierEntry) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(FRONTIER_KEY, encode_member(entry), entry.ready_at)
            .await?;
        Ok(())
    }

    async fn pop_ready(&self, now: Millis) -> StoreResult<Option<FrontierEntry>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = self
            .pop_ready
            .key(FRONTIER_KEY)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        popped
            .map(|(member, score)| decode_member(&member, &score))
            .transpose()
    }

    async fn frontier_len(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(FRONTIER_KEY).await?)
    }

    async fn is_seen(&self, url: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(SEEN_KEY, url).await?)
    }

    async fn seen_count(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(SEEN_KEY).await?)
    }

    async fn reserve_domain(
        &self,
        domain: &str,
        now: Millis,
        cooldown_ms: Millis,
    ) -> StoreResult<Reservation> {
        let mut conn = self.conn.clone();
        let (ready, until): (i64, Millis) = self
            .reserve
            .key(domain_key(domain))
            .arg(now)
            .arg(now.saturating_add(cooldown_ms))
            .invoke_async(&mut conn)
            .await?;

        Ok(if ready == 1 {
            Reservation::Ready
        } else {
            Reservation::Deferred { until }
        })
    }

    async fn domain_state(&self, domain: &str) -> StoreResult<Option<DomainState>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(domain_key(domain)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(DomainState {
            domain: domain.to_string(),
            next_allowed_at: parse_millis(&fields, "next_allowed_at")?.unwrap_or(0),
            robots_rules: fields.get("robots_rules").cloned(),
            robots_fetched_at: parse_millis(&fields, "robots_fetched_at")?,
            robots_expires_at: parse_millis(&fields, "robots_expires_at")?,
        }))
    }

    async fn record_robots(
        &self,
        domain: &str,
        rules: &str,
        fetched_at: Millis,
        expires_at: Millis,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(
            domain_key(domain),
            &[
                ("robots_rules", rules.to_string()),
                ("robots_fetched_at", fetched_at.to_string()),
                ("robots_expires_at", expires_at.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn try_lock(&self, name: &str, _now: Millis, ttl_ms: Millis) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(lock_key(name))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(lock_key(name)).await?;
        Ok(())
    }

    async fn incr(&self, name: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(counter_key(name), 1).await?)
    }

    async fn counter(&self, name: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(counter_key(name)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn reset_counter(&self, name: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(counter_key(name)).await?;
        Ok(())
    }

    async fn bump_attempts(&self, url: &str, error: &str) -> StoreResult<RetryState> {
        let mut conn = self.conn.clone();
        let (attempts,): (i64,) = redis::pipe()
            .atomic()
            .hincr(RETRY_ATTEMPTS_KEY, url, 1)
            .hset(RETRY_ERRORS_KEY, url, error)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(RetryState {
            url: url.to_string(),
            attempts: u32::try_from(attempts)
                .map_err(|_| StoreError::Corrupt(format!("attempts out of range: {}", attempts)))?,
            last_error: error.to_string(),
        })
    }

    async fn clear_attempts(&self, url: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hdel(RETRY_ATTEMPTS_KEY, url)
            .ignore()
            .hdel(RETRY_ERRORS_KEY, url)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&[FRONTIER_KEY, SEEN_KEY, RETRY_ATTEMPTS_KEY, RETRY_ERRORS_KEY][..])
            .await?;
        self.delete_matching("domain:*").await?;
        self.delete_matching("lock:*").await?;
        self.delete_matching("counter:*").await?;
        Ok(())
    }
}
