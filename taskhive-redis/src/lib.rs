//! Redis backed implementations of the cluster shared taskhive collaborators.
//!
//! - [`RedisGlobalRateLimiter`] keeps a sliding window log per locker key in a sorted set and
//!   evaluates it atomically in a Lua script against the server's clock, so instances with skewed
//!   clocks still share one window.
//! - [`RedisLeaderLock`] holds a `SET NX PX` lease that a background task renews. It reports
//!   leadership only while the last renewal succeeded and the lease has not lapsed.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, RedisError, Script, ToRedisArgs};
use taskhive::{
    leader::{LeaderError, LeaderLock},
    rate_limit::{GlobalRateLimiter, RateLimitError},
    settings::LeaderSettings,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

const SLIDING_WINDOW: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local permits = tonumber(ARGV[3])
local member = ARGV[4]
if permits > limit then
  return -1
end
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local used = redis.call('ZCARD', key)
if used + permits <= limit then
  for i = 1, permits do
    redis.call('ZADD', key, now, member .. ':' .. i)
  end
  redis.call('PEXPIRE', key, window)
  return 0
end
local blocking = used + permits - limit - 1
local granted = redis.call('ZRANGE', key, blocking, blocking, 'WITHSCORES')
local wait = tonumber(granted[2]) + window - now
if wait < 1 then
  wait = 1
end
return wait
";

const ACQUIRE_OR_RENEW: &str = r"
local holder = redis.call('GET', KEYS[1])
if holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
if not holder then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
return 0
";

const RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

async fn connect(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let client = Client::open(redis_url)?;
    ConnectionManager::new(client).await
}

#[derive(Debug, Clone)]
struct NameSpace(String);

impl NameSpace {
    fn rate_limit<'a>(&'a self, key: &'a str) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::RateLimit(key),
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType<'a>,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::RateLimit(key) => write!(f, ":rate_limit:{key}"),
        }
    }
}

impl ToRedisArgs for NameSpacedKey<'_> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType<'a> {
    RateLimit(&'a str),
}

/// Converts the sliding window script's reply into a wait hint.
fn wait_hint(reply: i64) -> u64 {
    // Negative replies mean the request can never be satisfied.
    u64::try_from(reply).unwrap_or(u64::MAX)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A cluster wide sliding window rate limiter.
#[derive(Clone)]
pub struct RedisGlobalRateLimiter {
    conn: ConnectionManager,
    namespace: NameSpace,
    script: Arc<Script>,
}

impl std::fmt::Debug for RedisGlobalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisGlobalRateLimiter")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

fn map_rate_limit_err(error: RedisError) -> RateLimitError {
    tracing::error!(?error, "Redis rate limiter error: {error}");
    RateLimitError::Unavailable(error.to_string())
}

impl RedisGlobalRateLimiter {
    pub fn new(conn: ConnectionManager, namespace: impl ToString) -> Self {
        Self {
            conn,
            namespace: NameSpace(namespace.to_string()),
            script: Arc::new(Script::new(SLIDING_WINDOW)),
        }
    }

    pub async fn from_url(
        redis_url: &str,
        namespace: impl ToString,
    ) -> Result<Self, RateLimitError> {
        let conn = connect(redis_url).await.map_err(map_rate_limit_err)?;
        Ok(Self::new(conn, namespace))
    }
}

#[async_trait]
impl GlobalRateLimiter for RedisGlobalRateLimiter {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        permits: u32,
    ) -> Result<u64, RateLimitError> {
        let member = format!("{:016x}", rand::random::<u64>());
        let reply: i64 = self
            .script
            .key(self.namespace.rate_limit(key))
            .arg(limit)
            .arg(millis(window))
            .arg(permits)
            .arg(member)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_rate_limit_err)?;
        Ok(wait_hint(reply))
    }
}

#[derive(Debug, Default)]
struct LeaseState {
    held_until: Option<Instant>,
    last_error: Option<String>,
}

impl LeaseState {
    fn is_leader(&self, now: Instant) -> Result<bool, LeaderError> {
        if let Some(error) = &self.last_error {
            return Err(LeaderError::Unavailable(error.clone()));
        }
        Ok(self.held_until.is_some_and(|held_until| now < held_until))
    }
}

/// A lease based leader lock renewed in the background.
///
/// The lease is taken with the candidate name as its value, so only the holder can renew or
/// release it.
pub struct RedisLeaderLock {
    state: Arc<Mutex<LeaseState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    conn: ConnectionManager,
    key: String,
    candidate: String,
}

impl std::fmt::Debug for RedisLeaderLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLeaderLock")
            .field("key", &self.key)
            .field("candidate", &self.candidate)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RedisLeaderLock {
    /// Starts competing for the lease described by `settings`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        conn: ConnectionManager,
        settings: &LeaderSettings,
        candidate: impl ToString,
    ) -> Self {
        let state = Arc::new(Mutex::new(LeaseState::default()));
        let cancel = CancellationToken::new();
        let key = settings.key.clone();
        let candidate = candidate.to_string();
        let handle = tokio::spawn(renew_lease(
            conn.clone(),
            key.clone(),
            candidate.clone(),
            settings.lease(),
            settings.renew(),
            state.clone(),
            cancel.clone(),
        ));
        Self {
            state,
            cancel,
            handle: Mutex::new(Some(handle)),
            conn,
            key,
            candidate,
        }
    }

    pub async fn from_url(
        redis_url: &str,
        settings: &LeaderSettings,
        candidate: impl ToString,
    ) -> Result<Self, LeaderError> {
        let conn = connect(redis_url)
            .await
            .map_err(|error| LeaderError::Unavailable(error.to_string()))?;
        Ok(Self::spawn(conn, settings, candidate))
    }

    /// Stops renewing and gives up the lease if held.
    pub async fn shutdown(&self) -> Result<(), LeaderError> {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await.inspect_err(|error| {
                tracing::error!(?error, "Leader lease renewal did not shut down cleanly: {error}")
            });
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .held_until = None;

        let released: i64 = Script::new(RELEASE)
            .key(&self.key)
            .arg(&self.candidate)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|error| LeaderError::Unavailable(error.to_string()))?;
        tracing::info!(
            candidate = %self.candidate,
            released = released == 1,
            "Leader lock shut down"
        );
        Ok(())
    }
}

async fn renew_lease(
    mut conn: ConnectionManager,
    key: String,
    candidate: String,
    lease: Duration,
    renew: Duration,
    state: Arc<Mutex<LeaseState>>,
    cancel: CancellationToken,
) {
    let script = Script::new(ACQUIRE_OR_RENEW);
    loop {
        let requested_at = Instant::now();
        let reply: Result<i64, _> = script
            .key(&key)
            .arg(&candidate)
            .arg(millis(lease))
            .invoke_async(&mut conn)
            .await;
        {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match reply {
                Ok(held) => {
                    let was_leader = state.held_until.is_some_and(|until| requested_at < until);
                    let is_leader = held == 1;
                    if was_leader != is_leader {
                        tracing::info!(%candidate, is_leader, "Leadership changed");
                    }
                    // The lease runs from before the request was sent.
                    state.held_until = is_leader.then_some(requested_at + lease);
                    state.last_error = None;
                }
                Err(error) => {
                    tracing::warn!(?error, %candidate, "Failed to renew leader lease: {error}");
                    state.last_error = Some(error.to_string());
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(renew) => {},
        }
    }
    tracing::debug!(%candidate, "Stopped renewing leader lease");
}

#[async_trait]
impl LeaderLock for RedisLeaderLock {
    async fn try_is_leader(&self) -> Result<bool, LeaderError> {
        self.state
            .lock()
            .map_err(|_| LeaderError::BadState)?
            .is_leader(Instant::now())
    }
}
