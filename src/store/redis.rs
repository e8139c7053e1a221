use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use super::{
    ConsumeLimits, ConsumeOutcome, CounterStore, LimitDimension, StoreError, now_millis, u64_to_i64,
};
use crate::counter::{TokenDelta, UsageCounter};
use crate::key::CounterKey;
use crate::period::parse_period_start;

/// Multi-process backend: counters are hashes, and the check-and-increment
/// runs as a single server-side Lua script so it is indivisible from the
/// store's perspective. Suitable for multi-host deployments sharing one
/// Redis instance.
#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

/// Set member under the per-project index; JSON so identities and models may
/// contain any separator characters.
#[derive(Serialize, Deserialize)]
struct IndexMember {
    identity: String,
    model: String,
    period_start: String,
}

const TRY_CONSUME_SCRIPT: &str = r#"
local counter_key = KEYS[1]
local index_key = KEYS[2]

local amount = tonumber(ARGV[1]) or 0
local max_requests = tonumber(ARGV[2]) or -1
local max_tokens = tonumber(ARGV[3]) or -1
local max_cost = tonumber(ARGV[4]) or -1
local ts_ms = ARGV[5]
local member = ARGV[6]

local requests = tonumber(redis.call("HGET", counter_key, "requests_used") or "0") or 0
local tokens = tonumber(redis.call("HGET", counter_key, "tokens_used") or "0") or 0
local cost = tonumber(redis.call("HGET", counter_key, "cost_usd_micros") or "0") or 0

if max_requests >= 0 and requests + amount > max_requests then
  return { "DENY", "requests", tostring(requests) }
end
if max_tokens >= 0 and tokens >= max_tokens then
  return { "DENY", "tokens", tostring(requests) }
end
if max_cost >= 0 and cost >= max_cost then
  return { "DENY", "cost", tostring(requests) }
end

local new_requests = redis.call("HINCRBY", counter_key, "requests_used", amount)
redis.call("HSETNX", counter_key, "created_at_ms", ts_ms)
redis.call("HSET", counter_key, "updated_at_ms", ts_ms)
redis.call("SADD", index_key, member)
return { "ALLOW", "", tostring(new_requests) }
"#;

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "tollgate".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_counter(&self, key: &CounterKey) -> String {
        format!(
            "{}:counter:{}:{}:{}:{}",
            self.prefix,
            key.project_id,
            key.identity,
            key.model,
            key.period_start_str()
        )
    }

    fn key_project_index(&self, project_id: &str) -> String {
        format!("{}:counters:{project_id}", self.prefix)
    }

    fn index_member(key: &CounterKey) -> Result<String, StoreError> {
        serde_json::to_string(&IndexMember {
            identity: key.identity.clone(),
            model: key.model.clone(),
            period_start: key.period_start_str(),
        })
        .map_err(|err| StoreError::unavailable(err.to_string()))
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn ensure_row(&self, key: &CounterKey) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let counter_key = self.key_counter(key);
        let ts_ms = now_millis();
        let member = Self::index_member(key)?;
        // HSETNX is idempotent, so concurrent first writers all converge on
        // one hash with a single creation timestamp.
        let _: () = redis::pipe()
            .atomic()
            .hset_nx(&counter_key, "created_at_ms", ts_ms)
            .hset_nx(&counter_key, "updated_at_ms", ts_ms)
            .sadd(self.key_project_index(&key.project_id), member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_consume(
        &self,
        key: &CounterKey,
        amount: u64,
        limits: ConsumeLimits,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let ts_ms = now_millis();
        let member = Self::index_member(key)?;

        // -1 encodes "unlimited" on the script side.
        let max_requests = limits.max_requests.map(u64_to_i64).unwrap_or(-1);
        let max_tokens = limits.max_tokens.map(u64_to_i64).unwrap_or(-1);
        let max_cost = limits.max_cost_usd_micros.map(u64_to_i64).unwrap_or(-1);

        let script = redis::Script::new(TRY_CONSUME_SCRIPT);
        let result: Vec<String> = script
            .key(self.key_counter(key))
            .key(self.key_project_index(&key.project_id))
            .arg(u64_to_i64(amount))
            .arg(max_requests)
            .arg(max_tokens)
            .arg(max_cost)
            .arg(ts_ms)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let requests_used = result
            .get(2)
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);

        match result.first().map(|s| s.as_str()) {
            Some("ALLOW") => Ok(ConsumeOutcome {
                allowed: true,
                requests_used,
                exceeded: None,
            }),
            Some("DENY") => {
                let exceeded = match result.get(1).map(|s| s.as_str()) {
                    Some("tokens") => Some(LimitDimension::Tokens),
                    Some("cost") => Some(LimitDimension::Cost),
                    _ => Some(LimitDimension::Requests),
                };
                Ok(ConsumeOutcome {
                    allowed: false,
                    requests_used,
                    exceeded,
                })
            }
            _ => Err(StoreError::unavailable("unexpected redis script response")),
        }
    }

    async fn record_blocked(
        &self,
        key: &CounterKey,
        estimated_cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let counter_key = self.key_counter(key);
        let ts_ms = now_millis();
        let member = Self::index_member(key)?;
        let _: () = redis::pipe()
            .atomic()
            .hincr(&counter_key, "blocked_requests", 1)
            .hincr(
                &counter_key,
                "saved_usd_micros",
                u64_to_i64(estimated_cost_usd_micros),
            )
            .hset_nx(&counter_key, "created_at_ms", ts_ms)
            .hset(&counter_key, "updated_at_ms", ts_ms)
            .sadd(self.key_project_index(&key.project_id), member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn adjust_usage(
        &self,
        key: &CounterKey,
        tokens: TokenDelta,
        cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let counter_key = self.key_counter(key);
        let ts_ms = now_millis();
        let member = Self::index_member(key)?;
        let _: () = redis::pipe()
            .atomic()
            .hincr(&counter_key, "input_tokens", u64_to_i64(tokens.input))
            .hincr(&counter_key, "output_tokens", u64_to_i64(tokens.output))
            .hincr(&counter_key, "tokens_used", u64_to_i64(tokens.total()))
            .hincr(&counter_key, "cost_usd_micros", u64_to_i64(cost_usd_micros))
            .hset_nx(&counter_key, "created_at_ms", ts_ms)
            .hset(&counter_key, "updated_at_ms", ts_ms)
            .sadd(self.key_project_index(&key.project_id), member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_usage(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.key_counter(key)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(counter_from_hash(&raw)))
    }

    async fn list_usage(
        &self,
        project_id: &str,
    ) -> Result<Vec<(CounterKey, UsageCounter)>, StoreError> {
        let mut conn = self.connection().await?;
        let mut members: Vec<String> = conn.smembers(self.key_project_index(project_id)).await?;
        members.sort();

        let mut out = Vec::with_capacity(members.len());
        for raw in members {
            let Ok(member) = serde_json::from_str::<IndexMember>(&raw) else {
                continue;
            };
            let Some(period_start) = parse_period_start(&member.period_start) else {
                continue;
            };
            let key = CounterKey::new(project_id, member.identity, member.model, period_start);
            let fields: HashMap<String, String> = conn.hgetall(self.key_counter(&key)).await?;
            if fields.is_empty() {
                continue;
            }
            out.push((key, counter_from_hash(&fields)));
        }
        Ok(out)
    }
}

fn counter_from_hash(raw: &HashMap<String, String>) -> UsageCounter {
    let field = |name: &str| -> u64 {
        raw.get(name)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    };
    UsageCounter {
        requests_used: field("requests_used"),
        tokens_used: field("tokens_used"),
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cost_usd_micros: field("cost_usd_micros"),
        blocked_requests: field("blocked_requests"),
        saved_usd_micros: field("saved_usd_micros"),
        created_at_ms: field("created_at_ms"),
        updated_at_ms: field("updated_at_ms"),
    }
}
