use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    ConsumeLimits, ConsumeOutcome, CounterStore, StoreError, exceeded_dimension, now_millis,
};
use crate::counter::{TokenDelta, UsageCounter};
use crate::key::CounterKey;

/// Single-process backend: one mutex guarding the key-to-counter map.
///
/// Atomicity holds only within this process. That is a deliberate scope
/// limitation for local and single-instance deployments, not a correctness
/// bug; multi-process deployments share a `SqliteStore` or `RedisStore`
/// instead.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<CounterKey, UsageCounter>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<CounterKey, UsageCounter>>, StoreError>
    {
        // A poisoned lock means a writer panicked mid-update; fail closed.
        self.counters
            .lock()
            .map_err(|_| StoreError::unavailable("counter map lock poisoned"))
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn ensure_row(&self, key: &CounterKey) -> Result<(), StoreError> {
        let mut counters = self.lock()?;
        counters
            .entry(key.clone())
            .or_insert_with(|| UsageCounter::new(now_millis()));
        Ok(())
    }

    async fn try_consume(
        &self,
        key: &CounterKey,
        amount: u64,
        limits: ConsumeLimits,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut counters = self.lock()?;
        let now = now_millis();
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| UsageCounter::new(now));

        let exceeded = exceeded_dimension(
            counter.requests_used,
            counter.tokens_used,
            counter.cost_usd_micros,
            amount,
            &limits,
        );
        if let Some(dimension) = exceeded {
            return Ok(ConsumeOutcome {
                allowed: false,
                requests_used: counter.requests_used,
                exceeded: Some(dimension),
            });
        }

        counter.requests_used = counter.requests_used.saturating_add(amount);
        counter.updated_at_ms = now;
        Ok(ConsumeOutcome {
            allowed: true,
            requests_used: counter.requests_used,
            exceeded: None,
        })
    }

    async fn record_blocked(
        &self,
        key: &CounterKey,
        estimated_cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        let mut counters = self.lock()?;
        let now = now_millis();
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| UsageCounter::new(now));
        counter.blocked_requests = counter.blocked_requests.saturating_add(1);
        counter.saved_usd_micros = counter
            .saved_usd_micros
            .saturating_add(estimated_cost_usd_micros);
        counter.updated_at_ms = now;
        Ok(())
    }

    async fn adjust_usage(
        &self,
        key: &CounterKey,
        tokens: TokenDelta,
        cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        let mut counters = self.lock()?;
        let now = now_millis();
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| UsageCounter::new(now));
        counter.input_tokens = counter.input_tokens.saturating_add(tokens.input);
        counter.output_tokens = counter.output_tokens.saturating_add(tokens.output);
        counter.tokens_used = counter.tokens_used.saturating_add(tokens.total());
        counter.cost_usd_micros = counter.cost_usd_micros.saturating_add(cost_usd_micros);
        counter.updated_at_ms = now;
        Ok(())
    }

    async fn get_usage(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StoreError> {
        let counters = self.lock()?;
        Ok(counters.get(key).cloned())
    }

    async fn list_usage(
        &self,
        project_id: &str,
    ) -> Result<Vec<(CounterKey, UsageCounter)>, StoreError> {
        let counters = self.lock()?;
        let mut out: Vec<(CounterKey, UsageCounter)> = counters
            .iter()
            .filter(|(key, _)| key.project_id == project_id)
            .map(|(key, counter)| (key.clone(), counter.clone()))
            .collect();
        out.sort_by(|(a, _), (b, _)| {
            (&a.identity, &a.model, a.period_start).cmp(&(&b.identity, &b.model, b.period_start))
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LimitDimension;
    use time::macros::date;

    fn key() -> CounterKey {
        CounterKey::new("proj-1", "user-1", "gpt-4o", date!(2026 - 08 - 27))
    }

    fn request_cap(max: u64) -> ConsumeLimits {
        ConsumeLimits {
            max_requests: Some(max),
            ..ConsumeLimits::default()
        }
    }

    #[tokio::test]
    async fn boundary_is_exact() {
        let store = MemoryStore::new();
        let limits = request_cap(2);

        let first = store.try_consume(&key(), 1, limits).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.requests_used, 1);

        let second = store.try_consume(&key(), 1, limits).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.requests_used, 2);

        let third = store.try_consume(&key(), 1, limits).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.requests_used, 2);
        assert_eq!(third.exceeded, Some(LimitDimension::Requests));
    }

    #[tokio::test]
    async fn token_cap_denies_once_crossed() {
        let store = MemoryStore::new();
        let limits = ConsumeLimits {
            max_requests: Some(100),
            max_tokens: Some(50),
            ..ConsumeLimits::default()
        };

        store
            .adjust_usage(&key(), TokenDelta::new(40, 10), 0)
            .await
            .unwrap();
        let outcome = store.try_consume(&key(), 1, limits).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.exceeded, Some(LimitDimension::Tokens));
    }

    #[tokio::test]
    async fn adjust_maintains_token_sum_invariant() {
        let store = MemoryStore::new();
        store
            .adjust_usage(&key(), TokenDelta::new(100, 20), 1_000)
            .await
            .unwrap();
        store
            .adjust_usage(&key(), TokenDelta::new(50, 5), 500)
            .await
            .unwrap();

        let counter = store.get_usage(&key()).await.unwrap().unwrap();
        assert_eq!(counter.input_tokens, 150);
        assert_eq!(counter.output_tokens, 25);
        assert_eq!(counter.tokens_used, counter.input_tokens + counter.output_tokens);
        assert_eq!(counter.cost_usd_micros, 1_500);
    }

    #[tokio::test]
    async fn blocked_bookkeeping_never_touches_requests() {
        let store = MemoryStore::new();
        store.ensure_row(&key()).await.unwrap();
        store.record_blocked(&key(), 12_500).await.unwrap();
        store.record_blocked(&key(), 500).await.unwrap();

        let counter = store.get_usage(&key()).await.unwrap().unwrap();
        assert_eq!(counter.blocked_requests, 2);
        assert_eq!(counter.saved_usd_micros, 13_000);
        assert_eq!(counter.requests_used, 0);
    }

    #[tokio::test]
    async fn list_usage_filters_by_project() {
        let store = MemoryStore::new();
        store.ensure_row(&key()).await.unwrap();
        let other = CounterKey::new("proj-2", "user-1", "gpt-4o", date!(2026 - 08 - 27));
        store.ensure_row(&other).await.unwrap();

        let rows = store.list_usage("proj-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, key());
    }
}
