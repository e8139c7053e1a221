use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::{
    ConsumeLimits, ConsumeOutcome, CounterStore, StoreError, exceeded_dimension, i64_to_u64,
    now_millis, u64_to_i64,
};
use crate::counter::{TokenDelta, UsageCounter};
use crate::key::CounterKey;
use crate::period::parse_period_start;

/// Single-node persistent backend: one row per counter key, unique on the
/// key tuple.
///
/// `try_consume` is one conditional `UPDATE` that filters on the caps and
/// increments in the same statement; atomicity comes from SQLite's row-level
/// concurrency control, not from application locking. The follow-up `SELECT`
/// only classifies a denial, it plays no part in correctness.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl CounterStore for SqliteStore {
    async fn ensure_row(&self, key: &CounterKey) -> Result<(), StoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let ts_ms = u64_to_i64(now_millis());

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            // INSERT OR IGNORE absorbs the concurrent-first-writer conflict:
            // whoever loses the race still sees "row now exists".
            conn.execute(
                "INSERT OR IGNORE INTO usage_counters
                     (project_id, identity, model, period_start, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![
                    key.project_id,
                    key.identity,
                    key.model,
                    key.period_start_str(),
                    ts_ms
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn try_consume(
        &self,
        key: &CounterKey,
        amount: u64,
        limits: ConsumeLimits,
    ) -> Result<ConsumeOutcome, StoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let amount_i64 = u64_to_i64(amount);
        let ts_ms = u64_to_i64(now_millis());

        tokio::task::spawn_blocking(move || -> Result<ConsumeOutcome, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let max_requests = limits.max_requests.map(u64_to_i64);
            let max_tokens = limits.max_tokens.map(u64_to_i64);
            let max_cost = limits.max_cost_usd_micros.map(u64_to_i64);

            let affected = tx.execute(
                "UPDATE usage_counters
                 SET requests_used = requests_used + ?5,
                     updated_at_ms = ?6
                 WHERE project_id = ?1 AND identity = ?2 AND model = ?3 AND period_start = ?4
                   AND (?7 IS NULL OR requests_used + ?5 <= ?7)
                   AND (?8 IS NULL OR tokens_used < ?8)
                   AND (?9 IS NULL OR cost_usd_micros < ?9)",
                rusqlite::params![
                    key.project_id,
                    key.identity,
                    key.model,
                    key.period_start_str(),
                    amount_i64,
                    ts_ms,
                    max_requests,
                    max_tokens,
                    max_cost
                ],
            )?;

            let row: Option<(i64, i64, i64)> = tx
                .query_row(
                    "SELECT requests_used, tokens_used, cost_usd_micros
                     FROM usage_counters
                     WHERE project_id = ?1 AND identity = ?2 AND model = ?3 AND period_start = ?4",
                    rusqlite::params![
                        key.project_id,
                        key.identity,
                        key.model,
                        key.period_start_str()
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            tx.commit()?;

            let Some((requests, tokens, cost)) = row else {
                return Err(StoreError::RowMissing);
            };
            let requests_used = i64_to_u64(requests);

            if affected > 0 {
                Ok(ConsumeOutcome {
                    allowed: true,
                    requests_used,
                    exceeded: None,
                })
            } else {
                Ok(ConsumeOutcome {
                    allowed: false,
                    requests_used,
                    exceeded: exceeded_dimension(
                        requests_used,
                        i64_to_u64(tokens),
                        i64_to_u64(cost),
                        amount,
                        &limits,
                    ),
                })
            }
        })
        .await?
    }

    async fn record_blocked(
        &self,
        key: &CounterKey,
        estimated_cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let saved_i64 = u64_to_i64(estimated_cost_usd_micros);
        let ts_ms = u64_to_i64(now_millis());

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO usage_counters
                     (project_id, identity, model, period_start, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![
                    key.project_id,
                    key.identity,
                    key.model,
                    key.period_start_str(),
                    ts_ms
                ],
            )?;
            tx.execute(
                "UPDATE usage_counters
                 SET blocked_requests = blocked_requests + 1,
                     saved_usd_micros = saved_usd_micros + ?5,
                     updated_at_ms = ?6
                 WHERE project_id = ?1 AND identity = ?2 AND model = ?3 AND period_start = ?4",
                rusqlite::params![
                    key.project_id,
                    key.identity,
                    key.model,
                    key.period_start_str(),
                    saved_i64,
                    ts_ms
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn adjust_usage(
        &self,
        key: &CounterKey,
        tokens: TokenDelta,
        cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let input_i64 = u64_to_i64(tokens.input);
        let output_i64 = u64_to_i64(tokens.output);
        let total_i64 = u64_to_i64(tokens.total());
        let cost_i64 = u64_to_i64(cost_usd_micros);
        let ts_ms = u64_to_i64(now_millis());

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO usage_counters
                     (project_id, identity, model, period_start, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![
                    key.project_id,
                    key.identity,
                    key.model,
                    key.period_start_str(),
                    ts_ms
                ],
            )?;
            tx.execute(
                "UPDATE usage_counters
                 SET input_tokens = input_tokens + ?5,
                     output_tokens = output_tokens + ?6,
                     tokens_used = tokens_used + ?7,
                     cost_usd_micros = cost_usd_micros + ?8,
                     updated_at_ms = ?9
                 WHERE project_id = ?1 AND identity = ?2 AND model = ?3 AND period_start = ?4",
                rusqlite::params![
                    key.project_id,
                    key.identity,
                    key.model,
                    key.period_start_str(),
                    input_i64,
                    output_i64,
                    total_i64,
                    cost_i64,
                    ts_ms
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn get_usage(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StoreError> {
        let path = self.path.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<UsageCounter>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    "SELECT requests_used, tokens_used, input_tokens, output_tokens,
                            cost_usd_micros, blocked_requests, saved_usd_micros,
                            created_at_ms, updated_at_ms
                     FROM usage_counters
                     WHERE project_id = ?1 AND identity = ?2 AND model = ?3 AND period_start = ?4",
                    rusqlite::params![
                        key.project_id,
                        key.identity,
                        key.model,
                        key.period_start_str()
                    ],
                    counter_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    async fn list_usage(
        &self,
        project_id: &str,
    ) -> Result<Vec<(CounterKey, UsageCounter)>, StoreError> {
        let path = self.path.clone();
        let project_id = project_id.to_string();

        tokio::task::spawn_blocking(
            move || -> Result<Vec<(CounterKey, UsageCounter)>, StoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let mut stmt = conn.prepare(
                    "SELECT identity, model, period_start,
                            requests_used, tokens_used, input_tokens, output_tokens,
                            cost_usd_micros, blocked_requests, saved_usd_micros,
                            created_at_ms, updated_at_ms
                     FROM usage_counters
                     WHERE project_id = ?1
                     ORDER BY identity, model, period_start",
                )?;
                let rows = stmt.query_map(rusqlite::params![project_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        UsageCounter {
                            requests_used: i64_to_u64(row.get(3)?),
                            tokens_used: i64_to_u64(row.get(4)?),
                            input_tokens: i64_to_u64(row.get(5)?),
                            output_tokens: i64_to_u64(row.get(6)?),
                            cost_usd_micros: i64_to_u64(row.get(7)?),
                            blocked_requests: i64_to_u64(row.get(8)?),
                            saved_usd_micros: i64_to_u64(row.get(9)?),
                            created_at_ms: i64_to_u64(row.get(10)?),
                            updated_at_ms: i64_to_u64(row.get(11)?),
                        },
                    ))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (identity, model, period_raw, counter) = row?;
                    let Some(period_start) = parse_period_start(&period_raw) else {
                        return Err(StoreError::unavailable(format!(
                            "unparseable period_start {period_raw:?}"
                        )));
                    };
                    out.push((
                        CounterKey::new(project_id.clone(), identity, model, period_start),
                        counter,
                    ));
                }
                Ok(out)
            },
        )
        .await?
    }
}

fn counter_from_row(row: &rusqlite::Row<'_>) -> Result<UsageCounter, rusqlite::Error> {
    Ok(UsageCounter {
        requests_used: i64_to_u64(row.get(0)?),
        tokens_used: i64_to_u64(row.get(1)?),
        input_tokens: i64_to_u64(row.get(2)?),
        output_tokens: i64_to_u64(row.get(3)?),
        cost_usd_micros: i64_to_u64(row.get(4)?),
        blocked_requests: i64_to_u64(row.get(5)?),
        saved_usd_micros: i64_to_u64(row.get(6)?),
        created_at_ms: i64_to_u64(row.get(7)?),
        updated_at_ms: i64_to_u64(row.get(8)?),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_counters (
            project_id TEXT NOT NULL,
            identity TEXT NOT NULL,
            model TEXT NOT NULL,
            period_start TEXT NOT NULL,
            requests_used INTEGER NOT NULL DEFAULT 0,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd_micros INTEGER NOT NULL DEFAULT 0,
            blocked_requests INTEGER NOT NULL DEFAULT 0,
            saved_usd_micros INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (project_id, identity, model, period_start)
        );
        CREATE INDEX IF NOT EXISTS idx_usage_counters_project
            ON usage_counters(project_id);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

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

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("tollgate.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn boundary_is_exact_and_denial_leaves_count() {
        let (_dir, store) = store().await;
        store.ensure_row(&key()).await.expect("ensure");
        let limits = request_cap(2);

        assert!(store.try_consume(&key(), 1, limits).await.unwrap().allowed);
        let at_limit = store.try_consume(&key(), 1, limits).await.unwrap();
        assert!(at_limit.allowed);
        assert_eq!(at_limit.requests_used, 2);

        let denied = store.try_consume(&key(), 1, limits).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.requests_used, 2);
        assert_eq!(denied.exceeded, Some(LimitDimension::Requests));
    }

    #[tokio::test]
    async fn missing_row_is_reported_not_invented() {
        let (_dir, store) = store().await;
        let err = store.try_consume(&key(), 1, request_cap(5)).await;
        assert!(matches!(err, Err(StoreError::RowMissing)));
    }

    #[tokio::test]
    async fn ensure_row_is_idempotent() {
        let (_dir, store) = store().await;
        store.ensure_row(&key()).await.expect("first");
        store.ensure_row(&key()).await.expect("second");

        let rows = store.list_usage("proj-1").await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, key());
    }

    #[tokio::test]
    async fn at_most_limit_under_contention() {
        let (_dir, store) = store().await;
        store.ensure_row(&key()).await.expect("ensure");
        let store = Arc::new(store);
        let limits = request_cap(5);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            let key = key();
            handles.push(tokio::spawn(async move {
                store.try_consume(&key, 1, limits).await
            }));
        }

        let mut allowed = 0;
        let mut denied = 0;
        for handle in handles {
            let outcome = handle.await.expect("join").expect("consume");
            if outcome.allowed {
                allowed += 1;
            } else {
                denied += 1;
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(denied, 15);

        let counter = store.get_usage(&key()).await.expect("get").expect("row");
        assert_eq!(counter.requests_used, 5);
    }

    #[tokio::test]
    async fn adjust_and_blocked_accumulate() {
        let (_dir, store) = store().await;
        store.ensure_row(&key()).await.expect("ensure");

        store
            .adjust_usage(&key(), TokenDelta::new(100, 20), 10_000)
            .await
            .expect("adjust");
        store
            .adjust_usage(&key(), TokenDelta::new(50, 5), 5_000)
            .await
            .expect("adjust");
        store.record_blocked(&key(), 2_500).await.expect("blocked");

        let counter = store.get_usage(&key()).await.expect("get").expect("row");
        assert_eq!(counter.input_tokens, 150);
        assert_eq!(counter.output_tokens, 25);
        assert_eq!(counter.tokens_used, 175);
        assert_eq!(counter.cost_usd_micros, 15_000);
        assert_eq!(counter.blocked_requests, 1);
        assert_eq!(counter.saved_usd_micros, 2_500);
        assert_eq!(counter.requests_used, 0);
    }

    #[tokio::test]
    async fn periods_are_isolated() {
        let (_dir, store) = store().await;
        let p1 = key();
        let p2 = CounterKey::new("proj-1", "user-1", "gpt-4o", date!(2026 - 08 - 28));
        store.ensure_row(&p1).await.expect("ensure p1");
        store.ensure_row(&p2).await.expect("ensure p2");

        let limits = request_cap(10);
        store.try_consume(&p1, 3, limits).await.expect("consume p1");

        let c1 = store.get_usage(&p1).await.expect("get").expect("row");
        let c2 = store.get_usage(&p2).await.expect("get").expect("row");
        assert_eq!(c1.requests_used, 3);
        assert_eq!(c2.requests_used, 0);
    }

    #[tokio::test]
    async fn counters_survive_reopening_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tollgate.sqlite");

        {
            let store = SqliteStore::new(&path);
            store.init().await.expect("init");
            store.ensure_row(&key()).await.expect("ensure");
            store
                .try_consume(&key(), 2, request_cap(10))
                .await
                .expect("consume");
        }

        let reopened = SqliteStore::new(&path);
        let counter = reopened
            .get_usage(&key())
            .await
            .expect("get")
            .expect("row");
        assert_eq!(counter.requests_used, 2);
    }
}
