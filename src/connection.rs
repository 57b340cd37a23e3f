//! # Connection Pool Seam
//!
//! Workers execute SQL through the [`ConnectionPool`] trait and never learn
//! which backend sits behind it. The trait binds `?` placeholders
//! positionally and reports per-call execution info (backend query id, row
//! count, server-side elapsed time when the backend exposes one).
//!
//! [`PostgresPool`] is the in-tree implementation over `sqlx::PgPool`; a
//! Snowflake pool plugs in behind the same trait from outside. Tests use a
//! mock with configurable latency and fault injection.
//!
//! ## Deadlines
//!
//! Every execute call runs under a statement deadline (default 60 s). A
//! deadline hit is reported as a transient backend error — the operation is
//! recorded as a failure and the worker moves on.

use crate::error::EngineError;
use crate::pools::Value;
use std::time::Duration;

pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Backend-reported execution info for one statement.
#[derive(Clone, Debug, Default)]
pub struct ExecInfo {
    pub query_id: Option<String>,
    pub rowcount: Option<i64>,
    pub server_elapsed_ms: Option<f64>,
}

/// Result of one execute call. Reads report the fetched row count; writes
/// report rows affected through `info.rowcount`.
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    pub rows_returned: u64,
    pub info: ExecInfo,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    pub active: u32,
    pub idle: u32,
    pub max: u32,
}

#[async_trait::async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Execute `sql` with positional `?` parameters. `fetch` pulls result
    /// rows (reads); otherwise only the affected-row count is collected.
    async fn execute(
        &self,
        sql: &str,
        params: &[Value],
        fetch: bool,
    ) -> Result<ExecOutput, EngineError>;

    fn stats(&self) -> PoolStats;
}

/// Rewrite `?` placeholders to Postgres `$1..$n`, skipping quoted literals.
pub fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut in_quote = false;
    let mut n = 0;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                out.push(ch);
            }
            '?' if !in_quote => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

/// sqlx-backed Postgres pool implementing the seam.
pub struct PostgresPool {
    pool: sqlx::PgPool,
    statement_timeout: Duration,
}

impl PostgresPool {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| EngineError::TransientBackend(format!("connect failed: {e}")))?;
        Ok(PostgresPool {
            pool,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        })
    }

    pub fn from_pool(pool: sqlx::PgPool) -> Self {
        PostgresPool {
            pool,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn inner(&self) -> &sqlx::PgPool {
        &self.pool
    }

    fn bind_values<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        params: &'q [Value],
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        let mut q = query;
        for p in params {
            q = match p {
                Value::Null => q.bind(None::<String>),
                Value::Bool(b) => q.bind(*b),
                Value::Int(i) => q.bind(*i),
                Value::Float(f) => q.bind(*f),
                Value::Text(s) => q.bind(s.as_str()),
                Value::Timestamp(ts) => q.bind(*ts),
                Value::Date(d) => q.bind(*d),
            };
        }
        q
    }

    fn classify(e: sqlx::Error) -> EngineError {
        match e {
            sqlx::Error::PoolTimedOut => {
                EngineError::PoolExhausted("acquire timed out".into())
            }
            other => EngineError::TransientBackend(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionPool for PostgresPool {
    async fn execute(
        &self,
        sql: &str,
        params: &[Value],
        fetch: bool,
    ) -> Result<ExecOutput, EngineError> {
        let rewritten = rewrite_placeholders(sql);
        let fut = async {
            let query = Self::bind_values(sqlx::query(&rewritten), params);
            if fetch {
                let rows = query.fetch_all(&self.pool).await?;
                Ok::<ExecOutput, sqlx::Error>(ExecOutput {
                    rows_returned: rows.len() as u64,
                    info: ExecInfo {
                        rowcount: Some(rows.len() as i64),
                        ..ExecInfo::default()
                    },
                })
            } else {
                let done = query.execute(&self.pool).await?;
                Ok(ExecOutput {
                    rows_returned: 0,
                    info: ExecInfo {
                        rowcount: Some(done.rows_affected() as i64),
                        ..ExecInfo::default()
                    },
                })
            }
        };
        match tokio::time::timeout(self.statement_timeout, fut).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => Err(Self::classify(e)),
            Err(_) => Err(EngineError::TransientBackend(format!(
                "statement deadline exceeded ({:?})",
                self.statement_timeout
            ))),
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.pool.size().saturating_sub(self.pool.num_idle() as u32),
            idle: self.pool.num_idle() as u32,
            max: self.pool.options().get_max_connections(),
        }
    }
}
