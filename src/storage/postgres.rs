//! PostgreSQL backend.
//!
//! Delegates pooling to r2d2 with `min_idle = base_size` and
//! `max_size = base_size + overflow_cap`; r2d2 retires connections older
//! than `max_lifetime`, which plays the role of the recycle age.

use bytes::BytesMut;
use postgres::error::SqlState;
use postgres::types::{IsNull, ToSql, Type};
use r2d2_postgres::postgres::NoTls;
use r2d2_postgres::PostgresConnectionManager;
use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::pool::PoolConfig;
use super::{
    is_contention_message, BackendKind, PoolError, PoolState, StoreConnection, StoreError,
    StorePool,
};
use crate::sql::{SqlValue, Statement};

type Manager = PostgresConnectionManager<NoTls>;

/// Pool of PostgreSQL connections backed by r2d2.
pub struct PostgresPool {
    /// `None` once closed.
    pool: Mutex<Option<r2d2::Pool<Manager>>>,
    config: PoolConfig,
}

impl PostgresPool {
    /// Connect to `url` and open the base connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the base connections cannot
    /// be opened within `connect_timeout`.
    pub fn connect(
        url: &str,
        config: PoolConfig,
        connect_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let pg_config: postgres::Config = url
            .parse()
            .map_err(|e: postgres::Error| PoolError::Connect(e.to_string()))?;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);

        let pool = r2d2::Pool::builder()
            .max_size(to_u32(config.capacity()))
            .min_idle(Some(to_u32(config.base_size)))
            .max_lifetime(Some(config.recycle_age))
            .connection_timeout(connect_timeout)
            .build(manager)
            .map_err(|e| PoolError::Connect(e.to_string()))?;

        tracing::info!(
            base_size = config.base_size,
            overflow_cap = config.overflow_cap,
            "Opened PostgreSQL pool"
        );

        Ok(Self::from_pool(pool, config))
    }

    fn from_pool(pool: r2d2::Pool<Manager>, config: PoolConfig) -> Self {
        Self {
            pool: Mutex::new(Some(pool)),
            config,
        }
    }

    /// A handle on the live pool, or `None` after [`close_all`](StorePool::close_all).
    fn live(&self) -> Option<r2d2::Pool<Manager>> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl StorePool for PostgresPool {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn acquire(&self, timeout: Duration) -> Result<Box<dyn StoreConnection + '_>, PoolError> {
        let pool = self.live().ok_or(PoolError::Closed)?;
        let conn = pool.get_timeout(timeout).map_err(|e| {
            tracing::debug!(error = %e, "PostgreSQL pool checkout failed");
            PoolError::Timeout(timeout)
        })?;
        Ok(Box::new(PostgresConnection(conn)))
    }

    fn state(&self) -> PoolState {
        let (live, idle) = self.live().map_or((0, 0), |pool| {
            let state = pool.state();
            (state.connections as usize, state.idle_connections as usize)
        });
        PoolState {
            backend: BackendKind::Postgres,
            base_size: self.config.base_size,
            overflow_cap: self.config.overflow_cap,
            active: live.saturating_sub(idle),
            idle,
            overflow_active: live.saturating_sub(self.config.base_size),
            recycle_failures: 0,
        }
    }

    /// Drop the r2d2 pool. Idle connections close with it; borrowed ones
    /// close when their guard is dropped.
    fn close_all(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            let idle = pool.state().idle_connections;
            drop(pool);
            tracing::info!(closed = idle, "PostgreSQL pool closed");
        }
    }
}

/// A connection checked out of the r2d2 pool.
struct PostgresConnection(r2d2::PooledConnection<Manager>);

impl StoreConnection for PostgresConnection {
    fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        let params: Vec<&(dyn ToSql + Sync)> = statement
            .params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();

        // An uncommitted transaction rolls back when dropped.
        let mut tx = self.0.transaction().map_err(classify_postgres)?;
        let rows = tx
            .execute(statement.sql.as_str(), &params)
            .map_err(classify_postgres)?;
        tx.commit().map_err(classify_postgres)?;
        Ok(rows)
    }
}

/// Map a PostgreSQL error onto the retry taxonomy.
pub fn classify_postgres(err: postgres::Error) -> StoreError {
    let contention = match err.code() {
        Some(code) => {
            *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::LOCK_NOT_AVAILABLE
        }
        None => is_contention_message(&err.to_string()),
    };
    if contention {
        StoreError::Contention(err.to_string())
    } else {
        StoreError::Execution(err.to_string())
    }
}

type BoxError = Box<dyn StdError + Sync + Send>;

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn mismatch(value: &SqlValue, ty: &Type) -> BoxError {
    let kind = match value {
        SqlValue::Null => "null",
        SqlValue::Bool(_) => "bool",
        SqlValue::Integer(_) => "integer",
        SqlValue::Real(_) => "real",
        SqlValue::Text(_) => "text",
        SqlValue::Timestamp(_) => "timestamp",
    };
    format!("cannot bind a {kind} value to a column of type {ty}").into()
}

/// Values are encoded for the column type the server reports. Pairs with
/// no lossless encoding are refused instead of being sent in the wrong
/// wire format.
impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                Type::INT2 => i16::from(*b).to_sql(ty, out),
                Type::INT4 => i32::from(*b).to_sql(ty, out),
                Type::INT8 => i64::from(*b).to_sql(ty, out),
                _ if is_text(ty) => b.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            SqlValue::Integer(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::INT8 => i.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::BOOL => (*i != 0).to_sql(ty, out),
                _ if is_text(ty) => i.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            SqlValue::Real(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                _ if is_text(ty) => f.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            SqlValue::Text(s) => match *ty {
                Type::JSON => {
                    out.extend_from_slice(s.as_bytes());
                    Ok(IsNull::No)
                }
                Type::JSONB => {
                    // jsonb binary format: version byte, then the text.
                    out.extend_from_slice(&[1]);
                    out.extend_from_slice(s.as_bytes());
                    Ok(IsNull::No)
                }
                _ if <String as ToSql>::accepts(ty) => s.to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            SqlValue::Timestamp(at) => match *ty {
                Type::TIMESTAMPTZ => at.to_sql(ty, out),
                Type::TIMESTAMP => at.naive_utc().to_sql(ty, out),
                Type::DATE => at.date_naive().to_sql(ty, out),
                _ if is_text(ty) => at.to_rfc3339().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
        }
    }

    // The real check depends on the value, so it happens in `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        self.to_sql(ty, out)
    }
}
