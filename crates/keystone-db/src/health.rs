//! # Health Checks
//!
//! Liveness checks over the pool, used at startup and by status endpoints.
//!
//! ## Probes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  quick_check()          SELECT 1 within 2s                             │
//! │  check()                SELECT 1 within 5s + latency + pool stats      │
//! │  validate_connection()  quick_check, then BEGIN / SELECT 1 / ROLLBACK  │
//! │  wait_for_connection()  quick_check every `interval`, `retries` times  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult, TxStage};
use crate::pool::{Database, PoolStats};
use crate::txn::{Scope, TxOptions};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const QUICK_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall verdict of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Result of [`HealthChecker::check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: Health,
    pub message: String,
    /// Round-trip time of the check, in milliseconds.
    pub latency_ms: u64,
    pub connections: PoolStats,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == Health::Healthy
    }
}

/// Runs health checks against a [`Database`].
#[derive(Debug, Clone)]
pub struct HealthChecker {
    db: Database,
}

impl HealthChecker {
    pub fn new(db: Database) -> Self {
        HealthChecker { db }
    }

    /// Full check: round trip, latency, and pool statistics. Never fails; an
    /// unreachable database is reported as [`Health::Unhealthy`].
    pub async fn check(&self) -> HealthStatus {
        let timestamp = Utc::now();
        let started = Instant::now();
        let result = self.db.health_check(CHECK_TIMEOUT).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status, message) = match result {
            Ok(()) => (Health::Healthy, "Database is responding normally".to_string()),
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                (Health::Unhealthy, e.to_string())
            }
        };

        HealthStatus {
            status,
            message,
            latency_ms,
            connections: self.db.stats(),
            timestamp,
        }
    }

    /// Ping with a 2 second bound.
    pub async fn quick_check(&self) -> DbResult<()> {
        self.db.health_check(QUICK_CHECK_TIMEOUT).await
    }

    /// Verifies the database can run a transaction end to end.
    pub async fn validate_connection(&self) -> DbResult<()> {
        self.quick_check().await?;

        let ping = async {
            let mut tx = self.db.begin(TxOptions::default()).await?;
            sqlx::query_scalar::<_, i64>("SELECT 1")
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| DbError::connection("query in transaction failed", Some(e)))?;
            tx.rollback().await.map_err(|source| DbError::Transaction {
                stage: TxStage::Rollback,
                source,
            })
        };

        tokio::time::timeout(VALIDATE_TIMEOUT, ping)
            .await
            .map_err(|_| DbError::Timeout(VALIDATE_TIMEOUT))?
    }

    /// Polls [`HealthChecker::quick_check`] until it passes.
    ///
    /// ## Arguments
    /// * `scope` - Cancelling it stops the wait with `Cancelled`
    /// * `retries` - Number of attempts
    /// * `interval` - Pause between attempts
    pub async fn wait_for_connection(
        &self,
        scope: &Scope,
        retries: u32,
        interval: Duration,
    ) -> DbResult<()> {
        for attempt in 1..=retries {
            match scope.run(self.quick_check()).await {
                Ok(()) => {
                    debug!(attempt, "Database is available");
                    return Ok(());
                }
                Err(DbError::Cancelled) => return Err(DbError::Cancelled),
                Err(e) => debug!(attempt, retries, error = %e, "Database not available yet"),
            }

            if attempt < retries {
                scope
                    .run(async {
                        tokio::time::sleep(interval).await;
                        Ok(())
                    })
                    .await?;
            }
        }

        Err(DbError::connection(
            format!("database did not become available after {retries} retries"),
            None,
        ))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
