//! Query functions for the global `provider_backoffs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::ProviderBackoff;

/// Record (or extend) a cooldown for a provider.
pub async fn upsert(
    ex: impl SqliteExecutor<'_>,
    provider: &str,
    reason: &str,
    until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO provider_backoffs (provider, reason, until, created_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(provider) DO UPDATE SET \
             reason = excluded.reason, \
             until = MAX(provider_backoffs.until, excluded.until)",
    )
    .bind(provider)
    .bind(reason)
    .bind(until)
    .bind(now)
    .execute(ex)
    .await
    .context("failed to upsert provider backoff")?;

    Ok(())
}

/// The active cooldown for a provider, if it has not yet expired.
pub async fn get_active(
    pool: &SqlitePool,
    provider: &str,
    now: DateTime<Utc>,
) -> Result<Option<ProviderBackoff>> {
    let backoff = sqlx::query_as::<_, ProviderBackoff>(
        "SELECT * FROM provider_backoffs WHERE provider = ? AND until > ?",
    )
    .bind(provider)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to fetch provider backoff")?;

    Ok(backoff)
}

/// Drop a provider's cooldown (after the underlying incident resolves).
pub async fn clear(ex: impl SqliteExecutor<'_>, provider: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM provider_backoffs WHERE provider = ?")
        .bind(provider)
        .execute(ex)
        .await
        .context("failed to clear provider backoff")?;

    Ok(result.rows_affected())
}

/// Drop expired cooldowns.
pub async fn clear_expired(ex: impl SqliteExecutor<'_>, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM provider_backoffs WHERE until <= ?")
        .bind(now)
        .execute(ex)
        .await
        .context("failed to clear expired backoffs")?;

    Ok(result.rows_affected())
}

/// All cooldown rows.
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<ProviderBackoff>> {
    let backoffs =
        sqlx::query_as::<_, ProviderBackoff>("SELECT * FROM provider_backoffs ORDER BY until ASC")
            .fetch_all(pool)
            .await
            .context("failed to list provider backoffs")?;

    Ok(backoffs)
}
