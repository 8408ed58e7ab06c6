//! Channel store: the durable source of truth for channels, signed proofs
//! and wallet archive records.
//!
//! Ordering rule: the store write always precedes the in-memory cache
//! publish, so nothing observable ever exists only in memory. Concurrent
//! inserts of the same channel id are serialized by the unique constraints.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::error;

pub mod models;

pub use models::*;

/// Create a database connection pool, creating the database file on first
/// run. In-memory databases get a single connection (each sqlite memory
/// connection is its own database).
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .wrap_err("Invalid database URL")?
        .create_if_missing(true);

    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ============================================================================
// Channels
// ============================================================================

/// Insert a new channel row
pub async fn insert_channel(pool: &SqlitePool, channel: &NewChannel) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO channels (agent_id, channel_id, chain, token, peer_id, opened_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&channel.agent_id)
    .bind(&channel.channel_id)
    .bind(&channel.chain)
    .bind(&channel.token)
    .bind(&channel.peer_id)
    .bind(channel.opened_at)
    .execute(pool)
    .await
    .wrap_err("Failed to insert channel")?;

    Ok(())
}

/// Update a channel's last-activity timestamp
pub async fn mark_channel_activity(
    pool: &SqlitePool,
    channel_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(r#"UPDATE channels SET last_activity = $1 WHERE channel_id = $2"#)
        .bind(at)
        .bind(channel_id)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to mark activity on channel {}", channel_id))?;

    Ok(())
}

/// Mark a channel closed
pub async fn mark_channel_closed(
    pool: &SqlitePool,
    channel_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(r#"UPDATE channels SET closed_at = $1 WHERE channel_id = $2"#)
        .bind(at)
        .bind(channel_id)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to mark channel {} closed", channel_id))?;

    Ok(())
}

/// Get one channel by (agent, channel id)
pub async fn get_channel(
    pool: &SqlitePool,
    agent_id: &str,
    channel_id: &str,
) -> Result<Option<ChannelRow>> {
    let row = sqlx::query_as::<_, ChannelRow>(
        r#"SELECT agent_id, channel_id, chain, token, peer_id, opened_at, last_activity, closed_at
           FROM channels WHERE agent_id = $1 AND channel_id = $2"#,
    )
    .bind(agent_id)
    .bind(channel_id)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get channel")?;

    Ok(row)
}

/// Active channels for one agent
pub async fn list_active_channels(pool: &SqlitePool, agent_id: &str) -> Result<Vec<ChannelRow>> {
    let rows = sqlx::query_as::<_, ChannelRow>(
        r#"SELECT agent_id, channel_id, chain, token, peer_id, opened_at, last_activity, closed_at
           FROM channels WHERE agent_id = $1 AND closed_at IS NULL"#,
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await
    .map_err(|e| {
        error!("SQL error listing active channels: {:?}", e);
        e
    })
    .wrap_err("Failed to list active channels")?;

    Ok(rows)
}

/// All active channels, across agents (startup recovery)
pub async fn load_all_active(pool: &SqlitePool) -> Result<Vec<ChannelRow>> {
    let rows = sqlx::query_as::<_, ChannelRow>(
        r#"SELECT agent_id, channel_id, chain, token, peer_id, opened_at, last_activity, closed_at
           FROM channels WHERE closed_at IS NULL"#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to load active channels")?;

    Ok(rows)
}

/// Check if a channel exists on a chain
pub async fn channel_exists(pool: &SqlitePool, chain: &str, channel_id: &str) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"SELECT EXISTS(SELECT 1 FROM channels WHERE chain = $1 AND channel_id = $2)"#,
    )
    .bind(chain)
    .bind(channel_id)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to check channel existence")?;

    Ok(row.0)
}

// ============================================================================
// Signed proofs
// ============================================================================

/// Upsert the latest proof for (channel, direction). Nonce regressions are
/// rejected by the guard in the UPDATE arm.
pub async fn upsert_proof(pool: &SqlitePool, proof: &NewProof) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO channel_proofs
            (channel_id, direction, nonce, transferred_amount, locked_amount, locks_root, signature, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (channel_id, direction) DO UPDATE SET
            nonce = excluded.nonce,
            transferred_amount = excluded.transferred_amount,
            locked_amount = excluded.locked_amount,
            locks_root = excluded.locks_root,
            signature = excluded.signature,
            updated_at = excluded.updated_at
        WHERE excluded.nonce > channel_proofs.nonce
        "#,
    )
    .bind(&proof.channel_id)
    .bind(&proof.direction)
    .bind(proof.nonce)
    .bind(&proof.transferred_amount)
    .bind(&proof.locked_amount)
    .bind(&proof.locks_root)
    .bind(&proof.signature)
    .bind(Utc::now())
    .execute(pool)
    .await
    .wrap_err("Failed to upsert proof")?;

    Ok(())
}

/// Latest proof for (channel, direction)
pub async fn get_proof(
    pool: &SqlitePool,
    channel_id: &str,
    direction: &str,
) -> Result<Option<ProofRow>> {
    let row = sqlx::query_as::<_, ProofRow>(
        r#"SELECT channel_id, direction, nonce, transferred_amount, locked_amount, locks_root, signature, updated_at
           FROM channel_proofs WHERE channel_id = $1 AND direction = $2"#,
    )
    .bind(channel_id)
    .bind(direction)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get proof")?;

    Ok(row)
}

// ============================================================================
// Wallet archive
// ============================================================================

/// Persist an archived wallet record
pub async fn insert_wallet_archive(
    pool: &SqlitePool,
    agent_id: &str,
    total_transactions: i64,
    suspension_reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_archive (agent_id, archived_at, total_transactions, suspension_reason)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (agent_id) DO NOTHING
        "#,
    )
    .bind(agent_id)
    .bind(Utc::now())
    .bind(total_transactions)
    .bind(suspension_reason)
    .execute(pool)
    .await
    .wrap_err("Failed to insert wallet archive record")?;

    Ok(())
}

/// Retrieve an archived wallet record
pub async fn get_wallet_archive(
    pool: &SqlitePool,
    agent_id: &str,
) -> Result<Option<WalletArchiveRow>> {
    let row = sqlx::query_as::<_, WalletArchiveRow>(
        r#"SELECT agent_id, archived_at, total_transactions, suspension_reason
           FROM wallet_archive WHERE agent_id = $1"#,
    )
    .bind(agent_id)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get wallet archive record")?;

    Ok(row)
}
