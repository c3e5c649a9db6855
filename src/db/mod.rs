//! Async PostgreSQL connection state machine shared by the workshop and
//! cron partitions (§4.3).
//!
//! `original_source`'s `Pg::AsyncConnection` drives libpq's non-blocking
//! polling interface by hand through an explicit
//! `UNINITIALIZED → CONNECTING → READY → DISCONNECTED → WAITING →
//! RECONNECTING → READY` state machine. sqlx's `PgPool`/`PgListener`
//! already own that polling loop internally, so [`QueueDb`] keeps the same
//! state machine as an observable wrapper around them: one pool for
//! statements, one dedicated `LISTEN`/`NOTIFY` connection, and the fixed
//! 10-second reconnect backoff from `original_source`'s `OnDisconnect`.

pub mod cron;
pub mod workshop;

use std::time::{Duration, Instant};

use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::intervals;
use crate::error::{DbError, Result};

/// Mirrors `original_source/src/pg/AsyncConnection`'s state machine, kept
/// here purely for observability (logging, `/control` introspection); the
/// actual polling is sqlx's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    Disconnected,
    Waiting,
    Reconnecting,
}

/// One partition's database handle: a pool for queries plus a dedicated
/// `LISTEN`/`NOTIFY` connection (§4.3 is explicit that one partition owns
/// one connection; the pool here exists only because sqlx serializes
/// concurrent statements over one connection anyway, and a small pool lets
/// a slow claim attempt not block a concurrent progress update).
pub struct QueueDb {
    conninfo: String,
    schema: Option<String>,
    channels: Vec<String>,
    pool: PgPool,
    listener: PgListener,
    state: ConnectionState,
    reconnect_at: Option<Instant>,
}

impl QueueDb {
    /// Connects, optionally narrows the search path to `schema`, sets the
    /// session timezone to UTC (every timestamp is stored `WITH TIME ZONE`,
    /// per §6), and subscribes to `channels` (plus their schema-scoped
    /// variants, §6's `"<schema>:new_job"` note).
    pub async fn connect(conninfo: &str, schema: Option<&str>, channels: &[&str]) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(conninfo)
            .await
            .map_err(DbError::Connect)?;

        if let Some(schema) = schema {
            sqlx::query(&format!("SET search_path TO \"{schema}\", public"))
                .execute(&pool)
                .await
                .map_err(DbError::Connect)?;
        }
        sqlx::query("SET timezone='UTC'")
            .execute(&pool)
            .await
            .map_err(DbError::Connect)?;

        let mut listener = PgListener::connect(conninfo).await.map_err(DbError::Connect)?;
        for channel in channels {
            listener.listen(channel).await.map_err(DbError::Connect)?;
            if let Some(schema) = schema {
                listener
                    .listen(&format!("{schema}:{channel}"))
                    .await
                    .map_err(DbError::Connect)?;
            }
        }

        info!(channels = ?channels, "connected to database");

        Ok(Self {
            conninfo: conninfo.to_string(),
            schema: schema.map(str::to_string),
            channels: channels.iter().map(|s| s.to_string()).collect(),
            pool,
            listener,
            state: ConnectionState::Ready,
            reconnect_at: None,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Waits for the next notification, returning the channel name it was
    /// posted on (schema prefix included, if any) so callers can dispatch
    /// by name exactly as `original_source`'s `OnNotify` does.
    pub async fn recv_notification(&mut self) -> Result<String> {
        match self.listener.recv().await {
            Ok(notification) => Ok(notification.channel().to_string()),
            Err(error) => {
                self.mark_disconnected();
                Err(DbError::Connect(error).into())
            }
        }
    }

    fn mark_disconnected(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!("database connection lost, scheduling reconnect");
        }
        self.state = ConnectionState::Disconnected;
        self.reconnect_at = Some(Instant::now() + intervals::RECONNECT_BACKOFF);
    }

    /// Whether the fixed reconnect backoff has elapsed.
    pub fn should_reconnect(&self, now: Instant) -> bool {
        self.state == ConnectionState::Disconnected
            && self.reconnect_at.is_some_and(|at| now >= at)
    }

    pub fn reconnect_backoff() -> Duration {
        intervals::RECONNECT_BACKOFF
    }

    /// Re-establishes the `LISTEN`/`NOTIFY` connection after a loss. The
    /// pool reconnects lazily on its own next use.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.state = ConnectionState::Reconnecting;

        let mut listener = match PgListener::connect(&self.conninfo).await {
            Ok(listener) => listener,
            Err(error) => {
                self.mark_disconnected();
                return Err(DbError::Connect(error).into());
            }
        };
        for channel in &self.channels {
            listener.listen(channel).await.map_err(DbError::Connect)?;
            if let Some(schema) = &self.schema {
                listener
                    .listen(&format!("{schema}:{channel}"))
                    .await
                    .map_err(DbError::Connect)?;
            }
        }

        self.listener = listener;
        self.state = ConnectionState::Ready;
        self.reconnect_at = None;
        info!("reconnected to database");
        Ok(())
    }

    pub async fn notify(&self, channel: &str) -> Result<()> {
        sqlx::query(&format!("NOTIFY {channel}"))
            .execute(&self.pool)
            .await
            .map_err(|error| DbError::Query(error.to_string()))?;
        Ok(())
    }
}
