//! Postgres-backed work queue.
//!
//! One pool shared by every queue operation. Claim exclusivity across
//! processes comes from row locks (`FOR UPDATE SKIP LOCKED`); change events
//! travel through `pg_notify` so workers in other processes see them too.

pub mod notify;
pub mod work;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::event::{EVENT_CHANNEL_CAPACITY, WorkEvent};

#[derive(Clone)]
pub struct Db {
    pool: PgPool,
    /// Fed by the notification listener (see [`Db::listen`]).
    events: broadcast::Sender<WorkEvent>,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { pool, events })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
