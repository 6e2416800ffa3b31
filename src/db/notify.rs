//! Cross-process change events over LISTEN/NOTIFY.

use sqlx::PgConnection;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::event::{WorkEvent, WorkEventKind};
use crate::model::Work;

pub const NOTIFY_CHANNEL: &str = "workd_events";

/// Queue an event on the connection's transaction; Postgres delivers it on
/// commit and drops it on rollback.
pub(crate) async fn notify(conn: &mut PgConnection, kind: WorkEventKind, work: &Work) -> Result<()> {
    let payload = serde_json::to_string(&WorkEvent::new(kind, work))?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(payload)
        .execute(conn)
        .await?;
    Ok(())
}

impl super::Db {
    /// Forward notifications from every process into this handle's
    /// subscribers. Events are only observed while the returned task runs.
    pub async fn listen(&self) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        let events = self.events.clone();

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<WorkEvent>(notification.payload()) {
                            Ok(event) => {
                                debug!(kind = ?event.kind, work_id = %event.work_id, "notification");
                                let _ = events.send(event);
                            }
                            Err(e) => warn!("malformed notification payload: {e}"),
                        }
                    }
                    Err(e) => {
                        // recv reconnects on its own; back off if that fails.
                        error!("notification listener error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }
}
