//! The contract a plugin satisfies to execute one work type.

use async_trait::async_trait;
use std::future::Future;

use crate::model::WorkId;

/// What an adapter knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub work_id: WorkId,
    pub worker: String,
    /// 1 for the first execution.
    pub attempt: u32,
}

/// Executes work of a single type.
///
/// Returning `Err` fails the attempt; the error text is recorded on the
/// work item and the queue decides between retry and terminal failure.
#[async_trait]
pub trait WorkAdapter: Send + Sync + 'static {
    /// The work type this adapter handles.
    fn key(&self) -> &str;

    fn label(&self) -> &str {
        self.key()
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// External work is completed by an outside actor (a webhook, say).
    /// It is never claimed by local workers nor recovered as an orphan.
    fn external(&self) -> bool {
        false
    }

    async fn do_work(
        &self,
        input: serde_json::Value,
        ctx: WorkContext,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Adapter built from an async closure.
pub struct FnAdapter<F> {
    key: String,
    external: bool,
    f: F,
}

impl<F, Fut> FnAdapter<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    pub fn new(key: impl Into<String>, f: F) -> Self {
        Self {
            key: key.into(),
            external: false,
            f,
        }
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }
}

#[async_trait]
impl<F, Fut> WorkAdapter for FnAdapter<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn external(&self) -> bool {
        self.external
    }

    async fn do_work(
        &self,
        input: serde_json::Value,
        _ctx: WorkContext,
    ) -> anyhow::Result<serde_json::Value> {
        (self.f)(input).await
    }
}
