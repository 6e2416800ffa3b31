//! Work completed by an outside actor, e.g. a provider webhook calling
//! `finish_work`. Local workers never claim it and orphan recovery skips it.

use async_trait::async_trait;
use serde_json::Value;

use crate::director::{WorkAdapter, WorkContext};

pub const EXTERNAL: &str = "external";

pub struct ExternalAdapter;

#[async_trait]
impl WorkAdapter for ExternalAdapter {
    fn key(&self) -> &str {
        EXTERNAL
    }

    fn label(&self) -> &str {
        "External"
    }

    fn external(&self) -> bool {
        true
    }

    async fn do_work(&self, _input: Value, ctx: WorkContext) -> anyhow::Result<Value> {
        anyhow::bail!(
            "work {} is completed externally and cannot run on {}",
            ctx.work_id,
            ctx.worker
        )
    }
}
