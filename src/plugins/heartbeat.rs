//! Liveness job: optionally waits, optionally fails, echoes its input.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use crate::director::{WorkAdapter, WorkContext};

pub const HEARTBEAT: &str = "heartbeat";

pub struct HeartbeatAdapter;

#[async_trait]
impl WorkAdapter for HeartbeatAdapter {
    fn key(&self) -> &str {
        HEARTBEAT
    }

    fn label(&self) -> &str {
        "Heartbeat"
    }

    /// Input: `{"wait": <ms>, "fail": <bool>}`, both optional.
    async fn do_work(&self, input: Value, ctx: WorkContext) -> anyhow::Result<Value> {
        let wait = input.get("wait").and_then(Value::as_u64).unwrap_or(0);
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }

        if input.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            anyhow::bail!("heartbeat asked to fail (attempt {})", ctx.attempt);
        }

        Ok(json!({ "info": "heartbeat", "echo": input }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkId;

    fn ctx() -> WorkContext {
        WorkContext {
            work_id: WorkId::new(),
            worker: "test".to_string(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn echoes_input() {
        let out = HeartbeatAdapter
            .do_work(json!({ "note": "hi" }), ctx())
            .await
            .unwrap();
        assert_eq!(out["info"], "heartbeat");
        assert_eq!(out["echo"]["note"], "hi");
    }

    #[tokio::test]
    async fn fails_on_request() {
        let err = HeartbeatAdapter
            .do_work(json!({ "fail": true }), ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("asked to fail"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_before_answering() {
        let start = tokio::time::Instant::now();
        HeartbeatAdapter
            .do_work(json!({ "wait": 1500 }), ctx())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }
}
