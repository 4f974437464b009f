//! 场景测试共用的工作负载桩

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use peermesh_core::{MeshResult, TaskConfig, WorkItem, Workload};

/// 把完成回执发进通道的测试工作负载
pub struct ChannelWorkload {
    todo: Option<String>,
    value: i64,
    sink: mpsc::UnboundedSender<WorkItem>,
}

impl ChannelWorkload {
    pub fn new(
        todo: Option<&str>,
        value: i64,
    ) -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (sink, completed) = mpsc::unbounded_channel();
        (
            Self {
                todo: todo.map(str::to_string),
                value,
                sink,
            },
            completed,
        )
    }
}

#[async_trait]
impl Workload for ChannelWorkload {
    async fn fill(&self, item: &mut WorkItem) -> MeshResult<()> {
        item.todo = self.todo.clone();
        item.extra.insert("value".into(), json!(self.value));
        Ok(())
    }

    async fn completed(&self, item: WorkItem) -> MeshResult<()> {
        let _ = self.sink.send(item);
        Ok(())
    }
}

pub fn fast_task_config() -> TaskConfig {
    TaskConfig {
        stale_after_seconds: 30,
        produce_pause_min_ms: 10,
        produce_pause_max_ms: 20,
        tag: "TASK".to_string(),
    }
}

/// 生产循环整个测试期间都不会醒来的配置，用于只靠手工注入帧的场景
pub fn quiet_task_config() -> TaskConfig {
    TaskConfig {
        stale_after_seconds: 30,
        produce_pause_min_ms: 60_000,
        produce_pause_max_ms: 60_000,
        tag: "TASK".to_string(),
    }
}
