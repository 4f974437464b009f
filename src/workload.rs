use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::info;

use peermesh_core::{MeshResult, PeerAddress, WorkItem, Workload};
use peermesh_peer::{Ability, TaskEngine};

/// 随机数工作负载
///
/// 演示用：每个工作项带一个 1..=100 的随机数，`print_ability` 把它
/// 累进本地计数器。
pub struct RandomWorkload {
    counter: AtomicI64,
}

impl RandomWorkload {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicI64::new(0),
        })
    }

    pub fn register_abilities(this: &Arc<Self>, engine: &TaskEngine) {
        let workload = Arc::clone(this);
        let ability: Arc<dyn Ability> = Arc::new(
            move |peer: &PeerAddress, item: &mut WorkItem| -> MeshResult<()> {
                let random = item
                    .extra
                    .get("random")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let total = workload.counter.fetch_add(random, Ordering::Relaxed) + random;
                info!(
                    sender = %item.sender,
                    executor = %peer,
                    random,
                    total,
                    "print_ability completed"
                );
                Ok(())
            },
        );
        engine.register_ability("print_ability", ability, false);
    }
}

#[async_trait]
impl Workload for RandomWorkload {
    async fn fill(&self, item: &mut WorkItem) -> MeshResult<()> {
        let random: i64 = {
            let mut rng = rand::rng();
            rng.random_range(1..=100)
        };
        item.todo = Some("print_ability".to_string());
        item.extra.insert("random".into(), json!(random));
        Ok(())
    }

    async fn completed(&self, item: WorkItem) -> MeshResult<()> {
        info!(item = %item.id, results = ?item.results, "got my completed task back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fill_attaches_random_payload() {
        let workload = RandomWorkload::new();
        let mut item = WorkItem::new(PeerAddress::new("tcp://127.0.0.1:7700"), None);
        workload.fill(&mut item).await.unwrap();

        assert_eq!(item.todo.as_deref(), Some("print_ability"));
        let random = item.extra.get("random").and_then(|v| v.as_i64()).unwrap();
        assert!((1..=100).contains(&random));
    }
}
