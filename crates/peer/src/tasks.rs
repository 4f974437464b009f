//! 无主任务分发协议
//!
//! 在分发底座和成员协议之上组合出三层能力：工作负载生产（生产循环
//! 产出工作项并广播其 JSON 编码）、JSON 编解码（解码失败记日志丢弃）
//! 和能力执行与仲裁。每个节点对收到的每个工作项独立运行同一套仲裁：
//! 立即执行 / 挂起观察 / 过期接管 / 完成确认。

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use async_trait::async_trait;

use peermesh_core::{MeshResult, PeerAddress, TaskConfig, WorkItem, WorkStatus, Workload};

use crate::dispatch::{Dispatcher, HandlerFuture, MessageHandler};
use crate::gossip::Membership;
use crate::peer::Producer;

/// 能力处理器：拿到节点地址和工作项，原地修改工作项
pub trait Ability: Send + Sync {
    fn apply(&self, peer: &PeerAddress, item: &mut WorkItem) -> MeshResult<()>;
}

impl<F> Ability for F
where
    F: Fn(&PeerAddress, &mut WorkItem) -> MeshResult<()> + Send + Sync,
{
    fn apply(&self, peer: &PeerAddress, item: &mut WorkItem) -> MeshResult<()> {
        (self)(peer, item)
    }
}

struct AbilityEntry {
    name: String,
    handlers: Vec<Arc<dyn Ability>>,
}

/// 任务引擎：能力注册表、本地队列和仲裁算法
pub struct TaskEngine {
    dispatcher: Arc<Dispatcher>,
    membership: Arc<Membership>,
    workload: Arc<dyn Workload>,
    abilities: RwLock<Vec<AbilityEntry>>,
    /// 本地待办队列，按 `id` 去重；不跨节点共享，重启即失
    queue: Mutex<VecDeque<WorkItem>>,
    config: TaskConfig,
}

impl TaskEngine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        membership: Arc<Membership>,
        workload: Arc<dyn Workload>,
        config: TaskConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            membership,
            workload,
            abilities: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            config,
        })
    }

    /// 把工作负载标签的处理器挂到分发器上，必须在接收循环启动前调用
    pub fn register(this: &Arc<Self>) {
        let engine = Arc::clone(this);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |payload: String| -> HandlerFuture {
            let engine = Arc::clone(&engine);
            Box::pin(async move { engine.on_frame(&payload).await })
        });
        this.dispatcher
            .register_handler(&this.config.tag, handler, false);
    }

    /// 注册一项能力，语义与消息处理器注册一致（扇出/覆盖）
    pub fn register_ability(&self, name: &str, handler: Arc<dyn Ability>, overwrite: bool) {
        let mut abilities = self.abilities.write().unwrap_or_else(|e| e.into_inner());
        match abilities.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                if overwrite {
                    entry.handlers = vec![handler];
                } else {
                    entry.handlers.push(handler);
                }
            }
            None => abilities.push(AbilityEntry {
                name: name.to_string(),
                handlers: vec![handler],
            }),
        }
        debug!(peer = %self.dispatcher.address(), ability = name, overwrite, "registered ability");
    }

    /// 执行工作项的全部待办能力
    ///
    /// 未注册的能力记错误后跳过，不挡住其余能力；无论缺了多少能力，
    /// 工作项最终都进入完成态并带上结果说明。
    pub fn execute_abilities(&self, item: &mut WorkItem) -> MeshResult<()> {
        let names: Vec<String> = item.abilities().map(str::to_string).collect();
        for name in &names {
            let handlers = {
                let abilities = self.abilities.read().unwrap_or_else(|e| e.into_inner());
                abilities
                    .iter()
                    .find(|entry| &entry.name == name)
                    .map(|entry| entry.handlers.clone())
            };
            match handlers {
                Some(handlers) => {
                    for handler in handlers {
                        handler.apply(self.dispatcher.address(), item)?;
                    }
                }
                None => {
                    error!(peer = %self.dispatcher.address(), ability = %name, "能力未注册，跳过");
                }
            }
        }

        item.status = WorkStatus::Complete;
        item.results = Some(format!("Task completed by {}", self.dispatcher.address()));
        debug!(peer = %self.dispatcher.address(), item = %item.id, "task completed");
        Ok(())
    }

    /// 解码并仲裁一个工作负载帧
    async fn on_frame(&self, payload: &str) -> MeshResult<()> {
        let item: WorkItem = match serde_json::from_str(payload) {
            Ok(item) => item,
            Err(e) => {
                // 解码失败：记日志丢弃，不动任何状态
                error!(peer = %self.dispatcher.address(), "工作项解码失败: {e}");
                return Ok(());
            }
        };

        if let Some(response) = self.handle_item(item).await? {
            let encoded = serde_json::to_string(&response)?;
            self.dispatcher.broadcast(&self.config.tag, &encoded).await?;
        }
        Ok(())
    }

    /// 仲裁算法，对收到的每个工作项运行
    ///
    /// 返回需要回播的工作项（本节点刚执行完的结果）。
    pub async fn handle_item(&self, mut item: WorkItem) -> MeshResult<Option<WorkItem>> {
        let myself = self.dispatcher.address();

        // 自抑制：不对自己发出的未分配未完成请求起反应
        if item.sender == *myself
            && item.priority.as_ref() != Some(myself)
            && item.status != WorkStatus::Complete
        {
            return Ok(None);
        }

        let mut executed_here = false;
        if item.status != WorkStatus::Complete {
            let stale_after = Duration::seconds(self.config.stale_after_seconds);
            if item.is_stale(Utc::now(), stale_after) {
                // 过期接管：指定执行者失联时由观察者保证前进
                debug!(peer = %myself, item = %item.id, "taking over stale task");
                self.execute_abilities(&mut item)?;
                executed_here = true;
            } else if item.priority.is_none() || item.priority.as_ref() == Some(myself) {
                self.execute_abilities(&mut item)?;
                executed_here = true;
            } else {
                // 别人的任务：登记挂起，只观察不执行
                item.status = WorkStatus::Pending;
                self.enqueue(item).await;
                return Ok(None);
            }
        }

        self.remove_from_queue(&item.id).await;

        if item.sender == *myself {
            self.workload.completed(item).await?;
            return Ok(None);
        }
        if executed_here {
            // 把结果播回去，让发起者收到完成回执
            return Ok(Some(item));
        }
        // 途经的已完成工作项：多跳中继回不可达发起者是扩展点，此处不转发
        Ok(None)
    }

    /// 入队，按 `id` 去重
    async fn enqueue(&self, item: WorkItem) {
        let mut queue = self.queue.lock().await;
        if queue.iter().any(|queued| queued.id == item.id) {
            return;
        }
        debug!(peer = %self.dispatcher.address(), item = %item.id, "task queued");
        queue.push_back(item);
    }

    async fn remove_from_queue(&self, id: &Uuid) {
        let mut queue = self.queue.lock().await;
        if let Some(position) = queue.iter().position(|queued| &queued.id == id) {
            let removed = queue.remove(position);
            debug!(
                peer = %self.dispatcher.address(),
                item = %id,
                "removed task from queue: {removed:?}"
            );
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queue_contains(&self, id: &Uuid) -> bool {
        self.queue.lock().await.iter().any(|queued| &queued.id == id)
    }

    /// 铸造一个新工作项：执行者从当前已知节点里均匀随机挑选
    async fn mint(&self) -> MeshResult<WorkItem> {
        let members = self.membership.members().await;
        let priority = if members.is_empty() {
            // 还不认识任何节点：不指定执行者，谁都可以执行
            None
        } else {
            let index = rand::rng().random_range(0..members.len());
            Some(members[index].clone())
        };

        let mut item = WorkItem::new(self.dispatcher.address().clone(), priority);
        self.workload.fill(&mut item).await?;
        Ok(item)
    }
}

#[async_trait]
impl Producer for TaskEngine {
    /// 一次生产周期：随机停顿后，重发队头（持续传播未执行的工作项）
    /// 或铸造新工作项
    async fn produce(&self) -> MeshResult<Option<(String, String)>> {
        // 生产循环和接收循环之间的负载均衡全靠这个停顿；去掉它节点
        // 会在连续任务下完全失去响应
        let pause_ms = {
            let mut rng = rand::rng();
            rng.random_range(self.config.produce_pause_min_ms..=self.config.produce_pause_max_ms)
        };
        tokio::time::sleep(std::time::Duration::from_millis(pause_ms)).await;

        let item = {
            let mut queue = self.queue.lock().await;
            queue.pop_front()
        };
        let item = match item {
            Some(queued) => queued,
            None => self.mint().await?,
        };

        Ok(Some((self.config.tag.clone(), serde_json::to_string(&item)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    use peermesh_core::Transport;
    use peermesh_transport::{MemoryHub, MemoryTransport};

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new(format!("tcp://127.0.0.1:{port}"))
    }

    fn test_config() -> TaskConfig {
        TaskConfig {
            stale_after_seconds: 30,
            produce_pause_min_ms: 1,
            produce_pause_max_ms: 2,
            tag: "TASK".to_string(),
        }
    }

    /// 把完成回执记下来的测试工作负载
    #[derive(Default)]
    struct RecordingWorkload {
        filled: StdMutex<u32>,
        completed: StdMutex<Vec<WorkItem>>,
    }

    #[async_trait]
    impl Workload for RecordingWorkload {
        async fn fill(&self, item: &mut WorkItem) -> MeshResult<()> {
            *self.filled.lock().unwrap() += 1;
            item.todo = Some("double".to_string());
            item.extra.insert("value".into(), json!(21));
            Ok(())
        }

        async fn completed(&self, item: WorkItem) -> MeshResult<()> {
            self.completed.lock().unwrap().push(item);
            Ok(())
        }
    }

    fn double_ability() -> Arc<dyn Ability> {
        Arc::new(|_peer: &PeerAddress, item: &mut WorkItem| -> MeshResult<()> {
            let value = item
                .extra
                .get("value")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            item.extra.insert("value".into(), json!(value * 2));
            Ok(())
        })
    }

    async fn test_engine(port: u16) -> (Arc<TaskEngine>, Arc<RecordingWorkload>) {
        let hub = MemoryHub::new();
        let transport = Arc::new(MemoryTransport::new(addr(port), hub));
        transport.bind().await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(transport));
        let membership = Membership::new(Arc::clone(&dispatcher));
        let workload = Arc::new(RecordingWorkload::default());
        let engine = TaskEngine::new(
            dispatcher,
            membership,
            Arc::clone(&workload) as Arc<dyn Workload>,
            test_config(),
        );
        (engine, workload)
    }

    fn foreign_item(sender: u16, priority: Option<u16>) -> WorkItem {
        let mut item = WorkItem::new(addr(sender), priority.map(addr));
        item.todo = Some("double".to_string());
        item.extra.insert("value".into(), json!(21));
        item
    }

    #[tokio::test]
    async fn test_execute_abilities_completes_item() {
        let (engine, _) = test_engine(7300).await;
        engine.register_ability("double", double_ability(), false);

        let mut item = foreign_item(7301, None);
        engine.execute_abilities(&mut item).unwrap();
        assert_eq!(item.status, WorkStatus::Complete);
        assert_eq!(item.extra.get("value"), Some(&json!(42)));
        assert_eq!(
            item.results.as_deref(),
            Some("Task completed by tcp://127.0.0.1:7300")
        );
    }

    #[tokio::test]
    async fn test_missing_ability_never_strands_item() {
        let (engine, _) = test_engine(7302).await;
        engine.register_ability("double", double_ability(), false);

        let mut item = foreign_item(7303, None);
        item.todo = Some("missing;double".to_string());
        engine.execute_abilities(&mut item).unwrap();
        // 缺失的能力被跳过，其余照常执行，最终仍然完成
        assert_eq!(item.status, WorkStatus::Complete);
        assert_eq!(item.extra.get("value"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_ability_fanout_and_overwrite() {
        let (engine, _) = test_engine(7304).await;
        engine.register_ability("double", double_ability(), false);
        engine.register_ability("double", double_ability(), false);

        let mut item = foreign_item(7305, None);
        engine.execute_abilities(&mut item).unwrap();
        // 两个处理器都跑：21 * 2 * 2
        assert_eq!(item.extra.get("value"), Some(&json!(84)));

        engine.register_ability("double", double_ability(), true);
        let mut item = foreign_item(7305, None);
        engine.execute_abilities(&mut item).unwrap();
        assert_eq!(item.extra.get("value"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_self_suppression() {
        let (engine, workload) = test_engine(7306).await;
        engine.register_ability("double", double_ability(), false);

        // 自己发出、指派给别人的未完成请求：不起反应
        let item = foreign_item(7306, Some(7307));
        let response = engine.handle_item(item).await.unwrap();
        assert!(response.is_none());
        assert_eq!(engine.queue_len().await, 0);
        assert!(workload.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_priority_self_executes() {
        let (engine, _) = test_engine(7308).await;
        engine.register_ability("double", double_ability(), false);

        let item = foreign_item(7309, Some(7308));
        let response = engine.handle_item(item).await.unwrap().unwrap();
        assert_eq!(response.status, WorkStatus::Complete);
        assert_eq!(response.extra.get("value"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_no_priority_executes_anywhere() {
        let (engine, _) = test_engine(7310).await;
        engine.register_ability("double", double_ability(), false);

        let item = foreign_item(7311, None);
        let response = engine.handle_item(item).await.unwrap().unwrap();
        assert_eq!(response.status, WorkStatus::Complete);
    }

    #[tokio::test]
    async fn test_deferred_non_execution() {
        // 指派给别人的年轻任务：入队观察，不执行
        let (engine, _) = test_engine(7312).await;
        engine.register_ability("double", double_ability(), false);

        let item = foreign_item(7313, Some(7314));
        let id = item.id;
        let response = engine.handle_item(item).await.unwrap();
        assert!(response.is_none());
        assert!(engine.queue_contains(&id).await);

        // 同一工作项再次到达不会重复入队
        let mut again = foreign_item(7313, Some(7314));
        again.id = id;
        engine.handle_item(again).await.unwrap();
        assert_eq!(engine.queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_staleness_takeover() {
        let (engine, _) = test_engine(7315).await;
        engine.register_ability("double", double_ability(), false);

        let mut item = foreign_item(7316, Some(7317));
        item.status = WorkStatus::Pending;
        item.time = Utc::now() - Duration::seconds(40);
        let response = engine.handle_item(item).await.unwrap().unwrap();
        // 过期的挂起任务无视指派直接执行
        assert_eq!(response.status, WorkStatus::Complete);
        assert_eq!(response.extra.get("value"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_queue_convergence_on_completion() {
        let (engine, _) = test_engine(7318).await;
        engine.register_ability("double", double_ability(), false);

        let item = foreign_item(7319, Some(7320));
        let id = item.id;
        engine.handle_item(item).await.unwrap();
        assert!(engine.queue_contains(&id).await);

        // 完成回执到达后队列条目按 id 清除
        let mut done = foreign_item(7319, Some(7320));
        done.id = id;
        done.status = WorkStatus::Complete;
        done.results = Some("Task completed by tcp://127.0.0.1:7320".to_string());
        let response = engine.handle_item(done).await.unwrap();
        assert!(response.is_none());
        assert!(!engine.queue_contains(&id).await);
    }

    #[tokio::test]
    async fn test_completed_item_reaches_sender_sink() {
        let (engine, workload) = test_engine(7321).await;

        let mut item = WorkItem::new(addr(7321), Some(addr(7322)));
        item.status = WorkStatus::Complete;
        item.results = Some("Task completed by tcp://127.0.0.1:7322".to_string());
        let id = item.id;
        let response = engine.handle_item(item).await.unwrap();
        assert!(response.is_none());

        let completed = workload.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, id);
    }

    #[tokio::test]
    async fn test_passthrough_complete_not_relayed() {
        // 途经的已完成工作项：去重清队但不再转发
        let (engine, workload) = test_engine(7323).await;

        let mut item = foreign_item(7324, Some(7325));
        item.status = WorkStatus::Complete;
        let response = engine.handle_item(item).await.unwrap();
        assert!(response.is_none());
        assert!(workload.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decode_failure_dropped() {
        let (engine, _) = test_engine(7326).await;
        engine.on_frame("not json").await.unwrap();
        assert_eq!(engine.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_produce_reemits_queue_head_first() {
        let (engine, workload) = test_engine(7327).await;
        engine.register_ability("double", double_ability(), false);

        let queued = foreign_item(7328, Some(7329));
        let id = queued.id;
        engine.handle_item(queued).await.unwrap();

        // 队头被弹出重发，不铸造新工作项
        let (tag, payload) = engine.produce().await.unwrap().unwrap();
        assert_eq!(tag, "TASK");
        let reemitted: WorkItem = serde_json::from_str(&payload).unwrap();
        assert_eq!(reemitted.id, id);
        assert_eq!(engine.queue_len().await, 0);
        assert_eq!(*workload.filled.lock().unwrap(), 0);

        // 队列空了才铸造新的
        let (_, payload) = engine.produce().await.unwrap().unwrap();
        let minted: WorkItem = serde_json::from_str(&payload).unwrap();
        assert_ne!(minted.id, id);
        assert_eq!(minted.sender, addr(7327));
        assert!(minted.priority.is_none());
        assert_eq!(*workload.filled.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mint_picks_known_peer_as_priority() {
        let (engine, _) = test_engine(7330).await;
        engine.membership.join_group(&addr(7331)).await.unwrap();

        let (_, payload) = engine.produce().await.unwrap().unwrap();
        let minted: WorkItem = serde_json::from_str(&payload).unwrap();
        assert_eq!(minted.priority, Some(addr(7331)));
        assert_eq!(minted.status, WorkStatus::Unassigned);
    }
}
