//! 对等节点组合根
//!
//! 能力按组合而非继承叠加：节点持有分发器、成员关系和可选的任务
//! 引擎的引用，并运行三条永续活动（接收、生产、闲聊）。活动之间
//! 只通过传输层和节点自身的状态交流，取消统一走广播关闭信号。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use peermesh_core::{GossipConfig, MeshResult, PeerAddress, TaskConfig, Transport, Workload};

use crate::dispatch::Dispatcher;
use crate::gossip::Membership;
use crate::tasks::TaskEngine;

/// 工作负载生产端口
///
/// 生产循环每个节拍调用一次；返回要广播的帧，返回 `None` 表示本拍
/// 没有产出。
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self) -> MeshResult<Option<(String, String)>>;
}

/// 只参与闲聊、不产出工作负载的节点用的空生产者
pub struct IdleProducer {
    pause: Duration,
}

impl Default for IdleProducer {
    fn default() -> Self {
        Self {
            pause: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl Producer for IdleProducer {
    async fn produce(&self) -> MeshResult<Option<(String, String)>> {
        tokio::time::sleep(self.pause).await;
        Ok(None)
    }
}

/// 对等节点
pub struct Peer {
    dispatcher: Arc<Dispatcher>,
    membership: Arc<Membership>,
    engine: Option<Arc<TaskEngine>>,
    producer: Arc<dyn Producer>,
    gossip_interval: Duration,
    shutdown: broadcast::Sender<()>,
    activities: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub fn builder(transport: Arc<dyn Transport>) -> PeerBuilder {
        PeerBuilder::new(transport)
    }

    pub fn address(&self) -> &PeerAddress {
        self.dispatcher.address()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn engine(&self) -> Option<&Arc<TaskEngine>> {
        self.engine.as_ref()
    }

    /// 启动节点
    ///
    /// 绑定发布端点，把订阅端点连回自己（节点要观察到自己的广播），
    /// 然后派生接收、生产和闲聊三条活动。路由表和能力注册必须在此
    /// 之前完成。
    pub async fn setup(&self) -> MeshResult<()> {
        let transport = self.dispatcher.transport();
        transport.bind().await?;
        transport.connect(self.address()).await?;
        info!(peer = %self.address(), "peer starting");

        let mut activities = self.activities.lock().await;
        activities.push(tokio::spawn(Self::recv_loop(
            Arc::clone(self.dispatcher.transport()),
            Arc::clone(&self.dispatcher),
            self.shutdown.subscribe(),
        )));
        activities.push(tokio::spawn(Self::produce_loop(
            Arc::clone(&self.producer),
            Arc::clone(&self.dispatcher),
            self.shutdown.subscribe(),
        )));
        activities.push(tokio::spawn(Self::gossip_loop(
            Arc::clone(&self.membership),
            self.gossip_interval,
            self.shutdown.subscribe(),
        )));
        Ok(())
    }

    /// 停止节点
    ///
    /// 发出终止信号，取消所有持有的活动并等它们结束，压制取消过程
    /// 中的错误，最后释放传输端点。
    pub async fn teardown(&self) -> MeshResult<()> {
        let _ = self.shutdown.send(());

        let mut activities = self.activities.lock().await;
        for handle in activities.drain(..) {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(peer = %self.address(), "activity ended abnormally: {e}");
                }
            }
        }

        self.dispatcher.transport().close().await?;
        info!(peer = %self.address(), "peer stopped");
        Ok(())
    }

    /// 接收活动：每帧一个错误边界，出错记日志丢帧继续
    async fn recv_loop(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                frame = transport.recv() => match frame {
                    Ok(frame) => {
                        if let Err(e) = dispatcher.dispatch(&frame).await {
                            error!(peer = %dispatcher.address(), "处理消息失败: {e}");
                        }
                    }
                    Err(e) => {
                        error!(peer = %dispatcher.address(), "接收消息失败: {e}");
                        // 端点异常时退避，避免空转
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!(peer = %dispatcher.address(), "receive activity stopped");
    }

    /// 生产活动：调用生产端口并广播产出
    async fn produce_loop(
        producer: Arc<dyn Producer>,
        dispatcher: Arc<Dispatcher>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let tick = tokio::select! {
                _ = shutdown.recv() => break,
                tick = producer.produce() => tick,
            };
            match tick {
                Ok(Some((tag, payload))) => {
                    if let Err(e) = dispatcher.broadcast(&tag, &payload).await {
                        error!(peer = %dispatcher.address(), "广播工作负载失败: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(peer = %dispatcher.address(), "生产工作负载失败: {e}"),
            }
        }
        debug!(peer = %dispatcher.address(), "produce activity stopped");
    }

    /// 闲聊活动：固定间隔跑一次成员广播周期
    async fn gossip_loop(
        membership: Arc<Membership>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = membership.cycle().await {
                        error!("闲聊周期失败: {e}");
                    }
                }
            }
        }
    }
}

/// 节点构造器：选择节点承载哪些能力
pub struct PeerBuilder {
    transport: Arc<dyn Transport>,
    gossip: GossipConfig,
    workload: Option<(TaskConfig, Arc<dyn Workload>)>,
}

impl PeerBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            gossip: GossipConfig {
                broadcast_delay_seconds: 5.0,
            },
            workload: None,
        }
    }

    pub fn gossip(mut self, config: GossipConfig) -> Self {
        self.gossip = config;
        self
    }

    /// 挂载任务分发协议和具体工作负载
    pub fn workload(mut self, config: TaskConfig, workload: Arc<dyn Workload>) -> Self {
        self.workload = Some((config, workload));
        self
    }

    pub fn build(self) -> Peer {
        let dispatcher = Arc::new(Dispatcher::new(self.transport));
        let membership = Membership::new(Arc::clone(&dispatcher));
        Membership::register(&membership);

        let (engine, producer): (Option<Arc<TaskEngine>>, Arc<dyn Producer>) = match self.workload
        {
            Some((config, workload)) => {
                let engine = TaskEngine::new(
                    Arc::clone(&dispatcher),
                    Arc::clone(&membership),
                    workload,
                    config,
                );
                TaskEngine::register(&engine);
                (Some(Arc::clone(&engine)), engine)
            }
            None => (None, Arc::new(IdleProducer::default())),
        };

        let (shutdown, _) = broadcast::channel(16);
        Peer {
            dispatcher,
            membership,
            engine,
            producer,
            gossip_interval: Duration::from_secs_f64(self.gossip.broadcast_delay_seconds),
            shutdown,
            activities: Mutex::new(Vec::new()),
        }
    }
}
