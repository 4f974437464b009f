//! 闲聊成员协议
//!
//! 通过 `GROUP`/`JOINED` 两类消息发现节点并估计群体稳定度。节点广播
//! 成员视图的意愿和它自认为掌握的新信息量成正比，再用全局稳定度估计
//! （health）去压制。流言既消耗又补充每个节点自己的广播预算，群体
//! 稳定后系统收敛到静默，新节点出现时自动重新活跃。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use peermesh_core::models::wire;
use peermesh_core::{MeshResult, PeerAddress};

use crate::dispatch::{Dispatcher, HandlerFuture, MessageHandler};

/// 状态计数的满值
pub const TOTAL_HEALTH: u32 = 100;
/// 一次加入事件对群体健康的冲击
pub const NEW_PEER_DAMAGE: u32 = 1;

/// 闲聊协议的本地状态
///
/// `join_statuses` 和 `broadcast_statuses` 始终落在 [0, 100]；
/// `health` 与 `broadcast_ratio` 是两者除以满值的派生量。
#[derive(Debug, Clone, Copy)]
pub struct GossipState {
    pub join_statuses: u32,
    pub broadcast_statuses: u32,
    pub health: f64,
    pub broadcast_ratio: f64,
}

impl Default for GossipState {
    fn default() -> Self {
        Self {
            join_statuses: 0,
            broadcast_statuses: TOTAL_HEALTH,
            health: 0.0,
            broadcast_ratio: 1.0,
        }
    }
}

/// 成员关系：单调增长的群组视图加自阻尼广播策略
pub struct Membership {
    dispatcher: Arc<Dispatcher>,
    /// 节点地址 -> 加入时间。订阅连接本身由传输层持有；成员一旦
    /// 记录就不再移除
    group: RwLock<HashMap<PeerAddress, DateTime<Utc>>>,
    state: Mutex<GossipState>,
}

impl Membership {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            group: RwLock::new(HashMap::new()),
            state: Mutex::new(GossipState::default()),
        })
    }

    /// 把 `GROUP`/`JOINED` 处理器挂到分发器上，必须在接收循环启动前调用
    pub fn register(this: &Arc<Self>) {
        let membership = Arc::clone(this);
        let joined: Arc<dyn MessageHandler> = Arc::new(move |payload: String| -> HandlerFuture {
            let membership = Arc::clone(&membership);
            Box::pin(async move { membership.on_joined(&payload).await })
        });
        this.dispatcher
            .register_handler(wire::JOINED_TAG, joined, false);

        let membership = Arc::clone(this);
        let group: Arc<dyn MessageHandler> = Arc::new(move |payload: String| -> HandlerFuture {
            let membership = Arc::clone(&membership);
            Box::pin(async move { membership.on_group(&payload).await })
        });
        this.dispatcher
            .register_handler(wire::GROUP_TAG, group, false);
    }

    /// 加入一个节点的群组，幂等
    ///
    /// 只有地址是新的且不是自己时才建立订阅连接并记录，返回是否真的
    /// 加入了。
    pub async fn join_group(&self, address: &PeerAddress) -> MeshResult<bool> {
        if address == self.dispatcher.address() {
            return Ok(false);
        }
        {
            let group = self.group.read().await;
            if group.contains_key(address) {
                return Ok(false);
            }
        }

        self.dispatcher.transport().connect(address).await?;

        let mut group = self.group.write().await;
        if group.contains_key(address) {
            return Ok(false);
        }
        group.insert(address.clone(), Utc::now());
        debug!(peer = %self.dispatcher.address(), joined = %address, size = group.len(), "joined group");
        Ok(true)
    }

    /// 处理 `GROUP` 消息：并入对方的成员视图并回播自己的加入状态
    pub async fn on_group(&self, payload: &str) -> MeshResult<()> {
        {
            // 收到新消息，提高本节点转发它的动力
            let mut state = self.state.lock().await;
            state.broadcast_statuses = (state.broadcast_statuses + 1).min(TOTAL_HEALTH);
        }

        let mut joined = false;
        for address in wire::parse_group(payload) {
            match self.join_group(&address).await {
                Ok(newly_joined) => joined = joined || newly_joined,
                // 连不上的成员跳过，不能挡住其余地址
                Err(e) => warn!(peer = %self.dispatcher.address(), address = %address, "加入群组失败: {e}"),
            }
        }

        self.dispatcher
            .broadcast(wire::JOINED_TAG, wire::render_joined(joined))
            .await
    }

    /// 处理 `JOINED` 消息：根据观察到的加入扰动更新健康度
    pub async fn on_joined(&self, payload: &str) -> MeshResult<()> {
        let joined = wire::parse_joined(payload)?;

        let mut state = self.state.lock().await;
        if joined {
            debug!(peer = %self.dispatcher.address(), "new peer joined");
            state.join_statuses = state.join_statuses.saturating_sub(NEW_PEER_DAMAGE);
        } else {
            state.join_statuses = (state.join_statuses + 1).min(TOTAL_HEALTH);
        }
        // 所有加入回执都为假时健康度拉满
        state.health = f64::from(state.join_statuses) / f64::from(TOTAL_HEALTH);
        debug!(
            peer = %self.dispatcher.address(),
            health = state.health,
            broadcast_ratio = state.broadcast_ratio,
            "population health updated"
        );
        Ok(())
    }

    /// 一次闲聊周期
    ///
    /// 健康度低于自己的广播压力时广播成员视图并释放一点压力；群体仍
    /// 不稳定但自己没新东西可说时积累压力；完全收敛后保持静默。
    pub async fn cycle(&self) -> MeshResult<()> {
        let mut state = self.state.lock().await;
        state.broadcast_ratio = f64::from(state.broadcast_statuses) / f64::from(TOTAL_HEALTH);

        if state.health < state.broadcast_ratio {
            let peers = self.peers().await;
            self.dispatcher
                .broadcast(wire::GROUP_TAG, &wire::render_group(&peers))
                .await?;
            state.broadcast_statuses = state.broadcast_statuses.saturating_sub(1);
            debug!(
                peer = %self.dispatcher.address(),
                broadcast_ratio = state.broadcast_ratio,
                peers = peers.len(),
                "broadcasted group"
            );
        } else if state.health < 1.0 {
            state.broadcast_statuses = (state.broadcast_statuses + NEW_PEER_DAMAGE).min(TOTAL_HEALTH);
        }
        Ok(())
    }

    /// 本节点眼中的完整成员列表：自己在前，其余按地址排序
    pub async fn peers(&self) -> Vec<PeerAddress> {
        let group = self.group.read().await;
        let mut members: Vec<PeerAddress> = group.keys().cloned().collect();
        members.sort();
        let mut peers = Vec::with_capacity(members.len() + 1);
        peers.push(self.dispatcher.address().clone());
        peers.extend(members);
        peers
    }

    /// 群组成员（不含自己）
    pub async fn members(&self) -> Vec<PeerAddress> {
        let group = self.group.read().await;
        let mut members: Vec<PeerAddress> = group.keys().cloned().collect();
        members.sort();
        members
    }

    pub async fn group_size(&self) -> usize {
        self.group.read().await.len()
    }

    pub async fn state(&self) -> GossipState {
        *self.state.lock().await
    }

    #[cfg(test)]
    pub(crate) async fn set_state(&self, join_statuses: u32, broadcast_statuses: u32) {
        let mut state = self.state.lock().await;
        state.join_statuses = join_statuses;
        state.broadcast_statuses = broadcast_statuses;
        state.health = f64::from(join_statuses) / f64::from(TOTAL_HEALTH);
        state.broadcast_ratio = f64::from(broadcast_statuses) / f64::from(TOTAL_HEALTH);
    }
}
