//! 消息分发底座
//!
//! 每个节点的公共基础：持有节点身份、消息类型路由表和广播原语。
//! 分发采用宽容的多标签前缀匹配：凡是满足 `"<tag>="` 前缀的已注册
//! 标签全部触发，一个标签是另一个标签字面前缀时两者的处理器都会
//! 执行。这是刻意保留的行为，收紧成单一匹配属于协议变更。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use peermesh_core::models::wire;
use peermesh_core::{MeshResult, PeerAddress, Transport};

pub type HandlerFuture = Pin<Box<dyn Future<Output = MeshResult<()>> + Send>>;

/// 消息处理器：收到某个标签的载荷后被调用
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: String) -> HandlerFuture;
}

impl<F> MessageHandler for F
where
    F: Fn(String) -> HandlerFuture + Send + Sync,
{
    fn handle(&self, payload: String) -> HandlerFuture {
        (self)(payload)
    }
}

struct Route {
    tag: String,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

/// 分发器：路由表 + 传输端点
///
/// 路由表注册必须在接收循环启动之前完成，分发期间的并发变更不受支持。
pub struct Dispatcher {
    address: PeerAddress,
    transport: Arc<dyn Transport>,
    routes: RwLock<Vec<Route>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            address: transport.address().clone(),
            transport,
            routes: RwLock::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// 注册消息类型处理器
    ///
    /// 未注册的标签安装单处理器列表；已注册且 `overwrite` 为假时追加
    /// （多处理器扇出），为真时整表替换。
    pub fn register_handler(&self, tag: &str, handler: Arc<dyn MessageHandler>, overwrite: bool) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        match routes.iter_mut().find(|route| route.tag == tag) {
            Some(route) => {
                if overwrite {
                    route.handlers = vec![handler];
                } else {
                    route.handlers.push(handler);
                }
            }
            None => routes.push(Route {
                tag: tag.to_string(),
                handlers: vec![handler],
            }),
        }
        debug!(peer = %self.address, tag, overwrite, "registered message type");
    }

    /// 已注册的消息类型标签，按注册顺序
    pub fn tags(&self) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().map(|route| route.tag.clone()).collect()
    }

    /// 分发一条原始帧
    ///
    /// 对每个前缀匹配的标签，按注册顺序调用其全部处理器。处理器报错
    /// 时中止本帧剩余处理器并把错误交给循环边界记录。
    pub async fn dispatch(&self, raw: &str) -> MeshResult<()> {
        let matched: Vec<(String, String, Vec<Arc<dyn MessageHandler>>)> = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .filter_map(|route| {
                    wire::match_tag(raw, &route.tag).map(|payload| {
                        (
                            route.tag.clone(),
                            payload.to_string(),
                            route.handlers.clone(),
                        )
                    })
                })
                .collect()
        };

        for (tag, payload, handlers) in matched {
            trace!(peer = %self.address, tag, payload, "dispatching frame");
            for handler in handlers {
                handler.handle(payload.clone()).await?;
            }
        }
        Ok(())
    }

    /// 广播 `"<tag>=<payload>"`，即发即忘
    pub async fn broadcast(&self, tag: &str, payload: &str) -> MeshResult<()> {
        let frame = wire::encode_frame(tag, payload);
        self.transport.publish(&frame).await?;
        trace!(peer = %self.address, frame, "sent message");
        Ok(())
    }
}
