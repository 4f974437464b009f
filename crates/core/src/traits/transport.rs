use async_trait::async_trait;

use crate::models::PeerAddress;
use crate::MeshResult;

/// 发布/订阅传输抽象接口
///
/// 投递契约：至少一次、无序、尽力而为，只投递给发布时刻已经连接的
/// 订阅者。订阅者连接之前发布的帧永久丢失。没有消息级确认或重试。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 本端点的发布地址
    fn address(&self) -> &PeerAddress;

    /// 绑定发布端点
    async fn bind(&self) -> MeshResult<()>;

    /// 向指定发布端点打开一条订阅连接
    async fn connect(&self, address: &PeerAddress) -> MeshResult<()>;

    /// 发布一条帧，无投递确认
    async fn publish(&self, frame: &str) -> MeshResult<()>;

    /// 接收来自任意已连接发布端的下一条帧
    async fn recv(&self) -> MeshResult<String>;

    /// 释放两端端点
    async fn close(&self) -> MeshResult<()>;
}
