use async_trait::async_trait;

use crate::models::WorkItem;
use crate::MeshResult;

/// 具体工作负载接口
///
/// 任务分发协议通过这个接口和应用解耦：协议负责仲裁、排队和传播，
/// 工作负载负责新工作项的领域内容和完成回执。
#[async_trait]
pub trait Workload: Send + Sync {
    /// 为新铸造的工作项填充 `todo` 和领域字段
    async fn fill(&self, item: &mut WorkItem) -> MeshResult<()>;

    /// 发起节点的终端完成回调：自己发出的工作项执行完毕后回到这里
    async fn completed(&self, item: WorkItem) -> MeshResult<()>;
}
