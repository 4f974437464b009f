use chrono::{DateTime, Duration, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PeerAddress;

/// 工作项状态
///
/// 规范化的三态表示。旧版线路格式曾用布尔值表示未分配状态，
/// 解码时将布尔值视为 `Unassigned` 的别名以兼容旧载荷。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum WorkStatus {
    #[serde(rename = "unassigned")]
    #[default]
    Unassigned,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "complete")]
    Complete,
}

impl<'de> Deserialize<'de> for WorkStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            LegacySentinel(bool),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => match s.as_str() {
                "unassigned" => Ok(WorkStatus::Unassigned),
                "pending" => Ok(WorkStatus::Pending),
                "complete" => Ok(WorkStatus::Complete),
                other => Err(de::Error::unknown_variant(
                    other,
                    &["unassigned", "pending", "complete"],
                )),
            },
            Raw::LegacySentinel(_) => Ok(WorkStatus::Unassigned),
        }
    }
}

/// 分布式工作单元
///
/// - `id`: 生成的唯一标识，作为去重键
/// - `sender`: 发起节点地址
/// - `priority`: 指定执行节点；为空时任何节点都可以执行
/// - `time`: 创建时间，仅用于过期判定
/// - `todo`: 以 `;` 分隔的能力名列表
/// - `results`: 完成后附带的执行输出
/// - `extra`: 具体工作负载附加的领域字段，原样随消息传播
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub sender: PeerAddress,
    #[serde(default)]
    pub priority: Option<PeerAddress>,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub todo: Option<String>,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub results: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WorkItem {
    pub fn new(sender: PeerAddress, priority: Option<PeerAddress>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            priority,
            time: Utc::now(),
            todo: None,
            status: WorkStatus::Unassigned,
            results: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.time)
    }

    /// 过期判定：pending 状态下超过阈值的工作项可以被任意节点接管
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == WorkStatus::Pending && self.age(now) > threshold
    }

    /// 按注册顺序拆出待执行的能力名
    pub fn abilities(&self) -> impl Iterator<Item = &str> {
        self.todo
            .as_deref()
            .into_iter()
            .flat_map(|todo| todo.split(';'))
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
