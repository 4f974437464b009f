//! 系统配置
//!
//! 加载顺序：内置默认值 → TOML 配置文件（可选）→ 环境变量覆盖
//! （前缀 `PEERMESH_`）。

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{MeshError, MeshResult};

/// 系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub swarm: SwarmConfig,
    pub gossip: GossipConfig,
    pub task: TaskConfig,
    pub transport: TransportConfig,
    pub log: LogConfig,
}

/// 节点群启动配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// 节点数量
    pub n_peers: usize,
    /// 延迟启动节点占比，延迟加入的节点先等群组稳定再开始闲聊
    pub late_start_fraction: f64,
    /// 延迟启动节点的等待时间（秒）
    pub peer_setup_delay_seconds: f64,
    /// 起始端口，节点地址按端口递增分配
    pub starting_port: u16,
    pub host: String,
    /// 预连接拓扑
    pub topology: Topology,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// 两两互连
    All,
    /// 环形链接
    Linked,
    /// 每对以 0.5 概率连接
    Random,
}

/// 闲聊协议配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// 闲聊周期间隔（秒）
    pub broadcast_delay_seconds: f64,
}

/// 任务分发协议配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// 工作项过期阈值（秒），超过后任何节点都可接管 pending 的工作项
    pub stale_after_seconds: i64,
    /// 生产周期随机停顿下界（毫秒）
    pub produce_pause_min_ms: u64,
    /// 生产周期随机停顿上界（毫秒）
    pub produce_pause_max_ms: u64,
    /// 工作负载帧标签
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Memory,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub log_to: LogTo,
    pub level: String,
    /// 文件日志输出目录
    pub dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTo {
    Stdout,
    File,
    None,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            swarm: SwarmConfig {
                n_peers: 20,
                late_start_fraction: 0.1,
                peer_setup_delay_seconds: 30.0,
                starting_port: 5555,
                host: "127.0.0.1".to_string(),
                topology: Topology::Linked,
            },
            gossip: GossipConfig {
                broadcast_delay_seconds: 5.0,
            },
            task: TaskConfig {
                stale_after_seconds: 30,
                produce_pause_min_ms: 500,
                produce_pause_max_ms: 1000,
                tag: "TASK".to_string(),
            },
            transport: TransportConfig {
                kind: TransportKind::Tcp,
            },
            log: LogConfig {
                log_to: LogTo::Stdout,
                level: "info".to_string(),
                dir: "logs".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    pub fn load(config_path: Option<&str>) -> MeshResult<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default())
            .map_err(|e| MeshError::Configuration(format!("构建默认配置失败: {e}")))?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(MeshError::Configuration(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if Path::new("peermesh.toml").exists() {
            builder = builder.add_source(File::new("peermesh.toml", FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("PEERMESH")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| MeshError::Configuration(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| MeshError::Configuration(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(toml_str: &str) -> MeshResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| MeshError::Configuration(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.swarm.n_peers == 0 {
            return Err(MeshError::Configuration("n_peers 必须大于 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.swarm.late_start_fraction) {
            return Err(MeshError::Configuration(
                "late_start_fraction 必须位于 [0, 1]".to_string(),
            ));
        }
        if self.gossip.broadcast_delay_seconds <= 0.0 {
            return Err(MeshError::Configuration(
                "broadcast_delay_seconds 必须大于 0".to_string(),
            ));
        }
        if self.task.stale_after_seconds <= 0 {
            return Err(MeshError::Configuration(
                "stale_after_seconds 必须大于 0".to_string(),
            ));
        }
        if self.task.produce_pause_min_ms > self.task.produce_pause_max_ms {
            return Err(MeshError::Configuration(
                "produce_pause_min_ms 不能大于 produce_pause_max_ms".to_string(),
            ));
        }
        if self.task.tag.is_empty() || self.task.tag.contains('=') {
            return Err(MeshError::Configuration(
                "工作负载标签不能为空或包含 '='".to_string(),
            ));
        }
        Ok(())
    }
}
