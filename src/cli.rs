use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use peermesh_core::{AppConfig, LogTo, Topology, TransportKind};

/// 命令行参数
///
/// 和配置文件字段一一对应，命令行优先。
#[derive(Debug, Parser)]
#[command(name = "peermesh", about = "去中心化对等任务协调系统", version)]
pub struct Cli {
    /// TOML 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,

    /// 日志输出位置
    #[arg(long = "log-to", value_enum)]
    pub log_to: Option<LogToArg>,

    /// 日志级别
    #[arg(short = 'v', long = "log-level")]
    pub log_level: Option<String>,

    /// 节点数量
    #[arg(short = 'n', long = "n-peers")]
    pub n_peers: Option<usize>,

    /// 延迟启动节点占比
    #[arg(long = "n-late-start-peers")]
    pub n_late_start_peers: Option<f64>,

    /// 延迟启动节点的等待时间（秒）
    #[arg(long = "peer-setup-delay")]
    pub peer_setup_delay: Option<f64>,

    /// 起始端口，缺省时在 5555 基础上随机偏移
    #[arg(short = 's', long = "starting-port")]
    pub starting_port: Option<u16>,

    #[arg(long, value_enum)]
    pub transport: Option<TransportArg>,

    #[arg(long, value_enum)]
    pub topology: Option<TopologyArg>,

    /// 节点承载的工作负载类型
    #[arg(long = "peer-type", value_enum, default_value = "random")]
    pub peer_type: PeerKind,

    /// 分发给群组的包文件（peer-type=package 时由首个节点播种）
    #[arg(long)]
    pub package: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogToArg {
    Stdout,
    File,
    None,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TransportArg {
    Memory,
    Tcp,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TopologyArg {
    All,
    Linked,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PeerKind {
    /// 随机数工作负载，计数器累加
    Random,
    /// 包分发工作负载
    Package,
}

impl Cli {
    /// 把命令行覆盖写进配置
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(log_to) = self.log_to {
            config.log.log_to = match log_to {
                LogToArg::Stdout => LogTo::Stdout,
                LogToArg::File => LogTo::File,
                LogToArg::None => LogTo::None,
            };
        }
        if let Some(ref level) = self.log_level {
            config.log.level = level.clone();
        }
        if let Some(n_peers) = self.n_peers {
            config.swarm.n_peers = n_peers;
        }
        if let Some(fraction) = self.n_late_start_peers {
            config.swarm.late_start_fraction = fraction;
        }
        if let Some(delay) = self.peer_setup_delay {
            config.swarm.peer_setup_delay_seconds = delay;
        }
        match self.starting_port {
            Some(port) => config.swarm.starting_port = port,
            None if self.config.is_none() => {
                // 没有任何显式配置时随机化起始端口，便于并排跑多个群
                use rand::Rng;
                config.swarm.starting_port = 5555 + rand::rng().random_range(0..1000);
            }
            None => {}
        }
        if let Some(transport) = self.transport {
            config.transport.kind = match transport {
                TransportArg::Memory => TransportKind::Memory,
                TransportArg::Tcp => TransportKind::Tcp,
            };
        }
        if let Some(topology) = self.topology {
            config.swarm.topology = match topology {
                TopologyArg::All => Topology::All,
                TopologyArg::Linked => Topology::Linked,
                TopologyArg::Random => Topology::Random,
            };
        }
    }
}
