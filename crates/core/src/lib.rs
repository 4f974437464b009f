pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, GossipConfig, LogConfig, LogTo, SwarmConfig, TaskConfig, Topology, TransportConfig,
    TransportKind,
};
pub use errors::{MeshError, MeshResult};
pub use models::{PeerAddress, WorkItem, WorkStatus};
pub use traits::{Transport, Workload};
