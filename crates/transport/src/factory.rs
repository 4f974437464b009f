use std::sync::Arc;

use tracing::debug;

use peermesh_core::{MeshResult, PeerAddress, Transport, TransportConfig, TransportKind};

use crate::{MemoryHub, MemoryTransport, TcpTransport};

pub struct TransportFactory;

impl TransportFactory {
    /// 按配置创建传输端点。内存传输的各端点必须共享同一个中枢
    pub fn create(
        config: &TransportConfig,
        address: PeerAddress,
        hub: &Arc<MemoryHub>,
    ) -> MeshResult<Arc<dyn Transport>> {
        debug!(peer = %address, kind = ?config.kind, "creating transport");
        match config.kind {
            TransportKind::Memory => Ok(Arc::new(MemoryTransport::new(address, Arc::clone(hub)))),
            TransportKind::Tcp => Ok(Arc::new(TcpTransport::new(address))),
        }
    }
}
