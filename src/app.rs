use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tracing::{error, info, warn};

use peermesh_core::{AppConfig, MeshError, MeshResult, PeerAddress, Topology};
use peermesh_pack::{Package, PackageWorkload};
use peermesh_peer::Peer;
use peermesh_transport::{MemoryHub, TransportFactory};

use crate::cli::PeerKind;
use crate::shutdown::ShutdownManager;
use crate::workload::RandomWorkload;

const PACKAGE_CHUNK_SIZE: usize = 1024;

/// 启动整个节点群并运行到收到中断信号
pub async fn run(
    config: AppConfig,
    peer_kind: PeerKind,
    package: Option<PathBuf>,
) -> MeshResult<()> {
    let peers = build_peers(&config, peer_kind, package)?;
    connect_topology(&peers, config.swarm.topology).await?;

    let shutdown = ShutdownManager::new();
    let late_count =
        (config.swarm.n_peers as f64 * config.swarm.late_start_fraction).ceil() as usize;

    for (index, peer) in peers.iter().enumerate() {
        if index < late_count {
            // 晚加入的节点先让群组稳定下来再开口，否则它的第一轮
            // 闲聊发生在任何人订阅它之前，白白浪费
            let peer = Arc::clone(peer);
            let mut shutdown_rx = shutdown.subscribe().await;
            let base_delay = config.swarm.peer_setup_delay_seconds;
            let delay = Duration::from_secs_f64(base_delay * rand::rng().random_range(0.5..1.0));
            info!(peer = %peer.address(), ?delay, "delaying peer setup");
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(e) = peer.setup().await {
                    error!(peer = %peer.address(), "延迟启动节点失败: {e}");
                }
            });
        } else {
            peer.setup().await?;
        }
    }
    info!(
        n_peers = peers.len(),
        late_count,
        topology = ?config.swarm.topology,
        "swarm running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| MeshError::Internal(format!("等待中断信号失败: {e}")))?;
    info!("interrupt received, tearing down swarm");
    shutdown.shutdown().await;

    // 并发拆除所有节点，压制单个节点的拆除错误
    let results = join_all(peers.iter().map(|peer| peer.teardown())).await;
    for (peer, result) in peers.iter().zip(results) {
        if let Err(e) = result {
            warn!(peer = %peer.address(), "teardown failed: {e}");
        }
    }
    Ok(())
}

fn build_peers(
    config: &AppConfig,
    peer_kind: PeerKind,
    package: Option<PathBuf>,
) -> MeshResult<Vec<Arc<Peer>>> {
    let hub = MemoryHub::new();
    let mut peers = Vec::with_capacity(config.swarm.n_peers);

    for index in 0..config.swarm.n_peers {
        let port = config.swarm.starting_port + index as u16;
        let address = PeerAddress::new(format!("tcp://{}:{port}", config.swarm.host));
        let transport = TransportFactory::create(&config.transport, address, &hub)?;

        let peer = match peer_kind {
            PeerKind::Random => {
                let workload = RandomWorkload::new();
                let peer = Peer::builder(transport)
                    .gossip(config.gossip.clone())
                    .workload(config.task.clone(), Arc::clone(&workload) as _)
                    .build();
                if let Some(engine) = peer.engine() {
                    RandomWorkload::register_abilities(&workload, engine);
                }
                peer
            }
            PeerKind::Package => {
                let workload = PackageWorkload::new(format!("received/{port}"));
                // 首个节点播种待分发的包
                if index == 0 {
                    if let Some(ref path) = package {
                        let name = path
                            .file_stem()
                            .map(|stem| stem.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "package".to_string());
                        workload.offer(&Package::new(name, path), PACKAGE_CHUNK_SIZE)?;
                    }
                }
                let peer = Peer::builder(transport)
                    .gossip(config.gossip.clone())
                    .workload(config.task.clone(), Arc::clone(&workload) as _)
                    .build();
                if let Some(engine) = peer.engine() {
                    PackageWorkload::register_abilities(&workload, engine);
                }
                peer
            }
        };
        peers.push(Arc::new(peer));
    }
    Ok(peers)
}

/// 预连接拓扑，决定闲聊从哪些边开始扩散
async fn connect_topology(peers: &[Arc<Peer>], topology: Topology) -> MeshResult<()> {
    match topology {
        Topology::All => {
            for (i, peer) in peers.iter().enumerate() {
                for other in peers.iter().skip(i + 1) {
                    peer.membership().join_group(other.address()).await?;
                    other.membership().join_group(peer.address()).await?;
                }
            }
        }
        Topology::Linked => {
            for window in peers.windows(2) {
                window[0]
                    .membership()
                    .join_group(window[1].address())
                    .await?;
            }
            if let (Some(last), Some(first)) = (peers.last(), peers.first()) {
                if peers.len() > 1 {
                    last.membership().join_group(first.address()).await?;
                }
            }
        }
        Topology::Random => {
            for (i, peer) in peers.iter().enumerate() {
                for other in peers.iter().skip(i + 1) {
                    let connect = { rand::rng().random_range(0.0..1.0) < 0.5 };
                    if connect {
                        peer.membership().join_group(other.address()).await?;
                        other.membership().join_group(peer.address()).await?;
                    }
                }
            }
        }
    }
    Ok(())
}
