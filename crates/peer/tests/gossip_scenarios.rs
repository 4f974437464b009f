//! 闲聊协议的多节点场景测试，跑在内存传输上

use std::sync::Arc;
use std::time::Duration;

use peermesh_core::{GossipConfig, PeerAddress};
use peermesh_peer::Peer;
use peermesh_transport::{MemoryHub, MemoryTransport};

fn addr(port: u16) -> PeerAddress {
    PeerAddress::new(format!("tcp://127.0.0.1:{port}"))
}

fn gossip_peer(port: u16, hub: &Arc<MemoryHub>) -> Peer {
    let transport = Arc::new(MemoryTransport::new(addr(port), Arc::clone(hub)));
    Peer::builder(transport)
        .gossip(GossipConfig {
            broadcast_delay_seconds: 0.2,
        })
        .build()
}

/// 轮询直到条件成立或超时
async fn wait_until<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_scenario_a_stability_reports_raise_health() {
    // 两个互相订阅的节点闲聊：没有新成员可加时互发 JOINED=False，
    // 健康度从 0 开始上升
    let hub = MemoryHub::new();
    let p1 = gossip_peer(7400, &hub);
    let p2 = gossip_peer(7401, &hub);

    p1.membership().join_group(p2.address()).await.unwrap();
    p2.membership().join_group(p1.address()).await.unwrap();

    p1.setup().await.unwrap();
    p2.setup().await.unwrap();

    let converged = wait_until(
        || async { p1.membership().state().await.join_statuses >= 1 },
        Duration::from_secs(5),
    )
    .await;
    assert!(converged, "P1 never observed a JOINED=False report");

    let state = p1.membership().state().await;
    assert!(state.health >= 0.0 && state.health <= 1.0);
    assert!(state.join_statuses <= 100 && state.broadcast_statuses <= 100);

    p1.teardown().await.unwrap();
    p2.teardown().await.unwrap();
}

#[tokio::test]
async fn test_ring_discovery_converges_to_full_membership() {
    // 环形预连接：p1 听 p2，p2 听 p3，p3 听 p1。闲聊把各自的成员
    // 视图沿环传播，最终每个节点都认识其余两个
    let hub = MemoryHub::new();
    let p1 = gossip_peer(7402, &hub);
    let p2 = gossip_peer(7403, &hub);
    let p3 = gossip_peer(7404, &hub);

    p1.membership().join_group(p2.address()).await.unwrap();
    p2.membership().join_group(p3.address()).await.unwrap();
    p3.membership().join_group(p1.address()).await.unwrap();

    p1.setup().await.unwrap();
    p2.setup().await.unwrap();
    p3.setup().await.unwrap();

    let converged = wait_until(
        || async {
            p1.membership().group_size().await == 2
                && p2.membership().group_size().await == 2
                && p3.membership().group_size().await == 2
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(converged, "membership views never converged");

    // 收敛过程中的计数始终合法
    for peer in [&p1, &p2, &p3] {
        let state = peer.membership().state().await;
        assert!(state.join_statuses <= 100);
        assert!(state.broadcast_statuses <= 100);
        assert!((0.0..=1.0).contains(&state.health));
    }

    p1.teardown().await.unwrap();
    p2.teardown().await.unwrap();
    p3.teardown().await.unwrap();
}

#[tokio::test]
async fn test_teardown_is_clean_and_final() {
    let hub = MemoryHub::new();
    let peer = gossip_peer(7405, &hub);
    peer.setup().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    peer.teardown().await.unwrap();

    // 端点已释放：再广播必须失败
    assert!(peer.dispatcher().broadcast("GROUP", "[]").await.is_err());
}
