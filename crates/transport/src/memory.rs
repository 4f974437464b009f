//! 内存传输实现
//!
//! 用 Tokio broadcast channel 实现的进程内发布/订阅传输，适用于
//! 单进程部署和场景测试。每个绑定地址对应一条广播通道；订阅就是
//! 订阅目标地址的通道并把帧转发进本端点的合并接收队列。
//! 订阅之前发布的帧不会补发，落后的订阅者会丢帧，与传输契约一致。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use peermesh_core::{MeshError, MeshResult, PeerAddress, Transport};

const CHANNEL_CAPACITY: usize = 1024;

/// 进程内传输中枢：绑定地址 -> 广播发送端
#[derive(Default)]
pub struct MemoryHub {
    channels: StdMutex<HashMap<PeerAddress, broadcast::Sender<String>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender_for(&self, address: &PeerAddress) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(address.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

pub struct MemoryTransport {
    address: PeerAddress,
    hub: Arc<MemoryHub>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    connected: Mutex<HashSet<PeerAddress>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(address: PeerAddress, hub: Arc<MemoryHub>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            address,
            hub,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            forwarders: Mutex::new(Vec::new()),
            connected: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Transport("端点已关闭".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn address(&self) -> &PeerAddress {
        &self.address
    }

    async fn bind(&self) -> MeshResult<()> {
        self.ensure_open()?;
        self.hub.sender_for(&self.address);
        debug!(peer = %self.address, "memory transport bound");
        Ok(())
    }

    async fn connect(&self, address: &PeerAddress) -> MeshResult<()> {
        self.ensure_open()?;
        let mut connected = self.connected.lock().await;
        if !connected.insert(address.clone()) {
            return Ok(());
        }
        drop(connected);

        let mut rx = self.hub.sender_for(address).subscribe();
        let inbound = self.inbound_tx.clone();
        let publisher = address.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if inbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(publisher = %publisher, skipped, "subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.lock().await.push(handle);
        Ok(())
    }

    async fn publish(&self, frame: &str) -> MeshResult<()> {
        self.ensure_open()?;
        // 没有订阅者时发送失败是正常情况，尽力而为投递
        let _ = self.hub.sender_for(&self.address).send(frame.to_string());
        Ok(())
    }

    async fn recv(&self) -> MeshResult<String> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| MeshError::Transport("接收队列已关闭".to_string()))
    }

    async fn close(&self) -> MeshResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut forwarders = self.forwarders.lock().await;
        for handle in forwarders.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}
