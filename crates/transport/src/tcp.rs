//! TCP 传输实现
//!
//! 行分隔的 UTF-8 帧。发布端点是一个 TCP 监听器，每个接入连接都是
//! 一个订阅者，发布时把帧写给所有在线订阅者，写失败的连接直接丢弃。
//! 订阅就是向目标发布端点发起一条客户端连接，按行读入合并接收队列。
//! 没有重连和确认，尽力而为投递。

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use peermesh_core::{MeshError, MeshResult, PeerAddress, Transport};

use std::sync::Arc;

pub struct TcpTransport {
    address: PeerAddress,
    bound: StdMutex<Option<SocketAddr>>,
    subscribers: Arc<Mutex<Vec<OwnedWriteHalf>>>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: Mutex<HashSet<PeerAddress>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(address: PeerAddress) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            address,
            bound: StdMutex::new(None),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            tasks: Mutex::new(Vec::new()),
            connected: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// 实际绑定到的地址。绑定端口 0 时由操作系统分配端口，测试用
    pub fn local_address(&self) -> Option<PeerAddress> {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|addr| PeerAddress::new(format!("tcp://{addr}")))
    }

    fn ensure_open(&self) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Transport("端点已关闭".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn address(&self) -> &PeerAddress {
        &self.address
    }

    async fn bind(&self) -> MeshResult<()> {
        self.ensure_open()?;
        let listener = TcpListener::bind(self.address.host_port())
            .await
            .map_err(|e| MeshError::Transport(format!("绑定 {} 失败: {e}", self.address)))?;
        let local = listener
            .local_addr()
            .map_err(|e| MeshError::Transport(e.to_string()))?;
        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        debug!(peer = %self.address, %local, "tcp transport bound");

        let subscribers = Arc::clone(&self.subscribers);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "subscriber connected");
                        let (_read, write) = stream.into_split();
                        subscribers.lock().await.push(write);
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn connect(&self, address: &PeerAddress) -> MeshResult<()> {
        self.ensure_open()?;
        let mut connected = self.connected.lock().await;
        if connected.contains(address) {
            return Ok(());
        }

        let stream = TcpStream::connect(address.host_port())
            .await
            .map_err(|e| MeshError::Transport(format!("连接 {address} 失败: {e}")))?;
        connected.insert(address.clone());
        drop(connected);
        let inbound = self.inbound_tx.clone();
        let publisher = address.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if inbound.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(publisher = %publisher, "publisher closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(publisher = %publisher, "read failed: {e}");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn publish(&self, frame: &str) -> MeshResult<()> {
        self.ensure_open()?;
        let line = format!("{frame}\n");
        let mut subscribers = self.subscribers.lock().await;
        let mut alive = Vec::with_capacity(subscribers.len());
        for mut writer in subscribers.drain(..) {
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => alive.push(writer),
                Err(e) => debug!("dropping dead subscriber: {e}"),
            }
        }
        *subscribers = alive;
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
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
        self.subscribers.lock().await.clear();
        Ok(())
    }
}
