//! 包分发工作负载
//!
//! 任务协议的示范消费者：把包归档切块装进 `store_chunk` 工作项广播
//! 出去，接收侧把分块拼回归档、解压并落盘。分块字节以 base64 嵌进
//! JSON 载荷。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tracing::{debug, info};

use peermesh_core::{MeshError, MeshResult, PeerAddress, WorkItem, Workload};
use peermesh_peer::{Ability, TaskEngine};

use crate::package::Package;

/// 等待铸造进工作项的一个分块
struct ChunkJob {
    package: String,
    seq: usize,
    total: usize,
    data: Vec<u8>,
}

/// 接收中的包
struct Assembly {
    total: usize,
    received: BTreeMap<usize, Vec<u8>>,
}

pub struct PackageWorkload {
    outbound: Mutex<VecDeque<ChunkJob>>,
    assemblies: Mutex<HashMap<String, Assembly>>,
    output_dir: PathBuf,
}

impl PackageWorkload {
    pub fn new(output_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            outbound: Mutex::new(VecDeque::new()),
            assemblies: Mutex::new(HashMap::new()),
            output_dir: output_dir.into(),
        })
    }

    /// 登记一个待分发的包，返回分块数
    pub fn offer(&self, package: &Package, chunk_size: usize) -> MeshResult<usize> {
        let chunks = package.chunks(chunk_size)?;
        let total = chunks.len();
        let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        for (seq, data) in chunks.into_iter().enumerate() {
            outbound.push_back(ChunkJob {
                package: package.name().to_string(),
                seq,
                total,
                data,
            });
        }
        info!(package = package.name(), total, "package offered for distribution");
        Ok(total)
    }

    /// 把 `store_chunk` 能力挂到任务引擎上
    pub fn register_abilities(this: &Arc<Self>, engine: &TaskEngine) {
        let workload = Arc::clone(this);
        let ability: Arc<dyn Ability> = Arc::new(
            move |peer: &PeerAddress, item: &mut WorkItem| -> MeshResult<()> {
                workload.store_chunk(peer, item)
            },
        );
        engine.register_ability("store_chunk", ability, false);
    }

    fn store_chunk(&self, peer: &PeerAddress, item: &mut WorkItem) -> MeshResult<()> {
        let name = item
            .extra
            .get("package")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MeshError::Decode("store_chunk 缺少 package 字段".to_string()))?
            .to_string();
        let seq = item
            .extra
            .get("seq")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| MeshError::Decode("store_chunk 缺少 seq 字段".to_string()))?
            as usize;
        let total = item
            .extra
            .get("total")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| MeshError::Decode("store_chunk 缺少 total 字段".to_string()))?
            as usize;
        let chunk = item
            .extra
            .get("chunk")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MeshError::Decode("store_chunk 缺少 chunk 字段".to_string()))?;
        let data = BASE64
            .decode(chunk)
            .map_err(|e| MeshError::Decode(format!("分块 base64 解码失败: {e}")))?;

        let finished = {
            let mut assemblies = self.assemblies.lock().unwrap_or_else(|e| e.into_inner());
            let assembly = assemblies.entry(name.clone()).or_insert(Assembly {
                total,
                received: BTreeMap::new(),
            });
            assembly.received.insert(seq, data);
            debug!(peer = %peer, package = %name, seq, total, "chunk stored");
            if assembly.received.len() == assembly.total {
                assemblies.remove(&name)
            } else {
                None
            }
        };

        if let Some(assembly) = finished {
            self.write_package(&name, assembly)?;
        }
        Ok(())
    }

    fn write_package(&self, name: &str, assembly: Assembly) -> MeshResult<()> {
        let mut archive = Vec::new();
        for data in assembly.received.into_values() {
            archive.extend_from_slice(&data);
        }
        let restored = lz4_flex::decompress_size_prepended(&archive)
            .map_err(|e| MeshError::Decode(format!("包 {name} 解压失败: {e}")))?;

        fs::create_dir_all(&self.output_dir)?;
        let target = self.output_dir.join(name);
        fs::write(&target, restored)?;
        info!(package = name, target = %target.display(), "package reassembled");
        Ok(())
    }

    /// 还有多少分块没铸进工作项
    pub fn pending_chunks(&self) -> usize {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Workload for PackageWorkload {
    async fn fill(&self, item: &mut WorkItem) -> MeshResult<()> {
        let job = {
            let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            outbound.pop_front()
        };
        if let Some(job) = job {
            item.todo = Some("store_chunk".to_string());
            item.extra.insert("package".into(), json!(job.package));
            item.extra.insert("seq".into(), json!(job.seq));
            item.extra.insert("total".into(), json!(job.total));
            item.extra
                .insert("chunk".into(), json!(BASE64.encode(&job.data)));
        }
        // 没有待发分块时铸出空白工作项，让生产循环保持节拍
        Ok(())
    }

    async fn completed(&self, item: WorkItem) -> MeshResult<()> {
        let seq = item.extra.get("seq").and_then(|v| v.as_u64());
        debug!(item = %item.id, seq, "chunk round trip acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new(format!("tcp://127.0.0.1:{port}"))
    }

    fn chunk_item(name: &str, seq: usize, total: usize, data: &[u8]) -> WorkItem {
        let mut item = WorkItem::new(addr(7600), None);
        item.todo = Some("store_chunk".to_string());
        item.extra.insert("package".into(), json!(name));
        item.extra.insert("seq".into(), json!(seq));
        item.extra.insert("total".into(), json!(total));
        item.extra.insert("chunk".into(), json!(BASE64.encode(data)));
        item
    }

    #[test]
    fn test_chunk_reassembly_roundtrip() {
        let source_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let source = source_dir.path().join("blob");
        let payload = b"the quick brown fox".repeat(50);
        std::fs::write(&source, &payload).unwrap();

        let package = Package::new("blob", &source);
        let chunks = package.chunks(32).unwrap();
        let total = chunks.len();

        let workload = PackageWorkload::new(output_dir.path());
        // 乱序送达也要能拼回来
        let peer = addr(7601);
        for (seq, data) in chunks.into_iter().enumerate().rev() {
            let mut item = chunk_item("blob", seq, total, &data);
            workload.store_chunk(&peer, &mut item).unwrap();
        }

        let restored = std::fs::read(output_dir.path().join("blob")).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_store_chunk_rejects_malformed_item() {
        let output_dir = tempdir().unwrap();
        let workload = PackageWorkload::new(output_dir.path());
        let mut item = WorkItem::new(addr(7602), None);
        item.todo = Some("store_chunk".to_string());
        assert!(workload.store_chunk(&addr(7602), &mut item).is_err());
    }

    #[tokio::test]
    async fn test_fill_drains_offered_chunks() {
        let source_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let source = source_dir.path().join("blob");
        std::fs::write(&source, b"x".repeat(100)).unwrap();

        let package = Package::new("blob", &source);
        let workload = PackageWorkload::new(output_dir.path());
        let total = workload.offer(&package, 16).unwrap();
        assert_eq!(workload.pending_chunks(), total);

        let mut item = WorkItem::new(addr(7603), None);
        workload.fill(&mut item).await.unwrap();
        assert_eq!(item.todo.as_deref(), Some("store_chunk"));
        assert_eq!(item.extra.get("seq"), Some(&json!(0)));
        assert_eq!(workload.pending_chunks(), total - 1);

        // 排空后铸出的就是空白工作项
        for _ in 1..total {
            let mut item = WorkItem::new(addr(7603), None);
            workload.fill(&mut item).await.unwrap();
        }
        let mut item = WorkItem::new(addr(7603), None);
        workload.fill(&mut item).await.unwrap();
        assert!(item.todo.is_none());
    }
}
