//! 包归档缓存
//!
//! 包是一个有名字、可通过分块流广播的文件载荷。归档放在源文件旁边，
//! 源文件比归档新时重新压缩，属于低风险的便利封装。

use std::fs;
use std::path::{Path, PathBuf};

use peermesh_core::{MeshError, MeshResult};

pub struct Package {
    name: String,
    path: PathBuf,
    archive_path: PathBuf,
}

impl Package {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let path = path.into();
        let archive_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{name}.lz4"));
        Self {
            name,
            path,
            archive_path,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 归档路径，需要时先重建归档
    pub fn archive(&self) -> MeshResult<&Path> {
        if self.archive_needs_update()? {
            self.update_archive()?;
        }
        Ok(&self.archive_path)
    }

    fn archive_needs_update(&self) -> MeshResult<bool> {
        if !self.archive_path.exists() {
            return Ok(true);
        }
        let source = fs::metadata(&self.path)?.modified()?;
        let archive = fs::metadata(&self.archive_path)?.modified()?;
        Ok(source > archive)
    }

    fn update_archive(&self) -> MeshResult<()> {
        let bytes = fs::read(&self.path).map_err(|e| {
            MeshError::Internal(format!("读取包源文件 {} 失败: {e}", self.path.display()))
        })?;
        let compressed = lz4_flex::compress_prepend_size(&bytes);
        fs::write(&self.archive_path, compressed)?;
        Ok(())
    }

    /// 归档的固定大小分块
    pub fn chunks(&self, chunk_size: usize) -> MeshResult<Vec<Vec<u8>>> {
        let bytes = fs::read(self.archive()?)?;
        Ok(bytes.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect())
    }

    /// 归档大小（字节）
    pub fn len(&self) -> MeshResult<u64> {
        Ok(fs::metadata(self.archive()?)?.len())
    }

    pub fn is_empty(&self) -> MeshResult<bool> {
        Ok(self.len()? == 0)
    }
}
