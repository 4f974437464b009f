//! 线路微格式
//!
//! 所有帧都是 UTF-8 字符串 `"<TAG>=<PAYLOAD>"`。`GROUP` 的地址列表沿用
//! 旧版的方括号单引号渲染，解析时剥掉 `[` `]` `'` 和空格后按逗号
//! 切分。为了互操作必须逐字符复刻，不能换成通用容器序列化。

use crate::errors::{MeshError, MeshResult};

use super::PeerAddress;

/// `JOINED` 消息的保留标签
pub const JOINED_TAG: &str = "JOINED";
/// `GROUP` 消息的保留标签
pub const GROUP_TAG: &str = "GROUP";

/// 组装一条帧
pub fn encode_frame(tag: &str, payload: &str) -> String {
    format!("{tag}={payload}")
}

/// 若帧以 `tag=` 开头则返回其载荷
pub fn match_tag<'a>(raw: &'a str, tag: &str) -> Option<&'a str> {
    let rest = raw.strip_prefix(tag)?;
    rest.strip_prefix('=')
}

/// 渲染 GROUP 载荷：`['tcp://a:1', 'tcp://b:2']`，空组渲染为 `[]`
pub fn render_group(peers: &[PeerAddress]) -> String {
    let inner: Vec<String> = peers.iter().map(|p| format!("'{p}'")).collect();
    format!("[{}]", inner.join(", "))
}

/// 解析 GROUP 载荷，丢弃空条目
pub fn parse_group(payload: &str) -> Vec<PeerAddress> {
    payload
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '\'' | ' '))
        .collect::<String>()
        .split(',')
        .filter(|entry| !entry.is_empty())
        .map(PeerAddress::new)
        .collect()
}

/// 渲染 JOINED 载荷：与旧版一致的 `True` / `False`
pub fn render_joined(joined: bool) -> &'static str {
    if joined {
        "True"
    } else {
        "False"
    }
}

/// 解析 JOINED 载荷
pub fn parse_joined(payload: &str) -> MeshResult<bool> {
    match payload {
        "True" => Ok(true),
        "False" => Ok(false),
        other => Err(MeshError::Decode(format!(
            "unexpected JOINED payload: {other:?}"
        ))),
    }
}
