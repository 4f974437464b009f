use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 对等节点地址
///
/// 形如 `tcp://host:port` 的不透明端点标识。地址全串决定节点身份；
/// 端口号只用于显示和排序，协议正确性不依赖它。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 解析地址中的端口号，这是唯一会被解析出来的字段
    pub fn port(&self) -> Option<u16> {
        self.0.rsplit(':').next()?.parse().ok()
    }

    /// 去掉 `tcp://` 前缀，得到可用于套接字绑定的 host:port
    pub fn host_port(&self) -> &str {
        self.0.strip_prefix("tcp://").unwrap_or(&self.0)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.port(), other.port()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_parsing() {
        let addr = PeerAddress::new("tcp://127.0.0.1:5555");
        assert_eq!(addr.port(), Some(5555));
        assert_eq!(addr.host_port(), "127.0.0.1:5555");
    }

    #[test]
    fn test_port_missing() {
        let addr = PeerAddress::new("tcp://localhost");
        assert_eq!(addr.port(), None);
    }

    #[test]
    fn test_ordering_by_port() {
        let low = PeerAddress::new("tcp://127.0.0.1:5555");
        let high = PeerAddress::new("tcp://127.0.0.1:5600");
        assert!(low < high);

        let mut peers = vec![high.clone(), low.clone()];
        peers.sort();
        assert_eq!(peers, vec![low, high]);
    }

    #[test]
    fn test_identity_is_full_string() {
        let a = PeerAddress::new("tcp://hosta:5555");
        let b = PeerAddress::new("tcp://hostb:5555");
        assert_ne!(a, b);
    }
}
