// GB28181 服务配置
// 对应 protocols/gb28181.toml 的 [server] 段

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 信令传输模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Udp,
    Tcp,
    Both,
}

impl TransportMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => TransportMode::Tcp,
            "both" => TransportMode::Both,
            _ => TransportMode::Udp,
        }
    }

    pub fn wants_udp(self) -> bool {
        matches!(self, TransportMode::Udp | TransportMode::Both)
    }

    pub fn wants_tcp(self) -> bool {
        matches!(self, TransportMode::Tcp | TransportMode::Both)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Udp => write!(f, "udp"),
            TransportMode::Tcp => write!(f, "tcp"),
            TransportMode::Both => write!(f, "both"),
        }
    }
}

/// GB28181 信令服务配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gb28181Config {
    /// 是否启用
    pub enabled: bool,

    /// 监听 IP
    pub listen_ip: String,

    /// 监听端口（UDP/TCP 共用）
    pub listen_port: u16,

    /// 传输模式（udp/tcp/both）
    pub transport: TransportMode,

    /// 平台 SIP ID
    pub server_id: String,

    /// SIP 域
    pub realm: String,

    /// 全局注册密码，为空时关闭 Digest 鉴权
    pub password: String,

    /// 注册有效期（秒）
    pub register_expires: u32,

    /// 心跳间隔（秒）
    pub heartbeat_interval: u32,

    /// SDP 中优先使用的媒体 IP
    pub media_ip: String,

    /// 单端口回退
    pub media_port: u16,

    /// 媒体端口池起始
    pub media_port_start: u16,

    /// 媒体端口池结束
    pub media_port_end: u16,

    /// INVITE 等待应答超时（秒）
    pub ack_timeout_sec: u32,

    pub user_agent: String,
}

impl Default for Gb28181Config {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 5060,
            transport: TransportMode::Udp,
            server_id: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            password: String::new(),
            register_expires: 3600,
            heartbeat_interval: 60,
            media_ip: String::new(),
            media_port: 30000,
            media_port_start: 30000,
            media_port_end: 30100,
            ack_timeout_sec: 10,
            user_agent: "skycast-gb28181".to_string(),
        }
    }
}

impl Gb28181Config {
    /// 监听地址 host:port
    pub fn listen_addr(&self) -> String {
        let ip = if self.listen_ip.trim().is_empty() {
            "0.0.0.0"
        } else {
            self.listen_ip.trim()
        };
        format!("{}:{}", ip, self.listen_port)
    }

    /// 信令层对外宣告的主机：监听 IP 为通配地址时退回 fallback
    pub fn signal_host<'a>(&'a self, fallback: &'a str) -> &'a str {
        let ip = self.listen_ip.trim();
        if ip.is_empty() || ip == "0.0.0.0" || ip == "::" {
            fallback
        } else {
            ip
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_interval))
    }

    /// INVITE 超时，0 时取默认 10 秒
    pub fn ack_timeout(&self) -> Duration {
        let secs = if self.ack_timeout_sec == 0 {
            10
        } else {
            self.ack_timeout_sec
        };
        Duration::from_secs(u64::from(secs))
    }

    /// 维护周期：heartbeat/2，限制在 [5s, 30s]
    pub fn housekeeping_period(&self) -> Duration {
        let half = u64::from(self.heartbeat_interval) / 2;
        Duration::from_secs(half.clamp(5, 30))
    }

    /// 与信令运行相关的字段是否变化（变化时需要重启服务）
    pub fn requires_restart(&self, other: &Gb28181Config) -> bool {
        self.enabled != other.enabled
            || self.listen_ip != other.listen_ip
            || self.listen_port != other.listen_port
            || self.transport != other.transport
            || self.server_id != other.server_id
            || self.realm != other.realm
            || self.password != other.password
            || self.register_expires != other.register_expires
            || self.heartbeat_interval != other.heartbeat_interval
            || self.media_ip != other.media_ip
            || self.media_port != other.media_port
            || self.media_port_start != other.media_port_start
            || self.media_port_end != other.media_port_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Gb28181Config::default();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5060");
        assert_eq!(cfg.transport, TransportMode::Udp);
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_housekeeping_period_clamped() {
        let mut cfg = Gb28181Config::default();
        cfg.heartbeat_interval = 60;
        assert_eq!(cfg.housekeeping_period(), Duration::from_secs(30));
        cfg.heartbeat_interval = 4;
        assert_eq!(cfg.housekeeping_period(), Duration::from_secs(5));
        cfg.heartbeat_interval = 20;
        assert_eq!(cfg.housekeeping_period(), Duration::from_secs(10));
    }

    #[test]
    fn test_transport_mode_parse() {
        assert_eq!(TransportMode::parse("TCP"), TransportMode::Tcp);
        assert_eq!(TransportMode::parse("both"), TransportMode::Both);
        assert_eq!(TransportMode::parse("sctp"), TransportMode::Udp);
    }

    #[test]
    fn test_requires_restart_ignores_ack_timeout() {
        let a = Gb28181Config::default();
        let mut b = a.clone();
        b.ack_timeout_sec = 30;
        assert!(!a.requires_restart(&b));
        b.realm = "4401000000".to_string();
        assert!(a.requires_restart(&b));
    }

    #[test]
    fn test_signal_host_fallback() {
        let mut cfg = Gb28181Config::default();
        assert_eq!(cfg.signal_host("10.0.0.2"), "10.0.0.2");
        cfg.listen_ip = "192.168.1.10".to_string();
        assert_eq!(cfg.signal_host("10.0.0.2"), "192.168.1.10");
    }
}
