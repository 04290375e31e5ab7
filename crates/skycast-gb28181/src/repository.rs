// GB28181 持久化接口
// 设备/通道/会话/事件记录及其存储 trait，具体存储由调用方提供

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 设备信令传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTransport {
    #[default]
    Udp,
    Tcp,
}

impl DeviceTransport {
    /// 未知取值回退到 UDP
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("tcp") {
            DeviceTransport::Tcp
        } else {
            DeviceTransport::Udp
        }
    }
}

impl fmt::Display for DeviceTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTransport::Udp => write!(f, "udp"),
            DeviceTransport::Tcp => write!(f, "tcp"),
        }
    }
}

/// 设备在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
}

/// 设备记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: u64,
    pub device_id: String,
    pub name: String,
    pub transport: DeviceTransport,
    pub remote_addr: String,
    pub expires: u32,
    pub status: DeviceStatus,
    /// 设备级密码，覆盖全局密码
    #[serde(skip_serializing)]
    pub auth_password: Option<String>,
    pub last_register_at: Option<DateTime<Utc>>,
    pub last_keepalive_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub raw_payload: String,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            device_id: device_id.into(),
            name: String::new(),
            transport: DeviceTransport::Udp,
            remote_addr: String::new(),
            expires: 0,
            status: DeviceStatus::Offline,
            auth_password: None,
            last_register_at: None,
            last_keepalive_at: None,
            created_at: now,
            updated_at: now,
            raw_payload: String::new(),
        }
    }

    /// 最近一次活动时间
    pub fn last_seen(&self) -> DateTime<Utc> {
        [self.last_register_at, self.last_keepalive_at]
            .into_iter()
            .flatten()
            .fold(self.updated_at, |acc, t| acc.max(t))
    }

    /// 非空的设备级密码
    pub fn password_override(&self) -> Option<&str> {
        self.auth_password
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// 注册时的设备写入
#[derive(Debug, Clone)]
pub struct RegisterUpsert {
    pub device_id: String,
    pub transport: DeviceTransport,
    pub remote_addr: String,
    pub expires: u32,
    pub status: DeviceStatus,
    pub raw_payload: String,
}

/// 运行期消息（MESSAGE）的设备写入
#[derive(Debug, Clone)]
pub struct RuntimeTouch {
    pub device_id: String,
    pub transport: DeviceTransport,
    pub remote_addr: String,
    /// 是否为心跳
    pub keepalive: bool,
    pub raw_payload: String,
}

/// 设备分页查询
#[derive(Debug, Clone, Default)]
pub struct DeviceQuery {
    pub status: Option<DeviceStatus>,
    pub offset: usize,
    /// 0 表示不限
    pub limit: usize,
}

/// 通道记录
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub device_id: String,
    pub channel_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: String,
    pub parent_id: String,
    pub status: String,
    pub longitude: String,
    pub latitude: String,
    /// 完整的 Catalog 消息体
    #[serde(skip_serializing)]
    pub raw: String,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Inviting,
    Established,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Inviting => "inviting",
            SessionStatus::Established => "established",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inviting" => Some(SessionStatus::Inviting),
            "established" => Some(SessionStatus::Established),
            "terminated" => Some(SessionStatus::Terminated),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 点播会话记录，会话行是媒体端口租约的持久锚点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub call_id: String,
    pub device_id: String,
    pub channel_id: String,
    pub branch: String,
    pub stream_id: String,
    pub remote_addr: String,
    pub status: SessionStatus,
    pub sdp_body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        call_id: impl Into<String>,
        device_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            device_id: device_id.into(),
            channel_id: channel_id.into(),
            branch: String::new(),
            stream_id: String::new(),
            remote_addr: String::new(),
            status: SessionStatus::Inviting,
            sdp_body: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 合并已存在的同 Call-ID 行，应答已推进的状态与时间戳优先
    pub fn merge_answered(&mut self, answered: &SessionRecord) {
        if answered.status != SessionStatus::Inviting {
            self.status = answered.status;
            self.updated_at = answered.updated_at;
        }
        self.created_at = answered.created_at;
    }
}

/// 事件记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: String,
    pub device_id: String,
    pub call_id: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(kind: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            device_id: device_id.into(),
            call_id: String::new(),
            detail: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// GB28181 存储 trait
#[async_trait]
pub trait Gb28181Repository: Send + Sync {
    /// 分页列出设备
    async fn list_devices(&self, query: &DeviceQuery) -> Result<Vec<DeviceRecord>>;

    /// 按内部 ID 查询设备
    async fn get_device(&self, id: u64) -> Result<Option<DeviceRecord>>;

    /// 按国标设备 ID 查询设备
    async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// 注册时写入设备
    async fn upsert_device_on_register(&self, upsert: RegisterUpsert) -> Result<DeviceRecord>;

    /// 收到运行期消息时写入设备
    async fn touch_device(&self, touch: RuntimeTouch) -> Result<DeviceRecord>;

    /// 批量更新设备状态，返回更新数量
    async fn update_device_status(&self, device_ids: &[String], status: DeviceStatus)
        -> Result<u64>;

    async fn list_channels(&self, device_id: &str) -> Result<Vec<ChannelRecord>>;

    /// 整体替换设备的通道
    async fn replace_channels(&self, device_id: &str, channels: Vec<ChannelRecord>) -> Result<()>;

    /// 列出会话，按更新时间倒序；limit 为 0 表示不限
    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>>;

    async fn get_session(&self, call_id: &str) -> Result<Option<SessionRecord>>;

    async fn upsert_session(&self, session: SessionRecord) -> Result<()>;

    /// 写入刚发出 INVITE 的会话，返回最终落库的行
    ///
    /// 设备应答可能先于本地写入到达，此时保留应答处理推进后的状态。
    async fn store_invited_session(&self, mut session: SessionRecord) -> Result<SessionRecord> {
        if let Some(answered) = self.get_session(&session.call_id).await? {
            session.merge_answered(&answered);
        }
        self.upsert_session(session.clone()).await?;
        Ok(session)
    }

    async fn insert_event(&self, event: EventRecord) -> Result<()>;
}
