//! GB28181 信令核心
//!
//! 设备注册（Digest 鉴权）、心跳与目录、实时点播 INVITE/ACK/BYE、
//! 媒体端口租约以及周期维护。存储通过 [`Gb28181Repository`] 注入。

pub mod auth;
pub mod config;
pub mod error;
pub mod housekeeping;
pub mod manscdp;
pub mod media_port;
pub mod memory;
pub mod repository;
mod router;
pub mod sdp;
pub mod service;
pub mod session;
pub mod sip;
pub mod transport;
pub mod util;

pub use config::{Gb28181Config, TransportMode};
pub use error::{Gb28181Error, Result};
pub use housekeeping::SweepReport;
pub use media_port::{MediaPortAllocator, PortRange, PortSnapshot};
pub use memory::MemoryRepository;
pub use repository::{
    ChannelRecord, DeviceQuery, DeviceRecord, DeviceStatus, DeviceTransport, EventRecord,
    Gb28181Repository, RegisterUpsert, RuntimeTouch, SessionRecord, SessionStatus,
};
pub use service::{Gb28181Service, RuntimeStatus};
pub use session::{sanitize_call_id, InviteRequest};
