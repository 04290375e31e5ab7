// 内存存储实现（用于守护进程单机模式和测试）

use crate::error::Result;
use crate::repository::{
    ChannelRecord, DeviceQuery, DeviceRecord, DeviceStatus, EventRecord, Gb28181Repository,
    RegisterUpsert, RuntimeTouch, SessionRecord, SessionStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 默认保留的事件条数
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// 内存存储
pub struct MemoryRepository {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
    channels: Arc<RwLock<HashMap<String, Vec<ChannelRecord>>>>,
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    events: Arc<RwLock<VecDeque<EventRecord>>>,
    event_capacity: usize,
    next_id: AtomicU64,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定事件保留条数，超出后丢弃最旧的事件
    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            devices: Arc::default(),
            channels: Arc::default(),
            sessions: Arc::default(),
            events: Arc::default(),
            event_capacity: event_capacity.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    /// 直接写入设备（管理端录入、测试预置）
    pub async fn put_device(&self, mut device: DeviceRecord) -> DeviceRecord {
        let mut devices = self.devices.write().await;
        if device.id == 0 {
            device.id = devices
                .get(&device.device_id)
                .map(|d| d.id)
                .unwrap_or_else(|| self.allocate_id());
        }
        devices.insert(device.device_id.clone(), device.clone());
        device
    }

    /// 设置设备级密码
    pub async fn set_device_password(&self, device_id: &str, password: Option<String>) {
        let mut devices = self.devices.write().await;
        let device = devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let mut d = DeviceRecord::new(device_id);
                d.id = self.allocate_id();
                d
            });
        device.auth_password = password;
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.read().await.iter().cloned().collect()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl Gb28181Repository for MemoryRepository {
    async fn list_devices(&self, query: &DeviceQuery) -> Result<Vec<DeviceRecord>> {
        let devices = self.devices.read().await;
        let mut list: Vec<DeviceRecord> = devices
            .values()
            .filter(|d| query.status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        list.sort_by_key(|d| d.id);

        let iter = list.into_iter().skip(query.offset);
        Ok(if query.limit == 0 {
            iter.collect()
        } else {
            iter.take(query.limit).collect()
        })
    }

    async fn get_device(&self, id: u64) -> Result<Option<DeviceRecord>> {
        let devices = self.devices.read().await;
        Ok(devices.values().find(|d| d.id == id).cloned())
    }

    async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let devices = self.devices.read().await;
        Ok(devices.get(device_id).cloned())
    }

    async fn upsert_device_on_register(&self, upsert: RegisterUpsert) -> Result<DeviceRecord> {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let device = devices
            .entry(upsert.device_id.clone())
            .or_insert_with(|| {
                let mut d = DeviceRecord::new(&upsert.device_id);
                d.id = self.allocate_id();
                d
            });

        device.transport = upsert.transport;
        device.remote_addr = upsert.remote_addr;
        device.expires = upsert.expires;
        device.status = upsert.status;
        device.raw_payload = upsert.raw_payload;
        device.last_register_at = Some(now);
        device.updated_at = now;
        Ok(device.clone())
    }

    async fn touch_device(&self, touch: RuntimeTouch) -> Result<DeviceRecord> {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let device = devices
            .entry(touch.device_id.clone())
            .or_insert_with(|| {
                let mut d = DeviceRecord::new(&touch.device_id);
                d.id = self.allocate_id();
                d
            });

        device.transport = touch.transport;
        device.remote_addr = touch.remote_addr;
        device.status = DeviceStatus::Online;
        device.raw_payload = touch.raw_payload;
        if touch.keepalive {
            device.last_keepalive_at = Some(now);
        }
        device.updated_at = now;
        Ok(device.clone())
    }

    async fn update_device_status(
        &self,
        device_ids: &[String],
        status: DeviceStatus,
    ) -> Result<u64> {
        let mut devices = self.devices.write().await;
        let mut updated = 0;
        for id in device_ids {
            if let Some(device) = devices.get_mut(id) {
                device.status = status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn list_channels(&self, device_id: &str) -> Result<Vec<ChannelRecord>> {
        let channels = self.channels.read().await;
        Ok(channels.get(device_id).cloned().unwrap_or_default())
    }

    async fn replace_channels(&self, device_id: &str, channels: Vec<ChannelRecord>) -> Result<()> {
        let mut all = self.channels.write().await;
        all.insert(device_id.to_string(), channels);
        Ok(())
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if limit > 0 {
            list.truncate(limit);
        }
        Ok(list)
    }

    async fn get_session(&self, call_id: &str) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(call_id).cloned())
    }

    async fn upsert_session(&self, session: SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let mut session = session;
        if let Some(existing) = sessions.get(&session.call_id) {
            session.created_at = existing.created_at;
        }
        sessions.insert(session.call_id.clone(), session);
        Ok(())
    }

    async fn store_invited_session(&self, mut session: SessionRecord) -> Result<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        if let Some(answered) = sessions.get(&session.call_id) {
            session.merge_answered(answered);
        }
        sessions.insert(session.call_id.clone(), session.clone());
        Ok(session)
    }

    async fn insert_event(&self, event: EventRecord) -> Result<()> {
        let mut events = self.events.write().await;
        while events.len() >= self.event_capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}
