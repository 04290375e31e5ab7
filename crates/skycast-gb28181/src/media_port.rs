// 媒体端口池
// 按 Call-ID 租用 RTP 接收端口，游标轮转分配

use crate::config::Gb28181Config;
use crate::error::{Gb28181Error, Result};
use crate::repository::SessionRecord;
use crate::sdp;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// 端口池最多 4001 个端口
const MAX_SPAN: u32 = 4000;

/// 归一化后的端口范围（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn from_config(cfg: &Gb28181Config) -> Self {
        let mut start = u32::from(cfg.media_port_start);
        if start == 0 {
            start = u32::from(cfg.media_port);
        }
        if start == 0 {
            start = 30000;
        }

        let mut end = u32::from(cfg.media_port_end);
        if end == 0 {
            end = start + 100;
        }
        if end < start {
            std::mem::swap(&mut start, &mut end);
        }
        if end - start > MAX_SPAN {
            end = start + MAX_SPAN;
        }
        let end = end.min(u32::from(u16::MAX));

        Self {
            start: start as u16,
            end: end as u16,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn size(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

/// 端口占用快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSnapshot {
    pub start: u16,
    pub end: u16,
    pub used: usize,
    pub ports: Vec<u16>,
}

impl PortSnapshot {
    pub fn free(&self) -> usize {
        (usize::from(self.end - self.start) + 1).saturating_sub(self.used)
    }
}

#[derive(Debug)]
struct PoolState {
    range: PortRange,
    cursor: u16,
    by_call: HashMap<String, u16>,
    by_port: HashMap<u16, String>,
}

impl PoolState {
    fn clear(&mut self) {
        self.by_call.clear();
        self.by_port.clear();
        self.cursor = self.range.start;
    }

    fn remove_call(&mut self, call_id: &str) -> Option<u16> {
        let port = self.by_call.remove(call_id)?;
        if self.by_port.get(&port).map(String::as_str) == Some(call_id) {
            self.by_port.remove(&port);
        }
        Some(port)
    }

    fn insert(&mut self, call_id: &str, port: u16) {
        self.by_call.insert(call_id.to_string(), port);
        self.by_port.insert(port, call_id.to_string());
    }
}

/// 媒体端口分配器
#[derive(Debug)]
pub struct MediaPortAllocator {
    state: Mutex<PoolState>,
}

impl MediaPortAllocator {
    pub fn new(cfg: &Gb28181Config) -> Self {
        let range = PortRange::from_config(cfg);
        Self {
            state: Mutex::new(PoolState {
                range,
                cursor: range.start,
                by_call: HashMap::new(),
                by_port: HashMap::new(),
            }),
        }
    }

    pub fn range(&self) -> PortRange {
        self.lock().range
    }

    /// 为 Call-ID 租用端口，重复调用返回同一端口
    pub fn lease(&self, call_id: &str) -> Result<u16> {
        let mut st = self.lock();
        if let Some(port) = st.by_call.get(call_id) {
            return Ok(*port);
        }

        let range = st.range;
        let span = range.size();
        let mut candidate = st.cursor;
        for _ in 0..span {
            if !range.contains(candidate) {
                candidate = range.start;
            }
            if !st.by_port.contains_key(&candidate) {
                st.insert(call_id, candidate);
                st.cursor = if candidate >= range.end {
                    range.start
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
            candidate = if candidate >= range.end {
                range.start
            } else {
                candidate + 1
            };
        }

        Err(Gb28181Error::PortPoolExhausted)
    }

    /// 为 Call-ID 预留指定端口
    pub fn reserve(&self, call_id: &str, port: u16) -> Result<()> {
        let mut st = self.lock();
        let range = st.range;
        if !range.contains(port) {
            return Err(Gb28181Error::PortOutOfRange {
                port,
                start: range.start,
                end: range.end,
            });
        }

        if let Some(owner) = st.by_port.get(&port) {
            if owner == call_id {
                return Ok(());
            }
            return Err(Gb28181Error::PortOccupied {
                port,
                call_id: owner.clone(),
            });
        }

        st.remove_call(call_id);
        st.insert(call_id, port);
        Ok(())
    }

    /// 释放 Call-ID 占用的端口，返回被释放的端口
    pub fn release(&self, call_id: &str) -> Option<u16> {
        self.lock().remove_call(call_id)
    }

    pub fn port_of(&self, call_id: &str) -> Option<u16> {
        self.lock().by_call.get(call_id).copied()
    }

    pub fn snapshot(&self) -> PortSnapshot {
        let st = self.lock();
        let mut ports: Vec<u16> = st.by_port.keys().copied().collect();
        ports.sort_unstable();
        PortSnapshot {
            start: st.range.start,
            end: st.range.end,
            used: ports.len(),
            ports,
        }
    }

    /// 从持久化会话重建租约表，返回恢复的租约数
    pub fn resync<'a, I>(&self, sessions: I) -> usize
    where
        I: IntoIterator<Item = &'a SessionRecord>,
    {
        let mut st = self.lock();
        st.clear();

        let mut restored = 0;
        for session in sessions {
            if session.status.is_terminal() || session.call_id.is_empty() {
                continue;
            }
            let Some(port) = sdp::parse_media_info(&session.sdp_body).media_port else {
                continue;
            };
            if !st.range.contains(port) {
                continue;
            }
            match st.by_port.get(&port) {
                Some(owner) if owner != &session.call_id => {
                    tracing::warn!(
                        target: "gb28181::media",
                        call_id = %session.call_id,
                        port,
                        owner = %owner,
                        "Media port already claimed during resync",
                    );
                    continue;
                }
                _ => {}
            }
            st.remove_call(&session.call_id);
            st.insert(&session.call_id, port);
            restored += 1;
        }
        restored
    }

    /// 清空租约并按新配置重置范围
    pub fn reset(&self, cfg: &Gb28181Config) {
        let mut st = self.lock();
        st.range = PortRange::from_config(cfg);
        st.clear();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let st = self.lock();
        assert_eq!(st.by_call.len(), st.by_port.len());
        for (call, port) in &st.by_call {
            assert_eq!(st.by_port.get(port), Some(call));
        }
        assert!(st.range.contains(st.cursor));
    }
}
