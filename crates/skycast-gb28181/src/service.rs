// GB28181 信令服务
// 生命周期（启动/停止/更新配置）、运行状态与对外操作入口

use crate::auth::NonceStore;
use crate::config::{Gb28181Config, TransportMode};
use crate::error::{Gb28181Error, Result};
use crate::housekeeping::SweepReport;
use crate::media_port::MediaPortAllocator;
use crate::repository::{Gb28181Repository, SessionRecord};
use crate::session::InviteRequest;
use crate::transport::TcpPeer;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 配置变更重启时的等待时间
const RESTART_DEADLINE: Duration = Duration::from_secs(5);

/// 受主锁保护的运行期状态
pub(crate) struct RuntimeState {
    pub(crate) config: Gb28181Config,
    pub(crate) running: bool,
    pub(crate) bind_addrs: Vec<String>,
    pub(crate) last_packet_at: Option<DateTime<Utc>>,
    pub(crate) last_error: String,
    pub(crate) udp: Option<Arc<UdpSocket>>,
}

/// 服务内部共享状态，监听任务与外部调用共用
pub(crate) struct ServiceCore {
    state: RwLock<RuntimeState>,
    pub(crate) repo: Arc<dyn Gb28181Repository>,
    pub(crate) data_dir: PathBuf,
    pub(crate) nonces: NonceStore,
    pub(crate) ports: MediaPortAllocator,
    pub(crate) tcp_peers: tokio::sync::RwLock<HashMap<SocketAddr, Arc<TcpPeer>>>,
    pub(crate) received: AtomicU64,
    pub(crate) sent: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl ServiceCore {
    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, RuntimeState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, RuntimeState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn config(&self) -> Gb28181Config {
        self.read_state().config.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.read_state().running
    }

    pub(crate) fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.read_state().udp.clone()
    }

    /// 记录最近一次错误
    pub(crate) fn record_error(&self, err: impl std::fmt::Display) {
        self.write_state().last_error = err.to_string();
    }

    pub(crate) fn mark_packet(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.write_state().last_packet_at = Some(Utc::now());
    }

    /// 当前的停止信号接收端
    pub(crate) fn shutdown_signal(&self) -> Option<watch::Receiver<bool>> {
        self.lock_shutdown().as_ref().map(|tx| tx.subscribe())
    }

    /// 登记后台任务，顺带清理已结束的句柄
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.lock_tasks();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.shutdown.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 运行状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub running: bool,
    pub bind_addrs: Vec<String>,
    pub transport: TransportMode,
    pub received: u64,
    pub sent: u64,
    pub last_packet_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub media_port_start: u16,
    pub media_port_end: u16,
    pub media_port_used: usize,
    pub media_port_free: usize,
    pub media_port_leases: Vec<u16>,
}

/// GB28181 信令服务
pub struct Gb28181Service {
    core: Arc<ServiceCore>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Gb28181Service {
    pub fn new(
        config: Gb28181Config,
        repo: Arc<dyn Gb28181Repository>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let ports = MediaPortAllocator::new(&config);
        let core = ServiceCore {
            state: RwLock::new(RuntimeState {
                config,
                running: false,
                bind_addrs: Vec::new(),
                last_packet_at: None,
                last_error: String::new(),
                udp: None,
            }),
            repo,
            data_dir: data_dir.into(),
            nonces: NonceStore::new(),
            ports,
            tcp_peers: tokio::sync::RwLock::new(HashMap::new()),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        };

        Self {
            core: Arc::new(core),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// 启动监听与维护任务
    pub async fn start(&self, deadline: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(deadline).await
    }

    /// 停止服务，等待后台任务退出
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(deadline).await
    }

    /// 更新配置，信令相关字段变化且服务运行中时重启
    pub async fn update_config(&self, config: Gb28181Config) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let (old, running) = {
            let mut st = self.core.write_state();
            let old = std::mem::replace(&mut st.config, config.clone());
            (old, st.running)
        };

        if !running {
            self.core.ports.reset(&config);
            return Ok(());
        }
        if !old.requires_restart(&config) {
            return Ok(());
        }

        info!(target: "gb28181::service", "GB28181 config changed, restarting");
        self.stop_locked(RESTART_DEADLINE).await?;
        self.start_locked(RESTART_DEADLINE).await
    }

    pub fn config(&self) -> Gb28181Config {
        self.core.config()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    #[cfg(test)]
    pub(crate) fn core_for_test(&self) -> &Arc<ServiceCore> {
        &self.core
    }

    pub fn data_dir(&self) -> &Path {
        &self.core.data_dir
    }

    pub fn repository(&self) -> Arc<dyn Gb28181Repository> {
        self.core.repo.clone()
    }

    pub fn status(&self) -> RuntimeStatus {
        let snapshot = self.core.ports.snapshot();
        let st = self.core.read_state();
        RuntimeStatus {
            running: st.running,
            bind_addrs: st.bind_addrs.clone(),
            transport: st.config.transport,
            received: self.core.received.load(Ordering::Relaxed),
            sent: self.core.sent.load(Ordering::Relaxed),
            last_packet_at: st.last_packet_at,
            last_error: st.last_error.clone(),
            media_port_start: snapshot.start,
            media_port_end: snapshot.end,
            media_port_used: snapshot.used,
            media_port_free: snapshot.free(),
            media_port_leases: snapshot.ports,
        }
    }

    /// 发起实时点播
    pub async fn invite(&self, req: InviteRequest) -> Result<SessionRecord> {
        self.core.invite(req).await
    }

    /// 以新端口重新点播
    pub async fn reinvite(&self, call_id: &str) -> Result<SessionRecord> {
        self.core.reinvite(call_id).await
    }

    /// 结束点播
    pub async fn bye(&self, call_id: &str) -> Result<()> {
        self.core.bye(call_id).await
    }

    /// 向设备发送目录查询
    pub async fn query_catalog(&self, device_id: &str) -> Result<()> {
        self.core.query_catalog(device_id).await
    }

    /// 导出会话 SDP 文件，返回文件路径
    pub async fn export_session_sdp(&self, call_id: &str) -> Result<PathBuf> {
        self.core.export_session_sdp(call_id).await
    }

    /// 立即执行一次维护
    pub async fn run_housekeeping_once(&self) -> Result<SweepReport> {
        self.core.run_housekeeping_once().await
    }

    async fn start_locked(&self, deadline: Duration) -> Result<()> {
        let cfg = self.core.config();
        if !cfg.enabled {
            info!(target: "gb28181::service", "GB28181 disabled, skip start");
            return Ok(());
        }
        if self.core.is_running() {
            return Err(Gb28181Error::AlreadyRunning);
        }

        match tokio::time::timeout(deadline, self.open_listeners(&cfg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if let Err(stop_err) = self.stop_locked(deadline).await {
                    warn!(target: "gb28181::service", "Stop after failed start: {}", stop_err);
                }
                Err(e)
            }
            Err(_) => {
                if let Err(stop_err) = self.stop_locked(deadline).await {
                    warn!(target: "gb28181::service", "Stop after start timeout: {}", stop_err);
                }
                Err(Gb28181Error::Timeout)
            }
        }
    }

    async fn open_listeners(&self, cfg: &Gb28181Config) -> Result<()> {
        let core = &self.core;
        core.received.store(0, Ordering::Relaxed);
        core.sent.store(0, Ordering::Relaxed);
        core.ports.reset(cfg);
        {
            let mut st = core.write_state();
            st.bind_addrs.clear();
            st.last_error.clear();
            st.last_packet_at = None;
        }

        let (shutdown_tx, _) = watch::channel(false);
        *core.lock_shutdown() = Some(shutdown_tx);

        let listen_addr = cfg.listen_addr();
        let mut errors: Vec<String> = Vec::new();
        let mut bind_addrs = Vec::new();

        let mut udp = None;
        if cfg.transport.wants_udp() {
            match UdpSocket::bind(&listen_addr).await {
                Ok(socket) => {
                    let local = socket.local_addr()?;
                    bind_addrs.push(format!("udp://{}", local));
                    udp = Some(Arc::new(socket));
                }
                Err(e) => errors.push(format!("udp listen {}: {}", listen_addr, e)),
            }
        }

        let mut tcp = None;
        if cfg.transport.wants_tcp() {
            match TcpListener::bind(&listen_addr).await {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    bind_addrs.push(format!("tcp://{}", local));
                    tcp = Some(listener);
                }
                Err(e) => errors.push(format!("tcp listen {}: {}", listen_addr, e)),
            }
        }

        if udp.is_none() && tcp.is_none() {
            let msg = if errors.is_empty() {
                "no listener configured".to_string()
            } else {
                errors.join("; ")
            };
            error!(target: "gb28181::service", "GB28181 start failed: {}", msg);
            core.record_error(&msg);
            return Err(Gb28181Error::Transport(msg));
        }

        {
            let mut st = core.write_state();
            st.running = true;
            st.udp = udp.clone();
            st.bind_addrs = bind_addrs.clone();
            if !errors.is_empty() {
                st.last_error = errors.join("; ");
            }
        }
        if !errors.is_empty() {
            warn!(
                target: "gb28181::service",
                "GB28181 partial startup: {}",
                errors.join("; ")
            );
        }

        let Some(signal) = core.shutdown_signal() else {
            return Err(Gb28181Error::NotRunning);
        };
        if let Some(socket) = udp {
            core.track(core.spawn_udp_loop(socket, signal.clone()));
        }
        if let Some(listener) = tcp {
            core.track(core.spawn_tcp_accept_loop(listener, signal.clone()));
        }

        match core.repo.list_sessions(None, 0).await {
            Ok(sessions) => {
                let restored = core.ports.resync(&sessions);
                info!(
                    target: "gb28181::service",
                    restored,
                    "Media port leases resynced from sessions"
                );
            }
            Err(e) => {
                warn!(target: "gb28181::service", "Media port resync failed: {}", e);
                core.record_error(&e);
            }
        }

        core.track(core.spawn_housekeeping(signal));

        info!(
            target: "gb28181::service",
            bind = ?bind_addrs,
            transport = %cfg.transport,
            "GB28181 service started"
        );
        Ok(())
    }

    async fn stop_locked(&self, deadline: Duration) -> Result<()> {
        let core = &self.core;
        let was_running = {
            let mut st = core.write_state();
            let was = st.running;
            st.running = false;
            st.bind_addrs.clear();
            st.udp = None;
            was
        };

        if let Some(tx) = core.lock_shutdown().take() {
            let _ = tx.send(true);
        }

        let peers: Vec<Arc<TcpPeer>> = {
            let mut map = core.tcp_peers.write().await;
            map.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.close().await;
        }

        let cfg = core.config();
        core.ports.reset(&cfg);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *core.lock_tasks());
        if handles.is_empty() {
            return Ok(());
        }

        match tokio::time::timeout(deadline, join_all(handles)).await {
            Ok(_) => {
                if was_running {
                    info!(target: "gb28181::service", "GB28181 service stopped");
                }
                Ok(())
            }
            Err(_) => {
                warn!(target: "gb28181::service", "GB28181 stop deadline elapsed");
                Err(Gb28181Error::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::repository::SessionStatus;
    use crate::sdp::SdpSession;

    fn test_config() -> Gb28181Config {
        Gb28181Config {
            listen_ip: "127.0.0.1".to_string(),
            listen_port: 0,
            transport: TransportMode::Both,
            media_port_start: 30000,
            media_port_end: 30002,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let repo = Arc::new(MemoryRepository::new());
        let service = Gb28181Service::new(test_config(), repo, std::env::temp_dir());

        service.start(Duration::from_secs(5)).await.unwrap();
        let status = service.status();
        assert!(status.running);
        assert_eq!(status.bind_addrs.len(), 2);
        assert!(matches!(
            service.start(Duration::from_secs(5)).await,
            Err(Gb28181Error::AlreadyRunning)
        ));

        service.stop(Duration::from_secs(5)).await.unwrap();
        let status = service.status();
        assert!(!status.running);
        assert!(status.bind_addrs.is_empty());
        assert_eq!(status.media_port_used, 0);
        assert!(service.core.tcp_peers.read().await.is_empty());

        // 重复停止无副作用
        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_disabled_is_noop() {
        let mut cfg = test_config();
        cfg.enabled = false;
        let service = Gb28181Service::new(cfg, Arc::new(MemoryRepository::new()), std::env::temp_dir());
        service.start(Duration::from_secs(1)).await.unwrap();
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_resyncs_leases() {
        let repo = Arc::new(MemoryRepository::new());
        for (call_id, port, status) in [
            ("a", 30000, SessionStatus::Inviting),
            ("b", 30002, SessionStatus::Established),
            ("c", 30001, SessionStatus::Failed),
        ] {
            let mut s = SessionRecord::new(call_id, "dev", "ch");
            s.status = status;
            s.sdp_body = SdpSession::play("srv", "127.0.0.1", port, "0000000001").to_string();
            repo.upsert_session(s).await.unwrap();
        }

        let service = Gb28181Service::new(test_config(), repo, std::env::temp_dir());
        service.start(Duration::from_secs(5)).await.unwrap();
        assert_eq!(service.status().media_port_leases, vec![30000, 30002]);
        service.stop(Duration::from_secs(5)).await.unwrap();
        assert!(service.status().media_port_leases.is_empty());
    }

    #[tokio::test]
    async fn test_update_config_when_stopped_resets_range() {
        let service = Gb28181Service::new(
            test_config(),
            Arc::new(MemoryRepository::new()),
            std::env::temp_dir(),
        );
        let mut cfg = test_config();
        cfg.media_port_start = 40000;
        cfg.media_port_end = 40010;
        service.update_config(cfg).await.unwrap();
        let status = service.status();
        assert_eq!((status.media_port_start, status.media_port_end), (40000, 40010));
    }

    #[tokio::test]
    async fn test_update_config_restarts_running_service() {
        let service = Gb28181Service::new(
            test_config(),
            Arc::new(MemoryRepository::new()),
            std::env::temp_dir(),
        );
        service.start(Duration::from_secs(5)).await.unwrap();

        let mut cfg = test_config();
        cfg.transport = TransportMode::Udp;
        service.update_config(cfg).await.unwrap();
        let status = service.status();
        assert!(status.running);
        assert_eq!(status.bind_addrs.len(), 1);
        assert!(status.bind_addrs[0].starts_with("udp://"));

        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let service = Gb28181Service::new(
            test_config(),
            Arc::new(MemoryRepository::new()),
            std::env::temp_dir(),
        );
        let v = serde_json::to_value(service.status()).unwrap();
        assert_eq!(v["running"], false);
        assert_eq!(v["transport"], "both");
        assert_eq!(v["mediaPortStart"], 30000);
        assert_eq!(v["mediaPortFree"], 3);
        assert!(v["lastPacketAt"].is_null());
        assert!(v.get("media_port_start").is_none());
    }
}
