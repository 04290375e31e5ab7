// SIP 传输层
// UDP 收发循环、TCP 连接管理与按设备选择发送通道

use crate::error::{Gb28181Error, Result};
use crate::repository::{DeviceRecord, DeviceTransport};
use crate::service::ServiceCore;
use crate::sip::read_sip_frame;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// UDP 接收缓冲区
const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// 报文来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSource {
    pub transport: DeviceTransport,
    pub remote: SocketAddr,
}

impl PacketSource {
    pub fn udp(remote: SocketAddr) -> Self {
        Self {
            transport: DeviceTransport::Udp,
            remote,
        }
    }

    pub fn tcp(remote: SocketAddr) -> Self {
        Self {
            transport: DeviceTransport::Tcp,
            remote,
        }
    }
}

/// TCP 对端：写半部加锁串行化，记录绑定的设备
pub struct TcpPeer {
    addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    last_seen: Mutex<DateTime<Utc>>,
    device_ids: Mutex<HashSet<String>>,
}

impl TcpPeer {
    fn new(addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            addr,
            writer: tokio::sync::Mutex::new(writer),
            last_seen: Mutex::new(Utc::now()),
            device_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now();
    }

    pub fn bind_device(&self, device_id: &str) -> bool {
        self.device_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(device_id.to_string())
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.device_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(device_id)
    }

    /// 写出完整报文
    pub async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        writer.flush().await?;
        self.touch();
        Ok(())
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(target: "gb28181::transport", remote = %self.addr, "TCP shutdown: {}", e);
        }
    }
}

/// 补全 host:port
fn with_default_port(remote: &str, port: u16) -> String {
    let remote = remote.trim();
    if remote.parse::<SocketAddr>().is_ok() {
        return remote.to_string();
    }
    match remote.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => remote.to_string(),
        _ => format!("{}:{}", remote, port),
    }
}

/// 停止信号已触发
async fn stopped(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

impl ServiceCore {
    /// UDP 接收循环
    pub(crate) fn spawn_udp_loop(
        self: &Arc<Self>,
        socket: Arc<UdpSocket>,
        mut signal: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => match res {
                        Ok((0, _)) => continue,
                        Ok((len, addr)) => {
                            let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                            let core = core.clone();
                            tokio::spawn(async move {
                                core.handle_packet(text, PacketSource::udp(addr)).await;
                            });
                        }
                        Err(e) => {
                            if !core.is_running() {
                                break;
                            }
                            warn!(target: "gb28181::transport", "UDP receive failed: {}", e);
                            core.record_error(format!("udp receive: {}", e));
                        }
                    },
                    _ = stopped(&mut signal) => break,
                }
            }
            debug!(target: "gb28181::transport", "UDP loop exited");
        })
    }

    /// TCP 接入循环
    pub(crate) fn spawn_tcp_accept_loop(
        self: &Arc<Self>,
        listener: TcpListener,
        mut signal: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, addr)) => core.accept_peer(stream, addr, signal.clone()).await,
                        Err(e) => {
                            if !core.is_running() {
                                break;
                            }
                            warn!(target: "gb28181::transport", "TCP accept failed: {}", e);
                            core.record_error(format!("tcp accept: {}", e));
                        }
                    },
                    _ = stopped(&mut signal) => break,
                }
            }
            debug!(target: "gb28181::transport", "TCP accept loop exited");
        })
    }

    async fn accept_peer(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        signal: watch::Receiver<bool>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "gb28181::transport", remote = %addr, "set_nodelay failed: {}", e);
        }
        let (reader, writer) = stream.into_split();
        let peer = Arc::new(TcpPeer::new(addr, writer));
        self.tcp_peers.write().await.insert(addr, peer.clone());
        info!(target: "gb28181::transport", remote = %addr, "TCP peer connected");

        let core = self.clone();
        self.track(tokio::spawn(async move {
            core.peer_read_loop(reader, peer, signal).await;
        }));
    }

    /// 单个 TCP 连接的读循环，分帧出错即关闭连接
    async fn peer_read_loop(
        self: Arc<Self>,
        reader: OwnedReadHalf,
        peer: Arc<TcpPeer>,
        mut signal: watch::Receiver<bool>,
    ) {
        let addr = peer.addr();
        let mut reader = BufReader::new(reader);
        loop {
            tokio::select! {
                frame = read_sip_frame(&mut reader) => match frame {
                    Ok(Some(text)) => {
                        peer.touch();
                        self.handle_packet(text, PacketSource::tcp(addr)).await;
                    }
                    Ok(None) => {
                        debug!(target: "gb28181::transport", remote = %addr, "TCP peer closed");
                        break;
                    }
                    Err(e) => {
                        if self.is_running() {
                            warn!(target: "gb28181::transport", remote = %addr, "TCP framing error: {}", e);
                            self.record_error(&e);
                        }
                        break;
                    }
                },
                _ = stopped(&mut signal) => break,
            }
        }

        {
            let mut peers = self.tcp_peers.write().await;
            if peers.get(&addr).is_some_and(|p| Arc::ptr_eq(p, &peer)) {
                peers.remove(&addr);
            }
        }
        peer.close().await;
    }

    /// 把设备绑定到 TCP 对端，用于后续服务端发起的请求
    pub(crate) async fn bind_tcp_device(&self, source: &PacketSource, device_id: &str) {
        if source.transport != DeviceTransport::Tcp {
            return;
        }
        let peers = self.tcp_peers.read().await;
        if let Some(peer) = peers.get(&source.remote) {
            if peer.bind_device(device_id) {
                debug!(
                    target: "gb28181::transport",
                    remote = %source.remote,
                    %device_id,
                    "Device bound to TCP peer"
                );
            }
        }
    }

    async fn find_peer_for_device(&self, device_id: &str) -> Option<Arc<TcpPeer>> {
        let peers = self.tcp_peers.read().await;
        peers
            .values()
            .filter(|p| p.has_device(device_id))
            .max_by_key(|p| p.last_seen())
            .cloned()
    }

    /// 通过共享 UDP 套接字发送
    pub(crate) async fn send_udp(&self, remote: &str, payload: &[u8]) -> Result<()> {
        let socket = self
            .udp_socket()
            .ok_or_else(|| Gb28181Error::transport("UDP listener not running"))?;
        let target = with_default_port(remote, self.config().listen_port);

        let result = async {
            let addr = tokio::net::lookup_host(target.as_str())
                .await?
                .next()
                .ok_or_else(|| Gb28181Error::transport(format!("cannot resolve {}", target)))?;
            socket.send_to(payload, addr).await?;
            Ok::<(), Gb28181Error>(())
        }
        .await;

        self.after_send(&target, result)
    }

    /// 通过 TCP 对端发送
    pub(crate) async fn send_tcp(&self, peer: &TcpPeer, payload: &[u8]) -> Result<()> {
        let result = peer.send(payload).await.map_err(Gb28181Error::from);
        self.after_send(&peer.addr().to_string(), result)
    }

    /// 沿报文来源回复
    pub(crate) async fn reply(&self, source: &PacketSource, payload: &[u8]) -> Result<()> {
        match source.transport {
            DeviceTransport::Udp => self.send_udp(&source.remote.to_string(), payload).await,
            DeviceTransport::Tcp => {
                let peer = self.tcp_peers.read().await.get(&source.remote).cloned();
                match peer {
                    Some(peer) => self.send_tcp(&peer, payload).await,
                    None => {
                        let err = Gb28181Error::transport(format!(
                            "TCP peer {} is gone",
                            source.remote
                        ));
                        self.record_error(&err);
                        Err(err)
                    }
                }
            }
        }
    }

    /// 向设备发送服务端发起的请求
    pub(crate) async fn send_to_device(&self, device: &DeviceRecord, payload: &[u8]) -> Result<()> {
        match device.transport {
            DeviceTransport::Udp => self.send_udp(&device.remote_addr, payload).await,
            DeviceTransport::Tcp => match self.find_peer_for_device(&device.device_id).await {
                Some(peer) => self.send_tcp(&peer, payload).await,
                None => {
                    let err = Gb28181Error::PeerNotBound(device.device_id.clone());
                    self.record_error(&err);
                    Err(err)
                }
            },
        }
    }

    fn after_send(&self, target: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!(target: "gb28181::transport", %target, "SIP send failed: {}", e);
                self.record_error(format!("send to {}: {}", target, e));
                Err(e)
            }
        }
    }
}
