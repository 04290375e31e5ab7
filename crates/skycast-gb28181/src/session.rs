// 点播会话管理
// INVITE/重新点播/BYE/目录查询/SDP 导出

use crate::config::Gb28181Config;
use crate::error::{Gb28181Error, Result};
use crate::manscdp;
use crate::repository::{DeviceRecord, DeviceTransport, EventRecord, SessionRecord, SessionStatus};
use crate::sdp::{self, SdpSession};
use crate::service::ServiceCore;
use crate::sip::{SipMethod, SipRequest};
use crate::util;
use chrono::Utc;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// 回退端口
const FALLBACK_MEDIA_PORT: u16 = 30000;

/// 点播请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InviteRequest {
    pub device_id: String,
    pub channel_id: String,
    pub media_ip: Option<String>,
    pub media_port: Option<u16>,
    pub ssrc: Option<String>,
    pub stream_id: Option<String>,
}

/// 会话 ID 转为安全文件名
pub fn sanitize_call_id(call_id: &str) -> String {
    let replaced: String = call_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed: String = replaced
        .trim_matches(|c| c == '.' || c == '_')
        .chars()
        .take(128)
        .collect();
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// 连接到设备 9 端口探测本机出口 IP
async fn probe_local_ip(remote: &str) -> Option<IpAddr> {
    let host = match remote.parse::<std::net::SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => remote.rsplit_once(':').map_or(remote, |(h, _)| h).to_string(),
    };
    if host.is_empty() {
        return None;
    }
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect((host.as_str(), 9)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

impl ServiceCore {
    async fn load_device(&self, device_id: &str) -> Result<DeviceRecord> {
        self.repo
            .get_device_by_device_id(device_id)
            .await?
            .ok_or_else(|| Gb28181Error::DeviceNotFound(device_id.to_string()))
    }

    async fn load_session(&self, call_id: &str) -> Result<SessionRecord> {
        self.repo
            .get_session(call_id)
            .await?
            .ok_or_else(|| Gb28181Error::SessionNotFound(call_id.to_string()))
    }

    /// 本端信令地址：监听 IP，通配时用到设备的出口 IP
    async fn local_signal_host(&self, cfg: &Gb28181Config, device: &DeviceRecord) -> String {
        let probed = probe_local_ip(&device.remote_addr)
            .await
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        cfg.signal_host(&probed).to_string()
    }

    /// 媒体端口：指定端口走预留，否则租用，租用失败依次尝试单端口配置和 30000
    fn acquire_media_port(
        &self,
        call_id: &str,
        requested: Option<u16>,
        cfg: &Gb28181Config,
    ) -> Result<u16> {
        if let Some(port) = requested.filter(|p| *p > 0) {
            self.ports.reserve(call_id, port)?;
            return Ok(port);
        }

        match self.ports.lease(call_id) {
            Ok(port) => Ok(port),
            Err(lease_err) => {
                for fallback in [cfg.media_port, FALLBACK_MEDIA_PORT] {
                    if fallback > 0 && self.ports.reserve(call_id, fallback).is_ok() {
                        return Ok(fallback);
                    }
                }
                Err(lease_err)
            }
        }
    }

    fn via_header(&self, cfg: &Gb28181Config, device: &DeviceRecord, host: &str, branch: &str) -> String {
        let proto = match device.transport {
            DeviceTransport::Udp => "UDP",
            DeviceTransport::Tcp => "TCP",
        };
        format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            proto, host, cfg.listen_port, branch
        )
    }

    /// 发起实时点播
    pub(crate) async fn invite(&self, req: InviteRequest) -> Result<SessionRecord> {
        if !self.is_running() {
            return Err(Gb28181Error::NotRunning);
        }
        let cfg = self.config();

        let device = self.load_device(req.device_id.trim()).await?;
        let channel_id = req.channel_id.trim().to_string();
        if channel_id.is_empty() {
            return Err(Gb28181Error::InvalidArgument("channel_id is required".to_string()));
        }

        let media_ip = match non_empty(req.media_ip.as_deref())
            .or_else(|| non_empty(Some(cfg.media_ip.as_str())))
        {
            Some(ip) => ip,
            None => probe_local_ip(&device.remote_addr)
                .await
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        };

        let call_id = util::new_call_id();
        let branch = util::new_branch();
        let ssrc = non_empty(req.ssrc.as_deref()).unwrap_or_else(util::new_ssrc);
        let stream_id = non_empty(req.stream_id.as_deref()).unwrap_or_else(|| channel_id.clone());

        let media_port = self.acquire_media_port(&call_id, req.media_port, &cfg)?;

        let sdp_body = SdpSession::play(&cfg.server_id, &media_ip, media_port, &ssrc).to_string();
        let host = self.local_signal_host(&cfg, &device).await;

        let mut request = SipRequest::new(
            SipMethod::Invite,
            format!("sip:{}@{}", channel_id, device.remote_addr),
        );
        request
            .add_header("Via", self.via_header(&cfg, &device, &host, &branch))
            .add_header(
                "From",
                format!("<sip:{}@{}>;tag={}", cfg.server_id, cfg.realm, util::new_tag()),
            )
            .add_header("To", format!("<sip:{}@{}>", channel_id, cfg.realm))
            .add_header("Call-ID", call_id.clone())
            .add_header("CSeq", "1 INVITE")
            .add_header(
                "Contact",
                format!("<sip:{}@{}:{}>", cfg.server_id, host, cfg.listen_port),
            )
            .add_header("Max-Forwards", "70")
            .add_header("Subject", format!("{}:{},{}:0", channel_id, ssrc, cfg.server_id))
            .add_header("Content-Type", "Application/SDP")
            .add_header("User-Agent", cfg.user_agent.clone())
            .set_body(sdp_body.clone());

        if let Err(e) = self.send_to_device(&device, request.encode().as_bytes()).await {
            self.ports.release(&call_id);
            return Err(e);
        }

        let mut session = SessionRecord::new(&call_id, &device.device_id, &channel_id);
        session.branch = branch;
        session.stream_id = stream_id;
        session.remote_addr = device.remote_addr.clone();
        session.status = SessionStatus::Inviting;
        session.sdp_body = sdp_body;

        let session = match self.repo.store_invited_session(session).await {
            Ok(stored) => stored,
            Err(e) => {
                self.ports.release(&call_id);
                self.record_error(&e);
                return Err(e);
            }
        };
        if session.status != SessionStatus::Inviting {
            info!(
                target: "gb28181::session",
                %call_id,
                state = session.status.as_str(),
                "INVITE answered before session was stored"
            );
        }

        info!(
            target: "gb28181::session",
            %call_id,
            device_id = %device.device_id,
            %channel_id,
            media_port,
            "INVITE sent"
        );
        self.record_event(
            EventRecord::new("invite", &device.device_id)
                .with_call_id(&call_id)
                .with_detail(format!("channel={} port={}", channel_id, media_port)),
        )
        .await;

        Ok(session)
    }

    /// 基于旧会话重新点播
    pub(crate) async fn reinvite(&self, call_id: &str) -> Result<SessionRecord> {
        let prior = self.load_session(call_id).await?;
        let info = sdp::parse_media_info(&prior.sdp_body);

        let session = self
            .invite(InviteRequest {
                device_id: prior.device_id.clone(),
                channel_id: prior.channel_id.clone(),
                media_ip: info.media_ip,
                media_port: None,
                ssrc: info.ssrc,
                stream_id: Some(prior.stream_id.clone()),
            })
            .await?;

        if prior.status != SessionStatus::Established {
            self.ports.release(&prior.call_id);
        }
        info!(
            target: "gb28181::session",
            prior = %prior.call_id,
            call_id = %session.call_id,
            "Session re-invited"
        );
        Ok(session)
    }

    /// 结束会话：先发送 BYE，本地状态无论发送结果都会清理
    pub(crate) async fn bye(&self, call_id: &str) -> Result<()> {
        let mut session = self.load_session(call_id).await?;
        let cfg = self.config();

        let sent = async {
            let device = self.load_device(&session.device_id).await?;
            let host = self.local_signal_host(&cfg, &device).await;
            let branch = if session.branch.is_empty() {
                util::new_branch()
            } else {
                session.branch.clone()
            };

            let mut request = SipRequest::new(
                SipMethod::Bye,
                format!("sip:{}@{}", session.channel_id, device.remote_addr),
            );
            request
                .add_header("Via", self.via_header(&cfg, &device, &host, &branch))
                .add_header(
                    "From",
                    format!("<sip:{}@{}>;tag={}", cfg.server_id, cfg.realm, util::new_tag()),
                )
                .add_header("To", format!("<sip:{}@{}>", session.channel_id, cfg.realm))
                .add_header("Call-ID", session.call_id.clone())
                .add_header("CSeq", "2 BYE")
                .add_header("Max-Forwards", "70")
                .add_header("User-Agent", cfg.user_agent.clone());
            self.send_to_device(&device, request.encode().as_bytes()).await
        }
        .await;

        session.status = SessionStatus::Terminated;
        session.updated_at = Utc::now();
        let device_id = session.device_id.clone();
        let persisted = self.repo.upsert_session(session).await;
        self.ports.release(call_id);

        self.record_event(EventRecord::new("bye", device_id).with_call_id(call_id))
            .await;

        if let Err(e) = &sent {
            warn!(target: "gb28181::session", %call_id, "BYE not delivered: {}", e);
        }
        sent?;
        persisted?;
        info!(target: "gb28181::session", %call_id, "Session terminated");
        Ok(())
    }

    /// 发送目录查询
    pub(crate) async fn query_catalog(&self, device_id: &str) -> Result<()> {
        let cfg = self.config();
        let device = self.load_device(device_id).await?;
        let host = self.local_signal_host(&cfg, &device).await;
        let sn = manscdp::next_sn();

        let mut request = SipRequest::new(
            SipMethod::Message,
            format!("sip:{}@{}", device.device_id, device.remote_addr),
        );
        request
            .add_header("Via", self.via_header(&cfg, &device, &host, &util::new_branch()))
            .add_header(
                "From",
                format!("<sip:{}@{}>;tag={}", cfg.server_id, cfg.realm, util::new_tag()),
            )
            .add_header("To", format!("<sip:{}@{}>", device.device_id, cfg.realm))
            .add_header("Call-ID", util::new_call_id())
            .add_header("CSeq", "1 MESSAGE")
            .add_header("Max-Forwards", "70")
            .add_header("Content-Type", "Application/MANSCDP+xml")
            .add_header("User-Agent", cfg.user_agent.clone())
            .set_body(manscdp::catalog_query_xml(&device.device_id, sn));

        self.send_to_device(&device, request.encode().as_bytes()).await?;
        info!(target: "gb28181::session", %device_id, sn, "Catalog query sent");
        Ok(())
    }

    /// 导出会话 SDP 到 `<data_dir>/gb28181/sdp/<call_id>.sdp`
    pub(crate) async fn export_session_sdp(&self, call_id: &str) -> Result<PathBuf> {
        let session = self.load_session(call_id).await?;
        let cfg = self.config();
        let info = sdp::parse_media_info(&session.sdp_body);

        let media_ip = info
            .media_ip
            .or_else(|| non_empty(Some(cfg.listen_ip.as_str())))
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let media_port = info.media_port.unwrap_or(cfg.media_port);
        let ssrc = info.ssrc.unwrap_or_else(util::new_ssrc);
        let body = SdpSession::play(&cfg.server_id, &media_ip, media_port, &ssrc).to_string();

        let dir = self.data_dir.join("gb28181").join("sdp");
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(&dir).await?;

        let path = dir.join(format!("{}.sdp", sanitize_call_id(&session.call_id)));
        tokio::fs::write(&path, body.as_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        info!(target: "gb28181::session", %call_id, path = %path.display(), "Session SDP exported");
        Ok(path)
    }
}
