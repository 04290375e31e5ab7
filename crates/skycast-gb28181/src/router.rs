// SIP 消息分发
// REGISTER/MESSAGE/INVITE 应答/BYE 应答等处理

use crate::auth::{self, DigestContext};
use crate::error::Result;
use crate::manscdp::{self, CmdType};
use crate::repository::{
    ChannelRecord, DeviceStatus, EventRecord, RegisterUpsert, RuntimeTouch, SessionRecord,
    SessionStatus,
};
use crate::service::ServiceCore;
use crate::sip::{extract_sip_uri, header_param, sip_user, SipMessage, SipMethod, SipRequest, SipResponse};
use crate::transport::PacketSource;
use chrono::{Local, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// 解析 Expires 取值：空值或负数视为缺省
fn parse_expires(value: Option<&str>) -> Option<u32> {
    let v = value?.trim();
    if v.is_empty() {
        return None;
    }
    let n: i64 = v.parse().ok()?;
    if n < 0 {
        return None;
    }
    Some(u32::try_from(n).unwrap_or(u32::MAX))
}

/// GB28181 校时格式
fn gb_date() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// REGISTER 的设备 ID：From → To → Authorization
fn register_device_id(msg: &SipMessage) -> Option<String> {
    if let Some(id) = msg.header("From").and_then(sip_user) {
        return Some(id.to_string());
    }
    if let Some(id) = msg.header("To").and_then(sip_user) {
        return Some(id.to_string());
    }
    let params = auth::parse_digest_params(msg.header("Authorization")?)?;
    params
        .get("uri")
        .and_then(|uri| sip_user(uri))
        .map(str::to_string)
        .or_else(|| {
            params
                .get("username")
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
        })
}

impl ServiceCore {
    /// 入口：解码并分发一条报文
    pub(crate) async fn handle_packet(self: &Arc<Self>, text: String, source: PacketSource) {
        self.mark_packet();

        let msg = match SipMessage::parse(&text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(target: "gb28181::sip", remote = %source.remote, "Drop malformed SIP packet: {}", e);
                self.record_error(&e);
                return;
            }
        };

        let span = tracing::info_span!(
            "gb28181.sip.handle_message",
            remote = %source.remote,
            transport = %source.transport,
            call_id = msg.call_id().unwrap_or_default(),
        );
        if let Err(e) = self.dispatch(msg, source).instrument(span).await {
            warn!(target: "gb28181::sip", remote = %source.remote, "SIP handling failed: {}", e);
            self.record_error(&e);
        }
    }

    pub(crate) async fn dispatch(self: &Arc<Self>, msg: SipMessage, source: PacketSource) -> Result<()> {
        if msg.is_response() {
            return self.handle_response(&msg, &source).await;
        }

        let method = msg.method.clone().unwrap_or_else(|| SipMethod::Other(String::new()));
        match method {
            SipMethod::Register => self.handle_register(&msg, &source).await,
            SipMethod::Message => self.handle_message(&msg, &source).await,
            SipMethod::Bye => self.handle_inbound_bye(&msg, &source).await,
            SipMethod::Invite => {
                let device_id = msg.header("From").and_then(sip_user).unwrap_or_default();
                self.record_event(
                    EventRecord::new("inbound_invite", device_id)
                        .with_call_id(msg.call_id().unwrap_or_default()),
                )
                .await;
                self.respond_ok(&msg, &source).await
            }
            SipMethod::Options | SipMethod::Subscribe | SipMethod::Notify | SipMethod::Ack => {
                debug!(target: "gb28181::sip", method = %method, "Accept request");
                self.respond_ok(&msg, &source).await
            }
            other => {
                debug!(target: "gb28181::sip", method = %other, "Method not allowed");
                let resp = SipResponse::for_request(&msg, 405);
                self.reply(&source, resp.encode().as_bytes()).await
            }
        }
    }

    async fn respond_ok(&self, msg: &SipMessage, source: &PacketSource) -> Result<()> {
        let user_agent = self.config().user_agent;
        let mut resp = SipResponse::for_request(msg, 200);
        resp.add_header("User-Agent", user_agent);
        self.reply(source, resp.encode().as_bytes()).await
    }

    /// 写事件行，失败只记录日志
    pub(crate) async fn record_event(&self, event: EventRecord) {
        if let Err(e) = self.repo.insert_event(event).await {
            warn!(target: "gb28181::sip", "Insert event failed: {}", e);
            self.record_error(&e);
        }
    }

    async fn handle_register(self: &Arc<Self>, msg: &SipMessage, source: &PacketSource) -> Result<()> {
        let cfg = self.config();

        let Some(device_id) = register_device_id(msg) else {
            warn!(target: "gb28181::sip", "REGISTER without device id");
            let resp = SipResponse::for_request(msg, 400);
            return self.reply(source, resp.encode().as_bytes()).await;
        };

        let existing = self.repo.get_device_by_device_id(&device_id).await?;
        let password = existing
            .as_ref()
            .and_then(|d| d.password_override())
            .map(str::to_string)
            .unwrap_or_else(|| cfg.password.trim().to_string());

        if !password.is_empty() {
            let ctx = DigestContext {
                device_id: &device_id,
                method: "REGISTER",
                request_uri: &msg.request_uri,
                realm: &cfg.realm,
                password: &password,
            };
            if let Err(failure) = self.nonces.verify(ctx, msg.header("Authorization")) {
                if msg.header("Authorization").is_some() {
                    warn!(target: "gb28181::sip", %device_id, "REGISTER digest auth failed: {}", failure);
                } else {
                    debug!(target: "gb28181::sip", %device_id, "REGISTER challenge");
                }
                let nonce = self.nonces.issue(&device_id);
                let mut resp = SipResponse::for_request(msg, 401);
                resp.add_header("WWW-Authenticate", auth::challenge(&cfg.realm, &nonce));
                resp.add_header("User-Agent", cfg.user_agent.clone());
                return self.reply(source, resp.encode().as_bytes()).await;
            }
        }

        let expires = parse_expires(msg.header("Expires"))
            .or_else(|| parse_expires(msg.header("Contact").and_then(|c| header_param(c, "expires"))))
            .unwrap_or(cfg.register_expires);
        let status = if expires > 0 {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        };

        let upserted = self
            .repo
            .upsert_device_on_register(RegisterUpsert {
                device_id: device_id.clone(),
                transport: source.transport,
                remote_addr: source.remote.to_string(),
                expires,
                status,
                raw_payload: msg.raw.clone(),
            })
            .await;
        if let Err(e) = upserted {
            let resp = SipResponse::for_request(msg, 500);
            self.reply(source, resp.encode().as_bytes()).await?;
            return Err(e);
        }

        self.bind_tcp_device(source, &device_id).await;

        let mut resp = SipResponse::for_request(msg, 200);
        resp.add_header("Date", gb_date())
            .add_header("Expires", expires.to_string())
            .add_header("User-Agent", cfg.user_agent.clone());
        self.reply(source, resp.encode().as_bytes()).await?;

        let kind = if expires > 0 { "register" } else { "unregister" };
        self.record_event(
            EventRecord::new(kind, &device_id).with_detail(format!("expires={}", expires)),
        )
        .await;

        info!(target: "gb28181::sip", %device_id, expires, remote = %source.remote, "Device registered");

        if expires > 0 {
            let core = self.clone();
            tokio::spawn(async move {
                if let Err(e) = core.query_catalog(&device_id).await {
                    warn!(target: "gb28181::sip", %device_id, "Catalog query after register failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn handle_message(&self, msg: &SipMessage, source: &PacketSource) -> Result<()> {
        let body = manscdp::decode(&msg.body);
        let device_id = msg
            .header("From")
            .and_then(sip_user)
            .map(str::to_string)
            .unwrap_or_else(|| body.device_id.clone());

        if device_id.is_empty() {
            warn!(target: "gb28181::sip", "MESSAGE without device id");
            return self.respond_ok(msg, source).await;
        }

        let touched = self
            .repo
            .touch_device(RuntimeTouch {
                device_id: device_id.clone(),
                transport: source.transport,
                remote_addr: source.remote.to_string(),
                keepalive: body.cmd_type == CmdType::Keepalive,
                raw_payload: msg.body.clone(),
            })
            .await;
        if let Err(e) = touched {
            warn!(target: "gb28181::sip", %device_id, "Touch device failed: {}", e);
            self.record_error(&e);
        }

        self.bind_tcp_device(source, &device_id).await;

        match &body.cmd_type {
            CmdType::Keepalive => {
                debug!(target: "gb28181::sip", %device_id, "Keepalive received");
            }
            CmdType::Catalog if !body.items.is_empty() || body.is_empty_catalog() => {
                if body.skipped_items > 0 {
                    warn!(
                        target: "gb28181::sip",
                        %device_id,
                        skipped = body.skipped_items,
                        "Catalog items without DeviceID ignored"
                    );
                }
                let channels: Vec<ChannelRecord> = body
                    .items
                    .iter()
                    .map(|item| ChannelRecord {
                        device_id: device_id.clone(),
                        channel_id: item.channel_id.clone(),
                        name: item.name.clone(),
                        manufacturer: item.manufacturer.clone(),
                        model: item.model.clone(),
                        owner: item.owner.clone(),
                        civil_code: item.civil_code.clone(),
                        address: item.address.clone(),
                        parental: item.parental.clone(),
                        parent_id: item.parent_id.clone(),
                        status: item.status.clone(),
                        longitude: item.longitude.clone(),
                        latitude: item.latitude.clone(),
                        raw: msg.body.clone(),
                    })
                    .collect();
                let count = channels.len();
                match self.repo.replace_channels(&device_id, channels).await {
                    Ok(()) => {
                        info!(target: "gb28181::sip", %device_id, channels = count, "Catalog refreshed");
                        self.record_event(
                            EventRecord::new("catalog", &device_id)
                                .with_detail(format!("channels={}", count)),
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(target: "gb28181::sip", %device_id, "Replace channels failed: {}", e);
                        self.record_error(&e);
                    }
                }
            }
            other => {
                debug!(target: "gb28181::sip", %device_id, cmd_type = ?other, "MESSAGE refreshed liveness only");
            }
        }

        self.respond_ok(msg, source).await
    }

    async fn handle_inbound_bye(&self, msg: &SipMessage, source: &PacketSource) -> Result<()> {
        let call_id = msg.call_id().unwrap_or_default().to_string();
        if !call_id.is_empty() {
            if let Some(mut session) = self.repo.get_session(&call_id).await? {
                if !session.status.is_terminal() {
                    session.status = SessionStatus::Terminated;
                    session.updated_at = Utc::now();
                    let device_id = session.device_id.clone();
                    self.repo.upsert_session(session).await?;
                    self.ports.release(&call_id);
                    info!(target: "gb28181::sip", %call_id, "Session terminated by device");
                    self.record_event(
                        EventRecord::new("inbound_bye", device_id).with_call_id(&call_id),
                    )
                    .await;
                }
            }
        }
        self.respond_ok(msg, source).await
    }

    async fn handle_response(&self, msg: &SipMessage, source: &PacketSource) -> Result<()> {
        let Some((cseq, method)) = msg.cseq() else {
            debug!(target: "gb28181::sip", "Response without CSeq");
            return Ok(());
        };
        let call_id = msg.call_id().unwrap_or_default().to_string();
        let status = msg.status_code;

        match method {
            SipMethod::Invite => {
                if status < 200 {
                    debug!(target: "gb28181::sip", %call_id, status, "Provisional INVITE response");
                    return Ok(());
                }
                let session = self.repo.get_session(&call_id).await?;
                if status < 300 {
                    self.ack_invite(msg, source, cseq, session.as_ref()).await?;
                    // 已结束的会话只回 ACK，不恢复状态也不重新占用端口
                    if let Some(closed) = session.as_ref().filter(|s| s.status.is_terminal()) {
                        info!(
                            target: "gb28181::sip",
                            %call_id,
                            state = closed.status.as_str(),
                            "Late INVITE 2xx for closed session acknowledged"
                        );
                        return Ok(());
                    }
                    let session = match session {
                        Some(mut s) => {
                            s.status = SessionStatus::Established;
                            s.updated_at = Utc::now();
                            s
                        }
                        None => {
                            let channel_id = msg.header("To").and_then(sip_user).unwrap_or_default();
                            let mut s = SessionRecord::new(&call_id, "", channel_id);
                            s.status = SessionStatus::Established;
                            s.remote_addr = source.remote.to_string();
                            s.sdp_body = msg.body.clone();
                            s
                        }
                    };
                    let device_id = session.device_id.clone();
                    self.repo.upsert_session(session).await?;
                    info!(target: "gb28181::sip", %call_id, "Session established");
                    self.record_event(
                        EventRecord::new("session_established", device_id).with_call_id(&call_id),
                    )
                    .await;
                } else {
                    if session.as_ref().is_some_and(|s| s.status.is_terminal()) {
                        debug!(target: "gb28181::sip", %call_id, status, "INVITE failure for closed session");
                        return Ok(());
                    }
                    let session = match session {
                        Some(mut s) => {
                            s.status = SessionStatus::Failed;
                            s.updated_at = Utc::now();
                            s
                        }
                        None => {
                            let channel_id = msg.header("To").and_then(sip_user).unwrap_or_default();
                            let mut s = SessionRecord::new(&call_id, "", channel_id);
                            s.status = SessionStatus::Failed;
                            s.remote_addr = source.remote.to_string();
                            s
                        }
                    };
                    let device_id = session.device_id.clone();
                    self.repo.upsert_session(session).await?;
                    self.ports.release(&call_id);
                    warn!(target: "gb28181::sip", %call_id, status, "INVITE rejected");
                    self.record_event(
                        EventRecord::new("session_failed", device_id)
                            .with_call_id(&call_id)
                            .with_detail(format!("status={}", status)),
                    )
                    .await;
                }
            }
            SipMethod::Bye => {
                if let Some(mut session) = self.repo.get_session(&call_id).await? {
                    session.status = SessionStatus::Terminated;
                    session.updated_at = Utc::now();
                    self.repo.upsert_session(session).await?;
                }
                self.ports.release(&call_id);
                debug!(target: "gb28181::sip", %call_id, status, "BYE answered");
            }
            SipMethod::Message => {
                debug!(target: "gb28181::sip", %call_id, status, "MESSAGE answered");
            }
            other => {
                debug!(target: "gb28181::sip", %call_id, status, method = %other, "Ignore response");
            }
        }
        Ok(())
    }

    /// 对 INVITE 2xx 发送 ACK
    async fn ack_invite(
        &self,
        msg: &SipMessage,
        source: &PacketSource,
        cseq: u32,
        session: Option<&SessionRecord>,
    ) -> Result<()> {
        let cfg = self.config();
        let uri = msg
            .header("Contact")
            .and_then(extract_sip_uri)
            .map(str::to_string)
            .or_else(|| {
                session
                    .filter(|s| !s.channel_id.is_empty() && !s.remote_addr.is_empty())
                    .map(|s| format!("sip:{}@{}", s.channel_id, s.remote_addr))
            })
            .or_else(|| msg.header("To").and_then(extract_sip_uri).map(str::to_string))
            .unwrap_or_else(|| format!("sip:{}", source.remote));

        let mut ack = SipRequest::new(SipMethod::Ack, uri);
        for via in msg.header_values("Via") {
            ack.add_header("Via", via);
        }
        ack.add_header("From", msg.header("From").unwrap_or_default())
            .add_header("To", msg.header("To").unwrap_or_default())
            .add_header("Call-ID", msg.call_id().unwrap_or_default())
            .add_header("CSeq", format!("{} ACK", cseq))
            .add_header("Max-Forwards", "70")
            .add_header("User-Agent", cfg.user_agent);

        self.reply(source, ack.encode().as_bytes()).await
    }
}
