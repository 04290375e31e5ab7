// 集成测试公共工具：模拟设备与启动服务
#![allow(dead_code)]

use skycast_gb28181::sip::SipMessage;
use skycast_gb28181::{Gb28181Config, Gb28181Service, MemoryRepository, TransportMode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

pub const SERVER_ID: &str = "34020000002000000001";
pub const REALM: &str = "3402000000";
pub const DEVICE_ID: &str = "34020000001320000001";

pub fn base_config(transport: TransportMode) -> Gb28181Config {
    Gb28181Config {
        listen_ip: "127.0.0.1".to_string(),
        listen_port: 0,
        transport,
        server_id: SERVER_ID.to_string(),
        realm: REALM.to_string(),
        media_ip: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub service: Gb28181Service,
    pub data_dir: tempfile::TempDir,
}

impl Harness {
    pub async fn start(config: Gb28181Config) -> Self {
        Self::start_with_repo(config, Arc::new(MemoryRepository::new())).await
    }

    pub async fn start_with_repo(config: Gb28181Config, repo: Arc<MemoryRepository>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let data_dir = tempfile::tempdir().unwrap();
        let service = Gb28181Service::new(config, repo.clone(), data_dir.path());
        service.start(Duration::from_secs(5)).await.unwrap();
        Self {
            repo,
            service,
            data_dir,
        }
    }

    /// 服务实际监听地址
    pub fn bound(&self, scheme: &str) -> SocketAddr {
        let prefix = format!("{}://", scheme);
        self.service
            .status()
            .bind_addrs
            .iter()
            .find_map(|a| a.strip_prefix(prefix.as_str()).map(|s| s.parse().unwrap()))
            .unwrap()
    }

    pub async fn stop(&self) {
        self.service.stop(Duration::from_secs(5)).await.unwrap();
    }
}

/// UDP 模拟设备
pub struct UdpDevice {
    pub socket: UdpSocket,
    pub server: SocketAddr,
}

impl UdpDevice {
    pub async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self { socket, server }
    }

    pub fn local(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, text: &str) {
        self.socket.send_to(text.as_bytes(), self.server).await.unwrap();
    }

    pub async fn recv(&self) -> SipMessage {
        self.try_recv(Duration::from_secs(3))
            .await
            .expect("no SIP packet received")
    }

    pub async fn try_recv(&self, wait: Duration) -> Option<SipMessage> {
        let mut buf = vec![0u8; 65536];
        let (n, _) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        Some(SipMessage::parse(&String::from_utf8_lossy(&buf[..n])).unwrap())
    }

    /// 接收直到满足条件的报文
    pub async fn recv_until<F>(&self, mut pred: F) -> SipMessage
    where
        F: FnMut(&SipMessage) -> bool,
    {
        loop {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
    }
}

pub fn register_request(local: SocketAddr, cseq: u32, authorization: Option<&str>) -> String {
    let mut text = format!(
        "REGISTER sip:{server}@{realm} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};rport;branch=z9hG4bK{cseq}reg\r\n\
         From: <sip:{dev}@{realm}>;tag=dev{cseq}\r\n\
         To: <sip:{dev}@{realm}>\r\n\
         Call-ID: reg-call-1@{local}\r\n\
         CSeq: {cseq} REGISTER\r\n\
         Contact: <sip:{dev}@{local}>\r\n\
         Max-Forwards: 70\r\n\
         Expires: 3600\r\n",
        server = SERVER_ID,
        realm = REALM,
        dev = DEVICE_ID,
        local = local,
        cseq = cseq,
    );
    if let Some(auth) = authorization {
        text.push_str(&format!("Authorization: {}\r\n", auth));
    }
    text.push_str("Content-Length: 0\r\n\r\n");
    text
}

pub fn catalog_body(channels: &[(&str, &str)]) -> String {
    let items: String = channels
        .iter()
        .map(|(id, name)| {
            format!(
                "<Item>\r\n<DeviceID>{}</DeviceID>\r\n<Name>{}</Name>\r\n<Manufacturer>Hikvision</Manufacturer>\r\n<Status>ON</Status>\r\n</Item>\r\n",
                id, name
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Response>\r\n\
         <CmdType>Catalog</CmdType>\r\n\
         <SN>1</SN>\r\n\
         <DeviceID>{}</DeviceID>\r\n\
         <SumNum>{}</SumNum>\r\n\
         <DeviceList Num=\"{}\">\r\n{}</DeviceList>\r\n\
         </Response>\r\n",
        DEVICE_ID,
        channels.len(),
        channels.len(),
        items
    )
}

pub fn message_request(local: SocketAddr, transport: &str, body: &str) -> String {
    format!(
        "MESSAGE sip:{server}@{realm} SIP/2.0\r\n\
         Via: SIP/2.0/{transport} {local};rport;branch=z9hG4bKmsg\r\n\
         From: <sip:{dev}@{realm}>;tag=msg1\r\n\
         To: <sip:{server}@{realm}>\r\n\
         Call-ID: msg-call@{local}\r\n\
         CSeq: 20 MESSAGE\r\n\
         Content-Type: Application/MANSCDP+xml\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: {len}\r\n\r\n{body}",
        server = SERVER_ID,
        realm = REALM,
        dev = DEVICE_ID,
        local = local,
        transport = transport,
        len = body.len(),
        body = body,
    )
}

/// 设备对收到请求的应答
pub fn answer(req: &SipMessage, status: u16, reason: &str, contact: &str, body: &str) -> String {
    let mut text = format!("SIP/2.0 {} {}\r\n", status, reason);
    for via in req.header_values("Via") {
        text.push_str(&format!("Via: {}\r\n", via));
    }
    text.push_str(&format!("From: {}\r\n", req.header("From").unwrap()));
    text.push_str(&format!("To: {};tag=camera\r\n", req.header("To").unwrap()));
    text.push_str(&format!("Call-ID: {}\r\n", req.call_id().unwrap()));
    text.push_str(&format!("CSeq: {}\r\n", req.header("CSeq").unwrap()));
    text.push_str(&format!("Contact: <{}>\r\n", contact));
    if !body.is_empty() {
        text.push_str("Content-Type: application/sdp\r\n");
    }
    text.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    text
}

/// 轮询直到条件成立
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
