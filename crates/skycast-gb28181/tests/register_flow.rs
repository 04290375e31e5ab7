mod common;

use common::*;
use skycast_gb28181::auth::{compute_digest_response_qop, parse_digest_params};
use skycast_gb28181::repository::ChannelRecord;
use skycast_gb28181::{DeviceStatus, DeviceTransport, Gb28181Repository, TransportMode};
use std::time::Duration;

#[tokio::test]
async fn register_with_digest_then_catalog_query() {
    let mut cfg = base_config(TransportMode::Udp);
    cfg.password = "pw".to_string();
    let h = Harness::start(cfg).await;
    let dev = UdpDevice::connect(h.bound("udp")).await;

    // 首次注册不带鉴权
    dev.send(&register_request(dev.local(), 1, None)).await;
    let challenge = dev.recv().await;
    assert_eq!(challenge.status_code, 401);
    let www = challenge.header("WWW-Authenticate").unwrap();
    assert!(www.starts_with("Digest realm=\"3402000000\",nonce=\""));
    assert!(www.ends_with("\",algorithm=MD5,qop=\"auth\""));
    assert!(challenge.header("To").unwrap().contains(";tag="));

    let params = parse_digest_params(www).unwrap();
    let nonce = params["nonce"].clone();
    assert_eq!(nonce.len(), 48);

    let uri = format!("sip:{}@{}", SERVER_ID, REALM);
    let response = compute_digest_response_qop(
        DEVICE_ID, REALM, "pw", "REGISTER", &uri, &nonce, "00000001", "abc", "auth",
    );
    let auth = format!(
        "Digest username=\"{}\",realm=\"{}\",nonce=\"{}\",uri=\"{}\",response=\"{}\",qop=auth,nc=00000001,cnonce=\"abc\"",
        DEVICE_ID, REALM, nonce, uri, response
    );
    dev.send(&register_request(dev.local(), 2, Some(&auth))).await;

    let ok = dev.recv().await;
    assert_eq!(ok.status_code, 200);
    assert_eq!(ok.header("Expires"), Some("3600"));
    assert!(ok.header("Date").is_some());
    assert!(ok.header("User-Agent").is_some());
    assert_eq!(ok.header("CSeq"), Some("2 REGISTER"));

    let device = h.repo.get_device_by_device_id(DEVICE_ID).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert_eq!(device.transport, DeviceTransport::Udp);
    assert_eq!(device.remote_addr, dev.local().to_string());
    assert_eq!(device.expires, 3600);

    // 注册成功后异步下发目录查询
    let query = dev.recv().await;
    assert_eq!(query.method.as_ref().map(|m| m.as_str()), Some("MESSAGE"));
    assert!(query.body.contains("<CmdType>Catalog</CmdType>"));
    assert!(query.body.contains(&format!("<DeviceID>{}</DeviceID>", DEVICE_ID)));
    assert_eq!(
        query.header("Content-Type"),
        Some("Application/MANSCDP+xml")
    );

    h.stop().await;
}

#[tokio::test]
async fn register_with_wrong_password_is_challenged_again() {
    let mut cfg = base_config(TransportMode::Udp);
    cfg.password = "pw".to_string();
    let h = Harness::start(cfg).await;
    let dev = UdpDevice::connect(h.bound("udp")).await;

    dev.send(&register_request(dev.local(), 1, None)).await;
    let first = dev.recv().await;
    let nonce = parse_digest_params(first.header("WWW-Authenticate").unwrap()).unwrap()["nonce"].clone();

    let uri = format!("sip:{}@{}", SERVER_ID, REALM);
    let response = compute_digest_response_qop(
        DEVICE_ID, REALM, "wrong", "REGISTER", &uri, &nonce, "00000001", "abc", "auth",
    );
    let auth = format!(
        "Digest username=\"{}\",nonce=\"{}\",uri=\"{}\",response=\"{}\",qop=auth,nc=00000001,cnonce=\"abc\"",
        DEVICE_ID, nonce, uri, response
    );
    dev.send(&register_request(dev.local(), 2, Some(&auth))).await;

    let second = dev.recv().await;
    assert_eq!(second.status_code, 401);
    let fresh = parse_digest_params(second.header("WWW-Authenticate").unwrap()).unwrap()["nonce"].clone();
    assert_ne!(fresh, nonce);
    assert!(h.repo.get_device_by_device_id(DEVICE_ID).await.unwrap().is_none());

    h.stop().await;
}

#[tokio::test]
async fn catalog_message_replaces_channels() {
    let h = Harness::start(base_config(TransportMode::Udp)).await;
    let dev = UdpDevice::connect(h.bound("udp")).await;

    h.repo
        .replace_channels(
            DEVICE_ID,
            (0..3)
                .map(|i| ChannelRecord {
                    device_id: DEVICE_ID.to_string(),
                    channel_id: format!("old{}", i),
                    ..Default::default()
                })
                .collect(),
        )
        .await
        .unwrap();

    let body = catalog_body(&[
        ("34020000001310000001", "Gate"),
        ("34020000001310000002", "Lobby"),
    ]);
    dev.send(&message_request(dev.local(), "UDP", &body)).await;

    let ok = dev.recv().await;
    assert_eq!(ok.status_code, 200);
    assert_eq!(ok.header("CSeq"), Some("20 MESSAGE"));

    let channels = h.repo.list_channels(DEVICE_ID).await.unwrap();
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0].channel_id, "34020000001310000001");
    assert_eq!(channels[1].name, "Lobby");
    assert!(channels[0].raw.contains("<CmdType>Catalog</CmdType>"));

    let device = h.repo.get_device_by_device_id(DEVICE_ID).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Online);

    h.stop().await;
}

#[tokio::test]
async fn empty_catalog_clears_channels() {
    let h = Harness::start(base_config(TransportMode::Udp)).await;
    let dev = UdpDevice::connect(h.bound("udp")).await;

    let body = catalog_body(&[("34020000001310000001", "Gate")]);
    dev.send(&message_request(dev.local(), "UDP", &body)).await;
    assert_eq!(dev.recv().await.status_code, 200);
    assert_eq!(h.repo.list_channels(DEVICE_ID).await.unwrap().len(), 1);

    dev.send(&message_request(dev.local(), "UDP", &catalog_body(&[])))
        .await;
    assert_eq!(dev.recv().await.status_code, 200);
    assert!(h.repo.list_channels(DEVICE_ID).await.unwrap().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn keepalive_and_malformed_catalog_only_touch_liveness() {
    let h = Harness::start(base_config(TransportMode::Udp)).await;
    let dev = UdpDevice::connect(h.bound("udp")).await;

    let keepalive = format!(
        "<?xml version=\"1.0\"?>\r\n<Notify>\r\n<CmdType>Keepalive</CmdType>\r\n<SN>3</SN>\r\n<DeviceID>{}</DeviceID>\r\n<Status>OK</Status>\r\n</Notify>\r\n",
        DEVICE_ID
    );
    dev.send(&message_request(dev.local(), "UDP", &keepalive)).await;
    assert_eq!(dev.recv().await.status_code, 200);

    let device = h.repo.get_device_by_device_id(DEVICE_ID).await.unwrap().unwrap();
    assert!(device.last_keepalive_at.is_some());

    let broken = "<Response><CmdType>Catalog</CmdType><DeviceList><Item><DeviceID>x";
    dev.send(&message_request(dev.local(), "UDP", broken)).await;
    assert_eq!(dev.recv().await.status_code, 200);
    assert!(h.repo.list_channels(DEVICE_ID).await.unwrap().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn options_ok_unknown_method_405_and_garbage_ignored() {
    let h = Harness::start(base_config(TransportMode::Udp)).await;
    let dev = UdpDevice::connect(h.bound("udp")).await;

    let options = format!(
        "OPTIONS sip:{}@{} SIP/2.0\r\nVia: SIP/2.0/UDP {};branch=z9hG4bKopt\r\nFrom: <sip:{}@{}>;tag=o\r\nTo: <sip:{}@{}>\r\nCall-ID: opt-1\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n",
        SERVER_ID, REALM, dev.local(), DEVICE_ID, REALM, SERVER_ID, REALM
    );
    dev.send(&options).await;
    let ok = dev.recv().await;
    assert_eq!(ok.status_code, 200);
    assert!(ok.header("User-Agent").is_some());

    let publish = options.replace("OPTIONS", "PUBLISH");
    dev.send(&publish).await;
    let rejected = dev.recv().await;
    assert_eq!(rejected.status_code, 405);
    assert_eq!(rejected.reason, "Method Not Allowed");

    dev.send("\r\n\r\n").await;
    assert!(dev.try_recv(Duration::from_millis(300)).await.is_none());
    assert!(!h.service.status().last_error.is_empty());
    assert!(h.service.status().received >= 3);

    h.stop().await;
}

#[tokio::test]
async fn register_with_zero_expires_marks_offline() {
    let h = Harness::start(base_config(TransportMode::Udp)).await;
    let dev = UdpDevice::connect(h.bound("udp")).await;

    let text = register_request(dev.local(), 1, None).replace("Expires: 3600", "Expires: 0");
    dev.send(&text).await;
    let ok = dev.recv().await;
    assert_eq!(ok.status_code, 200);
    assert_eq!(ok.header("Expires"), Some("0"));

    let device = h.repo.get_device_by_device_id(DEVICE_ID).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Offline);
    // 注销不触发目录查询
    assert!(dev.try_recv(Duration::from_millis(300)).await.is_none());

    h.stop().await;
}
