// GB28181 控制接口
// 对信令服务门面的一层薄 HTTP 封装

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use skycast_gb28181::{
    DeviceQuery, DeviceStatus, Gb28181Error, Gb28181Repository, Gb28181Service, InviteRequest,
    SessionStatus,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Gb28181Service>,
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    call_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    device_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceListParams {
    status: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionListParams {
    status: Option<String>,
    limit: Option<usize>,
}

/// 服务错误到 HTTP 状态码
pub struct ApiError(Gb28181Error);

impl From<Gb28181Error> for ApiError {
    fn from(err: Gb28181Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Gb28181Error::DeviceNotFound(_) | Gb28181Error::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Gb28181Error::InvalidArgument(_) | Gb28181Error::PortOutOfRange { .. } => {
                StatusCode::BAD_REQUEST
            }
            Gb28181Error::PortOccupied { .. } => StatusCode::CONFLICT,
            Gb28181Error::PortPoolExhausted | Gb28181Error::NotRunning => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Gb28181Error::PeerNotBound(_) | Gb28181Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Gb28181Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(target: "gb28181d", "request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn bad_request(msg: String) -> ApiError {
    ApiError(Gb28181Error::InvalidArgument(msg))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/gb28181/status", get(status))
        .route("/api/v1/gb28181/invite", post(invite))
        .route("/api/v1/gb28181/reinvite", post(reinvite))
        .route("/api/v1/gb28181/bye", post(bye))
        .route("/api/v1/gb28181/catalog", post(query_catalog))
        .route("/api/v1/gb28181/sessions", get(list_sessions))
        .route("/api/v1/gb28181/sessions/:call_id/sdp", post(export_sdp))
        .route("/api/v1/gb28181/devices", get(list_devices))
        .route(
            "/api/v1/gb28181/devices/:device_id/channels",
            get(list_device_channels),
        )
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.service.status()))
}

async fn invite(
    State(state): State<AppState>,
    Json(req): Json<InviteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.service.invite(req).await?;
    Ok(Json(serde_json::json!({ "session": session })))
}

async fn reinvite(
    State(state): State<AppState>,
    Json(req): Json<CallRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.service.reinvite(&req.call_id).await?;
    Ok(Json(serde_json::json!({ "session": session })))
}

async fn bye(
    State(state): State<AppState>,
    Json(req): Json<CallRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.bye(&req.call_id).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn query_catalog(
    State(state): State<AppState>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.query_catalog(&req.device_id).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn export_sdp(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let path = state.service.export_session_sdp(&call_id).await?;
    Ok(Json(serde_json::json!({ "path": path.to_string_lossy() })))
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) if s.eq_ignore_ascii_case("online") => Some(DeviceStatus::Online),
        Some(s) if s.eq_ignore_ascii_case("offline") => Some(DeviceStatus::Offline),
        Some(other) => return Err(bad_request(format!("unknown device status {}", other))),
    };
    let devices = state
        .service
        .repository()
        .list_devices(&DeviceQuery {
            status,
            offset: params.offset.unwrap_or(0),
            limit: params.limit.unwrap_or(0),
        })
        .await?;
    Ok(Json(serde_json::json!({ "devices": devices })))
}

async fn list_device_channels(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let repo = state.service.repository();
    if repo.get_device_by_device_id(&device_id).await?.is_none() {
        return Err(ApiError(Gb28181Error::DeviceNotFound(device_id)));
    }
    let channels = repo.list_channels(&device_id).await?;
    Ok(Json(serde_json::json!({ "channels": channels })))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<SessionListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(
            SessionStatus::parse(s).ok_or_else(|| bad_request(format!("unknown session status {}", s)))?,
        ),
    };
    let sessions = state
        .service
        .repository()
        .list_sessions(status, params.limit.unwrap_or(0))
        .await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hyper::body::to_bytes;
    use skycast_gb28181::{
        DeviceRecord, Gb28181Config, MemoryRepository, SessionRecord, TransportMode,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        repo: Arc<MemoryRepository>,
        service: Arc<Gb28181Service>,
        _data_dir: tempfile::TempDir,
    }

    async fn test_app(start: bool) -> TestApp {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let repo = Arc::new(MemoryRepository::new());
        let config = Gb28181Config {
            listen_ip: "127.0.0.1".to_string(),
            listen_port: 0,
            transport: TransportMode::Udp,
            media_ip: "127.0.0.1".to_string(),
            ..Default::default()
        };
        let service = Arc::new(Gb28181Service::new(config, repo.clone(), data_dir.path()));
        if start {
            service.start(Duration::from_secs(5)).await.expect("start");
        }
        let app = router(AppState {
            service: service.clone(),
        });
        TestApp {
            app,
            repo,
            service,
            _data_dir: data_dir,
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body()).await.expect("body");
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("req")
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("req")
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let t = test_app(false).await;

        let resp = t.app.clone().oneshot(get_req("/health")).await.expect("health");
        assert_eq!(resp.status(), StatusCode::OK);

        let (status, v) = call(&t.app, get_req("/api/v1/gb28181/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["running"], false);
        assert_eq!(v["mediaPortStart"], 30000);
    }

    #[tokio::test]
    async fn test_invite_maps_errors() {
        let t = test_app(false).await;
        let body = serde_json::json!({ "device_id": "dev", "channel_id": "ch" });

        let (status, _) = call(&t.app, post_json("/api/v1/gb28181/invite", body.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        t.service.start(Duration::from_secs(5)).await.expect("start");
        let (status, v) = call(&t.app, post_json("/api/v1/gb28181/invite", body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(v["error"].as_str().unwrap_or_default().contains("dev"));

        t.service.stop(Duration::from_secs(5)).await.expect("stop");
    }

    #[tokio::test]
    async fn test_invite_and_bye_over_http() {
        let t = test_app(true).await;
        let device_sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        let mut device = DeviceRecord::new("34020000001320000001");
        device.remote_addr = device_sock.local_addr().expect("addr").to_string();
        device.status = DeviceStatus::Online;
        t.repo.put_device(device).await;

        let (status, v) = call(
            &t.app,
            post_json(
                "/api/v1/gb28181/invite",
                serde_json::json!({
                    "device_id": "34020000001320000001",
                    "channel_id": "34020000001310000001",
                    "media_port": 30005,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let call_id = v["session"]["call_id"].as_str().expect("call_id").to_string();
        assert_eq!(v["session"]["status"], "inviting");
        assert!(v["session"]["sdp_body"]
            .as_str()
            .unwrap_or_default()
            .contains("m=video 30005 "));

        let mut buf = vec![0u8; 8192];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), device_sock.recv_from(&mut buf))
            .await
            .expect("invite timeout")
            .expect("invite");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("INVITE "));

        let (status, v) = call(&t.app, get_req("/api/v1/gb28181/sessions?status=inviting")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["sessions"].as_array().map(Vec::len), Some(1));

        let (status, v) = call(
            &t.app,
            post_json(
                &format!("/api/v1/gb28181/sessions/{}/sdp", call_id),
                serde_json::json!({}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(v["path"].as_str().unwrap_or_default().ends_with(".sdp"));

        let (status, _) = call(
            &t.app,
            post_json("/api/v1/gb28181/bye", serde_json::json!({ "call_id": call_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let session = t.repo.get_session(&call_id).await.expect("get").expect("session");
        assert_eq!(session.status, SessionStatus::Terminated);

        t.service.stop(Duration::from_secs(5)).await.expect("stop");
    }

    #[tokio::test]
    async fn test_device_and_channel_listing() {
        let t = test_app(false).await;

        let mut online = DeviceRecord::new("dev-online");
        online.status = DeviceStatus::Online;
        online.auth_password = Some("secret".to_string());
        t.repo.put_device(online).await;
        t.repo.put_device(DeviceRecord::new("dev-offline")).await;

        let (status, v) = call(&t.app, get_req("/api/v1/gb28181/devices?status=online")).await;
        assert_eq!(status, StatusCode::OK);
        let devices = v["devices"].as_array().expect("devices");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["device_id"], "dev-online");
        assert!(devices[0].get("auth_password").is_none());

        let (status, _) = call(&t.app, get_req("/api/v1/gb28181/devices?status=sleeping")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&t.app, get_req("/api/v1/gb28181/devices/missing/channels")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        t.repo
            .replace_channels(
                "dev-online",
                vec![skycast_gb28181::ChannelRecord {
                    device_id: "dev-online".to_string(),
                    channel_id: "ch-1".to_string(),
                    name: "Gate".to_string(),
                    ..Default::default()
                }],
            )
            .await
            .expect("replace");
        let (status, v) =
            call(&t.app, get_req("/api/v1/gb28181/devices/dev-online/channels")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["channels"][0]["name"], "Gate");
    }

    #[tokio::test]
    async fn test_bye_and_reinvite_unknown_session() {
        let t = test_app(false).await;
        t.repo
            .upsert_session(SessionRecord::new("known", "dev", "ch"))
            .await
            .expect("upsert");

        let (status, _) = call(
            &t.app,
            post_json("/api/v1/gb28181/bye", serde_json::json!({ "call_id": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &t.app,
            post_json("/api/v1/gb28181/reinvite", serde_json::json!({ "call_id": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&t.app, get_req("/api/v1/gb28181/sessions?status=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
