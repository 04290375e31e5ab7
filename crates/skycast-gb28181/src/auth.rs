// REGISTER Digest 鉴权
// nonce 按设备 ID 签发，5 分钟有效，校验成功后作废

use crate::util;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// nonce 有效期
pub const NONCE_TTL_SECS: i64 = 300;

/// 鉴权失败原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("missing Authorization header")]
    MissingHeader,

    #[error("malformed Authorization header")]
    MalformedHeader,

    #[error("Authorization missing field {0}")]
    MissingField(&'static str),

    #[error("unknown nonce")]
    UnknownNonce,

    #[error("nonce expired")]
    ExpiredNonce,

    #[error("nonce mismatch")]
    NonceMismatch,

    #[error("digest response mismatch")]
    DigestMismatch,
}

#[derive(Debug, Clone)]
struct NonceEntry {
    nonce: String,
    expires_at: DateTime<Utc>,
}

/// 一次校验所需的请求上下文
#[derive(Debug, Clone, Copy)]
pub struct DigestContext<'a> {
    pub device_id: &'a str,
    pub method: &'a str,
    pub request_uri: &'a str,
    pub realm: &'a str,
    pub password: &'a str,
}

/// nonce 表
#[derive(Debug, Default)]
pub struct NonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为设备签发新的 nonce
    pub fn issue(&self, device_id: &str) -> String {
        self.issue_at(device_id, Utc::now())
    }

    pub fn issue_at(&self, device_id: &str, now: DateTime<Utc>) -> String {
        let nonce = util::random_hex(24);
        let mut entries = self.lock();
        entries.retain(|_, e| e.expires_at >= now);
        entries.insert(
            device_id.to_string(),
            NonceEntry {
                nonce: nonce.clone(),
                expires_at: now + Duration::seconds(NONCE_TTL_SECS),
            },
        );
        nonce
    }

    pub fn verify(
        &self,
        ctx: DigestContext<'_>,
        authorization: Option<&str>,
    ) -> Result<(), AuthFailure> {
        self.verify_at(ctx, authorization, Utc::now())
    }

    /// 校验 Authorization 头部，成功后消费 nonce
    pub fn verify_at(
        &self,
        ctx: DigestContext<'_>,
        authorization: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthFailure> {
        let header = authorization
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(AuthFailure::MissingHeader)?;
        let params = parse_digest_params(header).ok_or(AuthFailure::MalformedHeader)?;

        let nonce = params
            .get("nonce")
            .filter(|v| !v.is_empty())
            .ok_or(AuthFailure::MissingField("nonce"))?;
        let response = params
            .get("response")
            .filter(|v| !v.is_empty())
            .ok_or(AuthFailure::MissingField("response"))?;

        let mut entries = self.lock();
        entries.retain(|_, e| e.expires_at >= now);

        let entry = entries.get(ctx.device_id).ok_or(AuthFailure::UnknownNonce)?;
        if now > entry.expires_at {
            return Err(AuthFailure::ExpiredNonce);
        }
        if entry.nonce != *nonce {
            return Err(AuthFailure::NonceMismatch);
        }

        let username = params
            .get("username")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(ctx.device_id);
        let realm = params
            .get("realm")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(ctx.realm);
        let uri = params
            .get("uri")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(ctx.request_uri);

        let qop = params.get("qop").map(String::as_str).filter(|s| !s.is_empty());
        let expected = match qop {
            Some(qop) => compute_digest_response_qop(
                username,
                realm,
                ctx.password,
                ctx.method,
                uri,
                nonce,
                params.get("nc").map(String::as_str).unwrap_or_default(),
                params.get("cnonce").map(String::as_str).unwrap_or_default(),
                qop,
            ),
            None => compute_digest_response(username, realm, ctx.password, ctx.method, uri, nonce),
        };

        if !expected.eq_ignore_ascii_case(response.trim()) {
            return Err(AuthFailure::DigestMismatch);
        }

        entries.remove(ctx.device_id);
        Ok(())
    }

    /// 清理过期 nonce，返回清理数量
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at >= now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, NonceEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// WWW-Authenticate 挑战
pub fn challenge(realm: &str, nonce: &str) -> String {
    format!(
        "Digest realm=\"{}\",nonce=\"{}\",algorithm=MD5,qop=\"auth\"",
        realm, nonce
    )
}

/// 解析 Digest Authorization 头部为键值对
pub fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let value = value.trim();
    let rest = match value.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("Digest") => &value[6..],
        _ => value,
    };

    let mut map = HashMap::new();
    for part in rest.split(',') {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let val = val.trim();
        let val = val
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(val);
        map.insert(key, val.to_string());
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn md5_hex(input: String) -> String {
    format!("{:x}", md5::compute(input))
}

fn ha1_ha2(username: &str, realm: &str, password: &str, method: &str, uri: &str) -> (String, String) {
    let ha1 = md5_hex(format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(format!("{}:{}", method.to_ascii_uppercase(), uri));
    (ha1, ha2)
}

/// 计算 Digest 响应（无 qop）
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let (ha1, ha2) = ha1_ha2(username, realm, password, method, uri);
    md5_hex(format!("{}:{}:{}", ha1, nonce, ha2))
}

/// 计算 Digest 响应（qop=auth）
#[allow(clippy::too_many_arguments)]
pub fn compute_digest_response_qop(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
) -> String {
    let (ha1, ha2) = ha1_ha2(username, realm, password, method, uri);
    md5_hex(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: &str = "34020000001320000001";
    const URI: &str = "sip:34020000002000000001@3402000000";

    fn ctx() -> DigestContext<'static> {
        DigestContext {
            device_id: DEVICE,
            method: "REGISTER",
            request_uri: URI,
            realm: "3402000000",
            password: "pw",
        }
    }

    fn authorization(nonce: &str) -> String {
        let response = compute_digest_response_qop(
            DEVICE, "3402000000", "pw", "REGISTER", URI, nonce, "00000001", "abc", "auth",
        );
        format!(
            "Digest username=\"{}\",realm=\"3402000000\",nonce=\"{}\",uri=\"{}\",response=\"{}\",qop=auth,nc=00000001,cnonce=\"abc\"",
            DEVICE, nonce, URI, response
        )
    }

    #[test]
    fn test_qop_auth_accepted_once() {
        let store = NonceStore::new();
        let nonce = store.issue(DEVICE);
        assert_eq!(nonce.len(), 48);

        let header = authorization(&nonce);
        assert_eq!(store.verify(ctx(), Some(&header)), Ok(()));
        // nonce 已被消费
        assert_eq!(store.verify(ctx(), Some(&header)), Err(AuthFailure::UnknownNonce));
    }

    #[test]
    fn test_without_qop_and_uppercase_response() {
        let store = NonceStore::new();
        let nonce = store.issue(DEVICE);
        let response = compute_digest_response(DEVICE, "3402000000", "pw", "register", URI, &nonce)
            .to_ascii_uppercase();
        let header = format!(
            "Digest username=\"\", nonce=\"{}\", response=\"{}\"",
            nonce, response
        );
        assert_eq!(store.verify(ctx(), Some(&header)), Ok(()));
    }

    #[test]
    fn test_expired_nonce_rejected() {
        let store = NonceStore::new();
        let issued = Utc::now() - Duration::seconds(NONCE_TTL_SECS + 1);
        let nonce = store.issue_at(DEVICE, issued);
        let header = authorization(&nonce);
        let result = store.verify_at(ctx(), Some(&header), Utc::now());
        assert!(matches!(
            result,
            Err(AuthFailure::UnknownNonce) | Err(AuthFailure::ExpiredNonce)
        ));
    }

    #[test]
    fn test_wrong_password_and_nonce() {
        let store = NonceStore::new();
        let nonce = store.issue(DEVICE);

        let mut bad = ctx();
        bad.password = "other";
        assert_eq!(
            store.verify(bad, Some(&authorization(&nonce))),
            Err(AuthFailure::DigestMismatch)
        );
        assert_eq!(
            store.verify(ctx(), Some(&authorization("deadbeef"))),
            Err(AuthFailure::NonceMismatch)
        );
        assert_eq!(store.verify(ctx(), None), Err(AuthFailure::MissingHeader));
        assert_eq!(
            store.verify(ctx(), Some("Digest username=\"x\"")),
            Err(AuthFailure::MissingField("nonce"))
        );
    }

    #[test]
    fn test_sweep_removes_expired() {
        let store = NonceStore::new();
        let now = Utc::now();
        store.issue_at("b", now);
        store.issue_at("a", now - Duration::seconds(NONCE_TTL_SECS * 2));
        assert_eq!(store.len(), 2);
        assert_eq!(store.sweep_at(now), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_challenge_format() {
        assert_eq!(
            challenge("3402000000", "abc"),
            "Digest realm=\"3402000000\",nonce=\"abc\",algorithm=MD5,qop=\"auth\""
        );
    }

    #[test]
    fn test_parse_digest_params() {
        let params = parse_digest_params("Digest username=\"a\", qop=auth, nc=00000001").unwrap();
        assert_eq!(params["username"], "a");
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["nc"], "00000001");
        assert!(parse_digest_params("Digest").is_none());
    }
}
