// SIP 消息解析和生成
// 覆盖 GB28181 设备实际使用的子集

use crate::error::{Gb28181Error, Result};
use crate::util;
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
    Subscribe,
    Notify,
    Info,
    Other(String),
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "MESSAGE" => SipMethod::Message,
            "OPTIONS" => SipMethod::Options,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "INFO" => SipMethod::Info,
            other => SipMethod::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Other(s) => s.as_str(),
        }
    }
}

/// 紧凑头部名展开
fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        other => other,
    }
}

/// 已解析的 SIP 消息（请求或响应）
///
/// 头部读取时大小写不敏感，写出时保留原始大小写与顺序。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    /// 原始文本
    pub raw: String,

    /// 请求方法（响应为 None）
    pub method: Option<SipMethod>,

    /// 请求 URI（响应为空）
    pub request_uri: String,

    /// 响应状态码（请求为 0）
    pub status_code: u16,

    /// 响应原因短语
    pub reason: String,

    headers: Vec<(String, String)>,

    pub body: String,
}

impl SipMessage {
    /// 从字符串解析 SIP 消息
    pub fn parse(raw: &str) -> Result<Self> {
        let text = raw.trim_start_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return Err(Gb28181Error::parse("empty SIP message"));
        }

        let (head, body) = split_head_body(text);
        let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));
        let start_line = lines.next().unwrap_or_default().trim();

        let mut headers = Vec::new();
        for line in lines {
            let Some(pos) = line.find(':') else {
                continue;
            };
            let name = expand_compact(line[..pos].trim());
            if name.is_empty() {
                continue;
            }
            headers.push((name.to_string(), line[pos + 1..].trim().to_string()));
        }

        let mut msg = SipMessage {
            raw: raw.to_string(),
            method: None,
            request_uri: String::new(),
            status_code: 0,
            reason: String::new(),
            headers,
            body: body.to_string(),
        };

        let is_response = start_line
            .get(..7)
            .map(|p| p.eq_ignore_ascii_case("SIP/2.0"))
            .unwrap_or(false);

        if is_response {
            let mut parts = start_line.splitn(3, ' ');
            let _version = parts.next();
            let code = parts
                .next()
                .unwrap_or_default()
                .trim()
                .parse::<u16>()
                .map_err(|_| Gb28181Error::parse(format!("invalid status line: {}", start_line)))?;
            if code == 0 {
                return Err(Gb28181Error::parse(format!("invalid status code in: {}", start_line)));
            }
            msg.status_code = code;
            msg.reason = parts.next().unwrap_or_default().trim().to_string();
        } else {
            let parts: Vec<&str> = start_line.split_whitespace().collect();
            let Some(method) = parts.first() else {
                return Err(Gb28181Error::parse("missing request line"));
            };
            msg.method = Some(SipMethod::parse(method));

            let uri = match parts.get(1) {
                Some(u) if !u.to_ascii_uppercase().starts_with("SIP/2.0") => u.to_string(),
                _ => String::new(),
            };
            msg.request_uri = if uri.is_empty() {
                msg.header("To")
                    .and_then(extract_sip_uri)
                    .unwrap_or_default()
                    .to_string()
            } else {
                uri
            };
        }

        Ok(msg)
    }

    pub fn is_response(&self) -> bool {
        self.status_code > 0
    }

    /// 第一个匹配的头部值
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 同名头部的所有值（按输入顺序）
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID").filter(|v| !v.is_empty())
    }

    /// CSeq 序号与方法
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse::<u32>().ok()?;
        let method = SipMethod::parse(parts.next()?);
        Some((seq, method))
    }

    /// 重新序列化（Content-Length 按消息体重算）
    pub fn encode(&self) -> String {
        let mut out = if self.is_response() {
            format!("SIP/2.0 {} {}\r\n", self.status_code, self.reason)
        } else {
            format!(
                "{} {} SIP/2.0\r\n",
                self.method.as_ref().map(SipMethod::as_str).unwrap_or_default(),
                self.request_uri
            )
        };
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("Content-Length") || v.trim().is_empty() {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", k, v));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

fn split_head_body(text: &str) -> (&str, &str) {
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let lf = text.find("\n\n").map(|i| (i, 2));
    let sep = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match sep {
        Some((idx, len)) => (&text[..idx], &text[idx + len..]),
        None => (text, ""),
    }
}

/// 从头部值中提取 sip: URI（截止到 `>` 或 `;`）
pub fn extract_sip_uri(value: &str) -> Option<&str> {
    let start = value.find("sip:").or_else(|| value.find("SIP:"))?;
    let rest = &value[start..];
    let end = rest
        .find(|c: char| c == '>' || c == ';' || c == ',' || c.is_whitespace())
        .unwrap_or(rest.len());
    let uri = &rest[..end];
    if uri.len() > 4 {
        Some(uri)
    } else {
        None
    }
}

/// 提取 sip:user@host 中的 user
pub fn sip_user(value: &str) -> Option<&str> {
    let uri = extract_sip_uri(value)?;
    let rest = &uri[4..];
    let user = match rest.find('@') {
        Some(at) => &rest[..at],
        None => return None,
    };
    let user = user.trim();
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// 读取头部参数，例如 `expires=3600`、`tag=abc`
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim().trim_matches('"').trim_end_matches('>'))
        } else {
            None
        }
    })
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        500 => "Server Internal Error",
        _ => "Unknown",
    }
}

const LEADING_HEADERS: [&str; 5] = ["Via", "From", "To", "Call-ID", "CSeq"];

fn push_headers(out: &mut String, headers: &[(String, String)]) {
    for lead in LEADING_HEADERS {
        for (k, v) in headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case(lead)) {
            if !v.trim().is_empty() {
                out.push_str(&format!("{}: {}\r\n", k, v.trim()));
            }
        }
    }
    for (k, v) in headers {
        if LEADING_HEADERS.iter().any(|l| l.eq_ignore_ascii_case(k))
            || k.eq_ignore_ascii_case("Content-Length")
            || v.trim().is_empty()
        {
            continue;
        }
        out.push_str(&format!("{}: {}\r\n", k, v.trim()));
    }
}

/// 出站 SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// 生成 SIP 请求字符串
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{} {} SIP/2.0\r\n",
            self.method.as_str().to_ascii_uppercase(),
            self.uri
        );
        push_headers(&mut out, &self.headers);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

/// 出站 SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl SipResponse {
    /// 基于请求生成响应：复制 Via/From/To/Call-ID/CSeq，To 缺少 tag 时补一个
    pub fn for_request(req: &SipMessage, status_code: u16) -> Self {
        let mut headers = Vec::new();
        for via in req.header_values("Via") {
            headers.push(("Via".to_string(), via.to_string()));
        }
        if let Some(from) = req.header("From") {
            headers.push(("From".to_string(), from.to_string()));
        }
        if let Some(to) = req.header("To") {
            let to = if header_param(to, "tag").is_some() {
                to.to_string()
            } else {
                format!("{};tag={}", to, util::new_tag())
            };
            headers.push(("To".to_string(), to));
        }
        if let Some(call_id) = req.header("Call-ID") {
            headers.push(("Call-ID".to_string(), call_id.to_string()));
        }
        if let Some(cseq) = req.header("CSeq") {
            headers.push(("CSeq".to_string(), cseq.to_string()));
        }

        Self {
            status_code,
            reason_phrase: reason_phrase(status_code).to_string(),
            headers,
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn set_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// 生成 SIP 响应字符串
    pub fn encode(&self) -> String {
        let mut out = format!("SIP/2.0 {} {}\r\n", self.status_code, self.reason_phrase);
        push_headers(&mut out, &self.headers);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}
