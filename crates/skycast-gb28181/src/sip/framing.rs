// 流式传输（TCP）上的 SIP 分帧
// 头部读到空行为止，按 Content-Length 读取消息体

use crate::error::{Gb28181Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// 单个消息体上限
pub const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

/// 起始行加头部的上限
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// 读取一个完整的 SIP 报文
///
/// 返回 `Ok(None)` 表示对端在报文边界上正常关闭。
pub async fn read_sip_frame<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = String::new();
    let mut content_length = 0usize;
    let mut started = false;
    let mut header_len = 0usize;

    loop {
        let mut line = String::new();
        // 报文前的心跳空行不计入头部长度，但单行同样受限
        let budget = MAX_HEADER_LEN - header_len;
        let n = (&mut *reader).take(budget as u64).read_line(&mut line).await?;
        if n == 0 {
            if started {
                return Err(Gb28181Error::Framing("unexpected EOF in SIP headers".to_string()));
            }
            return Ok(None);
        }
        if n == budget && !line.ends_with('\n') {
            return Err(Gb28181Error::Framing(format!(
                "SIP header exceeds {} bytes",
                MAX_HEADER_LEN
            )));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if !started {
                // 心跳 CRLF
                continue;
            }
            break;
        }
        started = true;
        header_len += n;
        if header_len >= MAX_HEADER_LEN {
            return Err(Gb28181Error::Framing(format!(
                "SIP header exceeds {} bytes",
                MAX_HEADER_LEN
            )));
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                let parsed = value.trim().parse::<i64>().map_err(|_| {
                    Gb28181Error::Framing(format!("malformed Content-Length: {}", value.trim()))
                })?;
                content_length = usize::try_from(parsed.max(0)).unwrap_or(0);
                if content_length > MAX_BODY_LEN {
                    return Err(Gb28181Error::Framing(format!(
                        "Content-Length {} exceeds limit",
                        content_length
                    )));
                }
            }
        }

        head.push_str(trimmed);
        head.push_str("\r\n");
    }

    head.push_str("\r\n");

    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await.map_err(|e| {
            Gb28181Error::Framing(format!("unexpected EOF in SIP body: {}", e))
        })?;
        head.push_str(&String::from_utf8_lossy(&body));
    }

    Ok(Some(head))
}
