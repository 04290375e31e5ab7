// GB28181 点播 SDP
// 生成 INVITE 携带的 SDP，并从会话 SDP 中恢复媒体 IP/端口/SSRC

use std::fmt;

/// SDP 会话描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    /// o= 行的会话源（平台 ID）
    pub origin: String,

    /// 会话名称
    pub session_name: String,

    /// c= 连接地址
    pub connection_address: String,

    /// 媒体描述
    pub media: Vec<SdpMedia>,

    /// SSRC（GB28181 使用 y= 行携带）
    pub ssrc: Option<String>,
}

/// SDP 媒体描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<u8>,
    /// 非 rtpmap 属性（recvonly 等）
    pub attributes: Vec<String>,
    pub rtpmap: Vec<RtpMap>,
}

/// RTP 映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// 从 SDP 中恢复的媒体参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpMediaInfo {
    pub media_ip: Option<String>,
    pub media_port: Option<u16>,
    pub ssrc: Option<String>,
}

impl SdpSession {
    /// 点播（Play）SDP：PS/H264/MPEG4 三种负载，recvonly
    pub fn play(origin: &str, media_ip: &str, media_port: u16, ssrc: &str) -> Self {
        Self {
            origin: origin.to_string(),
            session_name: "Play".to_string(),
            connection_address: media_ip.to_string(),
            media: vec![SdpMedia {
                media_type: "video".to_string(),
                port: media_port,
                protocol: "RTP/AVP".to_string(),
                formats: vec![96, 98, 97],
                attributes: vec!["recvonly".to_string()],
                rtpmap: vec![
                    RtpMap {
                        payload_type: 96,
                        encoding_name: "PS".to_string(),
                        clock_rate: 90000,
                    },
                    RtpMap {
                        payload_type: 98,
                        encoding_name: "H264".to_string(),
                        clock_rate: 90000,
                    },
                    RtpMap {
                        payload_type: 97,
                        encoding_name: "MPEG4".to_string(),
                        clock_rate: 90000,
                    },
                ],
            }],
            ssrc: Some(ssrc.to_string()),
        }
    }

    /// 从字符串解析 SDP
    pub fn parse(sdp: &str) -> Self {
        let mut session = SdpSession {
            origin: String::new(),
            session_name: String::new(),
            connection_address: String::new(),
            media: Vec::new(),
            ssrc: None,
        };

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key {
                "o" => {
                    if let Some(id) = value.split_whitespace().next() {
                        session.origin = id.to_string();
                    }
                }
                "s" => session.session_name = value.to_string(),
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 && session.connection_address.is_empty() {
                        session.connection_address = parts[2].to_string();
                    }
                }
                "y" => {
                    if !value.is_empty() {
                        session.ssrc = Some(value.to_string());
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        session.media.push(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                            attributes: Vec::new(),
                            rtpmap: Vec::new(),
                        });
                    }
                }
                "a" => {
                    let Some(media) = session.media.last_mut() else {
                        continue;
                    };
                    if let Some(map) = value.strip_prefix("rtpmap:") {
                        if let Some(rtpmap) = parse_rtpmap(map) {
                            media.rtpmap.push(rtpmap);
                        }
                    } else {
                        media.attributes.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        session
    }

    /// 媒体 IP/端口/SSRC
    pub fn media_info(&self) -> SdpMediaInfo {
        let media_port = self.media.first().map(|m| m.port).filter(|p| *p > 0);
        SdpMediaInfo {
            media_ip: Some(self.connection_address.clone()).filter(|s| !s.is_empty()),
            media_port,
            ssrc: self.ssrc.clone(),
        }
    }
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (pt, rest) = value.split_once(' ')?;
    let (name, rate) = rest.split_once('/')?;
    let rate = rate.split('/').next().unwrap_or(rate);
    Some(RtpMap {
        payload_type: pt.trim().parse().ok()?,
        encoding_name: name.trim().to_string(),
        clock_rate: rate.trim().parse().unwrap_or(90000),
    })
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.origin, self.connection_address)?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(f, "c=IN IP4 {}\r\n", self.connection_address)?;
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|f| f.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
            for map in &media.rtpmap {
                write!(
                    f,
                    "a=rtpmap:{} {}/{}\r\n",
                    map.payload_type, map.encoding_name, map.clock_rate
                )?;
            }
        }

        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }
        Ok(())
    }
}

/// 从任意 SDP 文本中读取媒体参数
pub fn parse_media_info(sdp: &str) -> SdpMediaInfo {
    SdpSession::parse(sdp).media_info()
}
