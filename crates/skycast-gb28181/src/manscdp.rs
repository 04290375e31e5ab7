// MANSCDP 消息体编解码
// 解析 MESSAGE 携带的 Keepalive/Catalog XML，生成目录查询

use chrono::Utc;
use quick_xml::de::from_str;
use quick_xml::escape::escape;
use serde::Deserialize;

/// 命令类型（大小写不敏感）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdType {
    Keepalive,
    Catalog,
    Other(String),
}

impl CmdType {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.eq_ignore_ascii_case("Keepalive") {
            CmdType::Keepalive
        } else if s.eq_ignore_ascii_case("Catalog") {
            CmdType::Catalog
        } else {
            CmdType::Other(s.to_string())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    #[serde(default)]
    cmd_type: String,

    #[serde(rename = "SN", default)]
    sn: String,

    #[serde(rename = "DeviceID", default)]
    device_id: String,

    #[serde(default)]
    sum_num: Option<String>,

    #[serde(default)]
    device_list: Option<DeviceList>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceList {
    #[serde(rename = "Item", default)]
    items: Vec<RawItem>,
}

/// 目录项原始字段，全部按字符串读取，厂商填写格式不一
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawItem {
    #[serde(rename = "DeviceID", default)]
    device_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    manufacturer: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    civil_code: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    parental: String,
    #[serde(rename = "ParentID", default)]
    parent_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    longitude: String,
    #[serde(default)]
    latitude: String,
}

/// 目录项（通道）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogItem {
    pub channel_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: String,
    pub parent_id: String,
    pub status: String,
    pub longitude: String,
    pub latitude: String,
}

impl From<RawItem> for CatalogItem {
    fn from(item: RawItem) -> Self {
        Self {
            channel_id: item.device_id.trim().to_string(),
            name: item.name.trim().to_string(),
            manufacturer: item.manufacturer.trim().to_string(),
            model: item.model.trim().to_string(),
            owner: item.owner.trim().to_string(),
            civil_code: item.civil_code.trim().to_string(),
            address: item.address.trim().to_string(),
            parental: item.parental.trim().to_string(),
            parent_id: item.parent_id.trim().to_string(),
            status: item.status.trim().to_string(),
            longitude: item.longitude.trim().to_string(),
            latitude: item.latitude.trim().to_string(),
        }
    }
}

/// 解码后的 MANSCDP 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManscdpMessage {
    pub cmd_type: CmdType,
    pub sn: String,
    pub device_id: String,
    /// 仅 Catalog 且解析成功时非空
    pub items: Vec<CatalogItem>,
    /// Catalog 声明的通道总数
    pub sum_num: Option<u32>,
    /// 缺少 DeviceID 而被丢弃的目录项
    pub skipped_items: usize,
}

impl ManscdpMessage {
    /// 设备明确上报零通道
    pub fn is_empty_catalog(&self) -> bool {
        self.cmd_type == CmdType::Catalog && self.items.is_empty() && self.sum_num == Some(0)
    }
}

/// 解析 MESSAGE 消息体
///
/// 文档无法反序列化时退化为标签扫描，只恢复 CmdType/DeviceID，不产生通道。
pub fn decode(body: &str) -> ManscdpMessage {
    let xml = body.trim();
    match from_str::<Envelope>(xml) {
        Ok(env) => {
            let cmd_type = CmdType::parse(&env.cmd_type);
            let mut skipped_items = 0;
            let items = if cmd_type == CmdType::Catalog {
                env.device_list
                    .map(|list| {
                        let total = list.items.len();
                        let items: Vec<CatalogItem> = list
                            .items
                            .into_iter()
                            .map(CatalogItem::from)
                            .filter(|item| !item.channel_id.is_empty())
                            .collect();
                        skipped_items = total - items.len();
                        items
                    })
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            ManscdpMessage {
                cmd_type,
                sn: env.sn.trim().to_string(),
                device_id: env.device_id.trim().to_string(),
                items,
                sum_num: env.sum_num.and_then(|n| n.trim().parse().ok()),
                skipped_items,
            }
        }
        Err(e) => {
            tracing::debug!(target: "gb28181::manscdp", "MANSCDP body fallback to tag scan: {}", e);
            ManscdpMessage {
                cmd_type: CmdType::parse(scan_tag(xml, "CmdType").unwrap_or_default()),
                sn: scan_tag(xml, "SN").unwrap_or_default().to_string(),
                device_id: scan_tag(xml, "DeviceID").unwrap_or_default().to_string(),
                items: Vec::new(),
                sum_num: None,
                skipped_items: 0,
            }
        }
    }
}

/// 取第一个 `<tag>…</tag>` 的文本
fn scan_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim())
}

/// 新的 SN：当前 Unix 纳秒对 10^11 取模
pub fn next_sn() -> u64 {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    (nanos.unsigned_abs()) % 100_000_000_000
}

/// 生成目录查询 XML
pub fn catalog_query_xml(device_id: &str, sn: u64) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Query>\r\n\
         <CmdType>Catalog</CmdType>\r\n\
         <SN>{}</SN>\r\n\
         <DeviceID>{}</DeviceID>\r\n\
         </Query>\r\n",
        sn,
        escape(device_id)
    )
}
