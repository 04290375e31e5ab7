use serde::{Deserialize, Serialize};

/// 协议配置（泛型，`[server]` 段由各协议自行定义）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProtocolConfig<T> {
    #[serde(default)]
    pub server: T,
}
