use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 全局配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub system: SystemConfig,
    pub storage: StorageGlobalConfig,
}

/// 系统配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub version: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "SkyCast Video Platform".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

/// 存储全局配置，SDP 导出等文件落在 data_dir 下
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageGlobalConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageGlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}
