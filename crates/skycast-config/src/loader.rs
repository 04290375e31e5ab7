use anyhow::{anyhow, Context, Result};
use config::{Config, File, FileFormat};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{GlobalConfig, ProtocolConfig};

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// 加载全局配置
    pub fn load_global(&self) -> Result<GlobalConfig> {
        let config_path = self.config_dir.join("global.toml");

        if !config_path.exists() {
            // 配置文件不存在时使用默认配置
            debug!(path = %config_path.display(), "Global config not found, using defaults");
            return Ok(GlobalConfig::default());
        }

        let config = build(&config_path)?;
        let global = config
            .try_deserialize()
            .with_context(|| format!("invalid global config {}", config_path.display()))?;
        info!(path = %config_path.display(), "Global config loaded");
        Ok(global)
    }

    fn protocol_path(&self, protocol_name: &str) -> PathBuf {
        self.config_dir
            .join("protocols")
            .join(format!("{}.toml", protocol_name))
    }

    /// 加载协议配置，文件不存在时返回默认值
    pub fn load_protocol<T>(&self, protocol_name: &str) -> Result<ProtocolConfig<T>>
    where
        T: DeserializeOwned + Default,
    {
        let config_path = self.protocol_path(protocol_name);

        if !config_path.exists() {
            debug!(protocol = protocol_name, "Protocol config not found, using defaults");
            return Ok(ProtocolConfig::default());
        }

        let config = build(&config_path)?;
        let protocol = config
            .try_deserialize()
            .with_context(|| format!("invalid {} config {}", protocol_name, config_path.display()))?;
        info!(protocol = protocol_name, path = %config_path.display(), "Protocol config loaded");
        Ok(protocol)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        let global = self.load_global()?;

        if global.system.name.trim().is_empty() {
            return Err(anyhow!("system.name cannot be empty"));
        }
        if global.storage.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("storage.data_dir cannot be empty"));
        }

        // 协议目录下的文件至少要是合法 TOML
        let protocols_dir = self.config_dir.join("protocols");
        if protocols_dir.is_dir() {
            for entry in std::fs::read_dir(&protocols_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    continue;
                }
                let text = std::fs::read_to_string(&path)?;
                toml::from_str::<toml::Value>(&text)
                    .with_context(|| format!("malformed TOML in {}", path.display()))?;
            }
        }

        Ok(())
    }
}

fn build(path: &Path) -> Result<Config> {
    let config = Config::builder()
        .add_source(File::new(
            path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
            FileFormat::Toml,
        ))
        .build()?;
    Ok(config)
}
