use crate::package_manager::FieldAliases;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// winget 可执行文件，可以是完整路径
    pub program: String,
    /// list 时优先尝试 `--output json`
    pub prefer_structured_output: bool,
    /// upgrade-all 运行期间阻止单个 upgrade / uninstall 并发执行
    pub serialize_upgrade_all: bool,
    pub field_aliases: FieldAliases,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            program: "winget".to_string(),
            prefer_structured_output: true,
            serialize_upgrade_all: false,
            field_aliases: FieldAliases::default(),
        }
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".config/lian-winget/config.toml")
    }

    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }
}
