//! winget 编排核心
//!
//! 启动 winget、实时转发输出、按 track id 取消、解析已安装包列表，
//! 以及从注册表字符串推断安装目录。

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod install_dir;
pub mod package_manager;

pub use config::Config;
pub use error::{Result, WingetError};
pub use install_dir::{derive_directory_from_command, resolve_install_directory, PathResolver};
pub use package_manager::PackageManager;
