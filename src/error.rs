//! 错误类型定义
//!
//! 库内部统一使用 `WingetError`；二进制入口和配置加载仍然使用 anyhow。

use thiserror::Error;

/// 包管理器操作的错误分类
#[derive(Error, Debug)]
pub enum WingetError {
    /// 工具无法启动（找不到可执行文件、权限不足等）
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// 工具运行结束但返回了非零退出码；message 优先使用捕获到的输出
    #[error("{message}")]
    NonZeroExit { code: i32, message: String },

    /// 操作被调用方取消
    #[error("operation cancelled")]
    Cancelled,

    /// 结构化输出不可用，仅在内部用于回退到文本模式
    #[error("structured output unusable: {0}")]
    ParseFallback(String),

    /// 参数不合法，在启动任何进程之前拒绝
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WingetError>;

impl WingetError {
    /// 根据退出码和聚合输出构造 NonZeroExit
    pub fn non_zero_exit(code: i32, output: &str) -> Self {
        let message = if output.trim().is_empty() {
            format!("winget exited with code {}", code)
        } else {
            output.to_string()
        };
        Self::NonZeroExit { code, message }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
