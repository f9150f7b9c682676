//! 包管理器模块：对 winget 的封装
//!
//! `PackageManager` 是对外的操作入口：list / upgrade / upgrade-all / uninstall / cancel。
//! 真正的进程管理在 `streaming`，文本解析在 `parser`。

pub mod parser;
pub mod registry;
pub mod streaming;
pub mod types;

// 重新导出常用类型和函数
pub use parser::{parse_json_list, parse_list};
pub use registry::{ProcessControl, ProcessRegistry, RunEntry, TrackedRun};
pub use streaming::CommandRunner;
pub use types::{
    Action, CancelError, CancelResult, FieldAliases, OperationContext, PackageRecord,
    StreamEvent, StreamKind,
};

use crate::config::Config;
use crate::diagnostics::log_event;
use crate::error::{Result, WingetError};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// 拒绝明显不是包标识的输入，避免被当作额外参数传给 winget
fn validate_package_id(id: &str) -> Result<&str> {
    if id.is_empty() {
        return Err(WingetError::invalid_argument("package id is empty"));
    }
    if id.starts_with('-') {
        return Err(WingetError::invalid_argument(format!(
            "package id {:?} looks like a flag",
            id
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(WingetError::invalid_argument(format!(
            "package id {:?} contains whitespace or control characters",
            id
        )));
    }
    Ok(id)
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn labeled(ctx: OperationContext, name: Option<&str>) -> OperationContext {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => ctx.with_name(name),
        None => ctx,
    }
}

/// 回退日志的元数据；错误文本可能是整段工具输出，交给 `log_event` 截断
fn fallback_meta(stage: &str, err: &WingetError) -> Value {
    json!({ "stage": stage, "error": err.to_string() })
}

/// 等待 upgrade 闸门；排队期间收到取消请求时直接返回 Cancelled，预留随 `TrackedRun` 释放
async fn wait_gate<G>(tracked: Option<&TrackedRun>, gate: impl Future<Output = G>) -> Result<G> {
    match tracked {
        Some(run) => tokio::select! {
            guard = gate => Ok(guard),
            _ = run.cancelled() => {
                log::info!("track id {} 在排队时被取消", run.track_id());
                Err(WingetError::Cancelled)
            }
        },
        None => Ok(gate.await),
    }
}

#[derive(Clone)]
pub struct PackageManager {
    runner: Arc<CommandRunner>,
    aliases: FieldAliases,
    prefer_structured: bool,
    /// 开启后 upgrade-all 独占，单个 upgrade / uninstall 共享
    upgrade_gate: Option<Arc<RwLock<()>>>,
}

impl PackageManager {
    pub fn new(config: &Config) -> Self {
        let runner = CommandRunner::new(config.program.clone(), Arc::new(ProcessRegistry::new()));
        Self::with_runner(Arc::new(runner), config)
    }

    pub fn with_runner(runner: Arc<CommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            aliases: config.field_aliases.clone(),
            prefer_structured: config.prefer_structured_output,
            upgrade_gate: config
                .serialize_upgrade_all
                .then(|| Arc::new(RwLock::new(()))),
        }
    }

    pub fn runner(&self) -> &Arc<CommandRunner> {
        &self.runner
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.runner.subscribe()
    }

    async fn shared_gate(&self) -> Option<RwLockReadGuard<'_, ()>> {
        match &self.upgrade_gate {
            Some(gate) => Some(gate.read().await),
            None => None,
        }
    }

    async fn exclusive_gate(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        match &self.upgrade_gate {
            Some(gate) => Some(gate.write().await),
            None => None,
        }
    }

    // ===== 查询 =====

    /// 列出已安装的包；优先使用 JSON 输出，失败时回退到文本表格解析
    pub async fn list(&self) -> Result<Vec<PackageRecord>> {
        if self.prefer_structured {
            let args = to_args(&["list", "--output", "json"]);
            match self.runner.run(&args, OperationContext::new(Action::List)).await {
                Ok(out) => match parse_json_list(&out, &self.aliases) {
                    Ok(records) => return Ok(records),
                    Err(e) => log_event(
                        log::Level::Warn,
                        "结构化输出不可用，回退到文本模式",
                        fallback_meta("parse", &e),
                    ),
                },
                Err(e) => log_event(
                    log::Level::Warn,
                    "winget list --output json 失败，回退到文本模式",
                    fallback_meta("invoke", &e),
                ),
            }
        }
        self.list_text().await
    }

    /// 仅使用文本模式列出已安装的包
    pub async fn list_text(&self) -> Result<Vec<PackageRecord>> {
        let out = self
            .runner
            .run(&to_args(&["list"]), OperationContext::new(Action::List))
            .await?;
        Ok(parse_list(&out))
    }

    // ===== 变更操作 =====

    /// 升级单个包 (winget upgrade --id <id> -e)
    pub async fn upgrade(&self, id: &str, track_id: Option<&str>) -> Result<String> {
        self.upgrade_named(id, None, track_id).await
    }

    /// 同 `upgrade`，事件里额外带上包的显示名称
    pub async fn upgrade_named(
        &self,
        id: &str,
        name: Option<&str>,
        track_id: Option<&str>,
    ) -> Result<String> {
        let id = validate_package_id(id)?;
        let ctx = labeled(OperationContext::new(Action::Upgrade).with_id(id), name)
            .with_track_id(track_id);
        let tracked = self.runner.reserve(&ctx)?;
        let _gate = wait_gate(tracked.as_ref(), self.shared_gate()).await?;
        self.runner
            .run_reserved(&to_args(&["upgrade", "--id", id, "-e"]), ctx, tracked)
            .await
    }

    /// 升级全部可升级的包 (winget upgrade --all -e)
    pub async fn upgrade_all(&self, track_id: Option<&str>) -> Result<String> {
        let ctx = OperationContext::new(Action::UpgradeAll).with_track_id(track_id);
        let tracked = self.runner.reserve(&ctx)?;
        let _gate = wait_gate(tracked.as_ref(), self.exclusive_gate()).await?;
        self.runner
            .run_reserved(&to_args(&["upgrade", "--all", "-e"]), ctx, tracked)
            .await
    }

    /// 卸载单个包 (winget uninstall --id <id> -e)
    pub async fn uninstall(&self, id: &str, track_id: Option<&str>) -> Result<String> {
        self.uninstall_named(id, None, track_id).await
    }

    /// 同 `uninstall`，事件里额外带上包的显示名称
    pub async fn uninstall_named(
        &self,
        id: &str,
        name: Option<&str>,
        track_id: Option<&str>,
    ) -> Result<String> {
        let id = validate_package_id(id)?;
        let ctx = labeled(OperationContext::new(Action::Uninstall).with_id(id), name)
            .with_track_id(track_id);
        let tracked = self.runner.reserve(&ctx)?;
        let _gate = wait_gate(tracked.as_ref(), self.shared_gate()).await?;
        self.runner
            .run_reserved(&to_args(&["uninstall", "--id", id, "-e"]), ctx, tracked)
            .await
    }

    // ===== 取消 =====

    pub fn cancel(&self, track_id: &str) -> CancelResult {
        let key = track_id.trim();
        if key.is_empty() {
            return CancelResult::failed(CancelError::InvalidTrackId);
        }
        self.runner.cancel(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_ids_are_validated() {
        assert!(validate_package_id("Git.Git").is_ok());
        assert!(validate_package_id("7zip.7zip").is_ok());
        for bad in ["", "--all", "Git Git", "Git\tGit", "id\u{7}"] {
            assert!(
                matches!(validate_package_id(bad), Err(WingetError::InvalidArgument(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn empty_track_id_is_rejected_on_cancel() {
        let pm = PackageManager::new(&Config::default());
        assert_eq!(
            pm.cancel("  "),
            CancelResult::failed(CancelError::InvalidTrackId)
        );
        assert_eq!(pm.cancel("row-1"), CancelResult::failed(CancelError::NotRunning));
    }

    #[test]
    fn fallback_logging_is_bounded() {
        let err = WingetError::non_zero_exit(1, &"table row ".repeat(5_000));
        let line = crate::diagnostics::format_event("fallback", &fallback_meta("invoke", &err));
        assert!(line.contains("...<truncated>"));
        assert!(line.len() < 2_200);
    }

    #[test]
    fn blank_names_are_not_labels() {
        let ctx = labeled(OperationContext::new(Action::Upgrade), Some("  "));
        assert_eq!(ctx.name, None);
        let ctx = labeled(OperationContext::new(Action::Upgrade), Some("Git"));
        assert_eq!(ctx.name.as_deref(), Some("Git"));
    }

    #[tokio::test]
    async fn invalid_id_never_spawns() {
        let config = Config {
            program: "definitely-not-a-real-winget-binary".into(),
            ..Config::default()
        };
        let pm = PackageManager::new(&config);
        let err = pm.uninstall("-e", Some("t1")).await.unwrap_err();
        assert!(matches!(err, WingetError::InvalidArgument(_)));
    }
}
