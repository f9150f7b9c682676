//! PackageManager 相关数据类型定义

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// `winget list` 的一行记录；缺失的字段用空字符串表示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub id: String,
    pub version: String,
    pub available: String,
}

impl PackageRecord {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        version: impl Into<String>,
        available: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            version: version.into(),
            available: available.into(),
        }
    }
}

/// 输出来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// 触发本次调用的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    List,
    Upgrade,
    UpgradeAll,
    Uninstall,
}

/// 随每次调用传入的上下文，会原样附带到每个 StreamEvent 上
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationContext {
    pub action: Option<Action>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub track_id: Option<String>,
    /// 调用方自定义的附加字段
    pub extra: BTreeMap<String, String>,
}

impl OperationContext {
    pub fn new(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 空白的 track id 视为未跟踪
    pub fn with_track_id(mut self, track_id: Option<&str>) -> Self {
        self.track_id = track_id
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// 子进程的一段输出，发出后所有权交给订阅方
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub data: String,
    pub stream: StreamKind,
    pub args: Vec<String>,
    /// Unix 毫秒时间戳
    pub timestamp: i64,
    pub action: Option<Action>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub track_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, String>>,
}

impl StreamEvent {
    pub fn new(data: String, stream: StreamKind, args: &[String], ctx: &OperationContext) -> Self {
        Self {
            data,
            stream,
            args: args.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            action: ctx.action,
            id: ctx.id.clone(),
            name: ctx.name.clone(),
            track_id: ctx.track_id.clone(),
            context: if ctx.extra.is_empty() {
                None
            } else {
                Some(ctx.extra.clone())
            },
        }
    }
}

/// 取消失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    InvalidTrackId,
    NotRunning,
    UnableToTerminate,
}

impl CancelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTrackId => "invalid_track_id",
            Self::NotRunning => "not_running",
            Self::UnableToTerminate => "unable_to_terminate",
        }
    }
}

impl std::fmt::Display for CancelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CancelError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// cancel 的返回值：`{ok, error?, killed?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CancelError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killed: Option<bool>,
}

impl CancelResult {
    pub fn killed() -> Self {
        Self {
            ok: true,
            error: None,
            killed: Some(true),
        }
    }

    /// 调用还没启动进程（例如排在 upgrade-all 之后），只记下了取消请求
    pub fn dequeued() -> Self {
        Self {
            ok: true,
            error: None,
            killed: Some(false),
        }
    }

    pub fn failed(error: CancelError) -> Self {
        Self {
            ok: false,
            error: Some(error),
            killed: None,
        }
    }
}

/// 结构化输出中各字段的候选键名，按顺序尝试
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldAliases {
    pub name: Vec<String>,
    pub id: Vec<String>,
    pub version: Vec<String>,
    pub available: Vec<String>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        fn owned(keys: &[&str]) -> Vec<String> {
            keys.iter().map(|k| k.to_string()).collect()
        }
        Self {
            name: owned(&["Name", "name", "PackageName"]),
            id: owned(&["Id", "id", "PackageIdentifier", "PackageId"]),
            version: owned(&["Version", "InstalledVersion", "installedVersion"]),
            available: owned(&["AvailableVersion", "Available", "sourceVersion"]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_event_serializes_camel_case() {
        let ctx = OperationContext::new(Action::UpgradeAll).with_track_id(Some("row-1"));
        let ev = StreamEvent::new("hi".into(), StreamKind::Stderr, &["upgrade".into()], &ctx);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["stream"], json!("stderr"));
        assert_eq!(v["action"], json!("upgradeAll"));
        assert_eq!(v["trackId"], json!("row-1"));
        assert_eq!(v["id"], json!(null));
        assert!(v.get("context").is_none());
    }

    #[test]
    fn extra_fields_become_context() {
        let ctx = OperationContext::new(Action::Upgrade).with_extra("row", "7");
        let ev = StreamEvent::new(String::new(), StreamKind::Stdout, &[], &ctx);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["context"]["row"], json!("7"));
    }

    #[test]
    fn blank_track_id_is_untracked() {
        let ctx = OperationContext::new(Action::Upgrade).with_track_id(Some("   "));
        assert_eq!(ctx.track_id, None);
    }

    #[test]
    fn cancel_result_wire_shape() {
        let v = serde_json::to_value(CancelResult::failed(CancelError::NotRunning)).unwrap();
        assert_eq!(v, json!({"ok": false, "error": "not_running"}));
        let v = serde_json::to_value(CancelResult::killed()).unwrap();
        assert_eq!(v, json!({"ok": true, "killed": true}));
        let v = serde_json::to_value(CancelResult::dequeued()).unwrap();
        assert_eq!(v, json!({"ok": true, "killed": false}));
    }
}
