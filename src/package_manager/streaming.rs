//! 流式命令执行（list / upgrade / uninstall）
//!
//! 每次调用启动一个 winget 子进程，stdout / stderr 各由一个读取任务转发，
//! 每段输出立即作为 `StreamEvent` 推给所有订阅方，同时累积为最终结果。
//!
//! 取消流程：
//!   1. 直接终止：Unix 上对子进程所在进程组发 SIGTERM，其他平台在运行循环里 `start_kill`
//!   2. 进程树强杀：仅 Windows，`taskkill /PID <pid> /T /F`，只发起不等待
//!
//! 只要有一步成功就落下取消标记。token 在启动前就已预留，排队中的调用被取消时
//! 只落标记，启动前检查到标记就直接返回 Cancelled；标记恰好落在启动与挂上句柄之间时，
//! 挂上句柄后立即终止。
//!
//! 信号发出和进程自然退出之间存在极短的竞争窗口：
//! 进程可能在信号到达前已经以 0 退出，此时结果如实报告为成功。

use super::registry::{ProcessControl, ProcessRegistry, TrackedRun};
use super::types::{CancelError, CancelResult, OperationContext, StreamEvent, StreamKind};
use crate::diagnostics::log_event;
use crate::error::{Result, WingetError};
use serde_json::json;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 4096;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// 正在运行的子进程句柄，登记在 `ProcessRegistry` 中供 cancel 使用
pub struct ChildHandle {
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl ProcessControl for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn terminate(&self) -> bool {
        match self.pid {
            Some(pid) => {
                let pid = pid as libc::pid_t;
                // 子进程是自己进程组的组长，先对整组发信号，失败再退回单个 pid
                unsafe { libc::kill(-pid, libc::SIGTERM) == 0 || libc::kill(pid, libc::SIGTERM) == 0 }
            }
            None => self.kill_tx.send(()).is_ok(),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        self.kill_tx.send(()).is_ok()
    }

    #[cfg(windows)]
    fn kill_tree(&self) -> bool {
        use std::os::windows::process::CommandExt;

        let Some(pid) = self.pid else {
            return false;
        };
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .spawn()
            .is_ok()
    }
}

/// 把读到的字节解码为 UTF-8；末尾不完整的多字节序列留到下一次
fn decode_utf8(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    match std::str::from_utf8(pending.as_slice()) {
        Ok(s) => {
            let text = s.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// 从管道读取输出并转发到 channel（通用辅助函数）
async fn pump_stream<R>(mut reader: R, stream: StreamKind, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut pending = Vec::new();

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decode_utf8(&mut pending, &buffer[..n]);
                if !text.is_empty() && tx.send((stream, text)).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::warn!("读取 {:?} 失败: {}", stream, e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send((stream, String::from_utf8_lossy(&pending).into_owned()));
    }
}

/// winget 调用器：启动、转发输出、收尾、取消
pub struct CommandRunner {
    program: String,
    registry: Arc<ProcessRegistry>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            program: program.into(),
            registry,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// 订阅此后所有调用的输出事件；接收端被丢弃后自动退订
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    fn emit(&self, event: StreamEvent) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn build_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                // 创建独立进程组，方便 cancel 时统一结束整棵进程树
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }

    /// 为带 track id 的调用预留 token；token 已被占用时在启动任何进程之前拒绝
    pub fn reserve(&self, ctx: &OperationContext) -> Result<Option<TrackedRun>> {
        let Some(id) = ctx.track_id.as_deref() else {
            return Ok(None);
        };
        match TrackedRun::reserve(self.registry.clone(), id) {
            Some(run) => Ok(Some(run)),
            None => Err(WingetError::invalid_argument(format!(
                "track id {} is already in use",
                id
            ))),
        }
    }

    /// 执行一次 winget 调用，成功时返回 stdout + stderr 的完整输出
    pub async fn run(&self, args: &[String], ctx: OperationContext) -> Result<String> {
        let tracked = self.reserve(&ctx)?;
        self.run_reserved(args, ctx, tracked).await
    }

    /// 使用已经预留好的 token 执行调用；排队期间被取消时不会启动进程
    pub async fn run_reserved(
        &self,
        args: &[String],
        ctx: OperationContext,
        tracked: Option<TrackedRun>,
    ) -> Result<String> {
        if let Some(run) = tracked {
            if run.cancel_requested() {
                log::info!("track id {} 在启动前已被取消", run.track_id());
                run.finish();
                return Err(WingetError::Cancelled);
            }
            return self.spawn_and_wait(args, ctx, Some(run)).await;
        }
        self.spawn_and_wait(args, ctx, None).await
    }

    async fn spawn_and_wait(
        &self,
        args: &[String],
        ctx: OperationContext,
        tracked: Option<TrackedRun>,
    ) -> Result<String> {
        // 启动失败时 tracked 随之被丢弃，预留自动释放
        let mut child = self.build_command(args).spawn().map_err(|source| {
            log::warn!("启动 {} 失败: {}", self.program, source);
            WingetError::Spawn {
                program: self.program.clone(),
                source,
            }
        })?;

        let pid = child.id();
        log_event(
            log::Level::Info,
            "winget spawned",
            json!({
                "program": self.program,
                "args": args,
                "pid": pid,
                "action": ctx.action,
                "trackId": ctx.track_id,
            }),
        );

        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
        let handle: Arc<dyn ProcessControl> = Arc::new(ChildHandle { pid, kill_tx });
        if let Some(run) = &tracked {
            if run.attach(handle.clone()) {
                log::info!("track id {} 在启动过程中被取消，立即终止", run.track_id());
                if !handle.terminate() {
                    handle.kill_tree();
                }
            }
        }

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(stdout, StreamKind::Stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(stderr, StreamKind::Stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);

        let mut output = String::new();
        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => match chunk {
                    Some((stream, data)) => {
                        log::debug!("[{:?}] {} bytes", stream, data.len());
                        output.push_str(&data);
                        self.emit(StreamEvent::new(data, stream, args, &ctx));
                    }
                    None => break,
                },
                Some(()) = kill_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        log::warn!("终止 {} 失败: {}", self.program, e);
                    }
                }
            }
        }

        let status = child.wait().await;
        // 先注销再判断取消标记，之后到达的 cancel 只会得到 not_running
        let cancelled = tracked.map(TrackedRun::finish).unwrap_or(false);
        drop(handle);
        let status = status?;

        log_event(
            log::Level::Info,
            "winget exited",
            json!({
                "pid": pid,
                "code": status.code(),
                "cancelled": cancelled,
                "trackId": ctx.track_id,
            }),
        );

        if cancelled {
            return Err(WingetError::Cancelled);
        }
        match status.code() {
            // 部分 winget 版本成功时不给退出码
            Some(0) | None => Ok(output),
            Some(code) => Err(WingetError::non_zero_exit(code, &output)),
        }
    }

    /// 请求取消一个调用；只负责发出信号，不等待进程真正退出。
    /// 还在排队、尚未启动的调用只落下标记，启动前会检查。
    pub fn cancel(&self, track_id: &str) -> CancelResult {
        let Some(entry) = self.registry.lookup(track_id) else {
            log::debug!("cancel {}: 没有正在运行的进程", track_id);
            return CancelResult::failed(CancelError::NotRunning);
        };

        let Some(handle) = entry.handle else {
            if self.registry.mark_cancelled(track_id, entry.generation) {
                log::info!("cancel {}: 调用尚未启动，已标记取消", track_id);
                return CancelResult::dequeued();
            }
            return CancelResult::failed(CancelError::NotRunning);
        };

        let terminated = handle.terminate();
        let tree_killed = handle.kill_tree();
        if !terminated && !tree_killed {
            log::warn!("cancel {}: 无法终止进程 {:?}", track_id, handle.pid());
            return CancelResult::failed(CancelError::UnableToTerminate);
        }

        if !self.registry.mark_cancelled(track_id, entry.generation) {
            log::debug!("cancel {}: 进程在信号发出前已经退出", track_id);
        }
        log_event(
            log::Level::Info,
            "winget cancel issued",
            json!({
                "trackId": track_id,
                "pid": handle.pid(),
                "terminated": terminated,
                "treeKilled": tree_killed,
            }),
        );
        CancelResult::killed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package_manager::types::Action;

    #[test]
    fn decode_carries_split_multibyte_sequences() {
        let bytes = "升级".as_bytes();
        let mut pending = Vec::new();
        assert_eq!(decode_utf8(&mut pending, &bytes[..2]), "");
        assert_eq!(pending.len(), 2);
        assert_eq!(decode_utf8(&mut pending, &bytes[2..4]), "升");
        assert_eq!(decode_utf8(&mut pending, &bytes[4..]), "级");
        assert!(pending.is_empty());
    }

    #[test]
    fn decode_replaces_invalid_bytes() {
        let mut pending = Vec::new();
        let text = decode_utf8(&mut pending, &[b'o', b'k', 0xff, b'!']);
        assert_eq!(text, "ok\u{fffd}!");
        assert!(pending.is_empty());
    }

    struct Stubborn;

    impl ProcessControl for Stubborn {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn terminate(&self) -> bool {
            false
        }
    }

    #[test]
    fn cancel_reports_unknown_track_id() {
        let runner = CommandRunner::new("winget", Arc::new(ProcessRegistry::new()));
        assert_eq!(
            runner.cancel("nope"),
            CancelResult::failed(CancelError::NotRunning)
        );
    }

    #[test]
    fn failed_termination_does_not_mark() {
        let registry = Arc::new(ProcessRegistry::new());
        let run = TrackedRun::reserve(registry.clone(), "op").unwrap();
        run.attach(Arc::new(Stubborn));
        let runner = CommandRunner::new("winget", registry.clone());

        assert_eq!(
            runner.cancel("op"),
            CancelResult::failed(CancelError::UnableToTerminate)
        );
        assert!(!run.cancel_requested());
        assert!(registry.is_running("op"));
    }

    #[test]
    fn reserved_token_rejects_second_caller() {
        let runner = CommandRunner::new("winget", Arc::new(ProcessRegistry::new()));
        let ctx = OperationContext::new(Action::Upgrade)
            .with_track_id(Some("row"));
        let held = runner.reserve(&ctx).unwrap();
        assert!(held.is_some());
        assert!(matches!(
            runner.reserve(&ctx),
            Err(WingetError::InvalidArgument(_))
        ));
        drop(held);
        assert!(runner.reserve(&ctx).unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_before_spawn_skips_the_process() {
        let runner = CommandRunner::new(
            "/nonexistent/winget-does-not-exist",
            Arc::new(ProcessRegistry::new()),
        );
        let ctx = OperationContext::new(Action::Uninstall)
            .with_track_id(Some("queued"));
        let tracked = runner.reserve(&ctx).unwrap();

        assert_eq!(runner.cancel("queued"), CancelResult::dequeued());
        // 程序不存在，若真的启动会得到 Spawn 错误
        let err = runner.run_reserved(&[], ctx, tracked).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(runner.registry().is_empty());
    }
}
