//! 正在运行的子进程登记表
//!
//! 以调用方提供的 track id 为键。一次运行先预留 token（检查与插入在同一把锁内完成），
//! 启动子进程后再挂上句柄。每次预留分配一个递增的 generation，取消标记记在具体的
//! 那一次预留上，token 被下一次运行复用时旧标记不会串过去。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// 终止子进程的能力；真实实现见 `streaming::ChildHandle`
pub trait ProcessControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// 直接发送终止信号，返回信号是否成功发出
    fn terminate(&self) -> bool;

    /// 强制结束整棵进程树（仅在单个信号杀不干净的平台上有意义）
    fn kill_tree(&self) -> bool {
        false
    }
}

struct Slot {
    generation: u64,
    handle: Option<Arc<dyn ProcessControl>>,
    cancelled: bool,
    wake: Arc<Notify>,
}

#[derive(Default)]
struct RegistryState {
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

/// `lookup` 的结果：哪一次预留，以及子进程是否已经启动
#[derive(Clone)]
pub struct RunEntry {
    pub generation: u64,
    /// 还在排队或尚未启动时为 None
    pub handle: Option<Arc<dyn ProcessControl>>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // 锁内没有会 panic 的操作，中毒时直接沿用内部状态
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 预留 token；已被占用时返回 None，绝不覆盖已有的登记
    fn try_reserve(&self, track_id: &str) -> Option<(u64, Arc<Notify>)> {
        let mut state = self.lock();
        if state.slots.contains_key(track_id) {
            return None;
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let wake = Arc::new(Notify::new());
        state.slots.insert(
            track_id.to_string(),
            Slot {
                generation,
                handle: None,
                cancelled: false,
                wake: wake.clone(),
            },
        );
        log::debug!("reserved track id {} (#{})", track_id, generation);
        Some((generation, wake))
    }

    /// 挂上子进程句柄，返回这次预留是否已经被请求取消
    fn attach(&self, track_id: &str, generation: u64, handle: Arc<dyn ProcessControl>) -> bool {
        let mut state = self.lock();
        match state.slots.get_mut(track_id) {
            Some(slot) if slot.generation == generation => {
                slot.handle = Some(handle);
                slot.cancelled
            }
            _ => false,
        }
    }

    fn is_marked(&self, track_id: &str, generation: u64) -> bool {
        self.lock()
            .slots
            .get(track_id)
            .is_some_and(|slot| slot.generation == generation && slot.cancelled)
    }

    pub fn lookup(&self, track_id: &str) -> Option<RunEntry> {
        self.lock().slots.get(track_id).map(|slot| RunEntry {
            generation: slot.generation,
            handle: slot.handle.clone(),
        })
    }

    /// token 是否被占用（排队中或运行中）
    pub fn is_running(&self, track_id: &str) -> bool {
        self.lock().slots.contains_key(track_id)
    }

    /// 给指定的那次预留落下取消标记；token 已经换成别的运行时不做任何事
    pub fn mark_cancelled(&self, track_id: &str, generation: u64) -> bool {
        let mut state = self.lock();
        match state.slots.get_mut(track_id) {
            Some(slot) if slot.generation == generation => {
                slot.cancelled = true;
                slot.wake.notify_one();
                true
            }
            _ => false,
        }
    }

    /// 运行结束时的收尾：移除登记并取走标记，在同一把锁内完成
    fn finish(&self, track_id: &str, generation: u64) -> bool {
        let mut state = self.lock();
        match state.slots.get(track_id) {
            Some(slot) if slot.generation == generation => {
                let cancelled = slot.cancelled;
                state.slots.remove(track_id);
                log::debug!("released track id {} (#{})", track_id, generation);
                cancelled
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 一次被跟踪的运行，从预留 token 开始，到 `finish` 或被丢弃为止。
/// 未走到 `finish` 就被丢弃时（例如调用方放弃了 future）也会释放登记。
pub struct TrackedRun {
    registry: Arc<ProcessRegistry>,
    track_id: String,
    generation: u64,
    wake: Arc<Notify>,
    finished: bool,
}

impl TrackedRun {
    /// token 已被占用时返回 None
    pub fn reserve(registry: Arc<ProcessRegistry>, track_id: &str) -> Option<Self> {
        let (generation, wake) = registry.try_reserve(track_id)?;
        Some(Self {
            registry,
            track_id: track_id.to_string(),
            generation,
            wake,
            finished: false,
        })
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn cancel_requested(&self) -> bool {
        self.registry.is_marked(&self.track_id, self.generation)
    }

    /// 在取消请求到达时完成；请求早于等待时立即完成
    pub async fn cancelled(&self) {
        if self.cancel_requested() {
            return;
        }
        self.wake.notified().await;
    }

    /// 子进程已启动；返回 true 表示排队期间已经被请求取消，调用方应立即终止它
    pub fn attach(&self, handle: Arc<dyn ProcessControl>) -> bool {
        self.registry.attach(&self.track_id, self.generation, handle)
    }

    /// 返回本次运行是否被标记为取消
    pub fn finish(mut self) -> bool {
        self.finished = true;
        self.registry.finish(&self.track_id, self.generation)
    }
}

impl Drop for TrackedRun {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.finish(&self.track_id, self.generation);
        }
    }
}
