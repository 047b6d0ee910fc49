//! 取消令牌：`TickerFunc` 的退出信号，也是测试侧所有阻塞等待的超时边界。
//!
//! # 模块定位（Why）
//! - 周期函数循环需要一个“外部要求停止”的原生通道；
//! - `Trap::wait`、`Call::release_until`、`AdvanceWaiter::wait` 在测试中必须有界，否则一次遗漏的释放就会让
//!   整个测试套件挂死。
//!
//! # 结构概览（What）
//! - 原子位提供无锁的 [`Cancellation::is_cancelled`] 快路径；
//! - `Mutex + Condvar` 承载取消原因与阻塞等待；
//! - 监听器列表让等待方在取消时被唤醒，而不是轮询。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ClockError;

type Listener = Box<dyn FnOnce() + Send + 'static>;

/// 取消原语，跨线程共享同一份取消状态。
///
/// # 设计背景（Why）
/// - 与框架内其他并发原语保持一致：`clone`/[`child`](Self::child) 得到的令牌共享同一原子位；
/// - 在原有“只读标记”的基础上扩展了取消原因与阻塞等待，满足周期函数与测试等待的需要。
///
/// # 契约说明（What）
/// - 取消只发生一次，首个原因胜出，后续 `cancel` 返回 `false`；
/// - [`with_timeout`](Self::with_timeout) 构造的令牌在真实时间到期后以
///   [`ClockError::DeadlineExceeded`] 自行取消；
/// - 监听器在取消线程上执行，执行时不持有令牌内部锁。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

struct CancellationState {
    flag: AtomicBool,
    inner: Mutex<CancelInner>,
    cond: Condvar,
}

#[derive(Default)]
struct CancelInner {
    cause: Option<ClockError>,
    listeners: Vec<(u64, Listener)>,
    next_listener: u64,
}

impl std::fmt::Debug for CancellationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationState")
            .field("cancelled", &self.flag.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState {
                flag: AtomicBool::new(false),
                inner: Mutex::new(CancelInner::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// 创建在 `timeout` 真实时间后自动取消的令牌。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：测试中的每个阻塞等待都需要上限，避免遗漏的 `release` 让 CI 挂起。
    /// - **实现 (How)**：与 `SystemClock::sleep` 同样的思路，启动一个辅助线程在条件变量上等待截止点；
    ///   若令牌提前被取消，线程随即退出。
    /// - **契约 (What)**：到期后 [`cause`](Self::cause) 为 [`ClockError::DeadlineExceeded`]。
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        let deadline = Instant::now() + timeout;
        let state = Arc::clone(&token.inner);
        thread::spawn(move || {
            let mut guard = state.inner.lock();
            while guard.cause.is_none() {
                if state.cond.wait_until(&mut guard, deadline).timed_out() {
                    if guard.cause.is_none() {
                        let listeners = state.mark(&mut guard, ClockError::DeadlineExceeded);
                        drop(guard);
                        state.cond.notify_all();
                        run_listeners(listeners);
                    }
                    return;
                }
            }
        });
        token
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        let mut guard = self.inner.inner.lock();
        if guard.cause.is_some() {
            return false;
        }
        let listeners = self.inner.mark(&mut guard, ClockError::Cancelled);
        drop(guard);
        self.inner.cond.notify_all();
        run_listeners(listeners);
        true
    }

    /// 派生共享同一取消状态的子令牌，用于跨模块传播取消语义。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 返回取消原因；未取消时为 `None`。
    pub fn cause(&self) -> Option<ClockError> {
        self.inner.inner.lock().cause.clone()
    }

    /// 阻塞直到令牌被取消，返回取消原因。
    pub fn wait(&self) -> ClockError {
        let mut guard = self.inner.inner.lock();
        loop {
            if let Some(cause) = &guard.cause {
                return cause.clone();
            }
            self.inner.cond.wait(&mut guard);
        }
    }

    /// 阻塞直到令牌被取消或到达真实时间 `deadline`。
    ///
    /// 到期且仍未取消时返回 `None`。
    pub fn wait_deadline(&self, deadline: Instant) -> Option<ClockError> {
        let mut guard = self.inner.inner.lock();
        loop {
            if let Some(cause) = &guard.cause {
                return Some(cause.clone());
            }
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                return guard.cause.clone();
            }
        }
    }

    /// 登记一个在取消时执行一次的回调。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：让其他同步原语（陷阱队列、完成信号、周期函数）在取消时被精确唤醒，避免轮询。
    /// - **契约 (What)**：
    ///   - 令牌已取消时回调立即在当前线程执行，返回的登记句柄为空操作；
    ///   - 丢弃返回的 [`CancelRegistration`] 即注销回调；
    ///   - 回调在取消线程上执行，调用方不得在回调中等待取消线程持有的资源。
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.inner.inner.lock();
        if guard.cause.is_some() {
            drop(guard);
            callback();
            return CancelRegistration { slot: None };
        }
        let id = guard.next_listener;
        guard.next_listener += 1;
        guard.listeners.push((id, Box::new(callback)));
        CancelRegistration {
            slot: Some((Arc::clone(&self.inner), id)),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationState {
    fn mark(&self, guard: &mut CancelInner, cause: ClockError) -> Vec<(u64, Listener)> {
        guard.cause = Some(cause);
        self.flag.store(true, Ordering::Release);
        std::mem::take(&mut guard.listeners)
    }
}

fn run_listeners(listeners: Vec<(u64, Listener)>) {
    for (_, listener) in listeners {
        listener();
    }
}

/// [`Cancellation::on_cancel`] 返回的登记句柄，丢弃即注销。
#[must_use = "dropping the registration removes the listener immediately"]
pub struct CancelRegistration {
    slot: Option<(Arc<CancellationState>, u64)>,
}

impl std::fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("active", &self.slot.is_some())
            .finish()
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some((state, id)) = self.slot.take() {
            state.inner.lock().listeners.retain(|(slot, _)| *slot != id);
        }
    }
}
