//! 时钟能力契约：生产代码只依赖这里的 trait 与句柄类型。
//!
//! # 设计背景（Why）
//! - 调度器、通知器、健康检查等组件若直接读取真实时间，将无法在测试中复现竞态与边界条件；
//! - 通过 [`Clock`] 注入时间源，生产环境使用 [`SystemClock`](crate::SystemClock)，测试使用
//!   [`MockClock`](crate::MockClock)，两者返回同一组句柄类型，业务代码无需感知差异。
//!
//! # 契约说明（What）
//! - 所有方法都接受一组标签 `tags`，真实时钟忽略它们；虚拟时钟用它们匹配陷阱；
//! - 句柄（[`Timer`]、[`Ticker`]、[`Waiter`]）内部持有各自实现的后端，公开方法语义与真实定时器一致：
//!   `stop`/`reset` 的布尔返回值是判断“是否赢得与触发的竞争”的唯一依据。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::cancellation::Cancellation;
use crate::error::{BoxError, ClockError};
use crate::slot::TickSlot;

/// `after_func` 注册的回调；定时器被 `reset` 后可能再次执行，因此是 `Fn` 而非 `FnOnce`。
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// `ticker_func` 周期执行的函数；返回错误即终止循环。
pub type TickerCallback = Box<dyn FnMut() -> Result<(), BoxError> + Send + 'static>;

/// 抽象可注入的时钟。
///
/// # 接口约束（What）
/// - `now`/`since`/`until`：读取当前时间或与给定时间点的差值；
/// - `new_timer`/`after_func`：一次性定时器，前者投递值，后者执行回调；
/// - `new_ticker`：固定周期、单槽有损投递的周期器；
/// - `ticker_func`：固定周期执行函数，直到函数出错或 `ctx` 被取消，结果通过 [`Waiter`] 观察。
///
/// # 使用指引（How）
/// - 推荐通过 `Arc<dyn Clock>` 传递给需要时间能力的组件；
/// - 为方便陷阱过滤，调用点可携带描述自身用途的标签，例如 `&["reconciler", "backoff"]`。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前时间。
    fn now(&self, tags: &[&str]) -> DateTime<Utc>;

    /// 返回自 `t` 起经过的时间，`t` 在未来时为负值。
    fn since(&self, t: DateTime<Utc>, tags: &[&str]) -> TimeDelta;

    /// 返回距离 `t` 的剩余时间，`t` 在过去时为负值。
    fn until(&self, t: DateTime<Utc>, tags: &[&str]) -> TimeDelta;

    /// 创建一次性定时器，`d <= 0` 时立即以当前时间触发。
    fn new_timer(&self, d: TimeDelta, tags: &[&str]) -> Timer;

    /// 创建到期后执行 `f` 的定时器，返回的 [`Timer`] 没有投递槽。
    fn after_func(&self, d: TimeDelta, f: TimerCallback, tags: &[&str]) -> Timer;

    /// 创建周期器。
    ///
    /// # Panics
    /// `d <= 0` 时 panic。
    fn new_ticker(&self, d: TimeDelta, tags: &[&str]) -> Ticker;

    /// 以周期 `d` 反复执行 `f`，直到 `f` 返回错误或 `ctx` 被取消。
    ///
    /// # Panics
    /// `d <= 0` 时 panic。
    fn ticker_func(
        &self,
        ctx: &Cancellation,
        d: TimeDelta,
        f: TickerCallback,
        tags: &[&str],
    ) -> Waiter;
}

pub(crate) trait TimerBackend: Send + Sync {
    fn stop(&self, tags: &[&str]) -> bool;
    fn reset(&self, d: TimeDelta, tags: &[&str]) -> bool;
}

pub(crate) trait TickerBackend: Send + Sync {
    fn stop(&self, tags: &[&str]);
    fn reset(&self, d: TimeDelta, tags: &[&str]);
}

pub(crate) trait WaiterBackend: Send + Sync {
    fn wait(&self, tags: &[&str]) -> Result<(), ClockError>;
}

/// 一次性定时器句柄。
///
/// 通过 [`Clock::new_timer`] 创建的定时器携带投递槽，可用 [`channel`](Self::channel) 读取触发时间；
/// 通过 [`Clock::after_func`] 创建的定时器没有投递槽。克隆得到的句柄指向同一个定时器。
#[derive(Clone)]
pub struct Timer {
    slot: Option<TickSlot>,
    backend: Arc<dyn TimerBackend>,
}

impl Timer {
    pub(crate) fn new(slot: Option<TickSlot>, backend: Arc<dyn TimerBackend>) -> Self {
        Self { slot, backend }
    }

    /// 投递槽；`after_func` 定时器返回 `None`。
    pub fn channel(&self) -> Option<&TickSlot> {
        self.slot.as_ref()
    }

    /// 停止定时器。
    ///
    /// 返回 `true` 表示本次调用阻止了触发；定时器已触发或已停止时返回 `false`。
    pub fn stop(&self, tags: &[&str]) -> bool {
        self.backend.stop(tags)
    }

    /// 重新装填定时器，丢弃尚未读取的旧值。
    ///
    /// 返回值表示调用前定时器是否仍在运行。`d <= 0` 时立即以当前时间触发。
    pub fn reset(&self, d: TimeDelta, tags: &[&str]) -> bool {
        self.backend.reset(d, tags)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("has_channel", &self.slot.is_some())
            .finish_non_exhaustive()
    }
}

/// 周期器句柄，单槽有损投递。
#[derive(Clone)]
pub struct Ticker {
    slot: TickSlot,
    backend: Arc<dyn TickerBackend>,
}

impl Ticker {
    pub(crate) fn new(slot: TickSlot, backend: Arc<dyn TickerBackend>) -> Self {
        Self { slot, backend }
    }

    /// 投递槽；消费者来不及读取时多余的 tick 被丢弃。
    pub fn channel(&self) -> &TickSlot {
        &self.slot
    }

    /// 停止周期器，可重复调用。
    pub fn stop(&self, tags: &[&str]) {
        self.backend.stop(tags);
    }

    /// 以新周期 `d` 重新开始计时，丢弃尚未读取的旧 tick。
    ///
    /// # Panics
    /// `d <= 0` 时 panic。
    pub fn reset(&self, d: TimeDelta, tags: &[&str]) {
        self.backend.reset(d, tags);
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker").finish_non_exhaustive()
    }
}

/// 周期函数循环的完成句柄。
#[derive(Clone)]
pub struct Waiter {
    backend: Arc<dyn WaiterBackend>,
}

impl Waiter {
    pub(crate) fn new(backend: Arc<dyn WaiterBackend>) -> Self {
        Self { backend }
    }

    /// 阻塞直到循环退出，返回退出原因。
    ///
    /// 循环总是带着原因退出（函数错误或取消），因此返回值总是 `Err`。
    pub fn wait(&self, tags: &[&str]) -> Result<(), ClockError> {
        self.backend.wait(tags)
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").finish_non_exhaustive()
    }
}

/// 把真实时钟的有符号时长换算成标准库时长，负值截断为零。
pub(crate) fn to_std(d: TimeDelta) -> std::time::Duration {
    d.to_std().unwrap_or(std::time::Duration::ZERO)
}
