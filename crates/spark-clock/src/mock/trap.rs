//! 调用拦截协议：测试登记陷阱，匹配的时钟调用在生效前阻塞，直到测试显式放行。
//!
//! # 教案式说明
//! - **意图 (Why)**：仅推进时间无法消除“后台任务尚未登记定时器”这类竞态；陷阱把任意一次时钟调用变成
//!   测试可等待、可放行的检查点。
//! - **协议 (How)**：
//!   1. 调用方在持有时钟锁时收集匹配的陷阱（函数相同，且陷阱标签是调用标签的子集）；
//!   2. 释放时钟锁，把同一个调用投递给每个匹配的陷阱，并阻塞在计数闩上，直到每个陷阱各放行一次；
//!   3. 重新加锁执行调用本身，结束时触发完成信号，`release` 才返回。
//! - **契约 (What)**：
//!   - 陷阱关闭后，新到达与尚未取走的调用自动放行，不会因为测试提前结束而挂起；
//!   - 已关闭陷阱的 `wait` 返回 [`ClockError::TrapClosed`]。

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::{MockClock, MockInner, MockState};
use crate::cancellation::Cancellation;
use crate::error::ClockError;
use crate::sync::{Countdown, Signal};

/// 可被拦截的时钟函数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClockFunction {
    NewTimer,
    TimerStop,
    TimerReset,
    NewTicker,
    TickerStop,
    TickerReset,
    TickerFunc,
    TickerFuncWait,
    AfterFunc,
    Now,
    Since,
    Until,
}

impl ClockFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewTimer => "NewTimer",
            Self::TimerStop => "TimerStop",
            Self::TimerReset => "TimerReset",
            Self::NewTicker => "NewTicker",
            Self::TickerStop => "TickerStop",
            Self::TickerReset => "TickerReset",
            Self::TickerFunc => "TickerFunc",
            Self::TickerFuncWait => "TickerFuncWait",
            Self::AfterFunc => "AfterFunc",
            Self::Now => "Now",
            Self::Since => "Since",
            Self::Until => "Until",
        }
    }
}

impl fmt::Display for ClockFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次时钟调用的参数快照。
#[derive(Clone, Debug)]
pub(crate) struct CallRecord {
    function: ClockFunction,
    tags: Vec<String>,
    duration: Option<TimeDelta>,
    time: Option<DateTime<Utc>>,
}

impl CallRecord {
    pub(crate) fn new(function: ClockFunction, tags: &[&str]) -> Self {
        Self {
            function,
            tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
            duration: None,
            time: None,
        }
    }

    pub(crate) fn with_duration(mut self, d: TimeDelta) -> Self {
        self.duration = Some(d);
        self
    }

    pub(crate) fn with_time(mut self, t: DateTime<Utc>) -> Self {
        self.time = Some(t);
        self
    }
}

#[derive(Debug)]
struct CallInner {
    record: CallRecord,
    gate: Countdown,
    done: Arc<Signal>,
}

/// 被拦截调用的完成守卫；析构时触发完成信号。
///
/// 调用方把它声明在时钟锁守卫之后，使其先于锁释放，`release` 返回时调用的效果已经可见。
#[must_use]
pub(crate) struct CallCompletion {
    call: Option<Arc<CallInner>>,
}

impl Drop for CallCompletion {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            call.done.fire();
        }
    }
}

pub(crate) struct TrapShared {
    function: ClockFunction,
    tags: Vec<String>,
    queue: Mutex<TrapQueue>,
    cond: Condvar,
}

#[derive(Default)]
struct TrapQueue {
    closed: bool,
    pending: VecDeque<Arc<CallInner>>,
}

impl TrapShared {
    fn matches(&self, record: &CallRecord) -> bool {
        self.function == record.function && self.tags.iter().all(|tag| record.tags.contains(tag))
    }

    /// 投递调用；陷阱已关闭时直接替它放行。
    fn deliver(&self, call: Arc<CallInner>) {
        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            call.gate.count_down();
            return;
        }
        queue.pending.push_back(call);
        self.cond.notify_all();
    }

    fn shut(&self) -> Vec<Arc<CallInner>> {
        let mut queue = self.queue.lock();
        queue.closed = true;
        self.cond.notify_all();
        queue.pending.drain(..).collect()
    }
}

impl MockClock {
    /// 拦截一次调用：无匹配陷阱时立即返回；否则在释放时钟锁的状态下阻塞，直到所有匹配的陷阱都放行。
    pub(crate) fn intercept(
        &self,
        state: &mut MutexGuard<'_, MockState>,
        record: CallRecord,
    ) -> CallCompletion {
        let traps: Vec<Arc<TrapShared>> = state
            .traps
            .iter()
            .filter(|trap| trap.matches(&record))
            .cloned()
            .collect();
        debug!(
            function = %record.function,
            tags = ?record.tags,
            traps = traps.len(),
            "mock clock call"
        );
        if traps.is_empty() {
            return CallCompletion { call: None };
        }

        let call = Arc::new(CallInner {
            record,
            gate: Countdown::new(traps.len()),
            done: Arc::new(Signal::new()),
        });
        MutexGuard::unlocked(state, || {
            for trap in &traps {
                trap.deliver(Arc::clone(&call));
            }
            call.gate.wait();
        });
        CallCompletion { call: Some(call) }
    }
}

/// 陷阱构造器，由 [`MockClock::trap`] 返回；每个方法登记一个针对对应函数的陷阱。
///
/// 传入的标签是过滤条件：只有携带全部这些标签的调用才会被拦截，空标签匹配该函数的所有调用。
pub struct Trapper<'a> {
    clock: &'a MockClock,
}

impl<'a> Trapper<'a> {
    pub(crate) fn new(clock: &'a MockClock) -> Self {
        Self { clock }
    }

    pub fn new_timer(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::NewTimer, tags)
    }

    pub fn timer_stop(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::TimerStop, tags)
    }

    pub fn timer_reset(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::TimerReset, tags)
    }

    pub fn new_ticker(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::NewTicker, tags)
    }

    pub fn ticker_stop(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::TickerStop, tags)
    }

    pub fn ticker_reset(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::TickerReset, tags)
    }

    pub fn ticker_func(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::TickerFunc, tags)
    }

    pub fn ticker_func_wait(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::TickerFuncWait, tags)
    }

    pub fn after_func(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::AfterFunc, tags)
    }

    pub fn now(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::Now, tags)
    }

    pub fn since(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::Since, tags)
    }

    pub fn until(&self, tags: &[&str]) -> Trap {
        self.register(ClockFunction::Until, tags)
    }

    fn register(&self, function: ClockFunction, tags: &[&str]) -> Trap {
        let shared = Arc::new(TrapShared {
            function,
            tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
            queue: Mutex::new(TrapQueue::default()),
            cond: Condvar::new(),
        });
        self.clock.lock().traps.push(Arc::clone(&shared));
        trace!(function = %function, tags = ?tags, "trap registered");
        Trap {
            shared,
            clock: self.clock.downgrade(),
        }
    }
}

impl fmt::Debug for Trapper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trapper").finish_non_exhaustive()
    }
}

/// 已登记的陷阱。丢弃即关闭。
pub struct Trap {
    shared: Arc<TrapShared>,
    clock: Weak<MockInner>,
}

impl Trap {
    /// 拦截的函数。
    pub fn function(&self) -> ClockFunction {
        self.shared.function
    }

    /// 取出下一个被拦截的调用，按到达顺序返回。
    ///
    /// # 错误
    /// - 陷阱已关闭：[`ClockError::TrapClosed`]；
    /// - `ctx` 先被取消：取消原因。
    pub fn wait(&self, ctx: &Cancellation) -> Result<Call, ClockError> {
        let waker = Arc::clone(&self.shared);
        let _registration = ctx.on_cancel(move || {
            let _guard = waker.queue.lock();
            waker.cond.notify_all();
        });
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(inner) = queue.pending.pop_front() {
                return Ok(Call::new(inner));
            }
            if queue.closed {
                return Err(ClockError::TrapClosed);
            }
            if let Some(cause) = ctx.cause() {
                return Err(cause);
            }
            self.shared.cond.wait(&mut queue);
        }
    }

    /// 与 [`wait`](Self::wait) 相同，失败时 panic。
    pub fn must_wait(&self, ctx: &Cancellation) -> Call {
        match self.wait(ctx) {
            Ok(call) => call,
            Err(err) => panic!("trap for {} did not capture a call: {err}", self.shared.function),
        }
    }

    /// 关闭陷阱：从时钟注销，并放行所有尚未取走的调用。可重复调用。
    pub fn close(&self) {
        if let Some(clock) = MockClock::upgrade(&self.clock) {
            clock
                .lock()
                .traps
                .retain(|trap| !Arc::ptr_eq(trap, &self.shared));
        }
        let pending = self.shared.shut();
        trace!(
            function = %self.shared.function,
            released = pending.len(),
            "trap closed"
        );
        for call in pending {
            call.gate.count_down();
        }
    }
}

impl Drop for Trap {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trap")
            .field("function", &self.shared.function)
            .field("tags", &self.shared.tags)
            .finish_non_exhaustive()
    }
}

/// 被陷阱捕获的一次调用。
///
/// 调用方在 [`release`](Self::release) 之前保持阻塞。同一调用被多个陷阱捕获时，每个陷阱各自得到一个
/// `Call`，全部放行后调用才会继续。
///
/// 未放行就被丢弃的 `Call` 在析构时替测试放行，断言失败不会把调用方永久挂住。
#[derive(Debug)]
pub struct Call {
    pub function: ClockFunction,
    pub tags: Vec<String>,
    /// `NewTimer`、`AfterFunc`、`NewTicker`、`TickerFunc` 以及两种 `Reset` 的时长参数。
    pub duration: Option<TimeDelta>,
    /// `Since`、`Until` 的时间参数。
    pub time: Option<DateTime<Utc>>,
    inner: Arc<CallInner>,
    released: AtomicBool,
}

impl Call {
    fn new(inner: Arc<CallInner>) -> Self {
        let record = inner.record.clone();
        Self {
            function: record.function,
            tags: record.tags,
            duration: record.duration,
            time: record.time,
            inner,
            released: AtomicBool::new(false),
        }
    }

    /// 放行调用并阻塞直到调用执行完毕。
    pub fn release(&self) {
        self.open_gate();
        self.inner.done.wait();
    }

    /// 放行调用，等待其执行完毕或 `ctx` 取消。
    pub fn release_until(&self, ctx: &Cancellation) -> Result<(), ClockError> {
        self.open_gate();
        self.inner.done.wait_until(ctx)
    }

    /// 与 [`release_until`](Self::release_until) 相同，失败时 panic。
    pub fn must_release(&self, ctx: &Cancellation) {
        if let Err(err) = self.release_until(ctx) {
            panic!("{} call was released but did not complete: {err}", self.function);
        }
    }

    fn open_gate(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.gate.count_down();
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.open_gate();
    }
}
