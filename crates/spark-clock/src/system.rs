//! 真实时钟：把 [`Clock`] 契约委托给墙上时间与标准库线程。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::cancellation::Cancellation;
use crate::clock::{
    Clock, Ticker, TickerBackend, TickerCallback, Timer, TimerBackend, TimerCallback, Waiter,
    WaiterBackend, to_std,
};
use crate::error::ClockError;
use crate::slot::TickSlot;

/// 基于标准库线程实现的系统时钟。
///
/// # 设计动机（Why）
/// - 不绑定任何异步运行时，生产代码在普通线程中即可使用；
/// - 与 [`MockClock`](crate::MockClock) 返回同一组句柄，组件在两种时钟之间切换无需改动。
///
/// # 契约说明（What）
/// - `now` 直接返回 [`Utc::now`]，标签被忽略；
/// - 每次装填定时器启动一个辅助线程在条件变量上等待截止点，`stop`/`reset` 通过代数号让旧线程作废；
/// - 周期器与周期函数各自占用一个后台线程，周期器句柄全部丢弃后线程随之退出。
///
/// # 权衡（Trade-offs）
/// - 为每个定时器启动线程牺牲了一定性能；高频场景应注入基于定时轮的自定义 [`Clock`]。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self, _tags: &[&str]) -> DateTime<Utc> {
        Utc::now()
    }

    fn since(&self, t: DateTime<Utc>, _tags: &[&str]) -> TimeDelta {
        Utc::now() - t
    }

    fn until(&self, t: DateTime<Utc>, _tags: &[&str]) -> TimeDelta {
        t - Utc::now()
    }

    fn new_timer(&self, d: TimeDelta, _tags: &[&str]) -> Timer {
        let slot = TickSlot::new();
        let core = TimerCore::arm(Some(slot.clone()), None, d);
        Timer::new(Some(slot), Arc::new(RealTimer { core }))
    }

    fn after_func(&self, d: TimeDelta, f: TimerCallback, _tags: &[&str]) -> Timer {
        let core = TimerCore::arm(None, Some(f), d);
        Timer::new(None, Arc::new(RealTimer { core }))
    }

    fn new_ticker(&self, d: TimeDelta, _tags: &[&str]) -> Ticker {
        assert!(
            d > TimeDelta::zero(),
            "non-positive interval for new_ticker: {d}"
        );
        let slot = TickSlot::new();
        let core = TickerCore::start(slot.clone(), d);
        Ticker::new(slot, Arc::new(RealTicker { core }))
    }

    fn ticker_func(
        &self,
        ctx: &Cancellation,
        d: TimeDelta,
        f: TickerCallback,
        _tags: &[&str],
    ) -> Waiter {
        assert!(
            d > TimeDelta::zero(),
            "non-positive interval for ticker_func: {d}"
        );
        Waiter::new(FuncOutcome::start(ctx.clone(), to_std(d), f))
    }
}

struct TimerCore {
    slot: Option<TickSlot>,
    callback: Option<TimerCallback>,
    state: Mutex<TimerRun>,
    cond: Condvar,
}

/// 从现在起 `d` 之后的时刻；超出 `Instant` 的表示范围时为 `None`，即永不到期。
fn after(d: Duration) -> Option<Instant> {
    Instant::now().checked_add(d)
}

/// 从 `next` 起按 `period` 跳到第一个晚于现在的节拍。
fn catch_up(mut next: Instant, period: Duration) -> Option<Instant> {
    let now = Instant::now();
    while next <= now {
        next = next.checked_add(period)?;
    }
    Some(next)
}

struct TimerRun {
    generation: u64,
    armed: bool,
}

impl TimerCore {
    fn arm(slot: Option<TickSlot>, callback: Option<TimerCallback>, d: TimeDelta) -> Arc<Self> {
        let core = Arc::new(Self {
            slot,
            callback,
            state: Mutex::new(TimerRun {
                generation: 0,
                armed: true,
            }),
            cond: Condvar::new(),
        });
        core.spawn_wait(0, d);
        core
    }

    fn spawn_wait(self: &Arc<Self>, generation: u64, d: TimeDelta) {
        let core = Arc::clone(self);
        let deadline = after(to_std(d));
        thread::spawn(move || core.wait_and_fire(generation, deadline));
    }

    fn wait_and_fire(&self, generation: u64, deadline: Option<Instant>) {
        let mut state = self.state.lock();
        loop {
            if state.generation != generation || !state.armed {
                return;
            }
            match deadline {
                Some(at) => {
                    if self.cond.wait_until(&mut state, at).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        if state.generation != generation || !state.armed {
            return;
        }
        state.armed = false;
        drop(state);

        if let Some(slot) = &self.slot {
            slot.offer(Utc::now());
        }
        if let Some(callback) = &self.callback {
            callback();
        }
    }
}

struct RealTimer {
    core: Arc<TimerCore>,
}

impl TimerBackend for RealTimer {
    fn stop(&self, _tags: &[&str]) -> bool {
        let mut state = self.core.state.lock();
        let was_running = state.armed;
        state.armed = false;
        state.generation += 1;
        self.core.cond.notify_all();
        was_running
    }

    fn reset(&self, d: TimeDelta, _tags: &[&str]) -> bool {
        let (generation, was_running) = {
            let mut state = self.core.state.lock();
            let was_running = state.armed;
            state.armed = true;
            state.generation += 1;
            self.core.cond.notify_all();
            if let Some(slot) = &self.core.slot {
                slot.drain();
            }
            (state.generation, was_running)
        };
        self.core.spawn_wait(generation, d);
        was_running
    }
}

struct TickerCore {
    slot: TickSlot,
    state: Mutex<TickerRun>,
    cond: Condvar,
}

struct TickerRun {
    generation: u64,
    stopped: bool,
}

impl TickerCore {
    fn start(slot: TickSlot, d: TimeDelta) -> Arc<Self> {
        let core = Arc::new(Self {
            slot,
            state: Mutex::new(TickerRun {
                generation: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
        });
        core.spawn_loop(0, to_std(d));
        core
    }

    fn spawn_loop(self: &Arc<Self>, generation: u64, period: Duration) {
        let core = Arc::clone(self);
        thread::spawn(move || core.run(generation, period));
    }

    fn run(&self, generation: u64, period: Duration) {
        let mut next = after(period);
        let mut state = self.state.lock();
        loop {
            if state.generation != generation || state.stopped {
                return;
            }
            let Some(at) = next else {
                self.cond.wait(&mut state);
                continue;
            };
            if self.cond.wait_until(&mut state, at).timed_out() {
                if state.generation != generation || state.stopped {
                    return;
                }
                self.slot.offer(Utc::now());
                // 消费者或调度落后时跳过错过的周期，而不是补发。
                next = catch_up(at, period);
            }
        }
    }

    fn halt(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.generation += 1;
        self.cond.notify_all();
    }
}

struct RealTicker {
    core: Arc<TickerCore>,
}

impl TickerBackend for RealTicker {
    fn stop(&self, _tags: &[&str]) {
        self.core.halt();
    }

    fn reset(&self, d: TimeDelta, _tags: &[&str]) {
        assert!(
            d > TimeDelta::zero(),
            "non-positive interval for Ticker::reset: {d}"
        );
        let generation = {
            let mut state = self.core.state.lock();
            state.stopped = false;
            state.generation += 1;
            self.core.cond.notify_all();
            self.core.slot.drain();
            state.generation
        };
        self.core.spawn_loop(generation, to_std(d));
    }
}

impl Drop for RealTicker {
    fn drop(&mut self) {
        self.core.halt();
    }
}

struct FuncOutcome {
    err: Mutex<Option<ClockError>>,
    cond: Condvar,
}

impl FuncOutcome {
    fn start(ctx: Cancellation, period: Duration, mut f: TickerCallback) -> Arc<Self> {
        let outcome = Arc::new(Self {
            err: Mutex::new(None),
            cond: Condvar::new(),
        });
        let finished = Arc::clone(&outcome);
        thread::spawn(move || {
            let mut next = after(period);
            let err = loop {
                let Some(at) = next else {
                    break ctx.wait();
                };
                if let Some(cause) = ctx.wait_deadline(at) {
                    break cause;
                }
                if let Err(err) = f() {
                    break ClockError::ticker_func(err);
                }
                next = catch_up(at, period);
            };
            debug!(reason = %err, "ticker func loop exited");
            finished.finish(err);
        });
        outcome
    }

    fn finish(&self, err: ClockError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
            self.cond.notify_all();
        }
    }
}

impl WaiterBackend for FuncOutcome {
    fn wait(&self, _tags: &[&str]) -> Result<(), ClockError> {
        let mut slot = self.err.lock();
        loop {
            if let Some(err) = slot.as_ref() {
                return Err(err.clone());
            }
            self.cond.wait(&mut slot);
        }
    }
}
