//! 虚拟时钟：一个小型离散事件模拟器，配合调用拦截协议让测试确定性地观察并放行并发任务对时钟的调用。
//!
//! # 模块定位（Why）
//! - 真实时间下的竞态（定时器同时到期、停止与触发赛跑、tick 丢失）在 CI 中无法稳定复现；
//! - [`MockClock`] 用显式推进的模拟时间替代流逝的真实时间，同时保留这些竞态本身：同一时刻到期的事件
//!   在各自独立的线程上并发触发，而不是被串行化。
//!
//! # 结构概览（What）
//! - `MockState`：模拟当前时间 `cur`、活跃事件集合 `all`、缓存的最早触发时间与事件、已登记的陷阱；
//! - [`Event`]：定时器、周期器、周期函数共享的最小能力 `{next, fire}`；
//! - `timer`/`ticker`/`ticker_func`：三种事件实现；
//! - `trap`：调用拦截协议（[`Trap`]、[`Call`]）。
//!
//! # 并发约束（How）
//! - 所有共享状态只在持有 `MockState` 互斥锁时修改；锁顺序固定为“时钟锁 → 事件自身的锁”；
//! - 两处刻意释放时钟锁：触发事件时，以及等待陷阱放行时，使回调可以重入时钟而不死锁；
//! - 同一时刻只允许一个 `advance`/`set` 在途，违反即视为调用方缺陷并 panic。

mod ticker;
mod ticker_func;
mod timer;
mod trap;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::cancellation::Cancellation;
use crate::clock::{Clock, Ticker, TickerCallback, Timer, TimerCallback, Waiter};
use crate::error::ClockError;
use crate::sync::Signal;

pub use trap::{Call, ClockFunction, Trap, Trapper};

pub(crate) use trap::CallRecord;

/// 默认起始时间 `2024-01-01T00:00:00Z` 对应的 Unix 秒数。
pub const DEFAULT_START_UNIX_SECS: i64 = 1_704_067_200;

/// [`MockClock::new`] 使用的固定起始时间，保证测试在不同机器上得到相同的时间读数。
pub fn default_start() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::seconds(DEFAULT_START_UNIX_SECS)
}

/// 饱和后的截止时间；停在这里的事件永不触发。
pub(crate) const NEVER: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

/// `from + d`，越过可表示范围时饱和到两端，`TimeDelta::MAX` 因而表示“永不触发”。
pub(crate) fn deadline(from: DateTime<Utc>, d: TimeDelta) -> DateTime<Utc> {
    match from.checked_add_signed(d) {
        Some(at) => at,
        None if d < TimeDelta::zero() => DateTime::<Utc>::MIN_UTC,
        None => NEVER,
    }
}

pub(crate) type EventId = u64;

/// 事件的最小能力：报告下一次触发时间，并在给定时间触发。
///
/// 事件只在活跃期间被时钟持有；停止或（一次性定时器）触发后即从 `all` 中移除。
pub(crate) trait Event: Send + Sync {
    fn id(&self) -> EventId;

    /// 调用时必须持有时钟锁。
    fn next(&self) -> DateTime<Utc>;

    /// 在独立线程上执行，调用时不持有时钟锁。
    fn fire(self: Arc<Self>, at: DateTime<Utc>);
}

pub(crate) struct MockInner {
    state: Mutex<MockState>,
}

pub(crate) struct MockState {
    pub(crate) cur: DateTime<Utc>,
    advancing: bool,
    all: BTreeMap<EventId, Arc<dyn Event>>,
    next_time: Option<DateTime<Utc>>,
    next_events: Vec<Arc<dyn Event>>,
    traps: Vec<Arc<trap::TrapShared>>,
    next_id: u64,
}

impl MockState {
    pub(crate) fn allocate_id(&mut self) -> EventId {
        self.next_id += 1;
        self.next_id
    }

    /// 登记事件并立即重算最早触发缓存。调用方不得持有该事件自身的锁。
    pub(crate) fn add_event(&mut self, event: Arc<dyn Event>) {
        self.all.insert(event.id(), event);
        self.recompute_next();
    }

    /// 移除事件；事件不在集合中时为空操作。
    pub(crate) fn remove_event(&mut self, id: EventId) {
        if self.all.remove(&id).is_some() {
            self.recompute_next();
        }
    }

    /// 扫描 `all`，记录最小的 `next()` 以及所有与之相等的事件；并列的事件必须在同一轮一起触发。
    pub(crate) fn recompute_next(&mut self) {
        let mut best: Option<DateTime<Utc>> = None;
        let mut events: Vec<Arc<dyn Event>> = Vec::new();
        for event in self.all.values() {
            let next = event.next();
            match best {
                Some(current) if next > current => {}
                Some(current) if next == current => events.push(Arc::clone(event)),
                _ => {
                    best = Some(next);
                    events.clear();
                    events.push(Arc::clone(event));
                }
            }
        }
        self.next_time = best;
        self.next_events = events;
    }
}

/// 虚拟时钟：以显式推进的模拟时间实现 [`Clock`]。
///
/// # 设计动机（Why）
/// - 业务代码中的定时器、周期器、周期函数在测试中需要 100% 可重复；
/// - 仅推进时间还不够：后台任务可能尚未登记定时器（丢失唤醒），或回调尚未写完状态，测试就已开始断言。
///   [`trap`](Self::trap) 提供的拦截协议让测试在选定的调用边界上获得确定性的检查点。
///
/// # 行为概览（How）
/// - [`advance`](Self::advance)/[`set`](Self::set)：同步推进，逐轮触发到期事件直到目标时间；
/// - [`advance_next`](Self::advance_next)：推进到下一个事件，并在后台线程上完成这一轮；
/// - [`peek`](Self::peek)：查询距离下一个事件的时长。
///
/// # 契约说明（What）
/// - 存在事件后 `cur` 单调不减；
/// - 同一轮内并列事件在独立线程上并发触发，彼此之间不保证顺序，但全部完成后才计算下一轮；
/// - 克隆得到的句柄共享同一条时间线。
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<MockInner>,
}

impl MockClock {
    /// 创建起始时间为 [`default_start`] 的虚拟时钟。
    pub fn new() -> Self {
        Self::with_start(default_start())
    }

    /// 以指定起始时间构造虚拟时钟。
    pub fn with_start(start: DateTime<Utc>) -> Self {
        let state = MockState {
            cur: start,
            advancing: false,
            all: BTreeMap::new(),
            next_time: None,
            next_events: Vec::new(),
            traps: Vec::new(),
            next_id: 0,
        };
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(state),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<MockInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<MockInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.state.lock()
    }

    /// 推进模拟时间 `d`，并同步触发这段时间内到期的全部事件（包括触发过程中新登记的事件）。
    ///
    /// # Panics
    /// - `d` 为负；
    /// - 另一个 `advance`/`set` 正在进行。
    pub fn advance(&self, d: TimeDelta) {
        assert!(
            d >= TimeDelta::zero(),
            "cannot advance the mock clock by a negative duration ({d})"
        );
        let mut state = self.lock();
        claim_advance(&mut state);
        let target = deadline(state.cur, d);
        debug!(from = %state.cur, to = %target, "advancing mock clock");
        self.run_rounds(state, target);
    }

    /// 把模拟时间设置为 `t`。
    ///
    /// `t` 不早于当前时间时等价于 `advance(t - cur)`；早于当前时间只在没有任何活跃事件时允许。
    ///
    /// # Panics
    /// - 存在活跃定时器/周期器时把时间往回拨；
    /// - 另一个 `advance`/`set` 正在进行。
    pub fn set(&self, t: DateTime<Utc>) {
        let mut state = self.lock();
        if t < state.cur {
            assert!(
                !state.advancing,
                "concurrent advance/set on the mock clock is not allowed"
            );
            assert!(
                state.next_time.is_none(),
                "cannot set the mock clock back to {t} (now {}) while timers or tickers are scheduled",
                state.cur
            );
            debug!(from = %state.cur, to = %t, "setting mock clock backwards");
            state.cur = t;
            return;
        }
        claim_advance(&mut state);
        debug!(from = %state.cur, to = %t, "setting mock clock");
        self.run_rounds(state, t);
    }

    /// 推进到下一个已登记事件的时间点。
    ///
    /// 返回推进的时长，以及一个在本轮触发全部完成后就绪的 [`AdvanceWaiter`]。推进权在返回前就已被占用，
    /// 因此在等待完成之前再次推进仍会 panic。
    ///
    /// # Panics
    /// - 没有任何活跃事件；
    /// - 另一个 `advance`/`set` 正在进行。
    pub fn advance_next(&self) -> (TimeDelta, AdvanceWaiter) {
        let mut state = self.lock();
        let Some(next) = state.next_time else {
            panic!("cannot advance to the next event: no timers or tickers are scheduled");
        };
        claim_advance(&mut state);
        let d = next - state.cur;
        debug!(from = %state.cur, to = %next, "advancing mock clock to next event");
        drop(state);

        let waiter = AdvanceWaiter::pending();
        let round = waiter.clone();
        let clock = self.clone();
        thread::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let state = clock.lock();
                clock.run_rounds(state, next);
            }));
            round.finish(outcome.err());
        });
        (d, waiter)
    }

    /// 距离下一个事件的时长；没有活跃事件时返回 `None`。
    pub fn peek(&self) -> Option<TimeDelta> {
        let state = self.lock();
        state.next_time.map(|next| next - state.cur)
    }

    /// 返回用于登记陷阱的构造器。
    pub fn trap(&self) -> Trapper<'_> {
        Trapper::new(self)
    }

    /// 推进主循环，调用前必须已占用推进权。
    fn run_rounds(&self, mut state: MutexGuard<'_, MockState>, target: DateTime<Utc>) {
        loop {
            let at = match state.next_time {
                Some(next) if next <= target && next < NEVER => next.max(state.cur),
                _ => {
                    state.cur = target;
                    break;
                }
            };
            state.cur = at;
            let events = state.next_events.clone();
            trace!(at = %at, events = events.len(), "firing simultaneous events");
            let outcome = MutexGuard::unlocked(&mut state, || {
                panic::catch_unwind(AssertUnwindSafe(|| fire_round(&events, at)))
            });
            if let Err(payload) = outcome {
                state.advancing = false;
                drop(state);
                panic::resume_unwind(payload);
            }
        }
        state.advancing = false;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MockClock");
        if let Some(state) = self.inner.state.try_lock() {
            debug
                .field("cur", &state.cur)
                .field("events", &state.all.len())
                .field("traps", &state.traps.len());
        }
        debug.finish_non_exhaustive()
    }
}

fn claim_advance(state: &mut MockState) {
    assert!(
        !state.advancing,
        "concurrent advance/set on the mock clock is not allowed"
    );
    state.advancing = true;
}

/// 每个事件一个线程，全部启动后再统一等待。
fn fire_round(events: &[Arc<dyn Event>], at: DateTime<Utc>) {
    thread::scope(|scope| {
        for event in events {
            let event = Arc::clone(event);
            scope.spawn(move || event.fire(at));
        }
    });
}

impl Clock for MockClock {
    fn now(&self, tags: &[&str]) -> DateTime<Utc> {
        let mut state = self.lock();
        let _call = self.intercept(&mut state, CallRecord::new(ClockFunction::Now, tags));
        state.cur
    }

    fn since(&self, t: DateTime<Utc>, tags: &[&str]) -> TimeDelta {
        let mut state = self.lock();
        let _call = self.intercept(
            &mut state,
            CallRecord::new(ClockFunction::Since, tags).with_time(t),
        );
        state.cur - t
    }

    fn until(&self, t: DateTime<Utc>, tags: &[&str]) -> TimeDelta {
        let mut state = self.lock();
        let _call = self.intercept(
            &mut state,
            CallRecord::new(ClockFunction::Until, tags).with_time(t),
        );
        t - state.cur
    }

    fn new_timer(&self, d: TimeDelta, tags: &[&str]) -> Timer {
        timer::create(self, ClockFunction::NewTimer, d, None, tags)
    }

    fn after_func(&self, d: TimeDelta, f: TimerCallback, tags: &[&str]) -> Timer {
        timer::create(self, ClockFunction::AfterFunc, d, Some(f), tags)
    }

    fn new_ticker(&self, d: TimeDelta, tags: &[&str]) -> Ticker {
        ticker::create(self, d, tags)
    }

    fn ticker_func(
        &self,
        ctx: &Cancellation,
        d: TimeDelta,
        f: TickerCallback,
        tags: &[&str],
    ) -> Waiter {
        ticker_func::create(self, ctx, d, f, tags)
    }
}

/// [`MockClock::advance_next`] 返回的本轮完成句柄。
#[derive(Clone)]
pub struct AdvanceWaiter {
    round: Arc<AdvanceRound>,
}

struct AdvanceRound {
    done: Arc<Signal>,
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl AdvanceWaiter {
    fn pending() -> Self {
        Self {
            round: Arc::new(AdvanceRound {
                done: Arc::new(Signal::new()),
                panic: Mutex::new(None),
            }),
        }
    }

    fn finish(&self, panic: Option<Box<dyn Any + Send + 'static>>) {
        *self.round.panic.lock() = panic;
        self.round.done.fire();
    }

    /// 本轮触发是否已经全部完成。
    pub fn is_done(&self) -> bool {
        self.round.done.is_fired()
    }

    /// 等待本轮触发完成，或在 `ctx` 取消时返回取消原因。
    ///
    /// 本轮中若有事件 panic，panic 在这里被重新抛出。
    pub fn wait(&self, ctx: &Cancellation) -> Result<(), ClockError> {
        self.round.done.wait_until(ctx)?;
        if let Some(payload) = self.round.panic.lock().take() {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    /// 与 [`wait`](Self::wait) 相同，但把错误转为 panic，便于测试直接调用。
    pub fn must_wait(&self, ctx: &Cancellation) {
        if let Err(err) = self.wait(ctx) {
            panic!("mock clock advance did not complete: {err}");
        }
    }
}

impl fmt::Debug for AdvanceWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvanceWaiter")
            .field("done", &self.is_done())
            .finish()
    }
}
