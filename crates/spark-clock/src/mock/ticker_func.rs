//! 周期函数事件：每个周期在独立线程上执行一次函数，函数出错或令牌取消时退出。
//!
//! # 教案式说明
//! - **意图 (Why)**：与周期器不同，函数执行期间下一次触发不会开始；推进时间的一方会等待本轮函数返回，
//!   因此测试可以在 `advance` 返回后直接断言函数产生的副作用。
//! - **契约 (What)**：
//!   - 退出只发生一次，首个原因（函数错误或取消原因）被 [`Waiter::wait`](crate::Waiter::wait) 返回；
//!   - 退出后事件从时钟注销，不再触发。
//! - **并发 (How)**：等待方在时钟锁上配合条件变量阻塞，退出路径在持有时钟锁时广播。

use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{
    CallRecord, ClockFunction, Event, EventId, MockClock, MockInner, MockState, deadline,
};
use crate::cancellation::{CancelRegistration, Cancellation};
use crate::clock::{TickerCallback, Waiter, WaiterBackend};
use crate::error::ClockError;

struct MockTickerFunc {
    id: EventId,
    clock: Weak<MockInner>,
    f: Mutex<TickerCallback>,
    state: Mutex<FuncState>,
    /// 与时钟锁配对使用。
    cond: Condvar,
}

struct FuncState {
    d: TimeDelta,
    nxt: DateTime<Utc>,
    done: bool,
    err: Option<ClockError>,
    registration: Option<CancelRegistration>,
}

pub(super) fn create(
    clock: &MockClock,
    ctx: &Cancellation,
    d: TimeDelta,
    f: TickerCallback,
    tags: &[&str],
) -> Waiter {
    assert!(
        d > TimeDelta::zero(),
        "non-positive interval for ticker_func: {d}"
    );
    let mut state = clock.lock();
    let call = clock.intercept(
        &mut state,
        CallRecord::new(ClockFunction::TickerFunc, tags).with_duration(d),
    );
    let event = Arc::new(MockTickerFunc {
        id: state.allocate_id(),
        clock: clock.downgrade(),
        f: Mutex::new(f),
        state: Mutex::new(FuncState {
            d,
            nxt: deadline(state.cur, d),
            done: false,
            err: None,
            registration: None,
        }),
        cond: Condvar::new(),
    });
    state.add_event(Arc::clone(&event) as Arc<dyn Event>);
    drop(call);
    drop(state);

    // 令牌已取消时回调会立即执行并加时钟锁，所以必须在释放时钟锁之后登记。
    let registration = {
        let token = ctx.clone();
        let target = Arc::downgrade(&event);
        let clock = clock.downgrade();
        ctx.on_cancel(move || {
            let (Some(event), Some(clock)) = (target.upgrade(), MockClock::upgrade(&clock)) else {
                return;
            };
            let cause = token.cause().unwrap_or(ClockError::Cancelled);
            let mut state = clock.lock();
            event.exit_locked(&mut state, cause);
        })
    };
    {
        let mut inner = event.state.lock();
        if !inner.done {
            inner.registration = Some(registration);
        }
    }

    Waiter::new(Arc::new(FuncWaiter {
        clock: clock.clone(),
        event,
    }))
}

impl MockTickerFunc {
    /// 首个退出原因胜出；调用方必须持有时钟锁。
    fn exit_locked(&self, state: &mut MockState, err: ClockError) {
        let registration = {
            let mut inner = self.state.lock();
            if inner.done {
                return;
            }
            debug!(id = self.id, reason = %err, "mock ticker func exited");
            inner.done = true;
            inner.err = Some(err);
            inner.registration.take()
        };
        state.remove_event(self.id);
        self.cond.notify_all();
        drop(registration);
    }
}

impl Event for MockTickerFunc {
    fn id(&self) -> EventId {
        self.id
    }

    fn next(&self) -> DateTime<Utc> {
        self.state.lock().nxt
    }

    fn fire(self: Arc<Self>, at: DateTime<Utc>) {
        let Some(clock) = MockClock::upgrade(&self.clock) else {
            return;
        };
        let mut state = clock.lock();
        {
            let mut inner = self.state.lock();
            if inner.done {
                return;
            }
            // 周期函数没有 reset，`nxt` 只在这里推进；与本轮时间不符说明调度缓存已损坏。
            assert_eq!(
                inner.nxt, at,
                "ticker func fired at {at} but was due at {}",
                inner.nxt
            );
            let d = inner.d;
            inner.nxt = deadline(inner.nxt, d);
        }
        state.recompute_next();
        drop(state);

        let outcome = {
            let mut f = self.f.lock();
            (*f)()
        };
        if let Err(err) = outcome {
            let mut state = clock.lock();
            self.exit_locked(&mut state, ClockError::ticker_func(err));
        }
    }
}

struct FuncWaiter {
    clock: MockClock,
    event: Arc<MockTickerFunc>,
}

impl WaiterBackend for FuncWaiter {
    fn wait(&self, tags: &[&str]) -> Result<(), ClockError> {
        let mut state = self.clock.lock();
        let _call = self.clock.intercept(
            &mut state,
            CallRecord::new(ClockFunction::TickerFuncWait, tags),
        );
        loop {
            if let Some(err) = self.event.state.lock().err.clone() {
                return Err(err);
            }
            self.event.cond.wait(&mut state);
        }
    }
}
