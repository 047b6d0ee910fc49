//! 一次性定时器事件。
//!
//! 停止与触发的竞争在时钟锁下裁决：`stopped` 位先被谁置上，谁就赢。`stop`/`reset` 的返回值据此反映
//! “调用前定时器是否仍在运行”。

use std::sync::{Arc, Weak};
use std::thread;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::trace;

use super::{CallRecord, ClockFunction, Event, EventId, MockClock, MockInner, deadline};
use crate::clock::{Timer, TimerBackend, TimerCallback};
use crate::slot::TickSlot;

struct MockTimer {
    id: EventId,
    clock: Weak<MockInner>,
    slot: Option<TickSlot>,
    callback: Option<TimerCallback>,
    state: Mutex<TimerState>,
}

struct TimerState {
    nxt: DateTime<Utc>,
    stopped: bool,
}

/// `new_timer`/`after_func` 的共同入口；`callback` 为空时创建带投递槽的定时器。
pub(super) fn create(
    clock: &MockClock,
    function: ClockFunction,
    d: TimeDelta,
    callback: Option<TimerCallback>,
    tags: &[&str],
) -> Timer {
    let mut state = clock.lock();
    let _call = clock.intercept(&mut state, CallRecord::new(function, tags).with_duration(d));

    let fires_at = deadline(state.cur, d);
    let slot = callback.is_none().then(TickSlot::new);
    let timer = Arc::new(MockTimer {
        id: state.allocate_id(),
        clock: clock.downgrade(),
        slot: slot.clone(),
        callback,
        state: Mutex::new(TimerState {
            nxt: fires_at,
            stopped: false,
        }),
    });
    if d <= TimeDelta::zero() {
        fire_detached(clock, &timer, state.cur);
    } else {
        state.add_event(Arc::clone(&timer) as Arc<dyn Event>);
    }
    trace!(id = timer.id, function = %function, fires_at = %fires_at, "mock timer armed");

    Timer::new(
        slot,
        Arc::new(TimerHandle {
            clock: clock.clone(),
            timer,
        }),
    )
}

/// 非正时长的定时器不进入事件集合，而是立即在独立线程上以当前时间触发。
fn fire_detached(clock: &MockClock, timer: &Arc<MockTimer>, at: DateTime<Utc>) {
    let clock = clock.clone();
    let timer = Arc::clone(timer);
    thread::spawn(move || timer.deliver(&clock, at));
}

impl MockTimer {
    fn deliver(&self, clock: &MockClock, at: DateTime<Utc>) {
        let mut state = clock.lock();
        {
            let mut timer = self.state.lock();
            // 在快照与触发之间被 reset 到更晚的时间点时，本次触发作废。
            if timer.stopped || timer.nxt > at {
                return;
            }
            timer.stopped = true;
        }
        state.remove_event(self.id);
        if let Some(slot) = &self.slot {
            slot.offer(at);
        }
        drop(state);

        if let Some(callback) = &self.callback {
            callback();
        }
    }
}

impl Event for MockTimer {
    fn id(&self) -> EventId {
        self.id
    }

    fn next(&self) -> DateTime<Utc> {
        self.state.lock().nxt
    }

    fn fire(self: Arc<Self>, at: DateTime<Utc>) {
        if let Some(clock) = MockClock::upgrade(&self.clock) {
            self.deliver(&clock, at);
        }
    }
}

struct TimerHandle {
    clock: MockClock,
    timer: Arc<MockTimer>,
}

impl TimerBackend for TimerHandle {
    fn stop(&self, tags: &[&str]) -> bool {
        let mut state = self.clock.lock();
        let _call = self
            .clock
            .intercept(&mut state, CallRecord::new(ClockFunction::TimerStop, tags));
        let was_running = {
            let mut timer = self.timer.state.lock();
            let was_running = !timer.stopped;
            timer.stopped = true;
            was_running
        };
        state.remove_event(self.timer.id);
        was_running
    }

    fn reset(&self, d: TimeDelta, tags: &[&str]) -> bool {
        let mut state = self.clock.lock();
        let _call = self.clock.intercept(
            &mut state,
            CallRecord::new(ClockFunction::TimerReset, tags).with_duration(d),
        );
        let cur = state.cur;
        let was_running = {
            let mut timer = self.timer.state.lock();
            let was_running = !timer.stopped;
            timer.stopped = false;
            timer.nxt = deadline(cur, d);
            was_running
        };
        state.remove_event(self.timer.id);
        if let Some(slot) = &self.timer.slot {
            slot.drain();
        }
        if d <= TimeDelta::zero() {
            fire_detached(&self.clock, &self.timer, cur);
        } else {
            state.add_event(Arc::clone(&self.timer) as Arc<dyn Event>);
        }
        was_running
    }
}
