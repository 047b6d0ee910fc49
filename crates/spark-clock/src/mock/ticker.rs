//! 周期器事件：按固定周期向单槽投递 tick，消费者跟不上时丢弃多余的 tick。

use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use super::{CallRecord, ClockFunction, Event, EventId, MockClock, MockInner, NEVER, deadline};
use crate::clock::{Ticker, TickerBackend};
use crate::slot::TickSlot;

struct MockTicker {
    id: EventId,
    clock: Weak<MockInner>,
    slot: TickSlot,
    state: Mutex<TickerState>,
}

struct TickerState {
    d: TimeDelta,
    nxt: DateTime<Utc>,
    stopped: bool,
}

pub(super) fn create(clock: &MockClock, d: TimeDelta, tags: &[&str]) -> Ticker {
    assert!(
        d > TimeDelta::zero(),
        "non-positive interval for new_ticker: {d}"
    );
    let mut state = clock.lock();
    let _call = clock.intercept(
        &mut state,
        CallRecord::new(ClockFunction::NewTicker, tags).with_duration(d),
    );

    let slot = TickSlot::new();
    let ticker = Arc::new(MockTicker {
        id: state.allocate_id(),
        clock: clock.downgrade(),
        slot: slot.clone(),
        state: Mutex::new(TickerState {
            d,
            nxt: deadline(state.cur, d),
            stopped: false,
        }),
    });
    state.add_event(Arc::clone(&ticker) as Arc<dyn Event>);

    Ticker::new(
        slot,
        Arc::new(TickerHandle {
            clock: clock.clone(),
            ticker,
        }),
    )
}

impl Event for MockTicker {
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
            let mut ticker = self.state.lock();
            if ticker.stopped || ticker.nxt > at {
                return;
            }
            let d = ticker.d;
            while ticker.nxt <= state.cur && ticker.nxt < NEVER {
                ticker.nxt = deadline(ticker.nxt, d);
            }
        }
        state.recompute_next();
        self.slot.offer(at);
    }
}

struct TickerHandle {
    clock: MockClock,
    ticker: Arc<MockTicker>,
}

impl TickerBackend for TickerHandle {
    fn stop(&self, tags: &[&str]) {
        let mut state = self.clock.lock();
        let _call = self
            .clock
            .intercept(&mut state, CallRecord::new(ClockFunction::TickerStop, tags));
        self.ticker.state.lock().stopped = true;
        state.remove_event(self.ticker.id);
    }

    fn reset(&self, d: TimeDelta, tags: &[&str]) {
        assert!(
            d > TimeDelta::zero(),
            "non-positive interval for Ticker::reset: {d}"
        );
        let mut state = self.clock.lock();
        let _call = self.clock.intercept(
            &mut state,
            CallRecord::new(ClockFunction::TickerReset, tags).with_duration(d),
        );
        let cur = state.cur;
        {
            let mut ticker = self.ticker.state.lock();
            ticker.stopped = false;
            ticker.d = d;
            ticker.nxt = deadline(cur, d);
        }
        self.ticker.slot.drain();
        // 已停止的周期器重新登记；仍在运行的覆盖原条目并重算。
        state.add_event(Arc::clone(&self.ticker) as Arc<dyn Event>);
    }
}
