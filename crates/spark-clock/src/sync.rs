//! 拦截协议内部使用的两个同步原语：计数闩与一次性完成信号。

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cancellation::Cancellation;
use crate::error::ClockError;

/// 计数闩：生产方阻塞到计数归零，每个消费方各减一次。
#[derive(Debug)]
pub(crate) struct Countdown {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Countdown {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// 计数减一；归零时唤醒所有等待方。多余的调用被忽略。
    pub(crate) fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return;
        }
        *remaining -= 1;
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }
}

/// 一次性完成信号。
///
/// 触发后永久保持已完成状态，任意数量的等待方都会观察到，不存在丢失唤醒。
#[derive(Debug, Default)]
pub(crate) struct Signal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        let mut fired = self.fired.lock();
        if !*fired {
            *fired = true;
            self.cond.notify_all();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.fired.lock()
    }

    pub(crate) fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cond.wait(&mut fired);
        }
    }

    /// 等待信号触发或令牌取消，先到者决定结果。
    pub(crate) fn wait_until(self: &Arc<Self>, ctx: &Cancellation) -> Result<(), ClockError> {
        let waker = Arc::clone(self);
        let _registration = ctx.on_cancel(move || {
            let _guard = waker.fired.lock();
            waker.cond.notify_all();
        });
        let mut fired = self.fired.lock();
        loop {
            if *fired {
                return Ok(());
            }
            if let Some(cause) = ctx.cause() {
                return Err(cause);
            }
            self.cond.wait(&mut fired);
        }
    }
}
