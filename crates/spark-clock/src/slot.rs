//! 单槽投递队列：定时器与周期器向调用方交付触发时间的通道。
//!
//! # 设计背景（Why）
//! - 真实定时器的通道只缓存一个值，消费者来不及读取时后续的 tick 被直接丢弃；虚拟时钟必须复现这种
//!   “有损而非排队”的行为，否则测试会观测到生产环境不存在的积压；
//! - `reset` 需要在重新装填前清空尚未读取的旧值，所以生产方也要能从槽中取走数据，普通 `mpsc` 通道做不到。
//!
//! # 契约说明（What）
//! - 槽满时 `offer` 静默丢弃新值并返回 `false`；
//! - `recv` 系列方法取走槽中的值，槽随之变空；
//! - 所有克隆共享同一个槽。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::cancellation::Cancellation;
use crate::error::ClockError;

/// 至多缓存一个触发时间的投递槽。
#[derive(Clone, Debug, Default)]
pub struct TickSlot {
    inner: Arc<SlotInner>,
}

#[derive(Debug, Default)]
struct SlotInner {
    value: Mutex<Option<DateTime<Utc>>>,
    cond: Condvar,
}

impl TickSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 阻塞直到取得一个值。
    pub fn recv(&self) -> DateTime<Utc> {
        let mut value = self.inner.value.lock();
        loop {
            if let Some(at) = value.take() {
                return at;
            }
            self.inner.cond.wait(&mut value);
        }
    }

    /// 非阻塞读取；槽为空时返回 `None`。
    pub fn try_recv(&self) -> Option<DateTime<Utc>> {
        self.inner.value.lock().take()
    }

    /// 最多等待 `timeout` 的真实时间。
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DateTime<Utc>> {
        let mut value = self.inner.value.lock();
        if value.is_none() {
            // 超时后仍以槽内状态为准，唤醒与超时同时发生时不丢值。
            let _ = self
                .inner
                .cond
                .wait_while_for(&mut value, |slot| slot.is_none(), timeout);
        }
        value.take()
    }

    /// 等待一个值，或在令牌取消时返回取消原因。
    pub fn recv_until(&self, ctx: &Cancellation) -> Result<DateTime<Utc>, ClockError> {
        let waker = Arc::clone(&self.inner);
        let _registration = ctx.on_cancel(move || {
            let _guard = waker.value.lock();
            waker.cond.notify_all();
        });
        let mut value = self.inner.value.lock();
        loop {
            if let Some(at) = value.take() {
                return Ok(at);
            }
            if let Some(cause) = ctx.cause() {
                return Err(cause);
            }
            self.inner.cond.wait(&mut value);
        }
    }

    /// 槽当前是否为空。
    pub fn is_empty(&self) -> bool {
        self.inner.value.lock().is_none()
    }

    /// 非阻塞投递；槽已满时丢弃 `at`。
    pub(crate) fn offer(&self, at: DateTime<Utc>) -> bool {
        let mut value = self.inner.value.lock();
        if value.is_some() {
            return false;
        }
        *value = Some(at);
        self.inner.cond.notify_one();
        true
    }

    /// 清空尚未被读取的值。
    pub(crate) fn drain(&self) -> Option<DateTime<Utc>> {
        self.inner.value.lock().take()
    }
}
