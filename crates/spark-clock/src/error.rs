//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义时钟契约对外“返回”的错误：业务错误（周期函数失败、取消）与协议错误（陷阱关闭、等待超时）；
//! - 编程错误（负向推进、回拨已有定时器的时间、并发推进）不在此列，它们以 panic 形式立即终止调用方。
//!
//! ## 设计要求（What）
//! - 错误需要被保存一次、交给多个等待者，因此 [`ClockError`] 必须实现 `Clone`；
//! - 周期函数返回的任意错误以 `Arc<dyn Error>` 保留，`source()` 链完整可追溯。

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// 周期函数与外部回调使用的装箱错误类型。
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 时钟契约的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：`Waiter::wait`、`Trap::wait`、`Call::release_until` 等阻塞点都需要向调用方解释“为何结束”，
///   统一枚举让测试可以直接 `matches!` 断言具体原因。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + Clone`，可安全跨线程广播；
///   - [`ClockError::TickerFunc`] 通过 `#[source]` 暴露原始错误。
/// - **设计权衡 (Trade-offs)**：使用 `Arc` 包裹外部错误，牺牲一次分配换取可克隆性。
#[derive(Clone, Debug, Error)]
pub enum ClockError {
    /// 取消令牌被显式取消。
    #[error("operation cancelled")]
    Cancelled,

    /// 带超时的取消令牌到期。
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// 等待中的陷阱已被关闭。
    #[error("trap closed")]
    TrapClosed,

    /// 周期函数返回错误，循环据此退出。
    #[error("ticker function failed: {0}")]
    TickerFunc(#[source] Arc<dyn StdError + Send + Sync + 'static>),
}

impl ClockError {
    /// 将周期函数返回的装箱错误包装为 [`ClockError::TickerFunc`]。
    pub fn ticker_func(err: BoxError) -> Self {
        ClockError::TickerFunc(Arc::from(err))
    }

    /// 判断错误是否源自取消令牌（显式取消或超时）。
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ClockError::Cancelled | ClockError::DeadlineExceeded)
    }
}
