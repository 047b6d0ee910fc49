#![deny(unsafe_code)]
#![doc = "spark-clock: 可注入时钟契约与带调用拦截协议的确定性虚拟时钟。"]
#![doc = ""]
#![doc = "== 使用方式 =="]
#![doc = "生产组件只依赖 [`Clock`] trait，通过 `Arc<dyn Clock>` 注入；运行时传入 [`SystemClock`]，测试传入 [`MockClock`]。"]
#![doc = "测试通过 [`MockClock::advance`] 显式推进时间，并可用 [`MockClock::trap`] 在任意时钟调用边界上设置陷阱，"]
#![doc = "等待后台任务到达该调用、检查参数、再以 [`Call::release`] 放行，从而消除“任务尚未登记定时器”一类竞态。"]
#![doc = ""]
#![doc = "== 并发模型 =="]
#![doc = "本 crate 只使用标准库线程与 `parking_lot` 同步原语，不依赖任何异步运行时；同一时刻到期的虚拟事件在各自独立的线程上并发触发。"]

mod cancellation;
mod clock;
mod error;
mod mock;
mod slot;
mod sync;
mod system;

pub use cancellation::{CancelRegistration, Cancellation};
pub use clock::{Clock, Ticker, TickerCallback, Timer, TimerCallback, Waiter};
pub use error::{BoxError, ClockError};
pub use mock::{
    AdvanceWaiter, Call, ClockFunction, DEFAULT_START_UNIX_SECS, MockClock, Trap, Trapper,
    default_start,
};
pub use slot::TickSlot;
pub use system::SystemClock;
