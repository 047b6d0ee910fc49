//! 真实时钟冒烟测试：以毫秒级时长验证 `SystemClock` 与虚拟时钟共享同一组句柄语义。
//!
//! # 测试目标（Why）
//! - 生产路径注入的是 `SystemClock`，其停止/重置返回值、有损周期投递、周期函数退出原因必须与虚拟时钟一致；
//!
//! # 维护提示（How）
//! - 所有等待都有真实时间上限，断言只检查“至少/至多”而不检查精确时刻，避免 CI 抖动导致误报。

pub mod tests {
    pub mod system {
        include!("smoke.rs");
    }
}
