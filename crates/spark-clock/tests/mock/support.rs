pub mod support {
    //! 测试辅助：时长构造与有界等待令牌。

    use std::time::Duration;

    use chrono::TimeDelta;
    use spark_clock::Cancellation;

    /// 所有阻塞等待共用的上限；正常路径远小于该值。
    pub fn bounded() -> Cancellation {
        Cancellation::with_timeout(Duration::from_secs(5))
    }

    /// 用于断言“仍在阻塞”的短超时令牌。
    pub fn brief() -> Cancellation {
        Cancellation::with_timeout(Duration::from_millis(50))
    }

    pub fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    pub fn hours(n: i64) -> TimeDelta {
        TimeDelta::hours(n)
    }
}
