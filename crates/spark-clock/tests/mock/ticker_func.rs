pub mod ticker_func {
    //! 周期函数：按周期执行、取消与函数错误两种退出路径、退出后注销。

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use spark_clock::{BoxError, Cancellation, Clock, ClockError, MockClock};

    use super::support::secs;

    fn counting(hits: &Arc<AtomicUsize>) -> Box<dyn FnMut() -> Result<(), BoxError> + Send> {
        let hits = Arc::clone(hits);
        Box::new(move || -> Result<(), BoxError> {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    /// 十次十秒推进恰好执行十次；取消后 `wait` 返回取消原因且循环被注销。
    #[test]
    fn ten_advances_run_function_ten_times_then_cancel() {
        let clock = MockClock::new();
        let ctx = Cancellation::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let waiter = clock.ticker_func(&ctx, secs(10), counting(&hits), &[]);

        for _ in 0..10 {
            clock.advance(secs(10));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        ctx.cancel();
        assert!(matches!(waiter.wait(&[]), Err(ClockError::Cancelled)));
        assert_eq!(clock.peek(), None, "退出后不再占用事件集合");

        clock.advance(secs(100));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn function_error_ends_loop_and_is_reported() {
        let clock = MockClock::new();
        let ctx = Cancellation::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let hits = Arc::clone(&hits);
            clock.ticker_func(
                &ctx,
                secs(1),
                Box::new(move || -> Result<(), BoxError> {
                    if hits.fetch_add(1, Ordering::SeqCst) == 2 {
                        return Err("probe failed".into());
                    }
                    Ok(())
                }),
                &[],
            )
        };

        clock.advance(secs(10));

        assert_eq!(hits.load(Ordering::SeqCst), 3, "出错后不得再执行");
        let err = waiter.wait(&[]).expect_err("循环总是带着原因退出");
        assert!(matches!(err, ClockError::TickerFunc(_)));
        assert_eq!(err.to_string(), "ticker function failed: probe failed");
        assert!(!ctx.is_cancelled(), "函数错误不应取消外部令牌");
        assert_eq!(clock.peek(), None);
    }

    #[test]
    fn already_cancelled_token_exits_immediately() {
        let clock = MockClock::new();
        let ctx = Cancellation::new();
        ctx.cancel();
        let hits = Arc::new(AtomicUsize::new(0));

        let waiter = clock.ticker_func(&ctx, secs(1), counting(&hits), &[]);

        assert!(matches!(waiter.wait(&[]), Err(ClockError::Cancelled)));
        clock.advance(secs(5));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// 首个退出原因胜出：函数错误之后的取消不改变 `wait` 的结果。
    #[test]
    fn first_exit_reason_wins() {
        let clock = MockClock::new();
        let ctx = Cancellation::new();
        let waiter = clock.ticker_func(
            &ctx,
            secs(1),
            Box::new(|| -> Result<(), BoxError> { Err("boom".into()) }),
            &[],
        );

        clock.advance(secs(1));
        ctx.cancel();

        assert!(matches!(waiter.wait(&[]), Err(ClockError::TickerFunc(_))));
        assert!(
            matches!(waiter.wait(&[]), Err(ClockError::TickerFunc(_))),
            "可重复等待"
        );
    }

    #[test]
    fn wait_blocks_until_cancelled_from_another_thread() {
        let clock = MockClock::new();
        let ctx = Cancellation::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let waiter = clock.ticker_func(&ctx, secs(1), counting(&hits), &[]);

        let canceller = ctx.child();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            canceller.cancel();
        });

        assert!(matches!(waiter.wait(&["shutdown"]), Err(ClockError::Cancelled)));
        handle.join().expect("取消线程不应 panic");
    }

    #[test]
    #[should_panic(expected = "non-positive interval for ticker_func")]
    fn zero_period_is_rejected() {
        let clock = MockClock::new();
        let _waiter = clock.ticker_func(
            &Cancellation::new(),
            secs(0),
            Box::new(|| -> Result<(), BoxError> { Ok(()) }),
            &[],
        );
    }
}
