pub mod traps {
    //! 调用拦截协议：标签过滤、多陷阱联合放行、关闭自动放行、调用参数与放行后的可见性。

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use spark_clock::{BoxError, Cancellation, Clock, ClockError, ClockFunction, MockClock};

    use super::support::{bounded, brief, secs};

    /// 带标签 `x` 的陷阱只拦截携带 `x` 的调用，其他调用既不投递也不阻塞。
    #[test]
    fn trap_only_intercepts_calls_carrying_its_tags() {
        let clock = MockClock::new();
        let trap = clock.trap().new_timer(&["x"]);

        let tagged = {
            let clock = clock.clone();
            thread::spawn(move || clock.new_timer(secs(1), &["y", "x"]))
        };
        let _untagged = clock.new_timer(secs(2), &["y"]);

        let call = trap.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::NewTimer);
        assert_eq!(call.tags, vec!["y".to_owned(), "x".to_owned()]);
        assert_eq!(call.duration, Some(secs(1)));
        assert_eq!(clock.peek(), Some(secs(2)), "被拦截的调用放行前不生效");

        call.must_release(&bounded());
        assert_eq!(clock.peek(), Some(secs(1)), "release 返回时调用已经生效");
        let _tagged = tagged.join().expect("被拦截的线程不应 panic");

        assert!(
            matches!(trap.wait(&brief()), Err(ClockError::DeadlineExceeded)),
            "未携带标签的调用不应投递给陷阱"
        );
    }

    /// 同一调用命中多个陷阱时，必须每个陷阱都放行后调用才继续。
    #[test]
    fn call_matching_two_traps_needs_both_releases() {
        let clock = MockClock::new();
        let start = clock.now(&[]);
        let by_a = clock.trap().now(&["a"]);
        let by_b = clock.trap().now(&["b"]);

        let caller = {
            let clock = clock.clone();
            thread::spawn(move || clock.now(&["a", "b"]))
        };
        let first = by_a.must_wait(&bounded());
        let second = by_b.must_wait(&bounded());

        assert!(
            matches!(first.release_until(&brief()), Err(ClockError::DeadlineExceeded)),
            "只放行一个陷阱时调用仍被阻塞"
        );
        assert!(!caller.is_finished());

        second.must_release(&bounded());
        assert_eq!(caller.join().expect("调用线程不应 panic"), start);
        first.must_release(&bounded());
    }

    #[test]
    fn closing_trap_releases_pending_calls_and_fails_waiters() {
        let clock = MockClock::new();
        let trap = clock.trap().now(&[]);

        let taken = {
            let clock = clock.clone();
            thread::spawn(move || clock.now(&["taken"]))
        };
        let call = trap.must_wait(&bounded());
        assert_eq!(call.tags, vec!["taken".to_owned()]);

        let pending = {
            let clock = clock.clone();
            thread::spawn(move || clock.now(&["pending"]))
        };
        trap.close();
        pending.join().expect("关闭陷阱后排队的调用应自动放行");

        call.must_release(&bounded());
        taken.join().expect("已取走的调用由测试放行");
        assert!(matches!(trap.wait(&bounded()), Err(ClockError::TrapClosed)));

        let _ = clock.now(&[]);
    }

    #[test]
    fn dropped_trap_no_longer_intercepts() {
        let clock = MockClock::new();
        {
            let _trap = clock.trap().new_ticker(&[]);
        }
        let ticker = clock.new_ticker(secs(1), &[]);
        ticker.stop(&[]);
    }

    #[test]
    fn since_and_until_calls_expose_time_argument() {
        let clock = MockClock::new();
        let start = clock.now(&[]);
        let since_trap = clock.trap().since(&["s"]);
        let until_trap = clock.trap().until(&["u"]);

        let earlier = start - secs(30);
        let since = {
            let clock = clock.clone();
            thread::spawn(move || clock.since(earlier, &["s"]))
        };
        let call = since_trap.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::Since);
        assert_eq!(call.time, Some(earlier));
        assert_eq!(call.duration, None);
        call.must_release(&bounded());
        assert_eq!(since.join().expect("since 线程不应 panic"), secs(30));

        let later = start + secs(45);
        let until = {
            let clock = clock.clone();
            thread::spawn(move || clock.until(later, &["u"]))
        };
        let call = until_trap.must_wait(&bounded());
        assert_eq!(call.time, Some(later));
        call.must_release(&bounded());
        assert_eq!(until.join().expect("until 线程不应 panic"), secs(45));
    }

    /// 放行是往返式的：`release` 返回时重置已经生效，测试可以立即断言。
    #[test]
    fn released_reset_is_visible_when_release_returns() {
        let clock = MockClock::new();
        let timer = clock.new_timer(secs(10), &[]);
        let trap = clock.trap().timer_reset(&["backoff"]);

        let resetter = {
            let timer = timer.clone();
            thread::spawn(move || timer.reset(secs(3), &["backoff"]))
        };
        let call = trap.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::TimerReset);
        assert_eq!(call.duration, Some(secs(3)));
        assert_eq!(clock.peek(), Some(secs(10)));

        call.must_release(&bounded());
        assert_eq!(clock.peek(), Some(secs(3)));
        assert!(resetter.join().expect("重置线程不应 panic"));
    }

    /// 等待周期函数的调用同样可拦截；放行后的 `wait` 在循环退出时才完成。
    #[test]
    fn ticker_func_wait_can_be_trapped() {
        let clock = MockClock::new();
        let ctx = Cancellation::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let create = clock.trap().ticker_func(&["poller"]);
        let wait = clock.trap().ticker_func_wait(&["poller"]);

        let creator = {
            let clock = clock.clone();
            let ctx = ctx.clone();
            let hits = Arc::clone(&hits);
            thread::spawn(move || {
                clock.ticker_func(
                    &ctx,
                    secs(5),
                    Box::new(move || -> Result<(), BoxError> {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                    &["poller"],
                )
            })
        };
        let call = create.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::TickerFunc);
        assert_eq!(call.duration, Some(secs(5)));
        call.must_release(&bounded());
        let waiter = creator.join().expect("创建线程不应 panic");

        clock.advance(secs(5));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let waiting = thread::spawn(move || waiter.wait(&["poller"]));
        let call = wait.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::TickerFuncWait);
        ctx.cancel();
        call.must_release(&bounded());
        let outcome = waiting.join().expect("等待线程不应 panic");
        assert!(matches!(outcome, Err(ClockError::Cancelled)));
    }

    #[test]
    fn wait_reports_cancellation_cause() {
        let clock = MockClock::new();
        let trap = clock.trap().after_func(&[]);
        assert_eq!(trap.function(), ClockFunction::AfterFunc);

        let ctx = Cancellation::new();
        ctx.cancel();
        assert!(matches!(trap.wait(&ctx), Err(ClockError::Cancelled)));
        assert!(matches!(trap.wait(&brief()), Err(ClockError::DeadlineExceeded)));
    }

    #[test]
    fn clock_function_names_are_canonical() {
        assert_eq!(ClockFunction::NewTimer.to_string(), "NewTimer");
        assert_eq!(ClockFunction::TimerStop.to_string(), "TimerStop");
        assert_eq!(ClockFunction::TickerFuncWait.to_string(), "TickerFuncWait");
        assert_eq!(ClockFunction::Until.as_str(), "Until");
    }

    #[test]
    fn timer_stop_is_held_until_released() {
        let clock = MockClock::new();
        let timer = clock.new_timer(secs(10), &[]);
        let trap = clock.trap().timer_stop(&["halt"]);

        let stopper = {
            let timer = timer.clone();
            thread::spawn(move || timer.stop(&["halt"]))
        };
        let call = trap.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::TimerStop);
        assert_eq!(call.duration, None);
        assert_eq!(clock.peek(), Some(secs(10)), "放行前定时器仍在运行");

        call.must_release(&bounded());
        assert_eq!(clock.peek(), None);
        assert!(stopper.join().expect("停止线程不应 panic"));
    }

    #[test]
    fn new_ticker_is_held_until_released() {
        let clock = MockClock::new();
        let trap = clock.trap().new_ticker(&["poll"]);

        let creator = {
            let clock = clock.clone();
            thread::spawn(move || clock.new_ticker(secs(4), &["poll"]))
        };
        let call = trap.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::NewTicker);
        assert_eq!(call.duration, Some(secs(4)));
        assert_eq!(clock.peek(), None, "放行前周期器尚未登记");

        call.must_release(&bounded());
        assert_eq!(clock.peek(), Some(secs(4)));
        creator.join().expect("创建线程不应 panic").stop(&[]);
    }

    #[test]
    fn ticker_stop_is_held_until_released() {
        let clock = MockClock::new();
        let ticker = clock.new_ticker(secs(3), &[]);
        let trap = clock.trap().ticker_stop(&["halt"]);

        let stopper = thread::spawn(move || ticker.stop(&["halt"]));
        let call = trap.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::TickerStop);
        assert_eq!(call.duration, None);
        assert_eq!(clock.peek(), Some(secs(3)));

        call.must_release(&bounded());
        assert_eq!(clock.peek(), None);
        stopper.join().expect("停止线程不应 panic");
    }

    #[test]
    fn ticker_reset_is_held_until_released() {
        let clock = MockClock::new();
        let ticker = clock.new_ticker(secs(3), &[]);
        let trap = clock.trap().ticker_reset(&["retune"]);

        let resetter = {
            let ticker = ticker.clone();
            thread::spawn(move || ticker.reset(secs(7), &["retune"]))
        };
        let call = trap.must_wait(&bounded());
        assert_eq!(call.function, ClockFunction::TickerReset);
        assert_eq!(call.duration, Some(secs(7)));
        assert_eq!(clock.peek(), Some(secs(3)));

        call.must_release(&bounded());
        assert_eq!(clock.peek(), Some(secs(7)));
        resetter.join().expect("重置线程不应 panic");
        ticker.stop(&[]);
    }

    /// 未放行就丢弃的调用会被自动放行，被拦截的线程不会永远挂起。
    #[test]
    fn dropped_call_releases_the_caller() {
        let clock = MockClock::new();
        let start = clock.now(&[]);
        let trap = clock.trap().now(&["abandoned"]);

        let caller = {
            let clock = clock.clone();
            thread::spawn(move || clock.now(&["abandoned"]))
        };
        let call = trap.must_wait(&bounded());
        drop(call);

        assert_eq!(caller.join().expect("调用线程不应 panic"), start);
    }
}
